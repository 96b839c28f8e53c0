//! `armtrack` – articulated-robot tracking demo.
//!
//! This binary wires the whole stack together:
//!
//! 1. Loads the TOML config (argument, `ARMTRACK_CONFIG`, or
//!    `armtrack.toml`); any error is fatal.
//! 2. Builds the joint chain, the synthetic renderer, the robot emulator
//!    and the fusion controller, then starts the fusion node on the event
//!    bus.
//! 3. Prints each published estimate against the emulator's ground truth
//!    (`--json` for one JSON object per line).
//! 4. Reads operator commands from stdin (`pause`, `resume`, empty line to
//!    toggle, `emu pause` / `emu resume` for the robot itself, `quit`) and
//!    shuts down cleanly on **Ctrl-C**.

mod config;
mod console;

use colored::Colorize;
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use armtrack_hal::{RobotEmulator, SineAnimator, SweepRenderer};
use armtrack_middleware::{EventBus, Topic};
use armtrack_runtime::{FusionController, FusionNode, init_tracing};
use armtrack_types::{EventPayload, FusedEstimate, Kinematics, RobotState, TrackError};

use crate::config::AppConfig;

fn main() -> ExitCode {
    // Held until exit so pending spans are flushed.
    let _telemetry = init_tracing("armtrack");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let json = args.iter().any(|a| a == "--json");
    let path_arg = args.iter().find(|a| !a.starts_with("--")).map(String::as_str);
    let path = config::config_path(path_arg);

    let cfg = match AppConfig::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red());
            return ExitCode::FAILURE;
        }
    };
    if !json {
        print_banner();
        println!("  Config loaded from {}", path.display().to_string().bold());
        println!("  Type {} for a list of commands.\n", "help".bold().cyan());
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {e}", "Runtime error".red());
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cfg, json)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", "Tracker error".red());
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: AppConfig, json: bool) -> Result<(), TrackError> {
    let chain: Arc<dyn Kinematics> = Arc::new(cfg.robot.chain()?);
    let renderer = Arc::new(SweepRenderer::new(cfg.renderer.clone(), chain.joint_count())?);
    let initial = cfg.robot.initial_state()?;

    let emulator = RobotEmulator::new(
        cfg.emulator.emulator_config(&cfg.fusion.sensors),
        initial.clone(),
        renderer.clone(),
        Box::new(SineAnimator::new(
            cfg.emulator.animation_gain,
            cfg.emulator.animated_joints.clone(),
        )),
    )?;
    let controller = FusionController::new(&cfg.fusion, chain.clone(), renderer)?;
    controller.initialize(&initial)?;
    controller.run()?;

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    // ── Tasks ─────────────────────────────────────────────────────────────
    let bus = EventBus::default();
    let mut estimates = bus.subscribe_to(Topic::Estimates);
    let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
    let node = FusionNode::spawn(controller.clone(), &bus, &cfg.fusion.sensors)?;

    let emulator_control = emulator.control();
    let (truth_tx, truth_rx) = watch::channel(initial);
    let emulator_task = tokio::spawn(emulator.run(bus.clone(), shutdown.clone(), Some(truth_tx)));

    {
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || console::run(controller, emulator_control, shutdown));
    }

    // ── Display loop ──────────────────────────────────────────────────────
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    let mut worst_error: f64 = 0.0;
    while !shutdown.load(Ordering::SeqCst) {
        tokio::select! {
            Some(event) = estimates.next_event() => {
                if let EventPayload::Estimate(estimate) = event.payload {
                    let truth = truth_rx.borrow().clone();
                    let report = Report::new(&estimate, &truth, chain.as_ref());
                    worst_error = worst_error.max(report.max_error());
                    report.print(chain.as_ref(), json);
                }
            }
            Some(event) = alerts.next_event() => {
                if let EventPayload::SensorFault { stream, message } = event.payload {
                    println!("{} {stream:?}: {message}", "Sensor fault".red().bold());
                }
            }
            _ = poll.tick() => {}
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────
    node.shutdown().await;
    let emulator = emulator_task
        .await
        .map_err(|e| TrackError::Channel(format!("emulator task failed: {e}")))?;

    let stats = controller.stats();
    info!(?stats, emulated_seconds = emulator.time(), "tracker stopped");
    if !json {
        let final_report =
            Report::new(&controller.current_state(), emulator.state(), chain.as_ref());
        println!();
        println!("  Emulated time   {:.2} s", emulator.time());
        println!("  Final error     {:.4} rad", final_report.max_error());
        if let Some(tip) = final_report.tip_error {
            println!("  Tip error       {:.4} m", tip);
        }
        println!("  Worst error     {worst_error:.4} rad");
        println!(
            "  Observations    {} joint, {} visual applied",
            stats.joint_applied, stats.visual_applied
        );
        println!("{}", "  ✓ Exiting armtrack.".green());
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

/// One estimate compared with ground truth.
#[derive(Debug, Serialize)]
struct Report {
    timestamp: f64,
    estimate: Vec<f64>,
    truth: Vec<f64>,
    error: Vec<f64>,
    /// End-effector distance between estimate and truth (m).
    tip_error: Option<f64>,
}

impl Report {
    fn new(estimate: &FusedEstimate, truth: &RobotState, kinematics: &dyn Kinematics) -> Self {
        let error = estimate
            .state
            .iter()
            .zip(truth.iter())
            .map(|(e, t)| e - t)
            .collect();
        let tip_error = match (
            kinematics.end_effector(&estimate.state),
            kinematics.end_effector(truth),
        ) {
            (Ok(e), Ok(t)) => Some((e - t).norm()),
            _ => None,
        };
        Self {
            timestamp: estimate.timestamp,
            estimate: estimate.state.as_slice().to_vec(),
            truth: truth.as_slice().to_vec(),
            error,
            tip_error,
        }
    }

    fn max_error(&self) -> f64 {
        self.error.iter().fold(0.0, |m, e| m.max(e.abs()))
    }

    fn print(&self, kinematics: &dyn Kinematics, json: bool) {
        if json {
            match serde_json::to_string(self) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to encode report"),
            }
            return;
        }
        let mut line = format!("  t={:>8.3}", self.timestamp);
        for (i, ((e, t), err)) in self
            .estimate
            .iter()
            .zip(&self.truth)
            .zip(&self.error)
            .enumerate()
        {
            let name = kinematics.joint_name(i).unwrap_or("?");
            let err_text = format!("{err:+.4}");
            let err_text = if err.abs() < 0.01 {
                err_text.green()
            } else if err.abs() < 0.05 {
                err_text.yellow()
            } else {
                err_text.red()
            };
            line.push_str(&format!("  {}: {e:+.4} / {t:+.4} ({err_text})", name.bold()));
        }
        if let Some(tip) = self.tip_error {
            line.push_str(&format!("  tip {tip:.4} m"));
        }
        println!("{line}");
    }
}

fn print_banner() {
    println!();
    println!("  {} {}",
        "armtrack".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Encoder + depth fusion for articulated robots");
    println!("  Columns: estimate / truth (error), radians");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_errors() {
        let estimate = FusedEstimate {
            timestamp: 1.0,
            state: RobotState::new(vec![0.1, -0.2]),
        };
        let chain = armtrack_types::JointChain::new(vec![
            armtrack_types::JointSpec::revolute("shoulder").with_length(1.0),
            armtrack_types::JointSpec::revolute("elbow").with_length(0.0),
        ])
        .unwrap();
        let report = Report::new(&estimate, &RobotState::new(vec![0.12, -0.15]), &chain);
        assert!((report.max_error() - 0.05).abs() < 1e-12);
        assert!((report.error[0] + 0.02).abs() < 1e-12);
        // Only the 1 m shoulder link moves the tip: a chord of 0.02 rad.
        let tip = report.tip_error.unwrap();
        assert!((tip - 2.0 * (0.01f64).sin()).abs() < 1e-9);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["timestamp"], 1.0);
    }
}
