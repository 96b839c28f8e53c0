//! Robot emulator: synthetic encoder and depth streams with ground truth.
//!
//! The emulator owns a virtual clock.  [`RobotEmulator::step`] advances it
//! deterministically and returns every observation due in the interval, in
//! time order, which makes it usable from plain unit tests.
//! [`RobotEmulator::run`] drives the same clock from wall time and publishes
//! the observations on the [`EventBus`].
//!
//! | Stream | Rate | Content |
//! |---|---|---|
//! | encoders | `joint_rate` | true angles + `encoder_offsets` + `N(0, encoder_noise_sigma²)` |
//! | depth | `visual_rate` | rendered true state, holes filled with `background_range`, `N(0, depth_noise_sigma²)` |
//!
//! Depth frames are released `visual_delay` seconds after capture and keep
//! their capture timestamp.
//!
//! An [`EmulatorControl`] handle pauses the robot itself: while paused the
//! virtual clock holds, nothing moves and nothing is published.  This is
//! independent of pausing the tracker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use armtrack_middleware::{EventBus, Topic};
use armtrack_perception::render::Renderer;
use armtrack_types::{DepthFrame, EncoderSample, Event, EventPayload, Observation, RobotState, TrackError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::animator::RobotAnimator;
use crate::noise::NoiseGenerator;

/// Event-source tag used on the bus.
pub const SOURCE: &str = "armtrack-hal::emulator";

/// Tolerance when comparing scheduled sensor times against the clock.
const TIME_EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Encoder sample rate (Hz).
    pub joint_rate: f64,
    /// Depth frame rate (Hz).
    pub visual_rate: f64,
    /// Time-dilation factor handed to the animator.
    pub dilation: f64,
    /// Delay between capture and delivery of a depth frame (s).
    pub visual_delay: f64,
    pub encoder_noise_sigma: f64,
    /// Constant per-joint encoder offsets; empty means none.
    pub encoder_offsets: Vec<f64>,
    pub depth_noise_sigma: f64,
    /// Range reported where the robot is not visible; `None` reports no
    /// return.
    pub background_range: Option<f64>,
    pub seed: Option<u64>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            joint_rate: 1000.0,
            visual_rate: 30.0,
            dilation: 1.0,
            visual_delay: 0.0,
            encoder_noise_sigma: 0.0,
            encoder_offsets: Vec::new(),
            depth_noise_sigma: 0.0,
            background_range: Some(4.0),
            seed: None,
        }
    }
}

impl EmulatorConfig {
    pub fn validate(&self, joint_count: usize) -> Result<(), TrackError> {
        let fail = |msg: String| Err(TrackError::Config(format!("emulator: {msg}")));
        let positive = |v: f64| v > 0.0 && v.is_finite();
        let non_negative = |v: f64| v >= 0.0 && v.is_finite();
        if !positive(self.joint_rate) {
            return fail(format!("joint_rate {} must be positive", self.joint_rate));
        }
        if !positive(self.visual_rate) {
            return fail(format!("visual_rate {} must be positive", self.visual_rate));
        }
        if !positive(self.dilation) {
            return fail(format!("dilation {} must be positive", self.dilation));
        }
        if !non_negative(self.visual_delay) {
            return fail(format!("visual_delay {} must be non-negative", self.visual_delay));
        }
        if !non_negative(self.encoder_noise_sigma) || !non_negative(self.depth_noise_sigma) {
            return fail("noise sigmas must be non-negative".to_string());
        }
        if !self.encoder_offsets.is_empty() && self.encoder_offsets.len() != joint_count {
            return Err(TrackError::JointCountMismatch {
                expected: joint_count,
                actual: self.encoder_offsets.len(),
            });
        }
        if let Some(range) = self.background_range {
            if !non_negative(range) {
                return fail(format!("background_range {range} must be non-negative"));
            }
        }
        Ok(())
    }
}

/// Cloneable pause switch for a [`RobotEmulator`], usable after the
/// emulator has been moved into [`RobotEmulator::run`].
#[derive(Debug, Clone, Default)]
pub struct EmulatorControl {
    paused: Arc<AtomicBool>,
}

impl EmulatorControl {
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("emulator paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("emulator resumed");
        }
    }

    /// Returns `true` when the emulator is paused afterwards.
    pub fn toggle_pause(&self) -> bool {
        let paused = !self.paused.fetch_xor(true, Ordering::SeqCst);
        info!(paused, "emulator pause toggled");
        paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Emulated robot with encoders and a depth camera.
pub struct RobotEmulator {
    config: EmulatorConfig,
    renderer: Arc<dyn Renderer>,
    animator: Box<dyn RobotAnimator>,
    noise: NoiseGenerator,
    state: RobotState,
    time: f64,
    joint_ticks: u64,
    visual_ticks: u64,
    /// Captured frames waiting for their release time.
    pending: VecDeque<(f64, Arc<DepthFrame>)>,
    control: EmulatorControl,
}

impl std::fmt::Debug for RobotEmulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotEmulator")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("time", &self.time)
            .field("pending_frames", &self.pending.len())
            .field("paused", &self.control.is_paused())
            .finish()
    }
}

impl RobotEmulator {
    pub fn new(
        config: EmulatorConfig,
        initial_state: RobotState,
        renderer: Arc<dyn Renderer>,
        animator: Box<dyn RobotAnimator>,
    ) -> Result<Self, TrackError> {
        config.validate(initial_state.len())?;
        if initial_state.is_empty() || !initial_state.is_finite() {
            return Err(TrackError::Config(
                "emulator initial state must be non-empty and finite".to_string(),
            ));
        }
        let noise = NoiseGenerator::new(config.seed);
        Ok(Self {
            config,
            renderer,
            animator,
            noise,
            state: initial_state,
            time: 0.0,
            joint_ticks: 0,
            visual_ticks: 0,
            pending: VecDeque::new(),
            control: EmulatorControl::default(),
        })
    }

    /// Handle pausing and resuming this emulator.
    pub fn control(&self) -> EmulatorControl {
        self.control.clone()
    }

    /// Ground-truth state.
    pub fn state(&self) -> &RobotState {
        &self.state
    }

    /// Virtual clock (s).
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Advance the clock by `dt` seconds and return every observation due in
    /// `(now, now + dt]` (plus those due at `t = 0` on the first call), in
    /// time order.  Returns nothing and leaves the clock alone while paused.
    pub fn step(&mut self, dt: f64) -> Vec<Observation> {
        if self.control.is_paused() {
            return Vec::new();
        }
        let end = self.time + dt.max(0.0);
        let mut out = Vec::new();
        loop {
            let next_joint = self.joint_ticks as f64 / self.config.joint_rate;
            let next_visual = self.visual_ticks as f64 / self.config.visual_rate;
            let next_release = self.pending.front().map_or(f64::INFINITY, |(t, _)| *t);
            let next = next_joint.min(next_visual).min(next_release);
            if next > end + TIME_EPS {
                break;
            }
            self.advance_to(next);

            while let Some((release, _)) = self.pending.front() {
                if *release > next + TIME_EPS {
                    break;
                }
                if let Some((_, frame)) = self.pending.pop_front() {
                    out.push(Observation::Depth(frame));
                }
            }
            if next_joint <= next + TIME_EPS {
                out.push(Observation::Joints(self.sample_encoders()));
                self.joint_ticks += 1;
            }
            if next_visual <= next + TIME_EPS {
                let frame = Arc::new(self.capture_frame());
                if self.config.visual_delay > 0.0 {
                    self.pending.push_back((next + self.config.visual_delay, frame));
                } else {
                    out.push(Observation::Depth(frame));
                }
                self.visual_ticks += 1;
            }
        }
        self.advance_to(end);
        out
    }

    /// Drive the emulator from wall time, publishing on the sensor topics
    /// until `shutdown` is raised.
    ///
    /// Returns the emulator so the caller can inspect the final ground
    /// truth.
    pub async fn run(
        mut self,
        bus: EventBus,
        shutdown: Arc<AtomicBool>,
        truth: Option<tokio::sync::watch::Sender<RobotState>>,
    ) -> Self {
        let tick = Duration::from_secs_f64((1.0 / self.config.joint_rate).max(0.001));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let started = tokio::time::Instant::now();
        info!(
            joint_rate = self.config.joint_rate,
            visual_rate = self.config.visual_rate,
            visual_delay = self.config.visual_delay,
            "emulator running"
        );

        // Wall time spent paused is excluded from the virtual clock.
        let mut held = Duration::ZERO;
        let mut paused_at: Option<tokio::time::Instant> = None;

        while !shutdown.load(Ordering::SeqCst) {
            interval.tick().await;
            if self.control.is_paused() {
                paused_at.get_or_insert_with(tokio::time::Instant::now);
                continue;
            }
            if let Some(at) = paused_at.take() {
                held += at.elapsed();
            }
            let target = started.elapsed().saturating_sub(held).as_secs_f64();
            let dt = target - self.time;
            for obs in self.step(dt) {
                let topic = Topic::for_stream(obs.stream());
                let event = Event::new(SOURCE, EventPayload::Observation(obs));
                if let Err(e) = bus.publish_to(topic, event) {
                    debug!(error = %e, "observation not delivered");
                }
            }
            if let Some(tx) = &truth {
                tx.send_replace(self.state.clone());
            }
        }
        info!(time = self.time, "emulator stopped");
        self
    }

    fn advance_to(&mut self, t: f64) {
        let dt = t - self.time;
        if dt <= 0.0 {
            return;
        }
        let mut next = self.state.clone();
        self.animator
            .animate(&self.state, dt, self.config.dilation, &mut next);
        self.state = next;
        self.time = t;
    }

    fn sample_encoders(&mut self) -> EncoderSample {
        let sigma = self.config.encoder_noise_sigma;
        let positions = self
            .state
            .iter()
            .enumerate()
            .map(|(i, &angle)| {
                let offset = self.config.encoder_offsets.get(i).copied().unwrap_or(0.0);
                angle + self.noise.biased_gaussian(offset, sigma)
            })
            .collect();
        EncoderSample {
            timestamp: self.time,
            positions,
        }
    }

    fn capture_frame(&mut self) -> DepthFrame {
        let mut ranges = self.renderer.render(&self.state);
        let sigma = self.config.depth_noise_sigma;
        for r in ranges.iter_mut() {
            if r.is_infinite() {
                if let Some(background) = self.config.background_range {
                    *r = background;
                }
            }
            if r.is_finite() {
                *r = (*r + self.noise.gaussian(sigma)).max(0.0);
            }
        }
        DepthFrame::new(self.time, ranges)
    }
}
