//! Application configuration – one TOML file for the whole demo.
//!
//! The tracker sections (`[likelihood]`, `[joint_transition]`, …) are read
//! into [`FusionConfig`]; the sections below describe the emulated robot
//! and are only used by the CLI:
//!
//! ```toml
//! [robot]
//! initial_state = [0.0, 0.3]
//! [[robot.joints]]
//! name = "shoulder"
//! lower = -1.4
//! upper = 1.4
//! length = 0.4        # link length (m), 0.3 when omitted
//!
//! [renderer]          # optional, SweepRendererConfig
//! [emulator]          # optional, noise / offsets / animation
//! ```
//!
//! The file path comes from the first positional argument or
//! `ARMTRACK_CONFIG`, falling back to `armtrack.toml` in the working
//! directory.

use std::fs;
use std::path::{Path, PathBuf};

use armtrack_hal::{EmulatorConfig, SweepRendererConfig};
use armtrack_runtime::{FusionConfig, SensorConfig};
use armtrack_types::{JointChain, JointSpec, RobotState, TrackError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    pub joints: Vec<JointSpec>,
    /// Starting angles; all zeros when omitted.
    #[serde(default)]
    pub initial_state: Vec<f64>,
}

impl RobotConfig {
    pub fn chain(&self) -> Result<JointChain, TrackError> {
        JointChain::new(self.joints.clone())
    }

    pub fn initial_state(&self) -> Result<RobotState, TrackError> {
        if self.initial_state.is_empty() {
            return Ok(RobotState::zeros(self.joints.len()));
        }
        let state = RobotState::new(self.initial_state.clone());
        state.check_len(self.joints.len())?;
        Ok(state)
    }
}

/// Noise and animation of the emulated robot.  Rates come from
/// `[sensors]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorSection {
    pub encoder_noise_sigma: f64,
    pub encoder_offsets: Vec<f64>,
    pub depth_noise_sigma: f64,
    pub background_range: Option<f64>,
    pub seed: Option<u64>,
    /// Sine animation gain (rad/s).
    pub animation_gain: f64,
    /// Animated joints; empty animates all.
    pub animated_joints: Vec<usize>,
}

impl Default for EmulatorSection {
    fn default() -> Self {
        Self {
            encoder_noise_sigma: 0.001,
            encoder_offsets: Vec::new(),
            depth_noise_sigma: 0.002,
            background_range: Some(4.0),
            seed: None,
            animation_gain: 0.1,
            animated_joints: Vec::new(),
        }
    }
}

impl EmulatorSection {
    pub fn emulator_config(&self, sensors: &SensorConfig) -> EmulatorConfig {
        EmulatorConfig {
            joint_rate: sensors.joint_rate,
            visual_rate: sensors.visual_rate,
            dilation: sensors.dilation,
            visual_delay: sensors.visual_delay,
            encoder_noise_sigma: self.encoder_noise_sigma,
            encoder_offsets: self.encoder_offsets.clone(),
            depth_noise_sigma: self.depth_noise_sigma,
            background_range: self.background_range,
            seed: self.seed,
        }
    }
}

/// The CLI-only sections of the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DemoSections {
    robot: RobotConfig,
    #[serde(default)]
    renderer: SweepRendererConfig,
    #[serde(default)]
    emulator: EmulatorSection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub robot: RobotConfig,
    pub renderer: SweepRendererConfig,
    pub emulator: EmulatorSection,
    pub fusion: FusionConfig,
}

impl AppConfig {
    /// Parse both halves from `raw`.  Environment overrides are not applied.
    pub fn from_toml_str(raw: &str) -> Result<Self, TrackError> {
        let demo: DemoSections = toml::from_str(raw)
            .map_err(|e| TrackError::Config(format!("failed to parse config: {e}")))?;
        let fusion = FusionConfig::from_toml_str(raw)?;
        Ok(Self {
            robot: demo.robot,
            renderer: demo.renderer,
            emulator: demo.emulator,
            fusion,
        })
    }

    /// Read, parse, apply `ARMTRACK_*` overrides and validate.
    pub fn load(path: &Path) -> Result<Self, TrackError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            TrackError::Config(format!("failed to read config at {}: {e}", path.display()))
        })?;
        let mut cfg = Self::from_toml_str(&raw)?;
        cfg.fusion.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), TrackError> {
        let joints = self.robot.joints.len();
        self.robot.chain()?;
        self.robot.initial_state()?;
        self.fusion.validate(joints)?;
        self.emulator
            .emulator_config(&self.fusion.sensors)
            .validate(joints)?;
        if let Some(&j) = self.emulator.animated_joints.iter().find(|&&j| j >= joints) {
            return Err(TrackError::Config(format!(
                "emulator: animated joint {j} out of range for {joints} joints"
            )));
        }
        Ok(())
    }
}

/// Resolve the config path: explicit argument, then `ARMTRACK_CONFIG`, then
/// `armtrack.toml`.
pub fn config_path(arg: Option<&str>) -> PathBuf {
    resolve_path(arg, std::env::var("ARMTRACK_CONFIG").ok().as_deref())
}

/// Extracted for testability without mutating environment variables.
pub(crate) fn resolve_path(arg: Option<&str>, env: Option<&str>) -> PathBuf {
    arg.or(env)
        .filter(|p| !p.trim().is_empty())
        .map_or_else(|| PathBuf::from("armtrack.toml"), PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[robot]
initial_state = [0.0, 0.2]

[[robot.joints]]
name = "shoulder"
lower = -1.4
upper = 1.4

[[robot.joints]]
name = "elbow"

[joint_transition]
joint_sigmas = [0.5, 0.5]
bias_sigmas = [0.001, 0.001]
bias_factors = [1.0, 1.0]

[joint_observation]
joint_sigmas = [0.002, 0.002]

[sensors]
visual_rate = 15.0

[emulator]
encoder_offsets = [0.02, -0.01]
seed = 3
"#;

    #[test]
    fn parses_both_halves() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.robot.joints.len(), 2);
        assert_eq!(cfg.robot.joints[0].upper, 1.4);
        assert!(cfg.robot.joints[1].upper.is_infinite());
        assert_eq!(cfg.fusion.sensors.visual_rate, 15.0);
        assert_eq!(cfg.emulator.seed, Some(3));
        assert_eq!(cfg.renderer, SweepRendererConfig::default());
        cfg.validate().unwrap();

        let emu = cfg.emulator.emulator_config(&cfg.fusion.sensors);
        assert_eq!(emu.visual_rate, 15.0);
        assert_eq!(emu.encoder_offsets, vec![0.02, -0.01]);
    }

    #[test]
    fn missing_robot_section_is_an_error() {
        let raw = SAMPLE.replace("[robot]", "[robt]");
        assert!(matches!(
            AppConfig::from_toml_str(&raw),
            Err(TrackError::Config(_))
        ));
    }

    #[test]
    fn joint_count_mismatch_is_rejected() {
        let raw = SAMPLE.replace("encoder_offsets = [0.02, -0.01]", "encoder_offsets = [0.02]");
        let cfg = AppConfig::from_toml_str(&raw).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(TrackError::JointCountMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("armtrack.toml");
        fs::write(&path, SAMPLE).unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.robot.initial_state().unwrap(), RobotState::new(vec![0.0, 0.2]));
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(AppConfig::load(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn path_resolution_order() {
        assert_eq!(resolve_path(Some("a.toml"), Some("b.toml")), PathBuf::from("a.toml"));
        assert_eq!(resolve_path(None, Some("b.toml")), PathBuf::from("b.toml"));
        assert_eq!(resolve_path(None, None), PathBuf::from("armtrack.toml"));
    }

    #[test]
    fn shipped_config_is_valid() {
        let raw = include_str!("../../../config/armtrack.toml");
        AppConfig::from_toml_str(raw).unwrap().validate().unwrap();
    }
}
