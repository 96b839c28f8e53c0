//! Tracker parameter surface, loaded from TOML.
//!
//! ```toml
//! [likelihood]            # optional, defaults shown in RangeLikelihoodParameters
//! tail_weight = 0.01
//!
//! [joint_transition]      # required, one entry per joint
//! joint_sigmas = [0.5]
//! bias_sigmas  = [0.01]
//! bias_factors = [1.0]
//!
//! [joint_observation]     # required, one entry per joint
//! joint_sigmas = [0.002]
//!
//! [joint_prior]           # optional
//! [visual]                # optional, particle tracker
//! [fusion]                # optional, residual injection
//! [sensors]               # optional, rates and delay
//! ```
//!
//! The per-joint vectors have no defaults: a file without them fails to
//! parse.  [`FusionConfig::validate`] checks them against the kinematic
//! model before anything is built.

use std::fs;
use std::path::Path;

use armtrack_perception::joint_filter::{JointNoise, JointPrior};
use armtrack_perception::likelihood::RangeLikelihoodParameters;
use armtrack_perception::particle::VisualParticleConfig;
use armtrack_types::TrackError;
use serde::{Deserialize, Serialize};

/// Per-joint transition noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointTransitionConfig {
    pub joint_sigmas: Vec<f64>,
    pub bias_sigmas: Vec<f64>,
    pub bias_factors: Vec<f64>,
}

/// Per-joint encoder noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointObservationConfig {
    pub joint_sigmas: Vec<f64>,
}

/// How visual residuals are folded into the joint bank.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionPolicy {
    /// Standard deviation assigned to a visual residual (rad).
    pub correction_sigma: f64,
    /// Span of joint-bank history kept to line residuals up with delayed
    /// frames (s).
    pub history_window: f64,
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self {
            correction_sigma: 0.01,
            history_window: 2.0,
        }
    }
}

/// Sensor timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Encoder rate (Hz).
    pub joint_rate: f64,
    /// Depth camera rate (Hz).
    pub visual_rate: f64,
    /// Capture-to-delivery delay of depth frames (s).
    pub visual_delay: f64,
    /// Emulator time dilation.
    pub dilation: f64,
    /// Rate at which the estimate is published (Hz).
    pub publish_rate: f64,
    /// A stream is considered silent after this many missed periods.
    pub timeout_periods: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            joint_rate: 1000.0,
            visual_rate: 30.0,
            visual_delay: 0.0,
            dilation: 1.0,
            publish_rate: 24.0,
            timeout_periods: 10.0,
        }
    }
}

impl SensorConfig {
    /// Rates, dilation and timeout must be positive; the delay non-negative.
    pub fn validate(&self) -> Result<(), TrackError> {
        for (name, value) in [
            ("joint_rate", self.joint_rate),
            ("visual_rate", self.visual_rate),
            ("dilation", self.dilation),
            ("publish_rate", self.publish_rate),
            ("timeout_periods", self.timeout_periods),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(TrackError::Config(format!("sensors: {name} {value} must be positive")));
            }
        }
        if !(self.visual_delay >= 0.0 && self.visual_delay.is_finite()) {
            return Err(TrackError::Config(format!(
                "sensors: visual_delay {} must be non-negative",
                self.visual_delay
            )));
        }
        Ok(())
    }
}

/// Complete tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default)]
    pub likelihood: RangeLikelihoodParameters,
    pub joint_transition: JointTransitionConfig,
    pub joint_observation: JointObservationConfig,
    #[serde(default)]
    pub joint_prior: JointPrior,
    #[serde(default)]
    pub visual: VisualParticleConfig,
    #[serde(default)]
    pub fusion: FusionPolicy,
    #[serde(default)]
    pub sensors: SensorConfig,
}

impl FusionConfig {
    /// A configuration with uniform per-joint noise, used by tests and
    /// demos.
    pub fn uniform(joint_count: usize, joint_sigma: f64, bias_sigma: f64, observation_sigma: f64) -> Self {
        Self {
            likelihood: RangeLikelihoodParameters::default(),
            joint_transition: JointTransitionConfig {
                joint_sigmas: vec![joint_sigma; joint_count],
                bias_sigmas: vec![bias_sigma; joint_count],
                bias_factors: vec![1.0; joint_count],
            },
            joint_observation: JointObservationConfig {
                joint_sigmas: vec![observation_sigma; joint_count],
            },
            joint_prior: JointPrior::default(),
            visual: VisualParticleConfig::default(),
            fusion: FusionPolicy::default(),
            sensors: SensorConfig::default(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, TrackError> {
        toml::from_str(raw).map_err(|e| TrackError::Config(format!("failed to parse config: {e}")))
    }

    /// Read, parse and apply `ARMTRACK_*` overrides.  Does not validate.
    pub fn load_from(path: &Path) -> Result<Self, TrackError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            TrackError::Config(format!("failed to read config at {}: {e}", path.display()))
        })?;
        let mut cfg = Self::from_toml_str(&raw)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), TrackError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TrackError::Config(format!("failed to create config directory: {e}")))?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|e| TrackError::Config(format!("failed to serialize config: {e}")))?;
        fs::write(path, raw).map_err(|e| {
            TrackError::Config(format!("failed to write config at {}: {e}", path.display()))
        })
    }

    /// Apply `ARMTRACK_*` environment variable overrides.
    ///
    /// | Variable | Config field |
    /// |---|---|
    /// | `ARMTRACK_JOINT_RATE` | `sensors.joint_rate` |
    /// | `ARMTRACK_VISUAL_RATE` | `sensors.visual_rate` |
    /// | `ARMTRACK_VISUAL_DELAY` | `sensors.visual_delay` |
    /// | `ARMTRACK_DILATION` | `sensors.dilation` |
    /// | `ARMTRACK_PUBLISH_RATE` | `sensors.publish_rate` |
    ///
    /// Values that do not parse as numbers are ignored.
    pub fn apply_env_overrides(&mut self) {
        let read = |name: &str| std::env::var(name).ok().and_then(|v| v.trim().parse::<f64>().ok());
        if let Some(v) = read("ARMTRACK_JOINT_RATE") {
            self.sensors.joint_rate = v;
        }
        if let Some(v) = read("ARMTRACK_VISUAL_RATE") {
            self.sensors.visual_rate = v;
        }
        if let Some(v) = read("ARMTRACK_VISUAL_DELAY") {
            self.sensors.visual_delay = v;
        }
        if let Some(v) = read("ARMTRACK_DILATION") {
            self.sensors.dilation = v;
        }
        if let Some(v) = read("ARMTRACK_PUBLISH_RATE") {
            self.sensors.publish_rate = v;
        }
    }

    /// Check every section against a robot with `joint_count` joints.
    pub fn validate(&self, joint_count: usize) -> Result<(), TrackError> {
        let per_joint = [
            &self.joint_transition.joint_sigmas,
            &self.joint_transition.bias_sigmas,
            &self.joint_transition.bias_factors,
            &self.joint_observation.joint_sigmas,
        ];
        for values in per_joint {
            if values.len() != joint_count {
                return Err(TrackError::JointCountMismatch {
                    expected: joint_count,
                    actual: values.len(),
                });
            }
        }
        // Per-joint signs are checked by the filter bank itself.
        armtrack_perception::joint_filter::JointFilterBank::new(self.joint_noise(), self.joint_prior)?;

        self.likelihood.validate()?;
        self.visual.validate()?;

        let positive = |v: f64| v > 0.0 && v.is_finite();
        if !positive(self.fusion.correction_sigma) {
            return Err(TrackError::Config(format!(
                "fusion: correction_sigma {} must be positive",
                self.fusion.correction_sigma
            )));
        }
        if !positive(self.fusion.history_window) {
            return Err(TrackError::Config(format!(
                "fusion: history_window {} must be positive",
                self.fusion.history_window
            )));
        }
        let s = &self.sensors;
        s.validate()?;
        if s.visual_delay >= self.fusion.history_window {
            return Err(TrackError::Config(format!(
                "fusion: history_window {} must exceed visual_delay {}",
                self.fusion.history_window, s.visual_delay
            )));
        }
        Ok(())
    }

    /// Per-joint noise in filter-bank form.
    pub fn joint_noise(&self) -> Vec<JointNoise> {
        let t = &self.joint_transition;
        t.joint_sigmas
            .iter()
            .zip(&t.bias_sigmas)
            .zip(&t.bias_factors)
            .zip(&self.joint_observation.joint_sigmas)
            .map(|(((&joint_sigma, &bias_sigma), &bias_factor), &observation_sigma)| JointNoise {
                joint_sigma,
                bias_sigma,
                bias_factor,
                observation_sigma,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [joint_transition]
        joint_sigmas = [0.5, 0.5]
        bias_sigmas = [0.01, 0.01]
        bias_factors = [1.0, 0.999]

        [joint_observation]
        joint_sigmas = [0.002, 0.002]
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = FusionConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.likelihood, RangeLikelihoodParameters::default());
        assert_eq!(cfg.likelihood.max_range, 6.0);
        assert_eq!(cfg.sensors.joint_rate, 1000.0);
        assert!(cfg.validate(2).is_ok());
        let noise = cfg.joint_noise();
        assert_eq!(noise.len(), 2);
        assert_eq!(noise[1].bias_factor, 0.999);
        assert_eq!(noise[0].observation_sigma, 0.002);
    }

    #[test]
    fn missing_required_section_is_fatal() {
        let raw = r#"
            [joint_transition]
            joint_sigmas = [0.5]
            bias_sigmas = [0.01]
            bias_factors = [1.0]
        "#;
        assert!(matches!(FusionConfig::from_toml_str(raw), Err(TrackError::Config(_))));

        let raw = r#"
            [joint_transition]
            joint_sigmas = [0.5]
            bias_factors = [1.0]
            [joint_observation]
            joint_sigmas = [0.002]
        "#;
        assert!(FusionConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn sections_override_defaults() {
        let raw = format!(
            "{MINIMAL}
            [likelihood]
            tail_weight = 0.05
            max_range = 8

            [visual]
            particle_count = 50
            aggregate = {{ kind = \"trimmed\", fraction = 0.1 }}
            resampling = \"multinomial\"
            seed = 3

            [sensors]
            visual_delay = 0.1
            "
        );
        let cfg = FusionConfig::from_toml_str(&raw).unwrap();
        assert_eq!(cfg.likelihood.tail_weight, 0.05);
        assert_eq!(cfg.likelihood.max_range, 8.0);
        assert_eq!(cfg.likelihood.model_sigma, 0.003);
        assert_eq!(cfg.visual.particle_count, 50);
        assert_eq!(
            cfg.visual.aggregate,
            armtrack_perception::particle::Aggregate::Trimmed { fraction: 0.1 }
        );
        assert_eq!(cfg.visual.seed, Some(3));
        assert_eq!(cfg.sensors.visual_delay, 0.1);
        assert!(cfg.validate(2).is_ok());
    }

    #[test]
    fn validate_catches_length_and_range_errors() {
        let cfg = FusionConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(
            cfg.validate(3),
            Err(TrackError::JointCountMismatch { expected: 3, actual: 2 })
        );

        let mut bad = cfg.clone();
        bad.joint_observation.joint_sigmas[0] = -1.0;
        assert!(matches!(bad.validate(2), Err(TrackError::Config(_))));

        let mut bad = cfg.clone();
        bad.likelihood.tail_weight = 2.0;
        assert!(bad.validate(2).is_err());

        let mut bad = cfg.clone();
        bad.sensors.visual_delay = 5.0;
        assert!(bad.validate(2).is_err());

        let mut bad = cfg;
        bad.sensors.visual_rate = 0.0;
        assert!(bad.validate(2).is_err());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("armtrack").join("tracker.toml");
        let cfg = FusionConfig::uniform(3, 0.4, 0.02, 0.001);
        cfg.save_to(&path).expect("save");
        let loaded = FusionConfig::load_from(&path).expect("load");
        assert_eq!(loaded.joint_transition, cfg.joint_transition);
        assert_eq!(loaded.joint_observation, cfg.joint_observation);
        assert_eq!(loaded.likelihood, cfg.likelihood);
    }

    #[test]
    fn load_from_missing_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = FusionConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, TrackError::Config(_)));
    }

    #[test]
    fn apply_env_overrides_changes_rates() {
        // SAFETY: the variables are unique to this test.
        unsafe {
            std::env::set_var("ARMTRACK_VISUAL_DELAY", "0.25");
            std::env::set_var("ARMTRACK_DILATION", "not-a-number");
        }
        let mut cfg = FusionConfig::uniform(1, 0.5, 0.01, 0.002);
        cfg.apply_env_overrides();
        assert_eq!(cfg.sensors.visual_delay, 0.25);
        assert_eq!(cfg.sensors.dilation, 1.0);
        unsafe {
            std::env::remove_var("ARMTRACK_VISUAL_DELAY");
            std::env::remove_var("ARMTRACK_DILATION");
        }
    }
}
