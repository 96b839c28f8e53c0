//! Factorised per-joint Kalman filter bank.
//!
//! Each joint carries a two-element state `[angle, bias]` and its own noise
//! parameters.  The encoder reads the angle offset by the bias:
//!
//! ```text
//! reading = angle − bias + v,        v ~ N(0, observation_sigma²)
//! ```
//!
//! and the transition is a random walk on the angle plus a decaying random
//! walk on the bias:
//!
//! ```text
//! angle' = angle + w_a,              Var(w_a) = joint_sigma² · dt
//! bias'  = bias_factor · bias + w_b, Var(w_b) = bias_sigma²  · dt
//! ```
//!
//! Joints never share state, so one joint's missing reading cannot hold up
//! the others: that joint is predicted only and flagged stale.

use armtrack_types::{EncoderSample, RobotState, TrackError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Noise parameters of a single joint filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointNoise {
    /// Angle random-walk intensity (rad / √s).
    pub joint_sigma: f64,
    /// Bias random-walk intensity (rad / √s).
    pub bias_sigma: f64,
    /// Per-step multiplicative coupling of the bias onto itself.
    pub bias_factor: f64,
    /// Encoder reading noise (rad).
    pub observation_sigma: f64,
}

impl JointNoise {
    fn validate(&self, joint: usize) -> Result<(), TrackError> {
        let ok = self.joint_sigma >= 0.0
            && self.joint_sigma.is_finite()
            && self.bias_sigma >= 0.0
            && self.bias_sigma.is_finite()
            && self.bias_factor.is_finite()
            && self.observation_sigma > 0.0
            && self.observation_sigma.is_finite();
        if ok {
            Ok(())
        } else {
            Err(TrackError::Config(format!(
                "joint {joint}: invalid filter noise {self:?}"
            )))
        }
    }
}

/// Belief over one joint's `[angle, bias]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointFilterState {
    pub angle: f64,
    pub bias: f64,
    /// Row-major 2×2 covariance of `[angle, bias]`.
    pub covariance: [[f64; 2]; 2],
    /// `true` when the last step had no reading for this joint.
    pub stale: bool,
}

impl JointFilterState {
    fn new(angle: f64, angle_sigma: f64, bias_sigma: f64) -> Self {
        Self {
            angle,
            bias: 0.0,
            covariance: [[angle_sigma * angle_sigma, 0.0], [0.0, bias_sigma * bias_sigma]],
            stale: false,
        }
    }

    pub fn angle_variance(&self) -> f64 {
        self.covariance[0][0]
    }

    pub fn bias_variance(&self) -> f64 {
        self.covariance[1][1]
    }

    fn predict(&mut self, noise: &JointNoise, dt: f64) {
        let f = noise.bias_factor;
        let p = &mut self.covariance;
        p[0][0] += noise.joint_sigma * noise.joint_sigma * dt;
        p[0][1] *= f;
        p[1][0] *= f;
        p[1][1] = f * f * p[1][1] + noise.bias_sigma * noise.bias_sigma * dt;
        self.bias *= f;
    }

    /// Scalar Kalman update with measurement row `h` and innovation `y`.
    fn update(&mut self, h: [f64; 2], innovation: f64, variance: f64) {
        let p = self.covariance;
        let ph = [
            p[0][0] * h[0] + p[0][1] * h[1],
            p[1][0] * h[0] + p[1][1] * h[1],
        ];
        let s = h[0] * ph[0] + h[1] * ph[1] + variance;
        if !(s > 0.0 && s.is_finite()) {
            return;
        }
        let k = [ph[0] / s, ph[1] / s];

        self.angle += k[0] * innovation;
        self.bias += k[1] * innovation;

        // P ← P − K (H P), then symmetrise.
        let hp = [
            h[0] * p[0][0] + h[1] * p[1][0],
            h[0] * p[0][1] + h[1] * p[1][1],
        ];
        let mut next = [[0.0; 2]; 2];
        for (r, row) in next.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = p[r][c] - k[r] * hp[c];
            }
        }
        let off = 0.5 * (next[0][1] + next[1][0]);
        next[0][1] = off;
        next[1][0] = off;
        next[0][0] = next[0][0].max(0.0);
        next[1][1] = next[1][1].max(0.0);
        self.covariance = next;
    }
}

/// Prior used by [`JointFilterBank::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JointPrior {
    pub initial_angle_sigma: f64,
    pub initial_bias_sigma: f64,
}

impl Default for JointPrior {
    fn default() -> Self {
        Self {
            initial_angle_sigma: 0.1,
            initial_bias_sigma: 0.01,
        }
    }
}

/// One independent filter per joint, indexed like [`RobotState`].
#[derive(Debug, Clone)]
pub struct JointFilterBank {
    noise: Vec<JointNoise>,
    prior: JointPrior,
    filters: Vec<JointFilterState>,
}

impl JointFilterBank {
    /// Build a bank with one filter per entry of `noise`, all at angle zero.
    ///
    /// # Errors
    ///
    /// [`TrackError::Config`] for an empty bank or non-physical noise.
    pub fn new(noise: Vec<JointNoise>, prior: JointPrior) -> Result<Self, TrackError> {
        if noise.is_empty() {
            return Err(TrackError::Config("joint filter bank has no joints".to_string()));
        }
        for (i, n) in noise.iter().enumerate() {
            n.validate(i)?;
        }
        if !(prior.initial_angle_sigma >= 0.0 && prior.initial_bias_sigma >= 0.0) {
            return Err(TrackError::Config(format!("invalid joint prior {prior:?}")));
        }
        let filters = noise
            .iter()
            .map(|_| JointFilterState::new(0.0, prior.initial_angle_sigma, prior.initial_bias_sigma))
            .collect();
        Ok(Self {
            noise,
            prior,
            filters,
        })
    }

    pub fn joint_count(&self) -> usize {
        self.filters.len()
    }

    /// Reset every joint to the prior centred on `state`.
    pub fn initialize(&mut self, state: &RobotState) -> Result<(), TrackError> {
        state.check_len(self.joint_count())?;
        for (filter, &angle) in self.filters.iter_mut().zip(state.iter()) {
            *filter = JointFilterState::new(
                angle,
                self.prior.initial_angle_sigma,
                self.prior.initial_bias_sigma,
            );
        }
        Ok(())
    }

    /// Propagate every joint by `dt` seconds without an observation.
    pub fn predict(&mut self, dt: f64) {
        let dt = dt.max(0.0);
        for (filter, noise) in self.filters.iter_mut().zip(&self.noise) {
            filter.predict(noise, dt);
        }
    }

    /// Predict by `dt` and fold in one encoder sample.
    ///
    /// A `NaN` reading leaves that joint predicted only and marks it stale.
    ///
    /// # Errors
    ///
    /// [`TrackError::MalformedObservation`] when the sample does not carry
    /// one reading per joint; the bank is left untouched.
    pub fn advance(&mut self, dt: f64, sample: &EncoderSample) -> Result<(), TrackError> {
        if sample.positions.len() != self.joint_count() {
            return Err(TrackError::MalformedObservation(format!(
                "encoder sample carries {} readings for {} joints",
                sample.positions.len(),
                self.joint_count()
            )));
        }
        let dt = dt.max(0.0);
        for (i, ((filter, noise), &reading)) in self
            .filters
            .iter_mut()
            .zip(&self.noise)
            .zip(&sample.positions)
            .enumerate()
        {
            filter.predict(noise, dt);
            if reading.is_finite() {
                let innovation = reading - (filter.angle - filter.bias);
                let r = noise.observation_sigma * noise.observation_sigma;
                filter.update([1.0, -1.0], innovation, r);
                filter.stale = false;
            } else {
                if !filter.stale {
                    debug!(joint = i, timestamp = sample.timestamp, "encoder reading missing");
                }
                filter.stale = true;
            }
        }
        Ok(())
    }

    /// Mean joint angles.
    pub fn estimate(&self) -> RobotState {
        RobotState::new(self.filters.iter().map(|f| f.angle).collect())
    }

    /// Mean encoder biases.
    pub fn biases(&self) -> RobotState {
        RobotState::new(self.filters.iter().map(|f| f.bias).collect())
    }

    pub fn filters(&self) -> &[JointFilterState] {
        &self.filters
    }

    /// Indices of joints that were only predicted in the last step.
    pub fn stale_joints(&self) -> Vec<usize> {
        self.filters
            .iter()
            .enumerate()
            .filter(|(_, f)| f.stale)
            .map(|(i, _)| i)
            .collect()
    }

    /// Treat `residual` as a direct observation of the angle error with
    /// variance `variance`.
    ///
    /// The update acts on the angle, and through the angle/bias
    /// cross-covariance built up by encoder updates it shifts the bias, so
    /// subsequent encoder readings stay aligned with the correction.
    /// Non-finite residual components are skipped.
    pub fn inject_correction(&mut self, residual: &RobotState, variance: f64) -> Result<(), TrackError> {
        residual.check_len(self.joint_count())?;
        if !(variance > 0.0 && variance.is_finite()) {
            return Err(TrackError::Config(format!(
                "correction variance {variance} must be positive"
            )));
        }
        for (filter, &r) in self.filters.iter_mut().zip(residual.iter()) {
            if r.is_finite() {
                filter.update([1.0, 0.0], r, variance);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise() -> JointNoise {
        JointNoise {
            joint_sigma: 0.5,
            bias_sigma: 0.01,
            bias_factor: 1.0,
            observation_sigma: 0.01,
        }
    }

    fn sample(t: f64, positions: Vec<f64>) -> EncoderSample {
        EncoderSample {
            timestamp: t,
            positions,
        }
    }

    #[test]
    fn rejects_empty_and_invalid_noise() {
        assert!(JointFilterBank::new(Vec::new(), JointPrior::default()).is_err());
        let bad = JointNoise {
            observation_sigma: 0.0,
            ..noise()
        };
        assert!(matches!(
            JointFilterBank::new(vec![bad], JointPrior::default()),
            Err(TrackError::Config(_))
        ));
    }

    #[test]
    fn converges_to_constant_noise_free_readings() {
        let prior = JointPrior {
            initial_angle_sigma: 1.0,
            initial_bias_sigma: 1e-3,
        };
        let mut bank = JointFilterBank::new(vec![noise(); 3], prior).unwrap();
        let truth = vec![0.4, -1.2, 2.0];

        for step in 1..=50 {
            bank.advance(0.001, &sample(step as f64 * 0.001, truth.clone())).unwrap();
        }
        let early = bank.estimate();
        for step in 51..=2000 {
            bank.advance(0.001, &sample(step as f64 * 0.001, truth.clone())).unwrap();
            let est = bank.estimate();
            for (e, t) in est.iter().zip(&truth) {
                assert!((e - t).abs() < 5e-3, "step {step}: {e} vs {t}");
            }
        }
        for (e, t) in early.iter().zip(&truth) {
            assert!((e - t).abs() < 5e-3);
        }
    }

    #[test]
    fn missing_reading_only_stales_that_joint() {
        let mut bank = JointFilterBank::new(vec![noise(); 2], JointPrior::default()).unwrap();
        bank.initialize(&RobotState::new(vec![0.0, 0.0])).unwrap();
        let before = bank.filters()[1].angle_variance();

        bank.advance(0.01, &sample(0.01, vec![0.3, f64::NAN])).unwrap();

        assert_eq!(bank.stale_joints(), vec![1]);
        assert!(bank.estimate()[0] > 0.25);
        assert_eq!(bank.estimate()[1], 0.0);
        assert!(bank.filters()[1].angle_variance() > before);

        bank.advance(0.01, &sample(0.02, vec![0.3, 0.1])).unwrap();
        assert!(bank.stale_joints().is_empty());
    }

    #[test]
    fn short_sample_is_rejected_without_mutation() {
        let mut bank = JointFilterBank::new(vec![noise(); 2], JointPrior::default()).unwrap();
        let before = bank.filters().to_vec();
        let err = bank.advance(0.01, &sample(0.0, vec![1.0])).unwrap_err();
        assert!(matches!(err, TrackError::MalformedObservation(_)));
        assert_eq!(bank.filters(), before.as_slice());
    }

    #[test]
    fn initialize_checks_length() {
        let mut bank = JointFilterBank::new(vec![noise(); 2], JointPrior::default()).unwrap();
        assert!(matches!(
            bank.initialize(&RobotState::zeros(3)),
            Err(TrackError::JointCountMismatch { expected: 2, actual: 3 })
        ));
        bank.initialize(&RobotState::new(vec![0.5, -0.5])).unwrap();
        assert_eq!(bank.estimate(), RobotState::new(vec![0.5, -0.5]));
    }

    #[test]
    fn predict_grows_uncertainty_and_decays_bias() {
        let n = JointNoise {
            bias_factor: 0.5,
            ..noise()
        };
        let mut bank = JointFilterBank::new(vec![n], JointPrior::default()).unwrap();
        bank.filters[0].bias = 0.2;
        let p0 = bank.filters()[0].angle_variance();
        bank.predict(0.1);
        assert!(bank.filters()[0].angle_variance() > p0);
        assert!((bank.biases()[0] - 0.1).abs() < 1e-12);
        // Negative dt is treated as zero.
        let p1 = bank.filters()[0].angle_variance();
        bank.predict(-1.0);
        assert!((bank.filters()[0].angle_variance() - p1).abs() < 1e-15);
    }

    #[test]
    fn correction_moves_bias_and_survives_later_readings() {
        let n = JointNoise {
            joint_sigma: 0.5,
            bias_sigma: 0.05,
            bias_factor: 1.0,
            observation_sigma: 0.001,
        };
        let mut bank = JointFilterBank::new(vec![n], JointPrior::default()).unwrap();
        bank.initialize(&RobotState::new(vec![0.0])).unwrap();

        // Encoder reads 0.02 above the true angle of 0.0.
        let mut t = 0.0;
        for _ in 0..3000 {
            t += 0.001;
            bank.advance(0.001, &sample(t, vec![0.02])).unwrap();
            if (t * 1000.0).round() as i64 % 33 == 0 {
                let residual = RobotState::new(vec![0.0 - bank.estimate()[0]]);
                bank.inject_correction(&residual, 0.005 * 0.005).unwrap();
            }
        }
        let angle = bank.estimate()[0];
        let bias = bank.biases()[0];
        assert!(angle.abs() < 0.01, "angle {angle}");
        assert!((bias + 0.02).abs() < 0.01, "bias {bias}");
    }

    #[test]
    fn correction_rejects_bad_input() {
        let mut bank = JointFilterBank::new(vec![noise()], JointPrior::default()).unwrap();
        assert!(bank.inject_correction(&RobotState::zeros(2), 0.1).is_err());
        assert!(bank.inject_correction(&RobotState::zeros(1), 0.0).is_err());
        let before = bank.estimate();
        bank.inject_correction(&RobotState::new(vec![f64::NAN]), 0.1).unwrap();
        assert_eq!(bank.estimate(), before);
    }
}
