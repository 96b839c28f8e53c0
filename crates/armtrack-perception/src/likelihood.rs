//! Occlusion-aware range-sensor likelihood.
//!
//! Scores one observed depth-pixel range against the range predicted by
//! rendering a robot-state hypothesis.  The sensor is modelled as a
//! three-part mixture:
//!
//! 1. a uniform outlier tail of density `tail_weight / max_range`, always
//!    present;
//! 2. when the pixel is **not occluded**, a Gaussian around the predicted
//!    range weighted by `1 − tail_weight`;
//! 3. when the pixel is **occluded**, an exponential "something is in front"
//!    prior on `[0, predicted]` convolved with the same Gaussian noise.
//!
//! The noise grows with range:
//!
//! ```text
//! σ(obs) = model_sigma + sigma_factor · obs²
//! ```
//!
//! and the occluded branch, with `λ = ln 2 / occlusion_half_life`, reads
//!
//! ```text
//! λ · exp(−λ·obs + λ²σ²/2) · (1 + erf((pred − obs + λσ²) / (√2·σ)))
//! ─────────────────────────────────────────────────────────────────
//!                    2 · (1 − exp(−λ·pred))
//! ```
//!
//! An unbounded prediction (`f64::INFINITY`: no robot surface on that ray)
//! is a first-class input: the unoccluded branch degenerates to the tail and
//! the occluded branch to `λ · exp(λ·(−2·obs + λσ²)/2)`.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use armtrack_perception::likelihood::{PixelModel, RangeLikelihoodModel, RangeLikelihoodParameters};
//!
//! let mut model = RangeLikelihoodModel::new(Arc::new(RangeLikelihoodParameters::default()));
//! model.set_prediction(1.5, false);
//! let hit = model.probability(1.5);
//! let miss = model.probability(3.0);
//! assert!(hit > miss);
//! assert!(miss > 0.0);
//! ```

use std::f64::consts::{LN_2, PI, SQRT_2};
use std::sync::Arc;

use armtrack_types::TrackError;
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Parameters
// ────────────────────────────────────────────────────────────────────────────

/// Immutable configuration of [`RangeLikelihoodModel`], shared by reference
/// across every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeLikelihoodParameters {
    /// Probability mass reserved for the uniform outlier component.
    pub tail_weight: f64,
    /// Range noise standard deviation at zero range (metres).
    pub model_sigma: f64,
    /// Quadratic growth of the noise with observed range.
    pub sigma_factor: f64,
    /// Distance over which the occluder prior halves (metres).
    pub occlusion_half_life: f64,
    /// Maximum sensor range (metres).
    pub max_range: f64,
    /// Prior probability that a pixel is occluded, used when the caller
    /// marginalises over the occlusion flag.
    pub occlusion_prior: f64,
}

impl Default for RangeLikelihoodParameters {
    fn default() -> Self {
        Self {
            tail_weight: 0.01,
            model_sigma: 0.003,
            sigma_factor: 0.001_424_78,
            occlusion_half_life: 1.0,
            max_range: 6.0,
            occlusion_prior: 0.1,
        }
    }
}

impl RangeLikelihoodParameters {
    /// Reject parameter sets that would make the mixture ill-defined.
    pub fn validate(&self) -> Result<(), TrackError> {
        let fail = |msg: String| Err(TrackError::Config(format!("likelihood: {msg}")));
        if !(0.0..1.0).contains(&self.tail_weight) {
            return fail(format!("tail_weight {} outside [0, 1)", self.tail_weight));
        }
        if !(self.model_sigma > 0.0 && self.model_sigma.is_finite()) {
            return fail(format!("model_sigma {} must be positive", self.model_sigma));
        }
        if !(self.sigma_factor >= 0.0 && self.sigma_factor.is_finite()) {
            return fail(format!("sigma_factor {} must be non-negative", self.sigma_factor));
        }
        if !(self.occlusion_half_life > 0.0 && self.occlusion_half_life.is_finite()) {
            return fail(format!(
                "occlusion_half_life {} must be positive",
                self.occlusion_half_life
            ));
        }
        if !(self.max_range > 0.0 && self.max_range.is_finite()) {
            return fail(format!("max_range {} must be positive", self.max_range));
        }
        if !(0.0..=1.0).contains(&self.occlusion_prior) {
            return fail(format!(
                "occlusion_prior {} outside [0, 1]",
                self.occlusion_prior
            ));
        }
        Ok(())
    }

    /// Exponential rate of the occluder prior.
    pub fn exponential_rate(&self) -> f64 {
        LN_2 / self.occlusion_half_life
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PixelModel
// ────────────────────────────────────────────────────────────────────────────

/// A per-pixel sensor model that is conditioned once on a rendered
/// prediction and then queried for observations.
///
/// Alternative sensor models plug into the particle tracker through this
/// trait.
pub trait PixelModel: Send + Sync {
    /// Condition the model on the predicted range of the current pixel.
    fn set_prediction(&mut self, predicted_range: f64, occluded: bool);

    /// Density of `observed_range` under the current prediction.
    fn probability(&self, observed_range: f64) -> f64;

    /// Natural log of [`probability`][Self::probability];
    /// `f64::NEG_INFINITY` when the probability is zero.
    fn log_probability(&self, observed_range: f64) -> f64 {
        log_or_neg_infinity(self.probability(observed_range))
    }
}

/// `ln(p)` for positive `p`, `f64::NEG_INFINITY` otherwise.
pub fn log_or_neg_infinity(p: f64) -> f64 {
    if p > 0.0 { p.ln() } else { f64::NEG_INFINITY }
}

// ────────────────────────────────────────────────────────────────────────────
// RangeLikelihoodModel
// ────────────────────────────────────────────────────────────────────────────

/// Depth-camera likelihood with an explicit occlusion branch.
///
/// [`evaluate`][Self::evaluate] is a pure function of its arguments; the
/// [`PixelModel`] implementation caches the prediction so a scoring loop can
/// condition once per rendered pixel.
#[derive(Debug, Clone)]
pub struct RangeLikelihoodModel {
    params: Arc<RangeLikelihoodParameters>,
    exponential_rate: f64,
    prediction: f64,
    occluded: bool,
}

impl RangeLikelihoodModel {
    /// Create a model over shared parameters.  The cached prediction starts
    /// unbounded and unoccluded.
    pub fn new(params: Arc<RangeLikelihoodParameters>) -> Self {
        let exponential_rate = params.exponential_rate();
        Self {
            params,
            exponential_rate,
            prediction: f64::INFINITY,
            occluded: false,
        }
    }

    pub fn parameters(&self) -> &RangeLikelihoodParameters {
        &self.params
    }

    /// Density of the uniform outlier component.
    pub fn tail_density(&self) -> f64 {
        self.params.tail_weight / self.params.max_range
    }

    /// Range-dependent noise standard deviation.
    pub fn sigma(&self, observed_range: f64) -> f64 {
        self.params.model_sigma + self.params.sigma_factor * observed_range * observed_range
    }

    /// Density of `observed` given `predicted` and the occlusion flag.
    ///
    /// Never negative and never NaN: a numerically degenerate evaluation
    /// falls back to the tail density.
    pub fn evaluate(&self, predicted: f64, observed: f64, occluded: bool) -> f64 {
        let tail = self.tail_density();
        let body_weight = 1.0 - self.params.tail_weight;
        let sigma = self.sigma(observed);
        let rate = self.exponential_rate;

        let body = if !occluded {
            if predicted.is_infinite() {
                0.0
            } else {
                let err = predicted - observed;
                (-(err * err) / (2.0 * sigma * sigma)).exp() / ((2.0 * PI).sqrt() * sigma)
            }
        } else if predicted.is_infinite() {
            rate * (0.5 * rate * (-2.0 * observed + rate * sigma * sigma)).exp()
        } else if predicted <= 0.0 {
            // Nothing can sit in front of a zero-range surface.
            0.0
        } else {
            let normalizer = -(-rate * predicted).exp_m1();
            let shifted = predicted - observed + rate * sigma * sigma;
            rate * (-rate * observed + 0.5 * rate * rate * sigma * sigma).exp()
                * (1.0 + libm::erf(shifted / (SQRT_2 * sigma)))
                / (2.0 * normalizer)
        };

        let p = tail + body_weight * body;
        if p.is_finite() && p >= 0.0 { p } else { tail }
    }

    /// `ln` of [`evaluate`][Self::evaluate].
    pub fn log_evaluate(&self, predicted: f64, observed: f64, occluded: bool) -> f64 {
        log_or_neg_infinity(self.evaluate(predicted, observed, occluded))
    }

    /// Density with the occlusion flag marginalised under
    /// `occlusion_prior`.
    pub fn evaluate_marginal(&self, predicted: f64, observed: f64) -> f64 {
        let q = self.params.occlusion_prior;
        (1.0 - q) * self.evaluate(predicted, observed, false)
            + q * self.evaluate(predicted, observed, true)
    }
}

impl PixelModel for RangeLikelihoodModel {
    fn set_prediction(&mut self, predicted_range: f64, occluded: bool) {
        self.prediction = predicted_range;
        self.occluded = occluded;
    }

    fn probability(&self, observed_range: f64) -> f64 {
        self.evaluate(self.prediction, observed_range, self.occluded)
    }
}
