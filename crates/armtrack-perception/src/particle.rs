//! Particle tracker over the full robot state, driven by depth frames.
//!
//! Every frame runs one sequential-importance-resampling cycle:
//!
//! | Step | What happens |
//! |---|---|
//! | Diffuse | each joint gets `N(0, diffusion_sigma² · dt)`, then joint limits are applied |
//! | Score | each particle is rendered and compared pixel-by-pixel with the frame |
//! | Reweight | `w ← w · exp(ll − max ll)`, then normalised |
//! | Resample | when the effective sample size drops below `threshold · N` |
//!
//! Pixels without a usable observation (non-finite or negative range) are
//! ignored; a frame with none at all leaves the particle set untouched.
//! The per-pixel occlusion flag is marginalised with the likelihood's
//! `occlusion_prior`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use armtrack_types::{DepthFrame, Kinematics, RobotState, TrackError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::likelihood::{
    PixelModel, RangeLikelihoodModel, RangeLikelihoodParameters, log_or_neg_infinity,
};
use crate::render::Renderer;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// How per-pixel log-likelihoods are combined into one particle score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregate {
    /// Plain sum over usable pixels.
    #[default]
    Sum,
    /// Drop the lowest `fraction` of pixel scores before summing, bounding
    /// the influence of outlier pixels.
    Trimmed { fraction: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingScheme {
    #[default]
    Systematic,
    Multinomial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EstimatePolicy {
    #[default]
    WeightedMean,
    MaxWeight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualParticleConfig {
    pub particle_count: usize,
    /// Resample when `ess < resampling_threshold · particle_count`.
    pub resampling_threshold: f64,
    /// Per-joint diffusion intensity (rad / √s).
    pub diffusion_sigma: f64,
    /// Standard deviation of the initial particle cloud (rad).
    pub initial_spread: f64,
    pub aggregate: Aggregate,
    pub resampling: ResamplingScheme,
    pub estimate_policy: EstimatePolicy,
    /// Fixed seed for reproducible runs; entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for VisualParticleConfig {
    fn default() -> Self {
        Self {
            particle_count: 200,
            resampling_threshold: 0.5,
            diffusion_sigma: 0.05,
            initial_spread: 0.05,
            aggregate: Aggregate::Sum,
            resampling: ResamplingScheme::Systematic,
            estimate_policy: EstimatePolicy::WeightedMean,
            seed: None,
        }
    }
}

impl VisualParticleConfig {
    pub fn validate(&self) -> Result<(), TrackError> {
        let fail = |msg: String| Err(TrackError::Config(format!("visual: {msg}")));
        if self.particle_count == 0 {
            return fail("particle_count must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.resampling_threshold) {
            return fail(format!(
                "resampling_threshold {} outside [0, 1]",
                self.resampling_threshold
            ));
        }
        if !(self.diffusion_sigma >= 0.0 && self.diffusion_sigma.is_finite()) {
            return fail(format!("diffusion_sigma {} must be non-negative", self.diffusion_sigma));
        }
        if !(self.initial_spread >= 0.0 && self.initial_spread.is_finite()) {
            return fail(format!("initial_spread {} must be non-negative", self.initial_spread));
        }
        if let Aggregate::Trimmed { fraction } = self.aggregate {
            if !(0.0..1.0).contains(&fraction) {
                return fail(format!("trim fraction {fraction} outside [0, 1)"));
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Particles
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub state: RobotState,
    pub weight: f64,
}

/// Result of [`VisualParticleTracker::advance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    /// The frame had no usable pixel; particles and weights are unchanged.
    Unusable,
    Updated {
        /// Effective sample size after reweighting, before any resampling.
        effective_sample_size: f64,
        resampled: bool,
        /// The weights collapsed and were reset to uniform.
        collapsed: bool,
    },
}

/// `1 / Σ wᵢ²`, or zero for an all-zero set.
pub fn effective_sample_size(particles: &[Particle]) -> f64 {
    let sum_sq: f64 = particles.iter().map(|p| p.weight * p.weight).sum();
    if sum_sq > 0.0 { 1.0 / sum_sq } else { 0.0 }
}

/// Normalise weights in place; returns `false` and resets to uniform when
/// they sum to zero or a non-finite value.
fn normalize_weights(particles: &mut [Particle]) -> bool {
    let sum: f64 = particles.iter().map(|p| p.weight).sum();
    if sum > 0.0 && sum.is_finite() {
        for p in particles.iter_mut() {
            p.weight /= sum;
        }
        true
    } else {
        let uniform = 1.0 / particles.len() as f64;
        for p in particles.iter_mut() {
            p.weight = uniform;
        }
        false
    }
}

fn systematic_resample(particles: &[Particle], rng: &mut StdRng) -> Vec<Particle> {
    let n = particles.len();
    let step = 1.0 / n as f64;
    let mut u = rng.r#gen::<f64>() * step;
    let mut i = 0;
    let mut cumsum = particles[0].weight;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        while u > cumsum && i + 1 < n {
            i += 1;
            cumsum += particles[i].weight;
        }
        out.push(Particle {
            state: particles[i].state.clone(),
            weight: step,
        });
        u += step;
    }
    out
}

fn multinomial_resample(particles: &[Particle], rng: &mut StdRng) -> Vec<Particle> {
    let n = particles.len();
    let cumulative: Vec<f64> = particles
        .iter()
        .scan(0.0, |acc, p| {
            *acc += p.weight;
            Some(*acc)
        })
        .collect();
    (0..n)
        .map(|_| {
            let u = rng.r#gen::<f64>();
            let idx = cumulative.iter().position(|&c| c >= u).unwrap_or(n - 1);
            Particle {
                state: particles[idx].state.clone(),
                weight: 1.0 / n as f64,
            }
        })
        .collect()
}

/// Combine per-pixel log-likelihoods.
fn aggregate(mut terms: Vec<f64>, policy: Aggregate) -> f64 {
    match policy {
        Aggregate::Sum => terms.iter().sum(),
        Aggregate::Trimmed { fraction } => {
            terms.sort_by(f64::total_cmp);
            let drop = (fraction * terms.len() as f64).floor() as usize;
            terms[drop.min(terms.len())..].iter().sum()
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// VisualParticleTracker
// ────────────────────────────────────────────────────────────────────────────

/// Weighted particle belief over the full [`RobotState`].
pub struct VisualParticleTracker {
    config: VisualParticleConfig,
    kinematics: Arc<dyn Kinematics>,
    renderer: Arc<dyn Renderer>,
    model: Box<dyn PixelModel>,
    occlusion_prior: f64,
    particles: Vec<Particle>,
    rng: StdRng,
    last_timestamp: Option<f64>,
    cancel: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for VisualParticleTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisualParticleTracker")
            .field("config", &self.config)
            .field("particles", &self.particles.len())
            .field("effective_sample_size", &self.effective_sample_size())
            .field("last_timestamp", &self.last_timestamp)
            .finish()
    }
}

impl VisualParticleTracker {
    /// Build a tracker scoring frames with a [`RangeLikelihoodModel`].
    ///
    /// The particle set starts as a cloud around the zero state; call
    /// [`initialize`][Self::initialize] to centre it elsewhere.
    pub fn new(
        config: VisualParticleConfig,
        kinematics: Arc<dyn Kinematics>,
        renderer: Arc<dyn Renderer>,
        likelihood: RangeLikelihoodParameters,
    ) -> Result<Self, TrackError> {
        likelihood.validate()?;
        let occlusion_prior = likelihood.occlusion_prior;
        let model = Box::new(RangeLikelihoodModel::new(Arc::new(likelihood)));
        Self::with_pixel_model(config, kinematics, renderer, model, occlusion_prior)
    }

    /// Build a tracker around an arbitrary per-pixel sensor model.
    pub fn with_pixel_model(
        config: VisualParticleConfig,
        kinematics: Arc<dyn Kinematics>,
        renderer: Arc<dyn Renderer>,
        model: Box<dyn PixelModel>,
        occlusion_prior: f64,
    ) -> Result<Self, TrackError> {
        config.validate()?;
        if kinematics.joint_count() == 0 {
            return Err(TrackError::Config("kinematics has no joints".to_string()));
        }
        let (rows, cols) = renderer.resolution();
        if rows == 0 || cols == 0 {
            return Err(TrackError::Config(format!(
                "renderer resolution {rows}x{cols} is empty"
            )));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut tracker = Self {
            particles: Vec::with_capacity(config.particle_count),
            config,
            kinematics,
            renderer,
            model,
            occlusion_prior: occlusion_prior.clamp(0.0, 1.0),
            rng,
            last_timestamp: None,
            cancel: None,
        };
        let zeros = RobotState::zeros(tracker.kinematics.joint_count());
        tracker.initialize(&zeros)?;
        Ok(tracker)
    }

    /// Abort [`advance`][Self::advance] with [`TrackError::Cancelled`] once
    /// `flag` is set.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Redraw the particle cloud around `state` with uniform weights.
    pub fn initialize(&mut self, state: &RobotState) -> Result<(), TrackError> {
        state.check_len(self.kinematics.joint_count())?;
        let n = self.config.particle_count;
        let spread = self.config.initial_spread;
        self.particles.clear();
        for _ in 0..n {
            let mut s = state.clone();
            self.jitter(&mut s, spread);
            self.particles.push(Particle {
                state: s,
                weight: 1.0 / n as f64,
            });
        }
        self.last_timestamp = None;
        Ok(())
    }

    /// Shift every particle by `delta` (the joint bank's motion since the
    /// previous frame).
    pub fn apply_motion(&mut self, delta: &RobotState) -> Result<(), TrackError> {
        self.check_motion(delta)?;
        for p in &mut self.particles {
            for (v, d) in p.state.as_mut_slice().iter_mut().zip(delta.iter()) {
                *v += d;
            }
            self.kinematics.clamp(&mut p.state);
        }
        Ok(())
    }

    fn check_motion(&self, delta: &RobotState) -> Result<(), TrackError> {
        delta.check_len(self.kinematics.joint_count())?;
        if !delta.is_finite() {
            return Err(TrackError::MalformedObservation(
                "non-finite motion delta".to_string(),
            ));
        }
        Ok(())
    }

    /// Run one diffuse / score / reweight / resample cycle on `frame`.
    ///
    /// # Errors
    ///
    /// - [`TrackError::MalformedObservation`] when the frame resolution does
    ///   not match the renderer.
    /// - [`TrackError::Cancelled`] when the cancellation flag is raised
    ///   mid-scoring; the particle set is left as it was.
    pub fn advance(&mut self, frame: &DepthFrame) -> Result<FrameOutcome, TrackError> {
        self.advance_with_motion(frame, None)
    }

    /// [`advance`][Self::advance] with every particle first shifted by
    /// `motion`.
    ///
    /// The shift is part of the proposal, so it is committed together with
    /// the reweighted set and never when the frame is rejected, cancelled or
    /// unusable.
    pub fn advance_with_motion(
        &mut self,
        frame: &DepthFrame,
        motion: Option<&RobotState>,
    ) -> Result<FrameOutcome, TrackError> {
        if let Some(delta) = motion {
            self.check_motion(delta)?;
        }
        let expected = self.renderer.resolution();
        if (frame.rows(), frame.cols()) != expected {
            return Err(TrackError::MalformedObservation(format!(
                "depth frame is {}x{}, renderer produces {}x{}",
                frame.rows(),
                frame.cols(),
                expected.0,
                expected.1
            )));
        }
        if frame.usable_pixels() == 0 {
            debug!(timestamp = frame.timestamp, "depth frame has no usable pixels");
            return Ok(FrameOutcome::Unusable);
        }

        let dt = self
            .last_timestamp
            .map_or(0.0, |t| (frame.timestamp - t).max(0.0));
        let sigma = self.config.diffusion_sigma * dt.sqrt();

        let mut proposals = Vec::with_capacity(self.particles.len());
        let mut scores = Vec::with_capacity(self.particles.len());
        for i in 0..self.particles.len() {
            if self.cancelled() {
                return Err(TrackError::Cancelled);
            }
            let mut state = self.particles[i].state.clone();
            if let Some(delta) = motion {
                for (v, d) in state.as_mut_slice().iter_mut().zip(delta.iter()) {
                    *v += d;
                }
            }
            self.jitter(&mut state, sigma);
            scores.push(self.score(&state, frame));
            proposals.push(state);
        }

        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut next: Vec<Particle> = self
            .particles
            .iter()
            .zip(proposals)
            .zip(&scores)
            .map(|((old, state), &ll)| Particle {
                state,
                weight: if max.is_finite() {
                    old.weight * (ll - max).exp()
                } else {
                    0.0
                },
            })
            .collect();

        let collapsed = !normalize_weights(&mut next);
        if collapsed {
            warn!(timestamp = frame.timestamp, "particle weights collapsed, reset to uniform");
        }

        let ess = effective_sample_size(&next);
        let threshold = self.config.resampling_threshold * next.len() as f64;
        let resampled = ess < threshold;
        if resampled {
            debug!(ess, threshold, "resampling particle set");
            next = match self.config.resampling {
                ResamplingScheme::Systematic => systematic_resample(&next, &mut self.rng),
                ResamplingScheme::Multinomial => multinomial_resample(&next, &mut self.rng),
            };
        }

        self.particles = next;
        self.last_timestamp = Some(frame.timestamp);
        Ok(FrameOutcome::Updated {
            effective_sample_size: ess,
            resampled,
            collapsed,
        })
    }

    /// Point estimate according to the configured [`EstimatePolicy`].
    pub fn estimate(&self) -> RobotState {
        match self.config.estimate_policy {
            EstimatePolicy::WeightedMean => {
                let mut mean = vec![0.0; self.kinematics.joint_count()];
                for p in &self.particles {
                    for (m, v) in mean.iter_mut().zip(p.state.iter()) {
                        *m += p.weight * v;
                    }
                }
                RobotState::new(mean)
            }
            EstimatePolicy::MaxWeight => self
                .particles
                .iter()
                .max_by(|a, b| a.weight.total_cmp(&b.weight))
                .map(|p| p.state.clone())
                .unwrap_or_else(|| RobotState::zeros(self.kinematics.joint_count())),
        }
    }

    pub fn effective_sample_size(&self) -> f64 {
        effective_sample_size(&self.particles)
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn config(&self) -> &VisualParticleConfig {
        &self.config
    }

    /// Timestamp of the last frame folded into the particle set.
    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn jitter(&mut self, state: &mut RobotState, sigma: f64) {
        if sigma > 0.0 {
            for v in state.as_mut_slice() {
                let z: f64 = self.rng.sample(StandardNormal);
                *v += sigma * z;
            }
        }
        self.kinematics.clamp(state);
    }

    fn score(&mut self, state: &RobotState, frame: &DepthFrame) -> f64 {
        let predicted = self.renderer.render(state);
        let q = self.occlusion_prior;
        let mut terms = Vec::with_capacity(frame.ranges.len());
        for (&pred, &obs) in predicted.iter().zip(frame.ranges.iter()) {
            if !(obs.is_finite() && obs >= 0.0) {
                continue;
            }
            self.model.set_prediction(pred, false);
            let visible = self.model.probability(obs);
            let occluded = if q > 0.0 {
                self.model.set_prediction(pred, true);
                self.model.probability(obs)
            } else {
                0.0
            };
            terms.push(log_or_neg_infinity((1.0 - q) * visible + q * occluded));
        }
        aggregate(terms, self.config.aggregate)
    }
}
