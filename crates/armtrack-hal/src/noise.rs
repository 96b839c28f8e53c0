//! Seeded noise source for the emulated sensors.

use rand::prelude::*;
use rand::rngs::SmallRng;
use rand_distr::StandardNormal;

/// Gaussian noise generator; reproducible when seeded.
#[derive(Debug, Clone)]
pub struct NoiseGenerator {
    rng: SmallRng,
}

impl NoiseGenerator {
    /// `None` draws the seed from OS entropy.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self { rng }
    }

    /// Zero-mean Gaussian sample with standard deviation `stddev`.
    #[inline]
    pub fn gaussian(&mut self, stddev: f64) -> f64 {
        if stddev == 0.0 {
            return 0.0;
        }
        let n: f64 = self.rng.sample(StandardNormal);
        n * stddev
    }

    #[inline]
    pub fn biased_gaussian(&mut self, bias: f64, stddev: f64) -> f64 {
        bias + self.gaussian(stddev)
    }
}
