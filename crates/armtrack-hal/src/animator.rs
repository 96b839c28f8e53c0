//! Ground-truth motion generators for the emulator.

use armtrack_types::RobotState;

/// Perturbs a reference state over time.
///
/// `next` arrives as a copy of `current`; implementations overwrite the
/// joints they drive.
pub trait RobotAnimator: Send {
    fn animate(&mut self, current: &RobotState, dt: f64, dilation: f64, next: &mut RobotState);
}

/// Holds the robot still.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticAnimator;

impl RobotAnimator for StaticAnimator {
    fn animate(&mut self, _current: &RobotState, _dt: f64, _dilation: f64, _next: &mut RobotState) {}
}

/// Sinusoidal sweep: each driven joint moves with velocity
/// `gain / dilation · sin(t / dilation)`.
#[derive(Debug, Clone)]
pub struct SineAnimator {
    gain: f64,
    /// Driven joints; empty drives all of them.
    joints: Vec<usize>,
    t: f64,
}

impl SineAnimator {
    pub fn new(gain: f64, joints: Vec<usize>) -> Self {
        Self {
            gain,
            joints,
            t: 0.0,
        }
    }

    /// Animator time (s).
    pub fn time(&self) -> f64 {
        self.t
    }
}

impl Default for SineAnimator {
    fn default() -> Self {
        Self::new(0.1, Vec::new())
    }
}

impl RobotAnimator for SineAnimator {
    fn animate(&mut self, current: &RobotState, dt: f64, dilation: f64, next: &mut RobotState) {
        self.t += dt;
        let dilation = if dilation > 0.0 { dilation } else { 1.0 };
        let step = self.gain * dt / dilation * (self.t / dilation).sin();
        let out = next.as_mut_slice();
        if self.joints.is_empty() {
            for (n, c) in out.iter_mut().zip(current.iter()) {
                *n = c + step;
            }
        } else {
            for &j in &self.joints {
                if j < current.len() {
                    out[j] = current[j] + step;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_animator_integrates_to_cosine() {
        let mut animator = SineAnimator::new(0.5, Vec::new());
        let mut state = RobotState::new(vec![0.2]);
        let dt = 1e-4;
        for _ in 0..20_000 {
            let mut next = state.clone();
            animator.animate(&state, dt, 1.0, &mut next);
            state = next;
        }
        let t = animator.time();
        let expected = 0.2 + 0.5 * (1.0 - t.cos());
        assert!((state[0] - expected).abs() < 1e-3);
    }

    #[test]
    fn sine_animator_only_drives_selected_joints() {
        let mut animator = SineAnimator::new(1.0, vec![1, 7]);
        let current = RobotState::new(vec![0.0, 0.0, 0.0]);
        let mut next = current.clone();
        animator.animate(&current, 0.5, 1.0, &mut next);
        assert_eq!(next[0], 0.0);
        assert!(next[1] > 0.0);
        assert_eq!(next[2], 0.0);
    }

    #[test]
    fn dilation_slows_motion() {
        let current = RobotState::new(vec![0.0]);
        let mut fast = current.clone();
        let mut slow = current.clone();
        SineAnimator::new(1.0, Vec::new()).animate(&current, 0.1, 1.0, &mut fast);
        SineAnimator::new(1.0, Vec::new()).animate(&current, 0.1, 4.0, &mut slow);
        assert!(slow[0] < fast[0]);
        assert!(slow[0] > 0.0);
    }
}
