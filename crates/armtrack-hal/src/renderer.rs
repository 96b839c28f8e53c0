//! Synthetic depth renderer for emulated arms.
//!
//! Stands in for a mesh renderer.  The image is split into horizontal bands,
//! one per joint.  Each column looks along a fixed bearing
//!
//! ```text
//! bearing(c) = −fov/2 + (c + ½) · fov / cols
//! ```
//!
//! and sees joint `j`'s link when `|bearing − θⱼ| ≤ link_half_width`, at a
//! range that grows away from the link axis:
//!
//! ```text
//! range = link_range + j · link_spacing + depth_slope · |bearing − θⱼ|
//! ```
//!
//! Every other pixel has no surface (`f64::INFINITY`).

use armtrack_perception::render::Renderer;
use armtrack_types::{RobotState, TrackError};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepRendererConfig {
    pub rows_per_joint: usize,
    pub cols: usize,
    /// Horizontal field of view (rad).
    pub field_of_view: f64,
    pub link_half_width: f64,
    /// Range of joint 0's link axis (m).
    pub link_range: f64,
    /// Range step between consecutive joints' links (m).
    pub link_spacing: f64,
    pub depth_slope: f64,
}

impl Default for SweepRendererConfig {
    fn default() -> Self {
        Self {
            rows_per_joint: 2,
            cols: 48,
            field_of_view: 3.0,
            link_half_width: 0.15,
            link_range: 1.5,
            link_spacing: 0.25,
            depth_slope: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepRenderer {
    config: SweepRendererConfig,
    joint_count: usize,
    bearings: Vec<f64>,
}

impl SweepRenderer {
    pub fn new(config: SweepRendererConfig, joint_count: usize) -> Result<Self, TrackError> {
        if joint_count == 0 || config.rows_per_joint == 0 || config.cols == 0 {
            return Err(TrackError::Config(
                "sweep renderer needs at least one joint, row and column".to_string(),
            ));
        }
        let finite_positive = |v: f64| v > 0.0 && v.is_finite();
        if !finite_positive(config.field_of_view)
            || !finite_positive(config.link_half_width)
            || !finite_positive(config.link_range)
            || !(config.link_spacing >= 0.0 && config.link_spacing.is_finite())
            || !(config.depth_slope >= 0.0 && config.depth_slope.is_finite())
        {
            return Err(TrackError::Config(format!(
                "invalid sweep renderer geometry {config:?}"
            )));
        }
        let step = config.field_of_view / config.cols as f64;
        let bearings = (0..config.cols)
            .map(|c| -0.5 * config.field_of_view + (c as f64 + 0.5) * step)
            .collect();
        Ok(Self {
            config,
            joint_count,
            bearings,
        })
    }

    pub fn config(&self) -> &SweepRendererConfig {
        &self.config
    }

    /// Bearing of column `col` (rad).
    pub fn bearing(&self, col: usize) -> Option<f64> {
        self.bearings.get(col).copied()
    }
}

impl Renderer for SweepRenderer {
    fn resolution(&self) -> (usize, usize) {
        (self.joint_count * self.config.rows_per_joint, self.config.cols)
    }

    fn render(&self, state: &RobotState) -> DMatrix<f64> {
        let (rows, cols) = self.resolution();
        let c = &self.config;
        DMatrix::from_fn(rows, cols, |r, col| {
            let joint = r / c.rows_per_joint;
            let Some(&angle) = state.as_slice().get(joint) else {
                return f64::INFINITY;
            };
            let off_axis = (self.bearings[col] - angle).abs();
            if off_axis <= c.link_half_width {
                c.link_range + joint as f64 * c.link_spacing + c.depth_slope * off_axis
            } else {
                f64::INFINITY
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer(joints: usize) -> SweepRenderer {
        SweepRenderer::new(SweepRendererConfig::default(), joints).unwrap()
    }

    #[test]
    fn resolution_follows_joint_count() {
        assert_eq!(renderer(3).resolution(), (6, 48));
        assert!(SweepRenderer::new(SweepRendererConfig::default(), 0).is_err());
        let bad = SweepRendererConfig {
            link_half_width: 0.0,
            ..Default::default()
        };
        assert!(SweepRenderer::new(bad, 1).is_err());
    }

    #[test]
    fn link_is_visible_only_near_joint_angle() {
        let r = renderer(1);
        let image = r.render(&RobotState::new(vec![0.0]));
        let visible: Vec<usize> = (0..48).filter(|&c| image[(0, c)].is_finite()).collect();
        assert!(!visible.is_empty());
        for &c in &visible {
            let bearing = r.bearing(c).unwrap();
            assert!(bearing.abs() <= 0.15);
            assert!((image[(0, c)] - (1.5 + 0.5 * bearing.abs())).abs() < 1e-12);
            assert_eq!(image[(1, c)], image[(0, c)]);
        }
    }

    #[test]
    fn joints_own_their_bands() {
        let r = renderer(2);
        let image = r.render(&RobotState::new(vec![-1.0, 1.0]));
        let left = image.row(0).iter().position(|v| v.is_finite()).unwrap();
        let right = image.row(2).iter().position(|v| v.is_finite()).unwrap();
        assert!(r.bearing(left).unwrap() < 0.0);
        assert!(r.bearing(right).unwrap() > 0.0);
        assert!(image[(2, right)] > 1.75 - 1e-12);
    }

    #[test]
    fn out_of_view_is_empty() {
        let image = renderer(1).render(&RobotState::new(vec![3.0]));
        assert!(image.iter().all(|v| v.is_infinite()));
    }
}
