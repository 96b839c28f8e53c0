//! Renderer collaborator interface.

use armtrack_types::RobotState;
use nalgebra::DMatrix;

/// Produces the depth image a camera would see for a robot state.
///
/// Camera intrinsics and resolution are fixed when the renderer is built.
/// Rendering is a pure function of the state; a pixel with no robot surface
/// along its ray holds `f64::INFINITY`.
pub trait Renderer: Send + Sync {
    /// `(rows, cols)` of every rendered image.
    fn resolution(&self) -> (usize, usize);

    fn render(&self, state: &RobotState) -> DMatrix<f64>;
}
