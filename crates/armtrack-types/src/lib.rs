//! `armtrack-types` – shared vocabulary of the articulated-robot tracker.
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//! the [`RobotState`] vector, the two observation kinds ([`EncoderSample`]
//! and [`DepthFrame`]), the published [`FusedEstimate`], the bus [`Event`]
//! envelope, the read-only [`Kinematics`] context and the workspace-wide
//! [`TrackError`].

use std::fmt;
use std::ops::Index;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Robot state
// ────────────────────────────────────────────────────────────────────────────

/// One scalar per degree of freedom, ordered by the kinematic model's joint
/// index.
///
/// The index-to-joint mapping is owned by the [`Kinematics`] context and is
/// fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState(DVector<f64>);

impl RobotState {
    /// Build a state from per-joint values.
    pub fn new(values: Vec<f64>) -> Self {
        Self(DVector::from_vec(values))
    }

    /// A state with `joint_count` zeros.
    pub fn zeros(joint_count: usize) -> Self {
        Self(DVector::zeros(joint_count))
    }

    /// Wrap an existing vector.
    pub fn from_vector(values: DVector<f64>) -> Self {
        Self(values)
    }

    /// Number of degrees of freedom.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        self.0.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        self.0.as_mut_slice()
    }

    pub fn as_vector(&self) -> &DVector<f64> {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.0.iter()
    }

    /// Component-wise `self - other`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackError::JointCountMismatch`] when the lengths differ.
    pub fn delta(&self, other: &RobotState) -> Result<RobotState, TrackError> {
        other.check_len(self.len())?;
        Ok(RobotState(&self.0 - &other.0))
    }

    /// Largest absolute component-wise difference, or `f64::INFINITY` when
    /// the lengths differ.
    pub fn max_abs_diff(&self, other: &RobotState) -> f64 {
        if self.len() != other.len() {
            return f64::INFINITY;
        }
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    /// Reject a state whose length differs from `expected`.
    pub fn check_len(&self, expected: usize) -> Result<(), TrackError> {
        if self.len() == expected {
            Ok(())
        } else {
            Err(TrackError::JointCountMismatch {
                expected,
                actual: self.len(),
            })
        }
    }

    /// `true` when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl Index<usize> for RobotState {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.0[index]
    }
}

impl From<Vec<f64>> for RobotState {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Observations
// ────────────────────────────────────────────────────────────────────────────

/// One reading of every joint encoder.
///
/// A `NaN` entry marks a joint whose reading is missing for this sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSample {
    /// Sensor time in seconds.
    pub timestamp: f64,
    /// Raw angle reading per joint (radians).
    pub positions: Vec<f64>,
}

/// A depth image: one range per pixel, in metres.
///
/// `f64::INFINITY` means the sensor got no return for that pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthFrame {
    /// Capture time in seconds.
    pub timestamp: f64,
    pub ranges: DMatrix<f64>,
}

impl DepthFrame {
    pub fn new(timestamp: f64, ranges: DMatrix<f64>) -> Self {
        Self { timestamp, ranges }
    }

    pub fn rows(&self) -> usize {
        self.ranges.nrows()
    }

    pub fn cols(&self) -> usize {
        self.ranges.ncols()
    }

    /// Number of pixels carrying a finite, non-negative range.
    pub fn usable_pixels(&self) -> usize {
        self.ranges
            .iter()
            .filter(|r| r.is_finite() && **r >= 0.0)
            .count()
    }
}

/// The two independent sensor streams feeding the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorStream {
    /// High-rate joint encoders.
    Joint,
    /// Low-rate depth camera.
    Visual,
}

impl fmt::Display for SensorStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorStream::Joint => write!(f, "joint"),
            SensorStream::Visual => write!(f, "visual"),
        }
    }
}

/// An immutable observation from either stream.
///
/// Depth frames are reference-counted so they can be fanned out over the bus
/// without copying the image.
#[derive(Debug, Clone)]
pub enum Observation {
    Joints(EncoderSample),
    Depth(Arc<DepthFrame>),
}

impl Observation {
    pub fn timestamp(&self) -> f64 {
        match self {
            Observation::Joints(sample) => sample.timestamp,
            Observation::Depth(frame) => frame.timestamp,
        }
    }

    pub fn stream(&self) -> SensorStream {
        match self {
            Observation::Joints(_) => SensorStream::Joint,
            Observation::Depth(_) => SensorStream::Visual,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output
// ────────────────────────────────────────────────────────────────────────────

/// The externally visible tracker output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedEstimate {
    /// Sensor time of the last observation folded into `state`.
    pub timestamp: f64,
    pub state: RobotState,
}

// ────────────────────────────────────────────────────────────────────────────
// Bus envelope
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper carried by the middleware bus.
#[derive(Debug, Clone)]
pub struct Event {
    /// e.g. `"armtrack-hal::emulator"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the bus.
#[derive(Debug, Clone)]
pub enum EventPayload {
    Observation(Observation),
    Estimate(FusedEstimate),
    SensorFault {
        stream: SensorStream,
        message: String,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Kinematics context
// ────────────────────────────────────────────────────────────────────────────

/// Read-only view of the kinematic model.
///
/// Built once at setup and shared with `Arc` by every component that needs
/// it; nothing mutates it afterwards.
pub trait Kinematics: Send + Sync {
    fn joint_count(&self) -> usize;

    fn joint_name(&self, index: usize) -> Option<&str>;

    fn joint_index(&self, name: &str) -> Option<usize>;

    /// `(lower, upper)` angle limits in radians.
    fn joint_limits(&self, index: usize) -> Option<(f64, f64)>;

    /// Forward kinematics: the end point of every link, base first, in the
    /// base frame (m).  The last entry is the end effector.
    ///
    /// # Errors
    ///
    /// [`TrackError::JointCountMismatch`] when `state` does not have one
    /// angle per joint.
    fn link_positions(&self, state: &RobotState) -> Result<Vec<Vector3<f64>>, TrackError>;

    /// End point of the last link.
    fn end_effector(&self, state: &RobotState) -> Result<Vector3<f64>, TrackError> {
        Ok(self
            .link_positions(state)?
            .last()
            .copied()
            .unwrap_or_else(Vector3::zeros))
    }

    /// Clamp every component of `state` into its joint limits.
    fn clamp(&self, state: &mut RobotState) {
        for (i, value) in state.as_mut_slice().iter_mut().enumerate() {
            if let Some((lower, upper)) = self.joint_limits(i) {
                *value = value.clamp(lower, upper);
            }
        }
    }
}

/// A single joint of a [`JointChain`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointSpec {
    pub name: String,
    #[serde(default = "default_lower")]
    pub lower: f64,
    #[serde(default = "default_upper")]
    pub upper: f64,
    /// Length of the link this joint drives (m).
    #[serde(default = "default_length")]
    pub length: f64,
}

fn default_lower() -> f64 {
    f64::NEG_INFINITY
}

fn default_upper() -> f64 {
    f64::INFINITY
}

fn default_length() -> f64 {
    0.3
}

impl JointSpec {
    /// A joint without angle limits.
    pub fn revolute(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lower: default_lower(),
            upper: default_upper(),
            length: default_length(),
        }
    }

    pub fn limited(name: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self {
            name: name.into(),
            lower,
            upper,
            length: default_length(),
        }
    }

    pub fn with_length(mut self, length: f64) -> Self {
        self.length = length;
        self
    }
}

/// Serial chain of named joints: the concrete [`Kinematics`] context.
///
/// All joints rotate about parallel axes, so the chain moves in the base
/// x–y plane; link `i` points along the sum of angles `0..=i`.
#[derive(Debug, Clone)]
pub struct JointChain {
    joints: Vec<JointSpec>,
}

impl JointChain {
    /// Validate and build a chain.
    ///
    /// # Errors
    ///
    /// Returns [`TrackError::Config`] for an empty chain, a duplicated joint
    /// name or a joint whose lower limit exceeds its upper limit.
    pub fn new(joints: Vec<JointSpec>) -> Result<Self, TrackError> {
        if joints.is_empty() {
            return Err(TrackError::Config("kinematic chain has no joints".to_string()));
        }
        for (i, joint) in joints.iter().enumerate() {
            if joints[..i].iter().any(|j| j.name == joint.name) {
                return Err(TrackError::Config(format!(
                    "duplicate joint name `{}`",
                    joint.name
                )));
            }
            if joint.lower.is_nan() || joint.upper.is_nan() || joint.lower > joint.upper {
                return Err(TrackError::Config(format!(
                    "joint `{}` has invalid limits [{}, {}]",
                    joint.name, joint.lower, joint.upper
                )));
            }
            if !(joint.length >= 0.0 && joint.length.is_finite()) {
                return Err(TrackError::Config(format!(
                    "joint `{}` has invalid link length {}",
                    joint.name, joint.length
                )));
            }
        }
        Ok(Self { joints })
    }

    pub fn joints(&self) -> &[JointSpec] {
        &self.joints
    }
}

impl Kinematics for JointChain {
    fn joint_count(&self) -> usize {
        self.joints.len()
    }

    fn joint_name(&self, index: usize) -> Option<&str> {
        self.joints.get(index).map(|j| j.name.as_str())
    }

    fn joint_index(&self, name: &str) -> Option<usize> {
        self.joints.iter().position(|j| j.name == name)
    }

    fn joint_limits(&self, index: usize) -> Option<(f64, f64)> {
        self.joints.get(index).map(|j| (j.lower, j.upper))
    }

    fn link_positions(&self, state: &RobotState) -> Result<Vec<Vector3<f64>>, TrackError> {
        state.check_len(self.joints.len())?;
        let mut heading = 0.0;
        let mut tip = Vector3::zeros();
        Ok(self
            .joints
            .iter()
            .zip(state.iter())
            .map(|(joint, &angle)| {
                heading += angle;
                tip += Vector3::new(heading.cos(), heading.sin(), 0.0) * joint.length;
                tip
            })
            .collect())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type spanning setup, observation and lifecycle failures.
///
/// Only [`TrackError::Config`] and [`TrackError::JointCountMismatch`] raised
/// at setup are fatal; everything else is absorbed by the component that
/// sees it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Joint Count Mismatch: expected {expected}, got {actual}")]
    JointCountMismatch { expected: usize, actual: usize },

    #[error("Malformed Observation: {0}")]
    MalformedObservation(String),

    #[error("Lifecycle Error: cannot {operation} while {state}")]
    Lifecycle {
        operation: &'static str,
        state: String,
    },

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Channel Error: {0}")]
    Channel(String),
}
