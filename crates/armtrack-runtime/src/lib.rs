//! `armtrack-runtime` – fusion of encoder and depth tracking.
//!
//! # Modules
//!
//! - [`config`] – [`FusionConfig`][config::FusionConfig]: every tunable of
//!   the tracker, loaded from TOML with `ARMTRACK_*` environment overrides.
//! - [`controller`] – [`FusionController`][controller::FusionController]:
//!   owns the [`JointFilterBank`][armtrack_perception::joint_filter::JointFilterBank]
//!   and the [`VisualParticleTracker`][armtrack_perception::particle::VisualParticleTracker],
//!   reconciles their timelines and publishes the fused estimate.  Carries
//!   the stopped / running / paused state machine.
//! - [`node`] – [`FusionNode`][node::FusionNode]: subscribes the controller
//!   to the sensor topics of the event bus and republishes its estimate.
//! - [`stream_monitor`] – [`StreamMonitor`][stream_monitor::StreamMonitor]:
//!   per-stream liveness deadlines.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable trace export.

pub mod config;
pub mod controller;
pub mod node;
pub mod stream_monitor;
pub mod telemetry;

pub use config::{FusionConfig, FusionPolicy, SensorConfig};
pub use controller::{DropReason, FusionController, FusionStats, ObservationOutcome, RunState};
pub use node::FusionNode;
pub use stream_monitor::{StreamHealth, StreamMonitor};
pub use telemetry::{TracerProviderGuard, init_tracing};
