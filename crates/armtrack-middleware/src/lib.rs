//! `armtrack-middleware` – transport between sensor sources and the tracker.
//!
//! Routes observations, estimates and alerts between the emulator (or real
//! drivers), the fusion node and any publisher without caring about the
//! data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
