//! `armtrack-hal` – emulated hardware for the articulated-robot tracker.
//!
//! Provides the sensor sources that stand in for a physical arm, so the full
//! tracking stack runs in headless tests and demos.
//!
//! # Modules
//!
//! - [`emulator`] – [`RobotEmulator`][emulator::RobotEmulator]: virtual-clock
//!   robot producing encoder samples and depth frames with configurable
//!   rates, delay, offsets and noise.
//! - [`animator`] – [`RobotAnimator`][animator::RobotAnimator] ground-truth
//!   motion generators.
//! - [`renderer`] – [`SweepRenderer`][renderer::SweepRenderer]: synthetic
//!   depth renderer used both by the emulator and by the tracker.
//! - [`noise`] – seeded Gaussian [`NoiseGenerator`][noise::NoiseGenerator].

pub mod animator;
pub mod emulator;
pub mod noise;
pub mod renderer;

pub use animator::{RobotAnimator, SineAnimator, StaticAnimator};
pub use emulator::{EmulatorConfig, EmulatorControl, RobotEmulator};
pub use renderer::{SweepRenderer, SweepRendererConfig};
