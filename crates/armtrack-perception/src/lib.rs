//! `armtrack-perception` – state estimators of the articulated-robot tracker.
//!
//! Turns raw encoder readings and depth frames into beliefs over the robot
//! state.
//!
//! # Modules
//!
//! - [`likelihood`] – [`RangeLikelihoodModel`][likelihood::RangeLikelihoodModel]:
//!   occlusion-aware per-pixel depth-sensor likelihood, behind the
//!   [`PixelModel`][likelihood::PixelModel] trait.
//! - [`joint_filter`] – [`JointFilterBank`][joint_filter::JointFilterBank]:
//!   one independent angle/bias Kalman filter per joint, advanced at encoder
//!   rate.
//! - [`particle`] – [`VisualParticleTracker`][particle::VisualParticleTracker]:
//!   particle belief over the full state, reweighted by rendered-vs-observed
//!   depth.
//! - [`render`] – the [`Renderer`][render::Renderer] collaborator that turns a
//!   state hypothesis into a predicted depth image.

pub mod joint_filter;
pub mod likelihood;
pub mod particle;
pub mod render;
