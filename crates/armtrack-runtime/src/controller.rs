//! Fusion controller: reconciles the encoder and depth timelines into one
//! published estimate.
//!
//! # Run states
//!
//! | From | Operation | To |
//! |---|---|---|
//! | `Stopped` | [`run`][FusionController::run] | `Running` |
//! | `Running` | [`pause`][FusionController::pause] / [`toggle_pause`][FusionController::toggle_pause] | `Paused` |
//! | `Paused` | [`resume`][FusionController::resume] / [`toggle_pause`][FusionController::toggle_pause] | `Running` |
//! | any | [`shutdown`][FusionController::shutdown] | `ShutDown` (terminal) |
//!
//! Observations received while `Paused` are dropped and counted; the
//! published estimate stays frozen until `resume`.  Callbacks before `run`
//! or after `shutdown` are rejected with [`TrackError::Lifecycle`].
//!
//! # Fusion policy
//!
//! The published joint angles always come from the [`JointFilterBank`].
//! Each completed visual update produces a residual
//! `visual estimate − bank estimate at the frame's timestamp`, which is fed
//! back into the bank as an angle observation; the bank's angle/bias
//! coupling turns it into a bias correction.  A bounded, timestamped
//! history of bank estimates lines residuals up with delayed frames and
//! provides the motion applied to the particles between frames.
//!
//! # Locking
//!
//! Encoder callbacks and run-state transitions serialise on the joint lock.
//! Depth frames serialise on the visual lock, which is held across the
//! whole particle update so a frame is never processed concurrently with
//! another.  When both are needed the visual lock is taken first.
//! [`current_state`][FusionController::current_state] reads a `watch`
//! slot and never waits for either.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use armtrack_perception::joint_filter::JointFilterBank;
use armtrack_perception::particle::{FrameOutcome, VisualParticleTracker};
use armtrack_perception::render::Renderer;
use armtrack_types::{
    DepthFrame, EncoderSample, FusedEstimate, Kinematics, RobotState, SensorStream, TrackError,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{FusionConfig, FusionPolicy};
use crate::stream_monitor::{StreamHealth, StreamMonitor};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a [`FusionController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Stopped,
    Running,
    Paused,
    /// Stopped for good; nothing is accepted any more.
    ShutDown,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Stopped => write!(f, "stopped"),
            RunState::Running => write!(f, "running"),
            RunState::Paused => write!(f, "paused"),
            RunState::ShutDown => write!(f, "shut down"),
        }
    }
}

/// Why an observation was not folded into the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DropReason {
    /// Older than the last consumed observation of the same stream.
    OutOfOrder,
    Paused,
    Malformed,
    /// Depth frame without a single usable pixel.
    NoUsablePixels,
    /// Aborted by shutdown.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationOutcome {
    Applied,
    Dropped(DropReason),
}

/// Snapshot of the controller's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FusionStats {
    pub joint_applied: u64,
    pub visual_applied: u64,
    pub dropped_out_of_order: u64,
    pub dropped_paused: u64,
    pub dropped_malformed: u64,
    pub dropped_unusable: u64,
    pub dropped_cancelled: u64,
    pub resamples: u64,
    pub weight_collapses: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    joint_applied: AtomicU64,
    visual_applied: AtomicU64,
    dropped_out_of_order: AtomicU64,
    dropped_paused: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_unusable: AtomicU64,
    dropped_cancelled: AtomicU64,
    resamples: AtomicU64,
    weight_collapses: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::OutOfOrder => &self.dropped_out_of_order,
            DropReason::Paused => &self.dropped_paused,
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::NoUsablePixels => &self.dropped_unusable,
            DropReason::Cancelled => &self.dropped_cancelled,
        };
        Self::bump(counter);
    }

    fn snapshot(&self) -> FusionStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        FusionStats {
            joint_applied: get(&self.joint_applied),
            visual_applied: get(&self.visual_applied),
            dropped_out_of_order: get(&self.dropped_out_of_order),
            dropped_paused: get(&self.dropped_paused),
            dropped_malformed: get(&self.dropped_malformed),
            dropped_unusable: get(&self.dropped_unusable),
            dropped_cancelled: get(&self.dropped_cancelled),
            resamples: get(&self.resamples),
            weight_collapses: get(&self.weight_collapses),
        }
    }
}

struct JointSide {
    bank: JointFilterBank,
    last_timestamp: Option<f64>,
    /// Bank estimates in timestamp order.
    history: VecDeque<(f64, RobotState)>,
}

impl JointSide {
    fn record(&mut self, timestamp: f64, state: RobotState, window: f64) {
        self.history.push_back((timestamp, state));
        while self.history.len() > 1
            && self
                .history
                .front()
                .is_some_and(|(t, _)| *t < timestamp - window)
        {
            self.history.pop_front();
        }
    }

    /// Bank estimate at `timestamp`, interpolated between recorded samples
    /// and held constant outside them.
    fn state_at(&self, timestamp: f64) -> Option<RobotState> {
        let (first_t, first) = self.history.front()?;
        let (last_t, last) = self.history.back()?;
        if timestamp <= *first_t {
            return Some(first.clone());
        }
        if timestamp >= *last_t {
            return Some(last.clone());
        }
        let idx = self.history.partition_point(|(t, _)| *t <= timestamp);
        let (t0, s0) = &self.history[idx - 1];
        let (t1, s1) = &self.history[idx];
        let alpha = if t1 > t0 { (timestamp - t0) / (t1 - t0) } else { 0.0 };
        Some(RobotState::from_vector(
            s0.as_vector() * (1.0 - alpha) + s1.as_vector() * alpha,
        ))
    }

    fn shift_history(&mut self, shift: &RobotState) {
        for (_, state) in self.history.iter_mut() {
            *state = RobotState::from_vector(state.as_vector() + shift.as_vector());
        }
    }
}

struct VisualSide {
    tracker: VisualParticleTracker,
    last_timestamp: Option<f64>,
    /// Bank estimate at the last consumed frame, after its correction.
    reference: Option<RobotState>,
}

struct Inner {
    kinematics: Arc<dyn Kinematics>,
    policy: FusionPolicy,
    stream_timeouts: [(SensorStream, Duration); 2],
    run_state: watch::Sender<RunState>,
    joint: Mutex<JointSide>,
    visual: Mutex<VisualSide>,
    published: watch::Sender<FusedEstimate>,
    cancel: Arc<AtomicBool>,
    counters: Counters,
    monitor: Mutex<StreamMonitor>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────────────────────────────────────────────────────
// FusionController
// ────────────────────────────────────────────────────────────────────────────

/// Owns both trackers and the published estimate.
///
/// Cloning is cheap; all clones drive the same controller, so sensor
/// tasks, the publisher and the console can each hold one.
#[derive(Clone)]
pub struct FusionController {
    inner: Arc<Inner>,
}

impl fmt::Debug for FusionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusionController")
            .field("run_state", &self.run_state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl FusionController {
    /// Validate `config` against `kinematics` and build both trackers.
    ///
    /// # Errors
    ///
    /// [`TrackError::Config`] or [`TrackError::JointCountMismatch`]; nothing
    /// is started on failure.
    pub fn new(
        config: &FusionConfig,
        kinematics: Arc<dyn Kinematics>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self, TrackError> {
        let joint_count = kinematics.joint_count();
        config.validate(joint_count)?;

        let bank = JointFilterBank::new(config.joint_noise(), config.joint_prior)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let tracker = VisualParticleTracker::new(
            config.visual.clone(),
            kinematics.clone(),
            renderer,
            config.likelihood,
        )?
        .with_cancellation(cancel.clone());

        let sensors = &config.sensors;
        let stream_timeouts = [
            (
                SensorStream::Joint,
                Duration::from_secs_f64(sensors.timeout_periods / sensors.joint_rate),
            ),
            (
                SensorStream::Visual,
                Duration::from_secs_f64(
                    sensors.timeout_periods / sensors.visual_rate + sensors.visual_delay,
                ),
            ),
        ];

        let (run_state, _) = watch::channel(RunState::Stopped);
        let (published, _) = watch::channel(FusedEstimate {
            timestamp: 0.0,
            state: bank.estimate(),
        });

        Ok(Self {
            inner: Arc::new(Inner {
                kinematics,
                policy: config.fusion,
                stream_timeouts,
                run_state,
                joint: Mutex::new(JointSide {
                    bank,
                    last_timestamp: None,
                    history: VecDeque::new(),
                }),
                visual: Mutex::new(VisualSide {
                    tracker,
                    last_timestamp: None,
                    reference: None,
                }),
                published,
                cancel,
                counters: Counters::default(),
                monitor: Mutex::new(StreamMonitor::new()),
            }),
        })
    }

    // ── Run-state machine ───────────────────────────────────────────────────

    pub fn run_state(&self) -> RunState {
        *self.inner.run_state.borrow()
    }

    /// Receiver notified on every run-state change.
    pub fn run_states(&self) -> watch::Receiver<RunState> {
        self.inner.run_state.subscribe()
    }

    /// `Stopped → Running`; starts stream monitoring.
    pub fn run(&self) -> Result<RunState, TrackError> {
        let state = self.transition("run", |s| (s == RunState::Stopped).then_some(RunState::Running))?;
        let mut monitor = lock(&self.inner.monitor);
        for (stream, timeout) in self.inner.stream_timeouts {
            monitor.register(stream, timeout);
        }
        Ok(state)
    }

    /// Freeze the published estimate.  Idempotent while paused.
    pub fn pause(&self) -> Result<RunState, TrackError> {
        self.transition("pause", |s| match s {
            RunState::Running | RunState::Paused => Some(RunState::Paused),
            _ => None,
        })
    }

    /// Resume from `Paused`.  Idempotent while running.
    pub fn resume(&self) -> Result<RunState, TrackError> {
        self.transition("resume", |s| match s {
            RunState::Running | RunState::Paused => Some(RunState::Running),
            _ => None,
        })
    }

    pub fn toggle_pause(&self) -> Result<RunState, TrackError> {
        self.transition("toggle pause", |s| match s {
            RunState::Running => Some(RunState::Paused),
            RunState::Paused => Some(RunState::Running),
            _ => None,
        })
    }

    /// Enter the terminal state and abort any in-flight particle update.
    pub fn shutdown(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
        let _ = self.transition("shut down", |_| Some(RunState::ShutDown));
    }

    /// Transitions hold the joint lock so an encoder update is either fully
    /// before or fully after the change.
    fn transition(
        &self,
        operation: &'static str,
        next: impl FnOnce(RunState) -> Option<RunState>,
    ) -> Result<RunState, TrackError> {
        let _joint = lock(&self.inner.joint);
        let current = self.run_state();
        let Some(target) = next(current) else {
            return Err(TrackError::Lifecycle {
                operation,
                state: current.to_string(),
            });
        };
        if target != current {
            self.inner.run_state.send_replace(target);
            info!(from = %current, to = %target, "fusion run state changed");
        }
        Ok(target)
    }

    // ── Setup ───────────────────────────────────────────────────────────────

    /// Re-seed both trackers around `state` and publish it.
    ///
    /// Allowed while stopped or running; a paused controller keeps its
    /// frozen estimate.
    pub fn initialize(&self, state: &RobotState) -> Result<(), TrackError> {
        state.check_len(self.inner.kinematics.joint_count())?;
        if !state.is_finite() {
            return Err(TrackError::Config("initial state must be finite".to_string()));
        }
        let mut visual = lock(&self.inner.visual);
        let mut joint = lock(&self.inner.joint);
        let run_state = self.run_state();
        if matches!(run_state, RunState::Paused | RunState::ShutDown) {
            return Err(TrackError::Lifecycle {
                operation: "initialize",
                state: run_state.to_string(),
            });
        }
        joint.bank.initialize(state)?;
        visual.tracker.initialize(state)?;
        joint.last_timestamp = None;
        joint.history.clear();
        visual.last_timestamp = None;
        visual.reference = None;

        let timestamp = self.inner.published.borrow().timestamp;
        self.inner.published.send_replace(FusedEstimate {
            timestamp,
            state: joint.bank.estimate(),
        });
        info!(joints = state.len(), "trackers initialised");
        Ok(())
    }

    // ── Observation callbacks ───────────────────────────────────────────────

    /// Fold one encoder sample into the joint bank and publish the result.
    pub fn joints_obsrv_callback(
        &self,
        sample: EncoderSample,
    ) -> Result<ObservationOutcome, TrackError> {
        let mut joint = lock(&self.inner.joint);
        if let Some(outcome) = self.gate("accept encoder sample")? {
            return Ok(outcome);
        }
        lock(&self.inner.monitor).record(SensorStream::Joint);

        let timestamp = sample.timestamp;
        if !timestamp.is_finite() {
            warn!(stream = "joint", "encoder sample without a finite timestamp");
            return Ok(self.dropped(DropReason::Malformed));
        }
        if let Some(last) = joint.last_timestamp
            && timestamp < last
        {
            warn!(stream = "joint", timestamp, last, "out-of-order observation dropped");
            return Ok(self.dropped(DropReason::OutOfOrder));
        }

        let dt = joint.last_timestamp.map_or(0.0, |last| timestamp - last);
        if let Err(e) = joint.bank.advance(dt, &sample) {
            warn!(stream = "joint", timestamp, error = %e, "encoder sample rejected");
            return Ok(self.dropped(DropReason::Malformed));
        }
        joint.last_timestamp = Some(timestamp);

        let stale = joint.bank.stale_joints();
        if !stale.is_empty() {
            debug!(timestamp, ?stale, "joints propagated without reading");
        }

        let state = joint.bank.estimate();
        let window = self.inner.policy.history_window;
        joint.record(timestamp, state.clone(), window);
        self.inner.published.send_replace(FusedEstimate { timestamp, state });
        Counters::bump(&self.inner.counters.joint_applied);
        Ok(ObservationOutcome::Applied)
    }

    /// Run one particle update on `frame` and feed the residual back into
    /// the joint bank.
    pub fn image_obsrv_callback(
        &self,
        frame: Arc<DepthFrame>,
    ) -> Result<ObservationOutcome, TrackError> {
        if let Some(outcome) = self.gate("accept depth frame")? {
            return Ok(outcome);
        }
        let mut visual = lock(&self.inner.visual);
        lock(&self.inner.monitor).record(SensorStream::Visual);

        let timestamp = frame.timestamp;
        if !timestamp.is_finite() {
            warn!(stream = "visual", "depth frame without a finite timestamp");
            return Ok(self.dropped(DropReason::Malformed));
        }
        if let Some(last) = visual.last_timestamp
            && timestamp < last
        {
            warn!(stream = "visual", timestamp, last, "out-of-order observation dropped");
            return Ok(self.dropped(DropReason::OutOfOrder));
        }

        // Carry the particles along with the encoder-measured motion since
        // the last frame they were aligned to.  The tracker commits the shift
        // only together with an accepted frame.
        let reference = lock(&self.inner.joint).state_at(timestamp);
        let motion = match (&visual.reference, &reference) {
            (Some(previous), Some(current)) => Some(current.delta(previous)?),
            _ => None,
        };
        let motion = match motion {
            Some(m) if !m.is_finite() => {
                warn!(timestamp, "non-finite particle motion skipped");
                None
            }
            m => m,
        };

        let outcome = match visual.tracker.advance_with_motion(&frame, motion.as_ref()) {
            Ok(outcome) => outcome,
            Err(TrackError::Cancelled) => {
                debug!(timestamp, "particle update cancelled");
                return Ok(self.dropped(DropReason::Cancelled));
            }
            Err(e @ TrackError::MalformedObservation(_)) => {
                warn!(stream = "visual", timestamp, error = %e, "depth frame rejected");
                return Ok(self.dropped(DropReason::Malformed));
            }
            Err(e) => return Err(e),
        };
        visual.last_timestamp = Some(timestamp);

        match outcome {
            FrameOutcome::Unusable => {
                warn!(stream = "visual", timestamp, "depth frame has no usable pixels");
                return Ok(self.dropped(DropReason::NoUsablePixels));
            }
            FrameOutcome::Updated {
                effective_sample_size,
                resampled,
                collapsed,
            } => {
                debug!(timestamp, ess = effective_sample_size, resampled, "particle update");
                if resampled {
                    Counters::bump(&self.inner.counters.resamples);
                }
                if collapsed {
                    Counters::bump(&self.inner.counters.weight_collapses);
                }
            }
        }
        visual.reference = reference.clone();
        let visual_estimate = visual.tracker.estimate();

        let mut joint = lock(&self.inner.joint);
        match self.run_state() {
            RunState::Running => {}
            RunState::Paused => return Ok(self.dropped(DropReason::Paused)),
            _ => return Ok(self.dropped(DropReason::Cancelled)),
        }

        let reference = reference.unwrap_or_else(|| joint.bank.estimate());
        let residual = visual_estimate.delta(&reference)?;
        let before = joint.bank.estimate();
        let sigma = self.inner.policy.correction_sigma;
        joint.bank.inject_correction(&residual, sigma * sigma)?;
        let after = joint.bank.estimate();
        let shift = after.delta(&before)?;
        joint.shift_history(&shift);
        visual.reference = Some(RobotState::from_vector(
            reference.as_vector() + shift.as_vector(),
        ));
        debug!(
            timestamp,
            residual = residual.max_abs_diff(&RobotState::zeros(residual.len())),
            "visual correction applied"
        );

        let published_at = joint.last_timestamp.map_or(timestamp, |t| t.max(timestamp));
        self.inner.published.send_replace(FusedEstimate {
            timestamp: published_at,
            state: after,
        });
        Counters::bump(&self.inner.counters.visual_applied);
        Ok(ObservationOutcome::Applied)
    }

    /// `None` when running; a drop while paused; an error otherwise.
    fn gate(&self, operation: &'static str) -> Result<Option<ObservationOutcome>, TrackError> {
        match self.run_state() {
            RunState::Running => Ok(None),
            RunState::Paused => Ok(Some(self.dropped(DropReason::Paused))),
            state => Err(TrackError::Lifecycle {
                operation,
                state: state.to_string(),
            }),
        }
    }

    fn dropped(&self, reason: DropReason) -> ObservationOutcome {
        self.inner.counters.dropped(reason);
        ObservationOutcome::Dropped(reason)
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Last committed estimate.  Never waits on an in-flight update.
    pub fn current_state(&self) -> FusedEstimate {
        self.inner.published.borrow().clone()
    }

    /// Receiver notified on every newly committed estimate.
    pub fn estimates(&self) -> watch::Receiver<FusedEstimate> {
        self.inner.published.subscribe()
    }

    pub fn stats(&self) -> FusionStats {
        self.inner.counters.snapshot()
    }

    /// Liveness of both sensor streams.
    pub fn stream_health(&self) -> Vec<(SensorStream, StreamHealth)> {
        let monitor = lock(&self.inner.monitor);
        [SensorStream::Joint, SensorStream::Visual]
            .into_iter()
            .map(|s| (s, monitor.health(s)))
            .collect()
    }

    /// Current encoder-bias estimate of the joint bank.
    pub fn biases(&self) -> RobotState {
        lock(&self.inner.joint).bank.biases()
    }

    pub fn kinematics(&self) -> &Arc<dyn Kinematics> {
        &self.inner.kinematics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armtrack_hal::renderer::{SweepRenderer, SweepRendererConfig};
    use armtrack_perception::particle::Particle;
    use armtrack_types::{JointChain, JointSpec};
    use nalgebra::DMatrix;
    use std::sync::Condvar;
    use std::thread;

    fn controller(joints: usize) -> FusionController {
        let renderer =
            Arc::new(SweepRenderer::new(SweepRendererConfig::default(), joints).unwrap());
        controller_with(joints, renderer, |_| {})
    }

    fn controller_with(
        joints: usize,
        renderer: Arc<dyn Renderer>,
        tweak: impl FnOnce(&mut FusionConfig),
    ) -> FusionController {
        let chain = Arc::new(
            JointChain::new(
                (0..joints)
                    .map(|i| JointSpec::revolute(format!("j{i}")))
                    .collect(),
            )
            .unwrap(),
        );
        let mut cfg = FusionConfig::uniform(joints, 0.5, 0.01, 0.002);
        cfg.visual.particle_count = 50;
        cfg.visual.seed = Some(1);
        tweak(&mut cfg);
        FusionController::new(&cfg, chain, renderer).unwrap()
    }

    /// Depth frame of a single joint at `angle`, background filled in.
    fn frame_at(t: f64, angle: f64) -> Arc<DepthFrame> {
        let renderer = SweepRenderer::new(SweepRendererConfig::default(), 1).unwrap();
        let image = renderer
            .render(&RobotState::new(vec![angle]))
            .map(|r| if r.is_finite() { r } else { 4.0 });
        Arc::new(DepthFrame::new(t, image))
    }

    fn particles(c: &FusionController) -> Vec<Particle> {
        lock(&c.inner.visual).tracker.particles().to_vec()
    }

    /// Sweep renderer whose renders block until [`release`][Self::release].
    struct GatedRenderer {
        inner: SweepRenderer,
        entered: AtomicBool,
        open: Mutex<bool>,
        opened: Condvar,
    }

    impl GatedRenderer {
        fn new() -> Self {
            Self {
                inner: SweepRenderer::new(SweepRendererConfig::default(), 1).unwrap(),
                entered: AtomicBool::new(false),
                open: Mutex::new(false),
                opened: Condvar::new(),
            }
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }
    }

    impl Renderer for GatedRenderer {
        fn resolution(&self) -> (usize, usize) {
            Renderer::resolution(&self.inner)
        }

        fn render(&self, state: &RobotState) -> DMatrix<f64> {
            self.entered.store(true, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
            drop(open);
            self.inner.render(state)
        }
    }

    fn sample(t: f64, positions: Vec<f64>) -> EncoderSample {
        EncoderSample {
            timestamp: t,
            positions,
        }
    }

    fn lifecycle_err(result: Result<ObservationOutcome, TrackError>) -> bool {
        matches!(result, Err(TrackError::Lifecycle { .. }))
    }

    #[test]
    fn run_state_machine() {
        let c = controller(1);
        assert_eq!(c.run_state(), RunState::Stopped);
        assert!(c.pause().is_err());
        assert!(c.toggle_pause().is_err());

        assert_eq!(c.run().unwrap(), RunState::Running);
        assert!(matches!(c.run(), Err(TrackError::Lifecycle { operation: "run", .. })));
        assert_eq!(c.resume().unwrap(), RunState::Running);
        assert_eq!(c.pause().unwrap(), RunState::Paused);
        assert_eq!(c.pause().unwrap(), RunState::Paused);
        assert_eq!(c.toggle_pause().unwrap(), RunState::Running);
        assert_eq!(c.toggle_pause().unwrap(), RunState::Paused);

        c.shutdown();
        assert_eq!(c.run_state(), RunState::ShutDown);
        c.shutdown();
        assert!(c.run().is_err());
        assert!(c.resume().is_err());
        assert!(c.initialize(&RobotState::zeros(1)).is_err());
    }

    #[test]
    fn callbacks_outside_running_are_rejected() {
        let c = controller(1);
        assert!(lifecycle_err(c.joints_obsrv_callback(sample(0.0, vec![0.0]))));
        let frame = Arc::new(DepthFrame::new(0.0, DMatrix::from_element(2, 48, 1.0)));
        assert!(lifecycle_err(c.image_obsrv_callback(frame.clone())));

        c.run().unwrap();
        c.shutdown();
        assert!(lifecycle_err(c.joints_obsrv_callback(sample(1.0, vec![0.0]))));
        assert!(lifecycle_err(c.image_obsrv_callback(frame)));
    }

    #[test]
    fn out_of_order_sample_is_dropped() {
        let c = controller(1);
        c.run().unwrap();
        assert_eq!(
            c.joints_obsrv_callback(sample(2.0, vec![0.5])).unwrap(),
            ObservationOutcome::Applied
        );
        let before = c.current_state();

        assert_eq!(
            c.joints_obsrv_callback(sample(1.0, vec![-3.0])).unwrap(),
            ObservationOutcome::Dropped(DropReason::OutOfOrder)
        );
        assert_eq!(c.current_state(), before);
        assert_eq!(c.stats().dropped_out_of_order, 1);
        assert_eq!(c.stats().joint_applied, 1);
        assert!((before.timestamp - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn pause_freezes_and_resume_unfreezes() {
        let c = controller(2);
        c.run().unwrap();
        for k in 0..10 {
            c.joints_obsrv_callback(sample(k as f64 * 0.01, vec![0.2, -0.1])).unwrap();
        }
        c.pause().unwrap();
        let frozen = c.current_state();
        for k in 10..20 {
            let outcome = c
                .joints_obsrv_callback(sample(k as f64 * 0.01, vec![0.9, 0.9]))
                .unwrap();
            assert_eq!(outcome, ObservationOutcome::Dropped(DropReason::Paused));
            assert_eq!(c.current_state(), frozen);
        }
        for _ in 0..100 {
            assert_eq!(c.current_state(), frozen);
        }
        assert_eq!(c.stats().dropped_paused, 10);

        c.resume().unwrap();
        c.joints_obsrv_callback(sample(0.5, vec![0.9, 0.9])).unwrap();
        assert_ne!(c.current_state(), frozen);
    }

    #[test]
    fn malformed_samples_are_dropped() {
        let c = controller(2);
        c.run().unwrap();
        assert_eq!(
            c.joints_obsrv_callback(sample(0.0, vec![0.1])).unwrap(),
            ObservationOutcome::Dropped(DropReason::Malformed)
        );
        assert_eq!(
            c.joints_obsrv_callback(sample(f64::NAN, vec![0.1, 0.1])).unwrap(),
            ObservationOutcome::Dropped(DropReason::Malformed)
        );
        let frame = Arc::new(DepthFrame::new(0.0, DMatrix::from_element(3, 3, 1.0)));
        assert_eq!(
            c.image_obsrv_callback(frame).unwrap(),
            ObservationOutcome::Dropped(DropReason::Malformed)
        );
        assert_eq!(c.stats().dropped_malformed, 3);
    }

    #[test]
    fn unusable_frame_keeps_estimate() {
        let c = controller(1);
        c.run().unwrap();
        c.joints_obsrv_callback(sample(0.0, vec![0.1])).unwrap();
        let before = c.current_state();
        let frame = Arc::new(DepthFrame::new(
            0.01,
            DMatrix::from_element(2, 48, f64::INFINITY),
        ));
        assert_eq!(
            c.image_obsrv_callback(frame).unwrap(),
            ObservationOutcome::Dropped(DropReason::NoUsablePixels)
        );
        assert_eq!(c.current_state(), before);
    }

    #[test]
    fn visual_frame_out_of_order() {
        let c = controller(1);
        c.initialize(&RobotState::new(vec![0.0])).unwrap();
        c.run().unwrap();
        assert_eq!(
            c.image_obsrv_callback(frame_at(1.0, 0.0)).unwrap(),
            ObservationOutcome::Applied
        );
        assert_eq!(
            c.image_obsrv_callback(frame_at(0.5, 0.0)).unwrap(),
            ObservationOutcome::Dropped(DropReason::OutOfOrder)
        );
        assert_eq!(c.stats().visual_applied, 1);
    }

    #[test]
    fn initialize_publishes_state() {
        let c = controller(2);
        let mut rx = c.estimates();
        c.initialize(&RobotState::new(vec![0.3, -0.3])).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(c.current_state().state, RobotState::new(vec![0.3, -0.3]));
        assert!(matches!(
            c.initialize(&RobotState::zeros(3)),
            Err(TrackError::JointCountMismatch { .. })
        ));
    }

    #[test]
    fn stream_health_after_run() {
        let c = controller(1);
        assert!(c
            .stream_health()
            .iter()
            .all(|(_, h)| *h == StreamHealth::Unmonitored));
        c.run().unwrap();
        assert!(c.stream_health().iter().all(|(_, h)| *h == StreamHealth::Live));
    }

    #[test]
    fn rejected_frame_keeps_particles_and_next_correction() {
        let renderer = Arc::new(SweepRenderer::new(SweepRendererConfig::default(), 1).unwrap());
        let c = controller_with(1, renderer, |cfg| {
            cfg.visual.initial_spread = 0.0;
            cfg.visual.diffusion_sigma = 0.0;
        });
        c.initialize(&RobotState::new(vec![0.0])).unwrap();
        c.run().unwrap();
        c.joints_obsrv_callback(sample(0.0, vec![0.0])).unwrap();
        assert_eq!(
            c.image_obsrv_callback(frame_at(0.0, 0.0)).unwrap(),
            ObservationOutcome::Applied
        );
        for k in 1..=10 {
            c.joints_obsrv_callback(sample(k as f64 * 0.01, vec![0.3])).unwrap();
        }
        let aligned = particles(&c);

        let wrong_size = Arc::new(DepthFrame::new(0.1, DMatrix::from_element(3, 3, 1.0)));
        assert_eq!(
            c.image_obsrv_callback(wrong_size).unwrap(),
            ObservationOutcome::Dropped(DropReason::Malformed)
        );
        assert_eq!(particles(&c), aligned);

        let bank = c.current_state().state;
        assert!(bank[0] > 0.1);
        assert_eq!(
            c.image_obsrv_callback(frame_at(0.1, 0.3)).unwrap(),
            ObservationOutcome::Applied
        );
        // The encoder motion is applied once, so the particles agree with the
        // bank and the correction leaves the estimate where it was.
        let visual = lock(&c.inner.visual).tracker.estimate();
        assert!((visual[0] - bank[0]).abs() < 1e-9);
        assert!((c.current_state().state[0] - bank[0]).abs() < 1e-9);
    }

    #[test]
    fn encoder_and_depth_callbacks_run_concurrently() {
        let c = controller(1);
        c.initialize(&RobotState::new(vec![0.0])).unwrap();
        c.run().unwrap();

        let encoders = {
            let c = c.clone();
            thread::spawn(move || {
                (0..500)
                    .map(|k| c.joints_obsrv_callback(sample(k as f64 * 0.002, vec![0.0])).unwrap())
                    .collect::<Vec<_>>()
            })
        };
        let frames = {
            let c = c.clone();
            thread::spawn(move || {
                (0..15)
                    .map(|k| c.image_obsrv_callback(frame_at(k as f64 * 0.066, 0.0)).unwrap())
                    .collect::<Vec<_>>()
            })
        };
        let encoders = encoders.join().unwrap();
        let frames = frames.join().unwrap();

        assert!(encoders.iter().all(|o| *o == ObservationOutcome::Applied));
        assert!(frames.iter().all(|o| *o == ObservationOutcome::Applied));
        let stats = c.stats();
        assert_eq!(stats.joint_applied, 500);
        assert_eq!(stats.visual_applied, 15);
        assert!(c.current_state().state[0].abs() < 0.05);
    }

    #[test]
    fn shutdown_cancels_frame_being_scored() {
        let renderer = Arc::new(GatedRenderer::new());
        let c = controller_with(1, renderer.clone(), |_| {});
        c.run().unwrap();
        c.joints_obsrv_callback(sample(0.0, vec![0.0])).unwrap();
        let published = c.current_state();
        let mut estimates = c.estimates();

        let worker = {
            let c = c.clone();
            thread::spawn(move || c.image_obsrv_callback(frame_at(0.0, 0.0)))
        };
        while !renderer.entered.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        c.shutdown();
        renderer.release();

        assert_eq!(
            worker.join().unwrap().unwrap(),
            ObservationOutcome::Dropped(DropReason::Cancelled)
        );
        assert!(!estimates.has_changed().unwrap());
        assert_eq!(c.current_state(), published);
        assert_eq!(c.stats().dropped_cancelled, 1);
        assert_eq!(c.stats().visual_applied, 0);
    }

    #[test]
    fn history_interpolates_and_clamps() {
        let bank = JointFilterBank::new(
            FusionConfig::uniform(1, 0.5, 0.01, 0.002).joint_noise(),
            Default::default(),
        )
        .unwrap();
        let mut side = JointSide {
            bank,
            last_timestamp: None,
            history: VecDeque::new(),
        };
        assert!(side.state_at(0.0).is_none());
        side.record(1.0, RobotState::new(vec![0.0]), 10.0);
        side.record(2.0, RobotState::new(vec![1.0]), 10.0);
        assert!((side.state_at(1.25).unwrap()[0] - 0.25).abs() < 1e-12);
        assert_eq!(side.state_at(0.0).unwrap()[0], 0.0);
        assert_eq!(side.state_at(5.0).unwrap()[0], 1.0);

        side.shift_history(&RobotState::new(vec![0.5]));
        assert!((side.state_at(2.0).unwrap()[0] - 1.5).abs() < 1e-12);

        side.record(20.0, RobotState::new(vec![2.0]), 10.0);
        assert_eq!(side.history.len(), 1);
    }
}
