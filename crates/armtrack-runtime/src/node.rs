//! [`FusionNode`] – bus wiring around a [`FusionController`].
//!
//! | Task | Input | Output |
//! |---|---|---|
//! | encoder | `Topic::JointSensor` | `joints_obsrv_callback` |
//! | visual forwarder | `Topic::VisualSensor` | newest-frame slot |
//! | visual worker | newest-frame slot | `image_obsrv_callback` on the blocking pool |
//! | publisher | estimate `watch` | `Topic::Estimates` at `publish_rate` |
//! | monitor | stream health | `SensorFault` on `Topic::SystemAlerts` |
//!
//! The visual worker processes one frame at a time.  A frame arriving while
//! another is being scored replaces any frame still waiting, so the tracker
//! always works on the newest image and encoder updates never queue behind
//! particle scoring.  Every task exits once the controller is shut down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use armtrack_middleware::{EventBus, Topic, TopicReceiver};
use armtrack_types::{DepthFrame, Event, EventPayload, Observation, SensorStream, TrackError};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SensorConfig;
use crate::controller::{FusionController, RunState, lock};
use crate::stream_monitor::StreamHealth;

/// Event-source tag used on the bus.
pub const SOURCE: &str = "armtrack-runtime::node";

type FrameSlot = Arc<Mutex<Option<Arc<DepthFrame>>>>;

/// Running set of tasks feeding one controller.
#[derive(Debug)]
pub struct FusionNode {
    controller: FusionController,
    tasks: Vec<JoinHandle<()>>,
    superseded: Arc<AtomicU64>,
}

impl FusionNode {
    /// Subscribe to the sensor topics and spawn the node's tasks.
    ///
    /// Subscriptions are taken before this returns, so events published
    /// afterwards are never missed.
    ///
    /// Must be called from within a Tokio runtime.  The controller is
    /// expected to be running; callbacks rejected for lifecycle reasons are
    /// logged at debug level.
    ///
    /// # Errors
    ///
    /// [`TrackError::Config`] when `sensors` fails validation; nothing is
    /// spawned.
    pub fn spawn(
        controller: FusionController,
        bus: &EventBus,
        sensors: &SensorConfig,
    ) -> Result<Self, TrackError> {
        sensors.validate()?;
        let superseded = Arc::new(AtomicU64::new(0));
        let slot: FrameSlot = Arc::new(Mutex::new(None));
        let ready = Arc::new(Notify::new());

        let tasks = vec![
            tokio::spawn(encoder_task(
                controller.clone(),
                bus.subscribe_to(Topic::JointSensor),
            )),
            tokio::spawn(visual_forwarder(
                controller.clone(),
                bus.subscribe_to(Topic::VisualSensor),
                slot.clone(),
                ready.clone(),
                superseded.clone(),
            )),
            tokio::spawn(visual_worker(controller.clone(), slot, ready)),
            tokio::spawn(publisher_task(
                controller.clone(),
                bus.clone(),
                period(sensors.publish_rate),
            )),
            tokio::spawn(monitor_task(controller.clone(), bus.clone(), monitor_period(sensors))),
        ];
        info!(publish_rate = sensors.publish_rate, "fusion node started");

        Ok(Self {
            controller,
            tasks,
            superseded,
        })
    }

    pub fn controller(&self) -> &FusionController {
        &self.controller
    }

    /// Depth frames replaced by a newer frame before being processed.
    pub fn superseded_frames(&self) -> u64 {
        self.superseded.load(Ordering::Relaxed)
    }

    /// Shut the controller down and wait for every task to finish.
    pub async fn shutdown(self) {
        self.controller.shutdown();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "fusion node task failed");
            }
        }
        info!(superseded = self.superseded.load(Ordering::Relaxed), "fusion node stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves once `rx` reports [`RunState::ShutDown`] or the controller is
/// gone.
async fn shut_down(rx: &mut watch::Receiver<RunState>) {
    let _ = rx.wait_for(|s| *s == RunState::ShutDown).await;
}

fn period(rate: f64) -> Duration {
    Duration::from_secs_f64(1.0 / rate)
}

/// Poll twice per shortest stream deadline, within 10–250 ms.
fn monitor_period(sensors: &SensorConfig) -> Duration {
    let fastest = sensors.joint_rate.max(sensors.visual_rate);
    let secs = (sensors.timeout_periods / fastest / 2.0).clamp(0.01, 0.25);
    Duration::from_secs_f64(secs)
}

async fn encoder_task(controller: FusionController, mut events: TopicReceiver) {
    let mut states = controller.run_states();
    loop {
        tokio::select! {
            event = events.next_event() => {
                let Some(event) = event else { break };
                if let EventPayload::Observation(Observation::Joints(sample)) = event.payload
                    && let Err(e) = controller.joints_obsrv_callback(sample)
                {
                    debug!(error = %e, "encoder sample not accepted");
                }
            }
            _ = shut_down(&mut states) => break,
        }
    }
}

async fn visual_forwarder(
    controller: FusionController,
    mut events: TopicReceiver,
    slot: FrameSlot,
    ready: Arc<Notify>,
    superseded: Arc<AtomicU64>,
) {
    let mut states = controller.run_states();
    loop {
        tokio::select! {
            event = events.next_event() => {
                let Some(event) = event else { break };
                if let EventPayload::Observation(Observation::Depth(frame)) = event.payload {
                    if lock(&slot).replace(frame).is_some() {
                        superseded.fetch_add(1, Ordering::Relaxed);
                    }
                    ready.notify_one();
                }
            }
            _ = shut_down(&mut states) => break,
        }
    }
}

async fn visual_worker(controller: FusionController, slot: FrameSlot, ready: Arc<Notify>) {
    let mut states = controller.run_states();
    loop {
        tokio::select! {
            _ = ready.notified() => {}
            _ = shut_down(&mut states) => break,
        }
        let Some(frame) = lock(&slot).take() else { continue };
        let worker = controller.clone();
        match tokio::task::spawn_blocking(move || worker.image_obsrv_callback(frame)).await {
            Ok(Ok(outcome)) => debug!(?outcome, "depth frame processed"),
            Ok(Err(e)) => debug!(error = %e, "depth frame not accepted"),
            Err(e) => warn!(error = %e, "depth frame worker panicked"),
        }
    }
}

async fn publisher_task(controller: FusionController, bus: EventBus, every: Duration) {
    let mut estimates = controller.estimates();
    let mut states = controller.run_states();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shut_down(&mut states) => break,
        }
        if !estimates.has_changed().unwrap_or(false) {
            continue;
        }
        let estimate = estimates.borrow_and_update().clone();
        let event = Event::new(SOURCE, EventPayload::Estimate(estimate));
        if let Err(e) = bus.publish_to(Topic::Estimates, event) {
            debug!(error = %e, "estimate not delivered");
        }
    }
}

async fn monitor_task(controller: FusionController, bus: EventBus, every: Duration) {
    let mut states = controller.run_states();
    let mut ticker = tokio::time::interval(every);
    let mut previous: HashMap<SensorStream, StreamHealth> = HashMap::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shut_down(&mut states) => break,
        }
        for (stream, health) in controller.stream_health() {
            let before = previous.insert(stream, health);
            match (before, health) {
                (Some(StreamHealth::Silent), StreamHealth::Silent) => {}
                (_, StreamHealth::Silent) => {
                    let message = format!("no {stream:?} observation within its deadline");
                    warn!(?stream, "sensor stream silent");
                    let alert = Event::new(SOURCE, EventPayload::SensorFault { stream, message });
                    if let Err(e) = bus.publish_to(Topic::SystemAlerts, alert) {
                        debug!(error = %e, "sensor alert not delivered");
                    }
                }
                (Some(StreamHealth::Silent), StreamHealth::Live) => {
                    info!(?stream, "sensor stream recovered");
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionConfig;
    use armtrack_hal::renderer::{SweepRenderer, SweepRendererConfig};
    use armtrack_perception::render::Renderer;
    use armtrack_types::{EncoderSample, JointChain, JointSpec, RobotState};

    fn controller() -> FusionController {
        let chain = Arc::new(JointChain::new(vec![JointSpec::revolute("j0")]).unwrap());
        let renderer = Arc::new(SweepRenderer::new(SweepRendererConfig::default(), 1).unwrap());
        let mut cfg = FusionConfig::uniform(1, 0.5, 0.01, 0.002);
        cfg.visual.particle_count = 20;
        cfg.visual.seed = Some(3);
        FusionController::new(&cfg, chain, renderer).unwrap()
    }

    fn joints(t: f64, value: f64) -> Event {
        Event::new(
            "test",
            EventPayload::Observation(Observation::Joints(EncoderSample {
                timestamp: t,
                positions: vec![value],
            })),
        )
    }

    #[tokio::test]
    async fn encoder_events_drive_published_estimate() {
        let c = controller();
        c.run().unwrap();
        let bus = EventBus::default();
        let mut published = bus.subscribe_to(Topic::Estimates);
        let node = FusionNode::spawn(c.clone(), &bus, &SensorConfig::default()).unwrap();

        let mut estimates = c.estimates();
        bus.publish_to(Topic::JointSensor, joints(0.0, 0.4)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), estimates.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(c.current_state().state[0] > 0.0);

        let event = tokio::time::timeout(Duration::from_secs(2), published.next_event())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.payload, EventPayload::Estimate(_)));

        node.shutdown().await;
        assert_eq!(c.run_state(), RunState::ShutDown);
    }

    fn depth(t: f64) -> Event {
        let renderer = SweepRenderer::new(SweepRendererConfig::default(), 1).unwrap();
        let image = renderer
            .render(&RobotState::zeros(1))
            .map(|r| if r.is_finite() { r } else { 4.0 });
        Event::new(
            "test",
            EventPayload::Observation(Observation::Depth(Arc::new(DepthFrame::new(t, image)))),
        )
    }

    #[tokio::test]
    async fn newest_depth_frame_wins_while_encoders_flow() {
        let c = controller();
        c.initialize(&RobotState::zeros(1)).unwrap();
        c.run().unwrap();
        let bus = EventBus::default();
        let node = FusionNode::spawn(c.clone(), &bus, &SensorConfig::default()).unwrap();

        for k in 0..60 {
            let t = k as f64 * 0.005;
            bus.publish_to(Topic::JointSensor, joints(t, 0.0)).unwrap();
            bus.publish_to(Topic::VisualSensor, depth(t)).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while c.stats().visual_applied == 0 || c.stats().joint_applied < 60 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(node.superseded_frames() > 0);
        let stats = c.stats();
        assert_eq!(stats.joint_applied, 60);
        assert!(stats.visual_applied > 0);
        assert_eq!(stats.dropped_out_of_order, 0);
        node.shutdown().await;
    }

    #[test]
    fn spawn_rejects_invalid_rates() {
        let sensors = SensorConfig {
            publish_rate: 0.0,
            ..SensorConfig::default()
        };
        let err = FusionNode::spawn(controller(), &EventBus::default(), &sensors).unwrap_err();
        assert!(matches!(err, TrackError::Config(_)));
    }

    #[tokio::test]
    async fn silent_stream_raises_alert() {
        let c = controller();
        c.run().unwrap();
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let node = FusionNode::spawn(c.clone(), &bus, &SensorConfig::default()).unwrap();

        let joint_fault = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(event) = alerts.next_event().await {
                if let EventPayload::SensorFault { stream: SensorStream::Joint, .. } = event.payload {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(joint_fault);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_joins_idle_node() {
        let c = controller();
        c.run().unwrap();
        let bus = EventBus::default();
        let node = FusionNode::spawn(c.clone(), &bus, &SensorConfig::default()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), node.shutdown())
            .await
            .unwrap();
        assert_eq!(c.run_state(), RunState::ShutDown);
    }

    #[test]
    fn monitor_period_is_bounded() {
        let fast = SensorConfig::default();
        assert_eq!(monitor_period(&fast), Duration::from_millis(10));
        let slow = SensorConfig {
            joint_rate: 1.0,
            visual_rate: 1.0,
            ..SensorConfig::default()
        };
        assert_eq!(monitor_period(&slow), Duration::from_millis(250));
    }
}
