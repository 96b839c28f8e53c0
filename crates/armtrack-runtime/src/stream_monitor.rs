//! [`StreamMonitor`] – sensor stream liveness.
//!
//! Every observation that reaches the controller counts as a heartbeat for
//! its stream.  A stream is *silent* once no observation has arrived within
//! its deadline; the runtime node turns the transition into a
//! `SensorFault` alert.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use armtrack_types::SensorStream;
use serde::Serialize;

/// Health reported for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamHealth {
    /// An observation arrived within the deadline.
    Live,
    /// Nothing arrived within the deadline.
    Silent,
    /// The stream is not monitored.
    Unmonitored,
}

#[derive(Debug)]
struct StreamEntry {
    last_seen: Instant,
    timeout: Duration,
    count: u64,
}

/// Tracks observation arrivals per [`SensorStream`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use armtrack_runtime::stream_monitor::{StreamMonitor, StreamHealth};
/// use armtrack_types::SensorStream;
///
/// let mut monitor = StreamMonitor::new();
/// monitor.register(SensorStream::Joint, Duration::from_millis(10));
/// monitor.record(SensorStream::Joint);
///
/// assert_eq!(monitor.health(SensorStream::Joint), StreamHealth::Live);
/// ```
#[derive(Debug, Default)]
pub struct StreamMonitor {
    streams: HashMap<SensorStream, StreamEntry>,
}

impl StreamMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start monitoring `stream` with deadline `timeout`.
    ///
    /// The deadline starts now; re-registering resets it.
    pub fn register(&mut self, stream: SensorStream, timeout: Duration) {
        self.streams.insert(
            stream,
            StreamEntry {
                last_seen: Instant::now(),
                timeout,
                count: 0,
            },
        );
    }

    /// Record an arrival on `stream`.  No-op for unmonitored streams.
    pub fn record(&mut self, stream: SensorStream) {
        if let Some(entry) = self.streams.get_mut(&stream) {
            entry.last_seen = Instant::now();
            entry.count += 1;
        }
    }

    pub fn health(&self, stream: SensorStream) -> StreamHealth {
        match self.streams.get(&stream) {
            Some(entry) if entry.last_seen.elapsed() <= entry.timeout => StreamHealth::Live,
            Some(_) => StreamHealth::Silent,
            None => StreamHealth::Unmonitored,
        }
    }

    /// Arrivals recorded on `stream` since registration.
    pub fn count(&self, stream: SensorStream) -> u64 {
        self.streams.get(&stream).map_or(0, |e| e.count)
    }

    /// Streams whose deadline has passed.  Order is unspecified.
    pub fn silent_streams(&self) -> Vec<SensorStream> {
        self.streams
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() > entry.timeout)
            .map(|(stream, _)| *stream)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fresh_stream_is_live() {
        let mut monitor = StreamMonitor::new();
        monitor.register(SensorStream::Visual, Duration::from_secs(5));
        assert_eq!(monitor.health(SensorStream::Visual), StreamHealth::Live);
    }

    #[test]
    fn arrival_resets_deadline() {
        let mut monitor = StreamMonitor::new();
        monitor.register(SensorStream::Joint, Duration::from_millis(40));
        thread::sleep(Duration::from_millis(25));
        monitor.record(SensorStream::Joint);
        thread::sleep(Duration::from_millis(25));
        assert_eq!(monitor.health(SensorStream::Joint), StreamHealth::Live);
        assert_eq!(monitor.count(SensorStream::Joint), 1);
    }

    #[test]
    fn stream_goes_silent() {
        let mut monitor = StreamMonitor::new();
        monitor.register(SensorStream::Joint, Duration::from_millis(20));
        monitor.register(SensorStream::Visual, Duration::from_secs(60));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(monitor.health(SensorStream::Joint), StreamHealth::Silent);
        assert_eq!(monitor.silent_streams(), vec![SensorStream::Joint]);
    }

    #[test]
    fn unmonitored_stream() {
        let mut monitor = StreamMonitor::new();
        monitor.record(SensorStream::Visual);
        assert_eq!(monitor.health(SensorStream::Visual), StreamHealth::Unmonitored);
        assert_eq!(monitor.count(SensorStream::Visual), 0);
        assert!(monitor.silent_streams().is_empty());
    }
}
