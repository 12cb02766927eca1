//! Event fan-out.
//!
//! Schedulers and the manager publish through an injected
//! [`EventBroadcaster`]; subscribers receive best-effort, at-most-once
//! delivery. Copy progress goes through a coalescing collector that keeps
//! only the latest sample per file between flush ticks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stevedore_protocol::events::{ProgressEvent, ServiceEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Flush interval for batched copy-progress events.
pub const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Publish/subscribe point for service events.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<ServiceEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    /// Best-effort publish; an absent or lagging subscriber is not an
    /// error, the queue store stays the ground truth.
    pub fn publish(&self, event: ServiceEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Coalescing sink for per-chunk progress callbacks.
///
/// Workers record from the blocking pool; the flusher drains the latest
/// sample per file on every tick. `bytes_copied` is cumulative, so the
/// retained sample is always the largest seen.
#[derive(Clone, Default)]
pub struct ProgressCollector {
    latest: Arc<Mutex<HashMap<(i64, i64), ProgressEvent>>>,
}

impl ProgressCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: ProgressEvent) {
        if let Ok(mut latest) = self.latest.lock() {
            latest.insert((event.bucket_id, event.file_id), event);
        }
    }

    pub fn drain(&self) -> Vec<ProgressEvent> {
        match self.latest.lock() {
            Ok(mut latest) => latest.drain().map(|(_, event)| event).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Background task publishing one batched progress broadcast per tick.
pub struct ProgressFlusher {
    handle: JoinHandle<()>,
}

impl ProgressFlusher {
    pub fn spawn(collector: ProgressCollector, events: EventBroadcaster) -> Self {
        Self::spawn_with_interval(collector, events, PROGRESS_FLUSH_INTERVAL)
    }

    pub fn spawn_with_interval(
        collector: ProgressCollector,
        events: EventBroadcaster,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let mut updates = collector.drain();
                if updates.is_empty() {
                    continue;
                }
                updates.sort_by_key(|event| (event.bucket_id, event.file_id));
                events.publish(ServiceEvent::CopyProgress { updates });
            }
        });
        Self { handle }
    }
}

impl Drop for ProgressFlusher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_keeps_latest_sample_per_file() {
        let collector = ProgressCollector::new();
        collector.record(ProgressEvent::new(1, 10, 100, 1000));
        collector.record(ProgressEvent::new(1, 10, 500, 1000));
        collector.record(ProgressEvent::new(1, 11, 50, 1000));

        let mut drained = collector.drain();
        drained.sort_by_key(|e| e.file_id);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].bytes_copied, 500);
        assert_eq!(drained[1].bytes_copied, 50);

        assert!(collector.drain().is_empty());
    }

    #[tokio::test]
    async fn flusher_publishes_batched_updates() {
        let collector = ProgressCollector::new();
        let events = EventBroadcaster::new();
        let mut rx = events.subscribe();

        let _flusher = ProgressFlusher::spawn_with_interval(
            collector.clone(),
            events.clone(),
            Duration::from_millis(10),
        );

        collector.record(ProgressEvent::new(1, 1, 10, 100));
        collector.record(ProgressEvent::new(1, 1, 90, 100));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ServiceEvent::CopyProgress { updates } = event else {
            panic!("expected progress batch");
        };
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].bytes_copied, 90);
        assert_eq!(updates[0].percent, 90);
    }
}
