// Event hub
//
// In-process fan-out of state transitions. Each subscriber owns a bounded
// channel; a full channel drops the event for that subscriber only and the
// publisher never blocks. Every event is also offered to an optional durable
// sink (the event log).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::db::schema::{AssetStatus, TaskKind, TaskStatus};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Asset,
    Task,
    Scan,
    Watch,
    System,
}

impl Topic {
    pub const ALL: [Topic; 5] = [Topic::Asset, Topic::Task, Topic::Scan, Topic::Watch, Topic::System];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Asset => "asset",
            Topic::Task => "task",
            Topic::Scan => "scan",
            Topic::Watch => "watch",
            Topic::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    AssetCreated {
        asset_id: String,
        path: String,
    },
    AssetChanged {
        asset_id: String,
        path: String,
    },
    AssetStatusChanged {
        asset_id: String,
        status: AssetStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AssetMissing {
        asset_id: String,
        path: String,
    },
    AssetDuplicate {
        asset_id: String,
        duplicate_of: String,
        fingerprint: String,
    },
    TaskStarted {
        task_id: i64,
        asset_id: String,
        kind: TaskKind,
    },
    TaskFinished {
        task_id: i64,
        asset_id: String,
        kind: TaskKind,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TaskRetryScheduled {
        task_id: i64,
        asset_id: String,
        kind: TaskKind,
        attempts: i64,
        not_before: i64,
    },
    ScanStarted {
        root: String,
    },
    ScanFinished {
        root: String,
        seen: u64,
        created: u64,
        changed: u64,
        missing: u64,
        errors: u64,
        completed: bool,
    },
    WatchOverflow {
        roots: Vec<String>,
    },
    WatchError {
        message: String,
    },
    EngineStarted {
        tasks_recovered: usize,
        assets_recovered: usize,
    },
    EngineStopping,
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::AssetCreated { .. }
            | Event::AssetChanged { .. }
            | Event::AssetStatusChanged { .. }
            | Event::AssetMissing { .. }
            | Event::AssetDuplicate { .. } => Topic::Asset,
            Event::TaskStarted { .. }
            | Event::TaskFinished { .. }
            | Event::TaskRetryScheduled { .. } => Topic::Task,
            Event::ScanStarted { .. } | Event::ScanFinished { .. } => Topic::Scan,
            Event::WatchOverflow { .. } | Event::WatchError { .. } => Topic::Watch,
            Event::EngineStarted { .. } | Event::EngineStopping => Topic::System,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::AssetCreated { .. } => "asset.created",
            Event::AssetChanged { .. } => "asset.changed",
            Event::AssetStatusChanged { .. } => "asset.status_changed",
            Event::AssetMissing { .. } => "asset.missing",
            Event::AssetDuplicate { .. } => "asset.duplicate",
            Event::TaskStarted { .. } => "task.started",
            Event::TaskFinished { .. } => "task.finished",
            Event::TaskRetryScheduled { .. } => "task.retry_scheduled",
            Event::ScanStarted { .. } => "scan.started",
            Event::ScanFinished { .. } => "scan.finished",
            Event::WatchOverflow { .. } => "watch.overflow",
            Event::WatchError { .. } => "watch.error",
            Event::EngineStarted { .. } => "system.started",
            Event::EngineStopping => "system.stopping",
        }
    }

    /// Asset id the event is about, when there is one
    pub fn subject_id(&self) -> Option<&str> {
        match self {
            Event::AssetCreated { asset_id, .. }
            | Event::AssetChanged { asset_id, .. }
            | Event::AssetStatusChanged { asset_id, .. }
            | Event::AssetMissing { asset_id, .. }
            | Event::AssetDuplicate { asset_id, .. }
            | Event::TaskStarted { asset_id, .. }
            | Event::TaskFinished { asset_id, .. }
            | Event::TaskRetryScheduled { asset_id, .. } => Some(asset_id.as_str()),
            _ => None,
        }
    }
}

/// Anything that can accept published events. The queue, scanner and watcher
/// depend on this rather than on the hub itself.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event);
}

/// Durable destination for every published event
pub trait EventSink: Send + Sync {
    fn record(&self, event: &Event) -> Result<()>;
}

/// Publisher that discards everything
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: Event) {}
}

#[derive(Debug, Clone)]
pub enum TopicFilter {
    All,
    Only(Vec<Topic>),
}

impl TopicFilter {
    pub fn matches(&self, topic: Topic) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Only(topics) => topics.contains(&topic),
        }
    }
}

struct Subscriber {
    id: u64,
    filter: TopicFilter,
    tx: Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// Receiving end of a subscription. Dropping it unsubscribes on the next publish.
pub struct Subscription {
    id: u64,
    rx: Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// None on timeout or once the hub is gone
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything currently buffered
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }

    /// Events dropped for this subscriber because its buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn receiver(&self) -> &Receiver<Event> {
        &self.rx
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub subscribers: usize,
    pub published: u64,
    pub dropped_total: u64,
    /// (subscriber id, dropped)
    pub per_subscriber: Vec<(u64, u64)>,
}

pub struct EventHub {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
    sink: Option<Arc<dyn EventSink>>,
    published: AtomicU64,
    dropped_total: AtomicU64,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            sink: None,
            published: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn with_sink(capacity: usize, sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new(capacity)
        }
    }

    pub fn subscribe(&self, filter: TopicFilter) -> Subscription {
        self.subscribe_with_capacity(filter, self.capacity)
    }

    pub fn subscribe_with_capacity(&self, filter: TopicFilter, capacity: usize) -> Subscription {
        let (tx, rx) = bounded(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.lock().push(Subscriber {
            id,
            filter,
            tx,
            dropped: Arc::clone(&dropped),
        });
        Subscription { id, rx, dropped }
    }

    pub fn stats(&self) -> HubStats {
        let subs = self.subscribers.lock();
        HubStats {
            subscribers: subs.len(),
            published: self.published.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            per_subscriber: subs
                .iter()
                .map(|s| (s.id, s.dropped.load(Ordering::Relaxed)))
                .collect(),
        }
    }

    fn deliver(&self, event: &Event) {
        let topic = event.topic();
        // Holding the lock for the whole fan-out keeps per-subscriber order
        let mut subs = self.subscribers.lock();
        subs.retain(|sub| {
            if !sub.filter.matches(topic) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Subscriber {} is full, dropped {}", sub.id, event.event_type());
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::debug!("Subscriber {} went away", sub.id);
                    false
                }
            }
        });
    }
}

impl EventPublisher for EventHub {
    fn publish(&self, event: Event) {
        self.published.fetch_add(1, Ordering::Relaxed);

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record(&event) {
                log::warn!("Failed to persist event {}: {}", event.event_type(), e);
            }
        }

        self.deliver(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;

    fn asset_event(n: usize) -> Event {
        Event::AssetCreated {
            asset_id: format!("a{}", n),
            path: format!("/r/{}.jpg", n),
        }
    }

    #[test]
    fn test_fan_out_and_filters() {
        let hub = EventHub::new(16);
        let all = hub.subscribe(TopicFilter::All);
        let tasks_only = hub.subscribe(TopicFilter::Only(vec![Topic::Task]));

        hub.publish(asset_event(1));
        hub.publish(Event::TaskStarted {
            task_id: 1,
            asset_id: "a1".into(),
            kind: TaskKind::Parse,
        });

        assert_eq!(all.drain().len(), 2);
        let got = tasks_only.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].topic(), Topic::Task);
    }

    #[test]
    fn test_slow_subscriber_drops_without_blocking() {
        let hub = EventHub::new(16);
        let slow = hub.subscribe_with_capacity(TopicFilter::All, 3);
        let fast = hub.subscribe_with_capacity(TopicFilter::All, 100);

        for i in 0..10 {
            hub.publish(asset_event(i));
        }

        assert_eq!(slow.dropped(), 7);
        assert_eq!(fast.dropped(), 0);
        assert_eq!(hub.stats().dropped_total, 7);

        // What did arrive is a prefix, in order
        let received: Vec<Event> = slow.drain();
        assert_eq!(received, (0..3).map(asset_event).collect::<Vec<_>>());
        assert_eq!(fast.drain().len(), 10);
    }

    #[test]
    fn test_per_subscriber_order_under_concurrency() {
        let hub = Arc::new(EventHub::new(10_000));
        let sub = hub.subscribe(TopicFilter::All);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let hub = Arc::clone(&hub);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        hub.publish(Event::TaskRetryScheduled {
                            task_id: t,
                            asset_id: format!("t{}", t),
                            kind: TaskKind::Parse,
                            attempts: i,
                            not_before: 0,
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Each publisher's events arrive in the order it published them
        let mut last = [-1i64; 4];
        for event in sub.drain() {
            if let Event::TaskRetryScheduled { task_id, attempts, .. } = event {
                assert!(attempts > last[task_id as usize]);
                last[task_id as usize] = attempts;
            }
        }
        assert_eq!(last, [249; 4]);
    }

    #[test]
    fn test_dropped_subscription_is_removed() {
        let hub = EventHub::new(4);
        let sub = hub.subscribe(TopicFilter::All);
        assert_eq!(hub.stats().subscribers, 1);
        drop(sub);
        hub.publish(asset_event(1));
        assert_eq!(hub.stats().subscribers, 0);
    }

    struct FailingSink;

    impl EventSink for FailingSink {
        fn record(&self, _event: &Event) -> Result<()> {
            Err(MediaError::Other("disk full".into()))
        }
    }

    #[test]
    fn test_sink_failure_does_not_stop_delivery() {
        let hub = EventHub::with_sink(4, Arc::new(FailingSink));
        let sub = hub.subscribe(TopicFilter::All);
        hub.publish(asset_event(1));
        assert_eq!(sub.drain().len(), 1);
    }

    #[test]
    fn test_event_metadata() {
        let e = Event::AssetMissing {
            asset_id: "a9".into(),
            path: "/r/x".into(),
        };
        assert_eq!(e.topic(), Topic::Asset);
        assert_eq!(e.event_type(), "asset.missing");
        assert_eq!(e.subject_id(), Some("a9"));

        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "asset_missing");
        assert_eq!(Event::EngineStopping.subject_id(), None);
    }
}
