//! Ordered, deduplicated delivery of lifecycle events to analytics sinks.

use crate::ad::SessionId;
use crate::fetch::Fetcher;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Pause between delivery attempts grows by this step per retry
const SINK_RETRY_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Impression,
    ViewableImpression,
    Start,
    FirstQuartile,
    Midpoint,
    ThirdQuartile,
    Complete,
    Click,
    Skip,
    Error,
    Custom(String),
}

impl EventKind {
    /// Fire-once kinds reach each sink at most once per session
    pub fn is_fire_once(&self) -> bool {
        !matches!(self, EventKind::Custom(_))
    }

    /// Key of this event in a creative's tracking table
    pub fn tracking_key(&self) -> &str {
        match self {
            EventKind::Impression => "impression",
            EventKind::ViewableImpression => "viewableImpression",
            EventKind::Start => "start",
            EventKind::FirstQuartile => "firstQuartile",
            EventKind::Midpoint => "midpoint",
            EventKind::ThirdQuartile => "thirdQuartile",
            EventKind::Complete => "complete",
            EventKind::Click => "clickTracking",
            EventKind::Skip => "skip",
            EventKind::Error => "error",
            EventKind::Custom(name) => name.as_str(),
        }
    }
}

/// Identifies the session an event belongs to
#[derive(Debug, Clone)]
pub struct EventOrigin {
    pub session: SessionId,
    pub placement: String,
    pub test_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedEvent {
    pub kind: EventKind,
    pub session: SessionId,
    pub placement: String,

    /// Monotonic per session, starting at 0
    pub sequence: u64,

    /// Tracking URLs to fire for this event
    pub urls: Vec<String>,

    pub metadata: BTreeMap<String, String>,
    pub test_mode: bool,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink delivery failed: {0}")]
    Failed(String),

    /// Part of the event went out; a retry only needs `remaining`
    #[error("sink delivery partly failed: {reason}")]
    Partial {
        reason: String,
        remaining: Vec<String>,
    },
}

/// Receives tracked events. Batching and wire format are the sink's business.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str {
        "sink"
    }

    async fn deliver(&self, event: &TrackedEvent) -> Result<(), SinkError>;
}

enum SinkMessage {
    Event(Arc<TrackedEvent>),
    Flush(oneshot::Sender<()>),
}

struct SinkHandle {
    name: String,
    tx: mpsc::UnboundedSender<SinkMessage>,
}

#[derive(Default)]
struct SessionLedger {
    fired: HashSet<EventKind>,
    next_sequence: u64,
}

/// Dispatches events to every registered sink.
///
/// Each sink is drained by its own worker task, so deliveries to one sink
/// keep firing order and a slow or failing sink never holds up the others.
/// Must be created inside a Tokio runtime.
pub struct EventTracker {
    sinks: Vec<SinkHandle>,
    ledgers: Mutex<HashMap<SessionId, SessionLedger>>,
}

impl EventTracker {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>, retries: u32) -> Self {
        let sinks = sinks
            .into_iter()
            .map(|sink| {
                let (tx, rx) = mpsc::unbounded_channel();
                let name = sink.name().to_string();
                tokio::spawn(run_sink(sink, rx, retries));
                SinkHandle { name, tx }
            })
            .collect();

        Self {
            sinks,
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    /// Record and dispatch an event.
    ///
    /// Returns `None` when a fire-once kind already fired for the session.
    pub fn fire(
        &self,
        origin: &EventOrigin,
        kind: EventKind,
        urls: Vec<String>,
        metadata: BTreeMap<String, String>,
    ) -> Option<Arc<TrackedEvent>> {
        let event = {
            let mut ledgers = self.ledgers.lock();
            let ledger = ledgers.entry(origin.session).or_default();

            if kind.is_fire_once() && !ledger.fired.insert(kind.clone()) {
                debug!("{} {:?} already fired, dropping duplicate", origin.session, kind);
                return None;
            }

            let sequence = ledger.next_sequence;
            ledger.next_sequence += 1;

            let event = Arc::new(TrackedEvent {
                kind,
                session: origin.session,
                placement: origin.placement.clone(),
                sequence,
                urls,
                metadata,
                test_mode: origin.test_mode,
            });

            // Enqueue while holding the ledger so sequence order is channel order
            for sink in &self.sinks {
                if sink.tx.send(SinkMessage::Event(event.clone())).is_err() {
                    warn!("sink {} is no longer running", sink.name);
                }
            }
            event
        };

        debug!(
            "{} fired {:?} (seq {})",
            event.session, event.kind, event.sequence
        );
        Some(event)
    }

    pub fn has_fired(&self, session: SessionId, kind: &EventKind) -> bool {
        self.ledgers
            .lock()
            .get(&session)
            .is_some_and(|ledger| ledger.fired.contains(kind))
    }

    /// Drop the dedup ledger of a retired session
    pub fn forget(&self, session: SessionId) {
        self.ledgers.lock().remove(&session);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Wait until every sink has handled the events fired before this call
    pub async fn flush(&self) {
        let mut waiting = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let (tx, rx) = oneshot::channel();
            if sink.tx.send(SinkMessage::Flush(tx)).is_ok() {
                waiting.push(rx);
            }
        }
        for rx in waiting {
            let _ = rx.await;
        }
    }
}

async fn run_sink(
    sink: Arc<dyn EventSink>,
    mut rx: mpsc::UnboundedReceiver<SinkMessage>,
    retries: u32,
) {
    while let Some(message) = rx.recv().await {
        match message {
            SinkMessage::Event(event) => deliver_with_retry(sink.as_ref(), &event, retries).await,
            SinkMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("sink {} worker stopped", sink.name());
}

async fn deliver_with_retry(sink: &dyn EventSink, event: &TrackedEvent, retries: u32) {
    let mut narrowed: Option<TrackedEvent> = None;
    for attempt in 0..=retries {
        let current = narrowed.as_ref().unwrap_or(event);
        let delivered = sink.deliver(current).await;
        match delivered {
            Ok(()) => return,
            Err(e) if attempt < retries => {
                warn!(
                    "sink {} failed {:?} for {} (attempt {}): {}",
                    sink.name(),
                    event.kind,
                    event.session,
                    attempt + 1,
                    e
                );
                if let SinkError::Partial { remaining, .. } = e {
                    narrowed = Some(TrackedEvent {
                        urls: remaining,
                        ..event.clone()
                    });
                }
                tokio::time::sleep(SINK_RETRY_STEP * (attempt + 1)).await;
            }
            Err(e) => {
                warn!(
                    "sink {} dropped {:?} for {} after {} attempts: {}",
                    sink.name(),
                    event.kind,
                    event.session,
                    retries + 1,
                    e
                );
            }
        }
    }
}

/// Logs every event at info level
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &TrackedEvent) -> Result<(), SinkError> {
        info!(
            "event {:?} session={} placement={} seq={} urls={}{}",
            event.kind,
            event.session,
            event.placement,
            event.sequence,
            event.urls.len(),
            if event.test_mode { " (test)" } else { "" }
        );
        Ok(())
    }
}

/// Fires each tracking URL of an event with a GET. Test-mode events are not fired.
pub struct PixelSink {
    fetcher: Arc<dyn Fetcher>,
}

impl PixelSink {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl EventSink for PixelSink {
    fn name(&self) -> &str {
        "pixel"
    }

    async fn deliver(&self, event: &TrackedEvent) -> Result<(), SinkError> {
        if event.test_mode {
            return Ok(());
        }

        let mut failures = Vec::new();
        let mut remaining = Vec::new();
        for url in &event.urls {
            if let Err(e) = self.fetcher.fetch(url).await {
                failures.push(format!("{}: {}", url, e));
                remaining.push(url.clone());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Partial {
                reason: failures.join("; "),
                remaining,
            })
        }
    }
}
