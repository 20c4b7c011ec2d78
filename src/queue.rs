//! Bounded-concurrency asset downloader sitting in front of the [`AssetCache`].

use crate::ad::SessionId;
use crate::cache::{AssetCache, CacheKey, CachedAsset};
use crate::config::EngineConfig;
use crate::creative::AssetRef;
use crate::error::{AdError, Result};
use crate::fetch::{FetchError, Fetcher};
use log::{debug, warn};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound on the pause between download attempts
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Final outcome of one asset for one session
#[derive(Debug)]
pub struct AssetCompletion {
    /// Position of the asset in the creative's asset list
    pub index: usize,
    pub result: Result<CachedAsset>,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl From<&EngineConfig> for QueueSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_downloads.max(1),
            max_attempts: config.max_download_attempts.max(1),
            backoff_base: config.backoff_base(),
        }
    }
}

struct Subscriber {
    session: SessionId,
    index: usize,
    tx: mpsc::UnboundedSender<AssetCompletion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Queued,
    InFlight,
}

/// One asset being fetched on behalf of every session that asked for it
struct DownloadTask {
    asset: AssetRef,
    priority: u8,
    seq: u64,
    status: TaskStatus,
    subscribers: Vec<Subscriber>,
    token: CancellationToken,
}

/// Heap entry. Entries whose task moved on are skipped when popped.
#[derive(Debug, PartialEq, Eq)]
struct PendingTask {
    priority: u8,
    seq: u64,
    key: CacheKey,
}

impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier submission
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<CacheKey, DownloadTask>,
    pending: BinaryHeap<PendingTask>,
    in_flight: usize,
    next_seq: u64,
    shutdown: bool,
}

/// Internal result of a fetch chain, shared by all subscribers
#[derive(Debug, Clone)]
enum Outcome {
    Ready(CachedAsset),
    Unavailable(String),
    Integrity(String),
    Cancelled,
}

impl Outcome {
    fn into_result(self, url: &str) -> Result<CachedAsset> {
        match self {
            Outcome::Ready(asset) => Ok(asset),
            Outcome::Unavailable(reason) => Err(AdError::AssetUnavailable {
                url: url.to_string(),
                reason,
            }),
            Outcome::Integrity(detail) => Err(AdError::AssetIntegrityMismatch {
                url: url.to_string(),
                detail,
            }),
            Outcome::Cancelled => Err(AdError::CancelledByCaller),
        }
    }
}

struct QueueInner {
    cache: Arc<AssetCache>,
    fetcher: Arc<dyn Fetcher>,
    settings: QueueSettings,
    state: Mutex<QueueState>,
}

/// Downloads creative assets into the cache.
///
/// At most `max_concurrent` fetches run at once; the rest wait ordered by
/// priority, then submission order. The same asset requested by several
/// sessions is fetched once and reported to each of them.
#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<QueueInner>,
}

impl DownloadQueue {
    pub fn new(cache: Arc<AssetCache>, fetcher: Arc<dyn Fetcher>, settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                cache,
                fetcher,
                settings,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.inner.cache
    }

    /// Request `asset` for `session`. The outcome arrives on `tx` tagged with `index`.
    ///
    /// A validated cache entry completes immediately without network I/O.
    pub fn enqueue(
        &self,
        session: SessionId,
        index: usize,
        asset: AssetRef,
        priority: u8,
        tx: mpsc::UnboundedSender<AssetCompletion>,
    ) {
        let key = CacheKey::from(&asset);

        if let Some(cached) = self.inner.cache.get(&key) {
            debug!("{} asset {} served from cache", session, asset.url);
            let _ = tx.send(AssetCompletion {
                index,
                result: Ok(cached),
            });
            return;
        }

        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            if state.shutdown {
                let _ = tx.send(AssetCompletion {
                    index,
                    result: Err(AdError::CancelledByCaller),
                });
                return;
            }

            let subscriber = Subscriber { session, index, tx };

            if let Some(task) = state.tasks.get_mut(&key) {
                debug!("{} joins pending download of {}", session, asset.url);
                task.subscribers.push(subscriber);
                if task.status == TaskStatus::Queued && priority > task.priority {
                    task.priority = priority;
                    state.pending.push(PendingTask {
                        priority,
                        seq: task.seq,
                        key,
                    });
                }
                return;
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.tasks.insert(
                key.clone(),
                DownloadTask {
                    asset,
                    priority,
                    seq,
                    status: TaskStatus::Queued,
                    subscribers: vec![subscriber],
                    token: CancellationToken::new(),
                },
            );
            state.pending.push(PendingTask { priority, seq, key });
        }

        Self::pump(&self.inner);
    }

    /// Start queued tasks while there is room under the concurrency bound
    fn pump(inner: &Arc<QueueInner>) {
        let mut started = Vec::new();
        {
            let mut guard = inner.state.lock();
            let state = &mut *guard;

            while !state.shutdown && state.in_flight < inner.settings.max_concurrent {
                let Some(next) = state.pending.pop() else {
                    break;
                };
                let Some(task) = state.tasks.get_mut(&next.key) else {
                    continue;
                };
                if task.seq != next.seq
                    || task.priority != next.priority
                    || task.status != TaskStatus::Queued
                {
                    continue;
                }

                task.status = TaskStatus::InFlight;
                state.in_flight += 1;
                started.push((next.key, task.seq, task.asset.clone(), task.token.clone()));
            }
        }

        for (key, seq, asset, token) in started {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let outcome = fetch_with_retry(&inner, &asset, &token).await;
                Self::finish(&inner, &key, seq, outcome);
                Self::pump(&inner);
            });
        }
    }

    fn finish(inner: &QueueInner, key: &CacheKey, seq: u64, outcome: Outcome) {
        let task = {
            let mut state = inner.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            match state.tasks.get(key) {
                Some(task) if task.seq == seq => state.tasks.remove(key),
                _ => None,
            }
        };

        let Some(task) = task else {
            debug!("Dropping result of abandoned download {}", key.url);
            return;
        };

        for subscriber in task.subscribers {
            let _ = subscriber.tx.send(AssetCompletion {
                index: subscriber.index,
                result: outcome.clone().into_result(&task.asset.url),
            });
        }
    }

    /// Withdraw every request made by `session`.
    ///
    /// Tasks nobody else waits for are dropped; in-flight ones are abandoned
    /// and their results discarded.
    pub fn cancel(&self, session: SessionId) {
        let mut state = self.inner.state.lock();
        state.tasks.retain(|key, task| {
            let before = task.subscribers.len();
            task.subscribers.retain(|s| s.session != session);
            if task.subscribers.len() == before || !task.subscribers.is_empty() {
                return true;
            }
            debug!("{} cancelled download of {}", session, key.url);
            task.token.cancel();
            false
        });
    }

    /// Tasks waiting for a fetch slot
    pub fn pending_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Queued)
            .count()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    /// Stop admitting work, abandon in-flight fetches and fail every waiter
    /// with `CancelledByCaller`.
    pub fn shutdown(&self) {
        let drained: Vec<DownloadTask> = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.pending.clear();
            state.tasks.drain().map(|(_, task)| task).collect()
        };

        for task in drained {
            task.token.cancel();
            for subscriber in task.subscribers {
                let _ = subscriber.tx.send(AssetCompletion {
                    index: subscriber.index,
                    result: Err(AdError::CancelledByCaller),
                });
            }
        }
        debug!("Download queue shut down");
    }
}

/// Delay before retrying after failed attempt `attempt` (1-based), capped at [`MAX_BACKOFF`]
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
}

async fn fetch_with_retry(inner: &QueueInner, asset: &AssetRef, token: &CancellationToken) -> Outcome {
    let key = CacheKey::from(asset);
    let max_attempts = inner.settings.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if token.is_cancelled() {
            return Outcome::Cancelled;
        }

        // Another writer may have landed it while this task waited
        if let Some(cached) = inner.cache.get(&key) {
            return Outcome::Ready(cached);
        }

        let fetched = tokio::select! {
            result = inner.fetcher.fetch(&asset.url) => result,
            _ = token.cancelled() => {
                debug!("Download of {} cancelled mid-flight", asset.url);
                return Outcome::Cancelled;
            }
        };

        match fetched {
            Ok(body) => {
                if token.is_cancelled() {
                    return Outcome::Cancelled;
                }
                return match inner.cache.put(asset, &body) {
                    Ok(cached) => Outcome::Ready(cached),
                    Err(AdError::AssetIntegrityMismatch { detail, .. }) => {
                        warn!("Integrity check failed for {}: {}", asset.url, detail);
                        Outcome::Integrity(detail)
                    }
                    Err(e) => {
                        warn!("Failed to cache {}: {}", asset.url, e);
                        Outcome::Unavailable(e.to_string())
                    }
                };
            }
            Err(FetchError::Permanent(reason)) => {
                warn!("Download of {} rejected: {}", asset.url, reason);
                return Outcome::Unavailable(reason);
            }
            Err(FetchError::Transient(reason)) if attempt < max_attempts => {
                let delay = backoff_delay(inner.settings.backoff_base, attempt);
                warn!(
                    "Download of {} failed (attempt {}/{}), retrying in {:?}: {}",
                    asset.url, attempt, max_attempts, delay, reason
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return Outcome::Cancelled,
                }
            }
            Err(FetchError::Transient(reason)) => {
                warn!(
                    "Download of {} failed after {} attempts: {}",
                    asset.url, max_attempts, reason
                );
                return Outcome::Unavailable(format!(
                    "{} (after {} attempts)",
                    reason, max_attempts
                ));
            }
        }
    }

    Outcome::Unavailable("no download attempts made".to_string())
}
