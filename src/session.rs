//! Per-request ad lifecycle.
//!
//! ```text
//! Requested -> Parsing -> Loading -> Ready -> Showing -> Completed | Skipped
//!                  \          \                  \
//!                   `----------`------------------`--> Failed
//! ```
//!
//! `Cancelled` is reachable from every non-terminal state. Transitions are
//! serialized by the session lock; embedder callbacks run after it is released.

use crate::ad::{AdRequest, AdResponsePayload, PayloadKind, SessionId};
use crate::cache::{CacheKey, CachedAsset};
use crate::creative::{self, Creative, CreativeKind};
use crate::engine::EngineShared;
use crate::error::{AdError, ErrorKind, Result};
use crate::tracker::{EventKind, EventOrigin};
use crate::unwrap::{self, ResolvedWrappers};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requested,
    Parsing,
    Loading { outstanding: usize },
    Ready,
    Showing,
    Completed,
    Failed(ErrorKind),
    Skipped,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed(_)
                | SessionState::Skipped
                | SessionState::Cancelled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Requested => "Requested",
            SessionState::Parsing => "Parsing",
            SessionState::Loading { .. } => "Loading",
            SessionState::Ready => "Ready",
            SessionState::Showing => "Showing",
            SessionState::Completed => "Completed",
            SessionState::Failed(_) => "Failed",
            SessionState::Skipped => "Skipped",
            SessionState::Cancelled => "Cancelled",
        }
    }
}

/// Lifecycle callbacks to the embedder. Each fires at most once per session.
pub trait AdListener: Send + Sync {
    fn on_ready(&self, _session: SessionId) {}
    fn on_failed(&self, _session: SessionId, _kind: ErrorKind) {}
    fn on_shown(&self, _session: SessionId) {}
    fn on_clicked(&self, _session: SessionId) {}
    fn on_completed(&self, _session: SessionId) {}
    fn on_skipped(&self, _session: SessionId) {}
}

/// Listener that ignores every callback
pub struct NoopListener;

impl AdListener for NoopListener {}

/// Compliance check consulted before a click-through is honoured
#[async_trait]
pub trait ClickGate: Send + Sync {
    async fn allow(&self, click_through: &str) -> bool;
}

pub struct AllowAll;

#[async_trait]
impl ClickGate for AllowAll {
    async fn allow(&self, _click_through: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// Click recorded; the embedder may navigate to `click_through`
    Accepted { click_through: Option<String> },
    /// The gate refused; nothing was recorded
    Blocked,
}

/// Video playback milestones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quartile {
    First,
    Midpoint,
    Third,
}

impl Quartile {
    fn event_kind(self) -> EventKind {
        match self {
            Quartile::First => EventKind::FirstQuartile,
            Quartile::Midpoint => EventKind::Midpoint,
            Quartile::Third => EventKind::ThirdQuartile,
        }
    }
}

struct SessionInner {
    state: SessionState,
    creative: Option<Arc<Creative>>,
    cached: Vec<Option<CachedAsset>>,
    pinned: Vec<CacheKey>,
    retired: bool,
}

pub struct AdSession {
    id: SessionId,
    request: AdRequest,
    origin: EventOrigin,
    shared: Arc<EngineShared>,
    listener: Arc<dyn AdListener>,
    inner: Mutex<SessionInner>,

    /// Mirrors `state.is_terminal()` so the registry never takes the session lock
    terminal: AtomicBool,

    cancel: CancellationToken,
}

impl std::fmt::Debug for AdSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdSession")
            .field("id", &self.id)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl AdSession {
    pub(crate) fn new(
        id: SessionId,
        request: AdRequest,
        shared: Arc<EngineShared>,
        listener: Arc<dyn AdListener>,
    ) -> Self {
        let origin = EventOrigin {
            session: id,
            placement: request.placement.clone(),
            test_mode: request.test_mode,
        };

        Self {
            id,
            request,
            origin,
            shared,
            listener,
            inner: Mutex::new(SessionInner {
                state: SessionState::Requested,
                creative: None,
                cached: Vec::new(),
                pinned: Vec::new(),
                retired: false,
            }),
            terminal: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn request(&self) -> &AdRequest {
        &self.request
    }

    pub fn placement(&self) -> &str {
        &self.request.placement
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    pub fn creative(&self) -> Option<Arc<Creative>> {
        self.inner.lock().creative.clone()
    }

    /// Cached files backing the creative's assets, in asset order
    pub fn cached_assets(&self) -> Vec<CachedAsset> {
        self.inner.lock().cached.iter().flatten().cloned().collect()
    }

    /// Feed the ad-decision response, then load every asset it needs.
    ///
    /// Resolves once the session is Ready or has failed. The error is also
    /// reported to the listener, except for `CancelledByCaller`.
    pub async fn on_response(&self, payload: AdResponsePayload) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            self.check(&inner, "on_response", |s| *s == SessionState::Requested)?;
            self.transition(&mut inner, SessionState::Parsing);
        }

        let wrappers = if payload.kind == PayloadKind::VastXml {
            match std::str::from_utf8(&payload.body) {
                Ok(xml) => tokio::select! {
                    wrappers = unwrap::prefetch_wrapper_chain(
                        xml,
                        self.shared.fetcher.as_ref(),
                        self.shared.parse_options.max_wrapper_depth,
                    ) => wrappers,
                    _ = self.cancel.cancelled() => return Err(AdError::CancelledByCaller),
                },
                Err(_) => ResolvedWrappers::new(),
            }
        } else {
            ResolvedWrappers::new()
        };

        let creative = match creative::parse_payload(&payload, &wrappers, &self.shared.parse_options) {
            Ok(creative) => Arc::new(creative),
            Err(e) => return Err(self.fail(e)),
        };

        debug!(
            "{} parsed {:?} creative with {} assets",
            self.id,
            creative.kind,
            creative.assets.len()
        );

        let assets = creative.assets.clone();
        {
            let mut inner = self.inner.lock();
            self.check(&inner, "on_response", |s| *s == SessionState::Parsing)?;
            inner.creative = Some(creative);
            inner.cached = vec![None; assets.len()];

            if assets.is_empty() {
                self.transition(&mut inner, SessionState::Ready);
            } else {
                let keys: Vec<CacheKey> = assets.iter().map(CacheKey::from).collect();
                for key in &keys {
                    self.shared.cache.pin(key);
                }
                inner.pinned = keys;
                self.transition(
                    &mut inner,
                    SessionState::Loading {
                        outstanding: assets.len(),
                    },
                );
            }
        }

        if assets.is_empty() {
            info!("{} ready on {}", self.id, self.request.placement);
            self.listener.on_ready(self.id);
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let priority = self.shared.config.priority_for(self.request.format);
        for (index, asset) in assets.into_iter().enumerate() {
            self.shared
                .queue
                .enqueue(self.id, index, asset, priority, tx.clone());
        }
        drop(tx);

        loop {
            let completion = tokio::select! {
                completion = rx.recv() => completion,
                _ = self.cancel.cancelled() => return Err(AdError::CancelledByCaller),
            };

            let Some(completion) = completion else {
                return Err(self.fail(AdError::AssetUnavailable {
                    url: String::new(),
                    reason: "download queue dropped the request".to_string(),
                }));
            };

            let cached = match completion.result {
                Ok(cached) => cached,
                Err(AdError::CancelledByCaller) => {
                    self.cancel();
                    return Err(AdError::CancelledByCaller);
                }
                Err(e) => return Err(self.fail(e)),
            };

            let ready = {
                let mut inner = self.inner.lock();
                let SessionState::Loading { outstanding } = inner.state else {
                    return Err(self.not_ready(&inner, "asset completion"));
                };

                let outstanding = match inner.cached.get_mut(completion.index) {
                    Some(slot) if slot.is_none() => {
                        *slot = Some(cached);
                        outstanding.saturating_sub(1)
                    }
                    _ => outstanding,
                };

                if outstanding == 0 {
                    self.transition(&mut inner, SessionState::Ready);
                    true
                } else {
                    inner.state = SessionState::Loading { outstanding };
                    false
                }
            };

            if ready {
                info!("{} ready on {}", self.id, self.request.placement);
                self.listener.on_ready(self.id);
                return Ok(());
            }
        }
    }

    /// Start showing a Ready ad: fires `impression` (and `start` for video)
    pub fn show(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            self.check(&inner, "show", |s| *s == SessionState::Ready)?;
            self.transition(&mut inner, SessionState::Showing);

            if let Some(creative) = inner.creative.clone() {
                self.fire(&creative, EventKind::Impression);
                if creative.kind == CreativeKind::Video {
                    self.fire(&creative, EventKind::Start);
                }
            }
        }

        self.listener.on_shown(self.id);
        Ok(())
    }

    /// The injected visibility signal reports the ad crossed the viewability threshold
    pub fn on_viewable_threshold(&self) -> Result<()> {
        let inner = self.inner.lock();
        self.check(&inner, "on_viewable_threshold", |s| *s == SessionState::Showing)?;
        if let Some(creative) = &inner.creative {
            self.fire(creative, EventKind::ViewableImpression);
        }
        Ok(())
    }

    /// Report a playback quartile of a showing video
    pub fn progress(&self, quartile: Quartile) -> Result<()> {
        let inner = self.inner.lock();
        self.check(&inner, "progress", |s| *s == SessionState::Showing)?;
        if let Some(creative) = &inner.creative {
            self.fire(creative, quartile.event_kind());
        }
        Ok(())
    }

    /// Record a click once the click gate allows the click-through.
    ///
    /// A blocked click fires nothing and leaves the session Showing.
    pub async fn register_click(&self) -> Result<ClickOutcome> {
        let click_through = {
            let inner = self.inner.lock();
            self.check(&inner, "register_click", |s| *s == SessionState::Showing)?;
            inner
                .creative
                .as_ref()
                .and_then(|creative| creative.click_through.clone())
        };

        if let Some(url) = &click_through {
            let allowed = tokio::select! {
                allowed = self.shared.gate.allow(url) => allowed,
                _ = self.cancel.cancelled() => return Err(AdError::CancelledByCaller),
            };
            if !allowed {
                info!("{} click to {} blocked by gate", self.id, url);
                return Ok(ClickOutcome::Blocked);
            }
        }

        let first_click = {
            let inner = self.inner.lock();
            self.check(&inner, "register_click", |s| *s == SessionState::Showing)?;
            match &inner.creative {
                Some(creative) => self.fire(creative, EventKind::Click),
                None => false,
            }
        };

        if first_click {
            self.listener.on_clicked(self.id);
        }
        Ok(ClickOutcome::Accepted { click_through })
    }

    pub fn complete(&self) -> Result<()> {
        self.finish("complete", EventKind::Complete, SessionState::Completed)?;
        self.listener.on_completed(self.id);
        self.retire();
        Ok(())
    }

    pub fn skip(&self) -> Result<()> {
        self.finish("skip", EventKind::Skip, SessionState::Skipped)?;
        self.listener.on_skipped(self.id);
        self.retire();
        Ok(())
    }

    /// Cancel from any non-terminal state. Returns false if already terminal.
    pub fn cancel(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            self.transition(&mut inner, SessionState::Cancelled);
        }

        info!("{} cancelled on {}", self.id, self.request.placement);
        self.retire();
        true
    }

    fn finish(&self, operation: &'static str, event: EventKind, next: SessionState) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check(&inner, operation, |s| *s == SessionState::Showing)?;
        if let Some(creative) = inner.creative.clone() {
            self.fire(&creative, event);
        }
        self.transition(&mut inner, next);
        Ok(())
    }

    /// Move to Failed and notify the listener, unless already terminal
    fn fail(&self, error: AdError) -> AdError {
        let kind = error.kind();
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return match inner.state {
                    SessionState::Cancelled => AdError::CancelledByCaller,
                    _ => error,
                };
            }
            self.transition(&mut inner, SessionState::Failed(kind));

            let urls = inner
                .creative
                .as_ref()
                .map(|creative| creative.tracking_urls(EventKind::Error.tracking_key()).to_vec())
                .unwrap_or_default();
            let mut metadata = BTreeMap::new();
            metadata.insert("error_kind".to_string(), format!("{:?}", kind));
            metadata.insert("detail".to_string(), error.to_string());
            self.shared
                .tracker
                .fire(&self.origin, EventKind::Error, urls, metadata);
        }

        warn!("{} on {} failed: {}", self.id, self.request.placement, error);
        self.listener.on_failed(self.id, kind);
        self.retire();
        error
    }

    /// Returns whether the event was dispatched (false for a repeated fire-once kind)
    fn fire(&self, creative: &Creative, kind: EventKind) -> bool {
        let urls = creative.tracking_urls(kind.tracking_key()).to_vec();
        self.shared
            .tracker
            .fire(&self.origin, kind, urls, BTreeMap::new())
            .is_some()
    }

    fn transition(&self, inner: &mut SessionInner, next: SessionState) {
        debug!("{} {} -> {}", self.id, inner.state.name(), next.name());
        inner.state = next;
        if next.is_terminal() {
            self.terminal.store(true, Ordering::SeqCst);
        }
    }

    fn check(
        &self,
        inner: &SessionInner,
        operation: &'static str,
        allowed: impl Fn(&SessionState) -> bool,
    ) -> Result<()> {
        if allowed(&inner.state) {
            Ok(())
        } else {
            Err(self.not_ready(inner, operation))
        }
    }

    fn not_ready(&self, inner: &SessionInner, operation: &'static str) -> AdError {
        match inner.state {
            SessionState::Cancelled => AdError::CancelledByCaller,
            state => AdError::SessionNotReady {
                operation,
                state: state.name(),
            },
        }
    }

    /// Release everything a terminal session holds. Runs once.
    fn retire(&self) {
        let pinned = {
            let mut inner = self.inner.lock();
            if inner.retired {
                return;
            }
            inner.retired = true;
            std::mem::take(&mut inner.pinned)
        };

        self.cancel.cancel();
        self.release(pinned);
        self.shared
            .registry
            .unregister(&self.request.placement, self.id);
        debug!("{} retired", self.id);
    }

    fn release(&self, pinned: Vec<CacheKey>) {
        self.shared.queue.cancel(self.id);
        for key in &pinned {
            self.shared.cache.unpin(key);
        }
        self.shared.tracker.forget(self.id);
    }
}

// The registry only holds weak references, so a dropped session frees its
// placement on its own; this releases the pins and queued downloads.
impl Drop for AdSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.retired {
            inner.retired = true;
            let pinned = std::mem::take(&mut inner.pinned);
            self.cancel.cancel();
            self.release(pinned);
        }
    }
}
