//! The engine context: owns every shared component and hands out sessions.

use crate::ad::{AdRequest, SessionId};
use crate::cache::AssetCache;
use crate::config::EngineConfig;
use crate::creative::ParseOptions;
use crate::error::Result;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::queue::{DownloadQueue, QueueSettings};
use crate::registry::AdSessionRegistry;
use crate::session::{AdListener, AdSession, AllowAll, ClickGate};
use crate::tracker::{EventSink, EventTracker};
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Components every session of one engine shares
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) parse_options: ParseOptions,
    pub(crate) cache: Arc<AssetCache>,
    pub(crate) queue: DownloadQueue,
    pub(crate) tracker: Arc<EventTracker>,
    pub(crate) registry: Arc<AdSessionRegistry>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) gate: Arc<dyn ClickGate>,
}

pub struct AdEngineBuilder {
    config: EngineConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    sinks: Vec<Arc<dyn EventSink>>,
    gate: Arc<dyn ClickGate>,
}

impl AdEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            fetcher: None,
            sinks: Vec::new(),
            gate: Arc::new(AllowAll),
        }
    }

    /// Source of wrapper documents and assets. Defaults to [`HttpFetcher`].
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn click_gate(mut self, gate: Arc<dyn ClickGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Open the asset cache and start the sink workers. Needs a Tokio runtime.
    pub fn build(self) -> Result<AdEngine> {
        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(self.config.fetch_timeout())?),
        };

        let cache = Arc::new(AssetCache::open(
            self.config.cache_dir.clone(),
            self.config.cache_budget_bytes,
        )?);
        let queue = DownloadQueue::new(
            cache.clone(),
            fetcher.clone(),
            QueueSettings::from(&self.config),
        );
        let tracker = Arc::new(EventTracker::new(self.sinks, self.config.sink_retries));

        info!(
            "Ad engine started: cache {} ({} entries), {} sinks",
            cache.dir().display(),
            cache.len(),
            tracker.sink_count()
        );

        Ok(AdEngine {
            shared: Arc::new(EngineShared {
                parse_options: ParseOptions::from(&self.config),
                config: self.config,
                cache,
                queue,
                tracker,
                registry: Arc::new(AdSessionRegistry::new()),
                fetcher,
                gate: self.gate,
            }),
            next_id: AtomicU64::new(1),
        })
    }
}

/// Entry point for embedders. Construct one per application and shut it down on exit.
pub struct AdEngine {
    shared: Arc<EngineShared>,
    next_id: AtomicU64,
}

impl AdEngine {
    pub fn builder(config: EngineConfig) -> AdEngineBuilder {
        AdEngineBuilder::new(config)
    }

    /// Create a session for `request` and claim its placement.
    ///
    /// Fails with `DuplicatePlacement` while another live session holds it.
    pub fn submit(
        &self,
        request: AdRequest,
        listener: Arc<dyn AdListener>,
    ) -> Result<Arc<AdSession>> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(AdSession::new(
            id,
            request,
            self.shared.clone(),
            listener,
        ));
        self.shared.registry.register(&session)?;
        info!(
            "{} submitted for {} ({})",
            id,
            session.placement(),
            session.request().format
        );
        Ok(session)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &AdSessionRegistry {
        &self.shared.registry
    }

    pub fn cache(&self) -> &AssetCache {
        &self.shared.cache
    }

    pub fn queue(&self) -> &DownloadQueue {
        &self.shared.queue
    }

    pub fn tracker(&self) -> &EventTracker {
        &self.shared.tracker
    }

    /// Cancel live sessions, stop the download queue and drain the sinks
    pub async fn shutdown(&self) {
        let sessions = self.shared.registry.live_sessions();
        let cancelled = sessions.iter().filter(|session| session.cancel()).count();
        drop(sessions);

        self.shared.queue.shutdown();
        self.shared.tracker.flush().await;
        info!("Ad engine shut down ({} sessions cancelled)", cancelled);
    }
}
