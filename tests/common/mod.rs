#![allow(dead_code)]

use ad_session::fetch::{FetchError, Fetcher};
use ad_session::session::{AdListener, ClickGate};
use ad_session::tracker::{EventKind, EventSink, SinkError, TrackedEvent};
use ad_session::{AdEngine, EngineConfig, ErrorKind, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Fetcher with scripted per-URL responses and fetch accounting.
///
/// Each URL answers from its script in order; the last answer repeats.
/// Unknown URLs fail permanently. A gated fetcher blocks every fetch
/// until `release` hands out a permit.
pub struct MockFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Result<Bytes, FetchError>>>>,
    counts: Mutex<HashMap<String, usize>>,
    order: Mutex<Vec<String>>,
    gate: Option<Semaphore>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn respond(&self, url: &str, body: impl Into<Bytes>) {
        self.script(url, vec![Ok(body.into())]);
    }

    pub fn script(&self, url: &str, responses: Vec<Result<Bytes, FetchError>>) {
        self.scripts
            .lock()
            .insert(url.to_string(), responses.into_iter().collect());
    }

    /// Let `n` blocked fetches proceed
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.counts.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.counts.lock().values().sum()
    }

    /// URLs in the order their fetches started
    pub fn order(&self) -> Vec<String> {
        self.order.lock().clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        *self.counts.lock().entry(url.to_string()).or_insert(0) += 1;
        self.order.lock().push(url.to_string());

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| FetchError::Transient(e.to_string()))?;
            permit.forget();
        }

        let mut scripts = self.scripts.lock();
        match scripts.get_mut(url) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap(),
            Some(script) => script
                .front()
                .cloned()
                .unwrap_or_else(|| Err(FetchError::Permanent(format!("{}: empty script", url)))),
            None => Err(FetchError::Permanent(format!("{}: HTTP status 404", url))),
        }
    }
}

/// Sink that keeps every delivered event
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TrackedEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TrackedEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind.clone()).collect()
    }

    pub fn count(&self, kind: &EventKind) -> usize {
        self.events.lock().iter().filter(|e| &e.kind == kind).count()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, event: &TrackedEvent) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Sink that rejects every delivery
#[derive(Default)]
pub struct FailingSink {
    attempts: AtomicUsize,
}

impl FailingSink {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn deliver(&self, _event: &TrackedEvent) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Failed("vendor endpoint down".to_string()))
    }
}

/// Listener recording callbacks as short strings ("ready", "failed:NoFill", ...)
#[derive(Default)]
pub struct RecordingListener {
    calls: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn push(&self, call: String) {
        self.calls.lock().push(call);
    }
}

impl AdListener for RecordingListener {
    fn on_ready(&self, _session: SessionId) {
        self.push("ready".to_string());
    }

    fn on_failed(&self, _session: SessionId, kind: ErrorKind) {
        self.push(format!("failed:{:?}", kind));
    }

    fn on_shown(&self, _session: SessionId) {
        self.push("shown".to_string());
    }

    fn on_clicked(&self, _session: SessionId) {
        self.push("clicked".to_string());
    }

    fn on_completed(&self, _session: SessionId) {
        self.push("completed".to_string());
    }

    fn on_skipped(&self, _session: SessionId) {
        self.push("skipped".to_string());
    }
}

/// Parental gate that refuses every click-through
pub struct DenyGate;

#[async_trait]
impl ClickGate for DenyGate {
    async fn allow(&self, _click_through: &str) -> bool {
        false
    }
}

pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default().with_cache_dir(dir);
    config.backoff_base_ms = 1;
    config.sink_retries = 1;
    config
}

pub fn engine_with(
    config: EngineConfig,
    fetcher: Arc<MockFetcher>,
    sinks: Vec<Arc<dyn EventSink>>,
    gate: Option<Arc<dyn ClickGate>>,
) -> AdEngine {
    let mut builder = AdEngine::builder(config).fetcher(fetcher);
    for sink in sinks {
        builder = builder.sink(sink);
    }
    if let Some(gate) = gate {
        builder = builder.click_gate(gate);
    }
    builder.build().unwrap()
}

/// Inline VAST with a single linear media file and a full set of tracking URLs
pub fn vast_with_media(url: &str, sha256: Option<&str>) -> String {
    let hash = sha256
        .map(|h| format!(r#" sha256="{}""#, h))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<VAST version="4.1">
  <Ad id="ad-1">
    <InLine>
      <AdSystem>Test</AdSystem>
      <AdTitle>Test ad</AdTitle>
      <Impression><![CDATA[https://t.example/imp]]></Impression>
      <Error><![CDATA[https://t.example/err]]></Error>
      <Creatives>
        <Creative id="c-1">
          <Linear>
            <Duration>00:00:30</Duration>
            <TrackingEvents>
              <Tracking event="start"><![CDATA[https://t.example/start]]></Tracking>
              <Tracking event="complete"><![CDATA[https://t.example/complete]]></Tracking>
            </TrackingEvents>
            <VideoClicks>
              <ClickThrough><![CDATA[https://brand.example/landing]]></ClickThrough>
              <ClickTracking><![CDATA[https://t.example/click]]></ClickTracking>
            </VideoClicks>
            <MediaFiles>
              <MediaFile delivery="progressive" type="video/mp4" width="640" height="360"{}><![CDATA[{}]]></MediaFile>
            </MediaFiles>
          </Linear>
        </Creative>
      </Creatives>
    </InLine>
  </Ad>
</VAST>"#,
        hash, url
    )
}

pub fn wrapper_to(uri: &str) -> String {
    format!(
        r#"<VAST version="3.0"><Ad id="w"><Wrapper>
            <AdSystem>Wrapper</AdSystem>
            <VASTAdTagURI><![CDATA[{}]]></VASTAdTagURI>
            <Impression><![CDATA[https://t.example/wrapper-imp]]></Impression>
        </Wrapper></Ad></VAST>"#,
        uri
    )
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
