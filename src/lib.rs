//! Ad-session engine: parses ad responses (VAST, MRAID, static), caches their
//! assets through a bounded download queue, drives each ad through its
//! lifecycle and reports ordered, deduplicated tracking events.

pub mod ad;
pub mod cache;
pub mod config;
pub mod creative;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod models;
pub mod mraid;
pub mod parser;
pub mod queue;
pub mod registry;
pub mod session;
pub mod tracker;
pub mod unwrap;

pub use ad::{AdFormat, AdRequest, AdResponsePayload, PayloadKind, SessionId};
pub use cache::{AssetCache, CacheKey, CachedAsset};
pub use config::EngineConfig;
pub use creative::{AssetRef, Creative, CreativeKind, ParseOptions, parse_payload};
pub use engine::{AdEngine, AdEngineBuilder};
pub use error::{AdError, ErrorKind, Result};
pub use fetch::{FetchError, Fetcher, HttpFetcher};
pub use queue::{AssetCompletion, DownloadQueue, QueueSettings};
pub use registry::AdSessionRegistry;
pub use session::{AdListener, AdSession, ClickGate, ClickOutcome, Quartile, SessionState};
pub use tracker::{EventKind, EventSink, EventTracker, LogSink, PixelSink, TrackedEvent};
