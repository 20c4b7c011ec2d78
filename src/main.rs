use clap::{Parser, Subcommand};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ad_session::fetch::{Fetcher, HttpFetcher};
use ad_session::session::AdListener;
use ad_session::tracker::{LogSink, PixelSink};
use ad_session::unwrap::prefetch_wrapper_chain;
use ad_session::{
    AdEngine, AdFormat, AdRequest, AdResponsePayload, AssetCache, CreativeKind, EngineConfig,
    ErrorKind, ParseOptions, Quartile, SessionId, parse_payload,
};

/// Ad-session engine: parse creatives and drive ad sessions
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse an ad response into a normalized creative
    Parse {
        /// Path or URL of the ad response
        #[arg(short, long)]
        input: String,

        /// Declared content type (vast, mraid, static or a MIME type)
        #[arg(short, long, default_value = "vast")]
        content_type: String,

        /// Engine config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Pretty print the output
        #[arg(short, long)]
        pretty: bool,
    },

    /// Drive one ad session from response to completion
    Run {
        /// Path or URL of the ad response
        #[arg(short, long)]
        input: String,

        /// Declared content type (vast, mraid, static or a MIME type)
        #[arg(short, long, default_value = "vast")]
        content_type: String,

        /// Placement identifier
        #[arg(long, default_value = "default")]
        placement: String,

        /// Ad format: banner, interstitial, video or rewarded
        #[arg(short, long, default_value = "interstitial")]
        format: AdFormat,

        /// Engine config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Mark the request as test traffic
        #[arg(long)]
        test_mode: bool,
    },

    /// List the persisted asset cache
    Cache {
        /// Engine config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Logs every lifecycle callback
struct LoggingListener;

impl AdListener for LoggingListener {
    fn on_ready(&self, session: SessionId) {
        info!("{} ready", session);
    }

    fn on_failed(&self, session: SessionId, kind: ErrorKind) {
        error!("{} failed: {:?}", session, kind);
    }

    fn on_shown(&self, session: SessionId) {
        info!("{} shown", session);
    }

    fn on_clicked(&self, session: SessionId) {
        info!("{} clicked", session);
    }

    fn on_completed(&self, session: SessionId) {
        info!("{} completed", session);
    }

    fn on_skipped(&self, session: SessionId) {
        info!("{} skipped", session);
    }
}

fn load_config(path: Option<&Path>) -> ad_session::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Parse {
            input,
            content_type,
            config,
            pretty,
        } => {
            let config = load_config(config.as_deref())?;
            let fetcher = HttpFetcher::new(config.fetch_timeout())?;
            let body = fetcher.fetch(&input).await?;
            let payload = AdResponsePayload::from_content_type(&content_type, body.to_vec());

            let wrappers = match std::str::from_utf8(&payload.body) {
                Ok(xml) => prefetch_wrapper_chain(xml, &fetcher, config.max_wrapper_depth).await,
                Err(_) => Default::default(),
            };
            let creative = parse_payload(&payload, &wrappers, &ParseOptions::from(&config))?;

            if pretty {
                println!("{}", serde_json::to_string_pretty(&creative)?);
            } else {
                println!("{}", serde_json::to_string(&creative)?);
            }
        }
        Commands::Run {
            input,
            content_type,
            placement,
            format,
            config,
            test_mode,
        } => {
            let config = load_config(config.as_deref())?;
            let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.fetch_timeout())?);
            let body = fetcher.fetch(&input).await?;

            let engine = AdEngine::builder(config)
                .fetcher(fetcher.clone())
                .sink(Arc::new(LogSink))
                .sink(Arc::new(PixelSink::new(fetcher)))
                .build()?;

            let request = AdRequest::new(placement, format).with_test_mode(test_mode);
            let session = engine.submit(request, Arc::new(LoggingListener))?;

            let payload = AdResponsePayload::from_content_type(&content_type, body.to_vec());
            let outcome = session.on_response(payload).await;

            if outcome.is_ok() {
                session.show()?;
                session.on_viewable_threshold()?;
                let is_video = session
                    .creative()
                    .is_some_and(|creative| creative.kind == CreativeKind::Video);
                if is_video {
                    for quartile in [Quartile::First, Quartile::Midpoint, Quartile::Third] {
                        session.progress(quartile)?;
                    }
                }
                session.complete()?;
            }

            println!("{} finished in state {}", session.id(), session.state().name());
            engine.shutdown().await;
            outcome?;
        }
        Commands::Cache { config } => {
            let config = load_config(config.as_deref())?;
            let cache = AssetCache::open(config.cache_dir.clone(), config.cache_budget_bytes)?;

            println!(
                "{}: {} entries, {} of {} bytes",
                cache.dir().display(),
                cache.len(),
                cache.total_bytes(),
                cache.budget()
            );
            for entry in cache.entries() {
                println!(
                    "{}  {:>10}  {}  {}",
                    entry.sha256,
                    entry.size,
                    entry.path.display(),
                    entry.key.url
                );
            }
        }
    }

    Ok(())
}
