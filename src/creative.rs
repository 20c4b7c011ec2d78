//! Normalized creatives and the parser that produces them from ad responses.

use crate::ad::{AdResponsePayload, PayloadKind};
use crate::config::{EngineConfig, MediaPreference};
use crate::error::{AdError, Result};
use crate::models::{Companion, InLine, MediaFile, ResourceType, TrackingEvent, Wrapper};
use crate::mraid;
use crate::parser;
use crate::tracker::EventKind;
use crate::unwrap::WrapperSource;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// What the creative renders as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreativeKind {
    Video,
    Display,
    Companion,
}

/// A file a creative needs on disk before it can be shown
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetRef {
    pub url: String,

    /// Expected SHA-256 of the content, lower-case hex
    pub sha256: Option<String>,

    /// Expected size in bytes
    pub size: Option<u64>,

    pub mime_type: Option<String>,
}

impl AssetRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sha256: None,
            size: None,
            mime_type: None,
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into().to_ascii_lowercase());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

impl From<&MediaFile> for AssetRef {
    fn from(media: &MediaFile) -> Self {
        Self {
            url: media.url.clone(),
            sha256: media.sha256.clone(),
            size: media.file_size,
            mime_type: non_empty(&media.mime_type),
        }
    }
}

/// Normalized result of parsing an ad response. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creative {
    pub kind: CreativeKind,
    pub ad_id: Option<String>,

    /// Every asset that must be cached before the ad is ready
    pub assets: Vec<AssetRef>,

    pub click_through: Option<String>,

    /// Tracking URLs keyed by event name (`impression`, `start`, `clickTracking`, ...)
    pub tracking: BTreeMap<String, Vec<String>>,

    pub duration: Option<Duration>,
    pub skip_offset: Option<Duration>,

    /// Markup handed to the web view for MRAID and HTML creatives
    pub markup: Option<String>,
}

impl Creative {
    fn new(kind: CreativeKind) -> Self {
        Self {
            kind,
            ad_id: None,
            assets: Vec::new(),
            click_through: None,
            tracking: BTreeMap::new(),
            duration: None,
            skip_offset: None,
            markup: None,
        }
    }

    pub fn tracking_urls(&self, event: &str) -> &[String] {
        self.tracking.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn add_tracking<I>(&mut self, event: &str, urls: I)
    where
        I: IntoIterator<Item = String>,
    {
        let entry = self.tracking.entry(event.to_string()).or_default();
        for url in urls {
            if !url.is_empty() && !entry.contains(&url) {
                entry.push(url);
            }
        }
        if entry.is_empty() {
            self.tracking.remove(event);
        }
    }
}

/// Parser settings taken from the engine config
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub max_wrapper_depth: usize,
    pub media: MediaPreference,
}

impl From<&EngineConfig> for ParseOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_wrapper_depth: config.max_wrapper_depth,
            media: config.media.clone(),
        }
    }
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Parse an ad response into a Creative. Pure: wrapper targets come from `wrappers`.
pub fn parse_payload(
    payload: &AdResponsePayload,
    wrappers: &dyn WrapperSource,
    options: &ParseOptions,
) -> Result<Creative> {
    match &payload.kind {
        PayloadKind::VastXml => parse_vast_payload(body_text(payload)?, wrappers, options),
        PayloadKind::MraidHtml => mraid::parse_mraid(body_text(payload)?),
        PayloadKind::Static => parse_static_payload(&payload.body),
        PayloadKind::Other(kind) => Err(AdError::UnsupportedCreativeType(kind.clone())),
    }
}

fn body_text(payload: &AdResponsePayload) -> Result<&str> {
    std::str::from_utf8(&payload.body)
        .map_err(|e| AdError::MalformedCreative(format!("payload is not UTF-8: {}", e)))
}

/// Tracking declared by the wrappers in a chain, merged into the final creative
#[derive(Default)]
struct WrapperTracking {
    impressions: Vec<String>,
    viewable_impressions: Vec<String>,
    errors: Vec<String>,
    tracking_events: Vec<TrackingEvent>,
    click_tracking: Vec<String>,
}

impl WrapperTracking {
    fn absorb(&mut self, wrapper: &Wrapper) {
        self.impressions.extend(wrapper.impressions.iter().cloned());
        self.viewable_impressions
            .extend(wrapper.viewable_impressions.iter().cloned());
        self.errors.extend(wrapper.errors.iter().cloned());

        for creative in &wrapper.creatives {
            if let Some(linear) = &creative.linear {
                self.tracking_events
                    .extend(linear.tracking_events.iter().cloned());
                if let Some(clicks) = &linear.video_clicks {
                    self.click_tracking
                        .extend(clicks.click_tracking.iter().cloned());
                }
            }
        }
    }
}

fn parse_vast_payload<'a>(
    xml: &'a str,
    wrappers: &'a dyn WrapperSource,
    options: &ParseOptions,
) -> Result<Creative> {
    let mut chain = WrapperTracking::default();
    let mut visited: HashSet<String> = HashSet::new();
    let mut document = xml;

    loop {
        let vast = parser::parse_vast(document)?;

        let Some(ad) = vast.into_primary_ad() else {
            return Err(AdError::NoFill);
        };

        if let Some(inline) = ad.inline {
            let mut creative = build_inline_creative(inline, chain, options)?;
            creative.ad_id = creative.ad_id.or(ad.id);
            return Ok(creative);
        }

        let Some(wrapper) = ad.wrapper else {
            return Err(AdError::MalformedCreative(
                "Ad has neither InLine nor Wrapper".to_string(),
            ));
        };

        let uri = wrapper.vast_ad_tag_uri.clone();
        if visited.len() >= options.max_wrapper_depth || !visited.insert(uri.clone()) {
            return Err(AdError::WrapperLoopOrDepthExceeded {
                uri,
                max_depth: options.max_wrapper_depth,
            });
        }

        chain.absorb(&wrapper);

        document = wrappers.resolve(&uri).ok_or_else(|| {
            AdError::MalformedCreative(format!("wrapped VAST {} could not be resolved", uri))
        })?;
    }
}

fn build_inline_creative(
    inline: InLine,
    chain: WrapperTracking,
    options: &ParseOptions,
) -> Result<Creative> {
    let linear = inline.creatives.iter().find_map(|creative| {
        let linear = creative.linear.as_ref()?;
        let media = select_media_file(&linear.media_files, &options.media)?;
        Some((creative, linear, media))
    });

    let mut result = if let Some((creative, linear, media)) = linear {
        let mut result = Creative::new(CreativeKind::Video);
        result.ad_id = creative.ad_id.clone().or_else(|| creative.id.clone());
        result.assets.push(AssetRef::from(media));
        result.duration = linear.duration.as_deref().and_then(parse_clock);
        result.skip_offset = linear
            .skip_offset
            .as_deref()
            .and_then(|offset| parse_offset(offset, result.duration));

        for event in linear.tracking_events.iter().chain(&chain.tracking_events) {
            result.add_tracking(&event.event, [event.url.clone()]);
        }

        if let Some(clicks) = &linear.video_clicks {
            result.click_through = clicks.click_through.clone();
            result.add_tracking(
                EventKind::Click.tracking_key(),
                clicks.click_tracking.iter().cloned(),
            );
        }
        result
    } else if let Some(companion) = select_companion(&inline) {
        let mut result = Creative::new(CreativeKind::Companion);
        match companion.resource_type {
            Some(ResourceType::Html) => result.markup = Some(companion.resource.clone()),
            _ => result.assets.push(AssetRef {
                url: companion.resource.clone(),
                sha256: None,
                size: None,
                mime_type: companion.creative_type.clone(),
            }),
        }
        result.click_through = companion.click_through.clone();

        for event in companion.tracking_events.iter().chain(&chain.tracking_events) {
            result.add_tracking(&event.event, [event.url.clone()]);
        }
        result
    } else if inline.creatives.iter().any(|c| c.linear.is_some()) {
        return Err(AdError::MalformedCreative(
            "Linear creative declares no usable media file".to_string(),
        ));
    } else {
        return Err(AdError::MalformedCreative(
            "InLine declares no media or companion resource".to_string(),
        ));
    };

    result.add_tracking(EventKind::Impression.tracking_key(), inline.impressions);
    result.add_tracking(EventKind::Impression.tracking_key(), chain.impressions);
    result.add_tracking(
        EventKind::ViewableImpression.tracking_key(),
        inline.viewable_impressions,
    );
    result.add_tracking(
        EventKind::ViewableImpression.tracking_key(),
        chain.viewable_impressions,
    );
    result.add_tracking(EventKind::Error.tracking_key(), inline.errors);
    result.add_tracking(EventKind::Error.tracking_key(), chain.errors);
    result.add_tracking(EventKind::Click.tracking_key(), chain.click_tracking);

    Ok(result)
}

/// First static companion, falling back to the first HTML one
fn select_companion(inline: &InLine) -> Option<&Companion> {
    let companions = || {
        inline
            .creatives
            .iter()
            .flat_map(|creative| creative.companions.iter())
            .filter(|companion| !companion.resource.is_empty())
    };

    companions()
        .find(|companion| companion.resource_type == Some(ResourceType::Static))
        .or_else(|| companions().find(|companion| companion.resource_type == Some(ResourceType::Html)))
}

/// Pick the media file to download.
///
/// Ranks by MIME preference order, then progressive over streaming
/// delivery, then bitrate: the closest at or below the target when one is
/// set, otherwise the highest. Ties keep document order.
pub fn select_media_file<'a>(
    files: &'a [MediaFile],
    preference: &MediaPreference,
) -> Option<&'a MediaFile> {
    files
        .iter()
        .filter(|file| !file.url.is_empty())
        .min_by_key(|file| {
            let mime_rank = preference
                .mime_types
                .iter()
                .position(|mime| mime.eq_ignore_ascii_case(&file.mime_type))
                .unwrap_or(preference.mime_types.len());

            let streaming = file
                .delivery
                .as_deref()
                .is_some_and(|delivery| delivery.eq_ignore_ascii_case("streaming"));

            let bitrate_rank: (u8, u32) = match (preference.target_bitrate, file.bitrate) {
                (Some(target), Some(bitrate)) if bitrate <= target => (0, target - bitrate),
                (Some(target), Some(bitrate)) => (1, bitrate - target),
                (Some(_), None) => (2, 0),
                (None, Some(bitrate)) => (0, u32::MAX - bitrate),
                (None, None) => (1, 0),
            };

            (mime_rank, streaming, bitrate_rank)
        })
}

/// Parse a VAST clock value, `HH:MM:SS` or `HH:MM:SS.mmm`
pub fn parse_clock(value: &str) -> Option<Duration> {
    let mut parts = value.trim().split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    let whole = hours.checked_mul(3600)?.checked_add(minutes * 60)?;
    Duration::from_secs(whole).checked_add(Duration::from_secs_f64(seconds))
}

/// Parse a `skipoffset`, either a clock value or a percentage of the duration
fn parse_offset(value: &str, duration: Option<Duration>) -> Option<Duration> {
    match value.trim().strip_suffix('%') {
        Some(percent) => {
            let percent: f64 = percent.trim().parse().ok()?;
            if !(0.0..=100.0).contains(&percent) {
                return None;
            }
            Some(duration?.mul_f64(percent / 100.0))
        }
        None => parse_clock(value),
    }
}

/// JSON descriptor of a static image or video creative
#[derive(Debug, Deserialize)]
struct StaticDescriptor {
    url: String,
    mime_type: Option<String>,
    sha256: Option<String>,
    size: Option<u64>,
    click_through: Option<String>,
    #[serde(default)]
    tracking: BTreeMap<String, Vec<String>>,
    duration_secs: Option<f64>,
}

fn parse_static_payload(body: &[u8]) -> Result<Creative> {
    let descriptor: StaticDescriptor = serde_json::from_slice(body)?;
    if descriptor.url.trim().is_empty() {
        return Err(AdError::MalformedCreative(
            "static creative without url".to_string(),
        ));
    }
    url::Url::parse(descriptor.url.trim())?;

    let is_video = descriptor
        .mime_type
        .as_deref()
        .is_some_and(|mime| mime.starts_with("video/"));

    let mut creative = Creative::new(if is_video {
        CreativeKind::Video
    } else {
        CreativeKind::Display
    });

    creative.assets.push(AssetRef {
        url: descriptor.url.trim().to_string(),
        sha256: descriptor.sha256.map(|h| h.to_ascii_lowercase()),
        size: descriptor.size,
        mime_type: descriptor.mime_type,
    });
    creative.click_through = descriptor.click_through;
    creative.duration = descriptor
        .duration_secs
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

    for (event, urls) in descriptor.tracking {
        creative.add_tracking(&event, urls);
    }

    Ok(creative)
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
