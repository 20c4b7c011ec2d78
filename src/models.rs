use serde::{Deserialize, Serialize};

/// Represents a VAST document (Video Ad Serving Template)
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Vast {
    /// The VAST version (e.g., "2.0", "3.0", "4.0", etc.)
    pub version: String,

    /// The Ad elements within the VAST document
    pub ads: Vec<Ad>,

    /// Document-level error tracking URLs (used by no-ad responses)
    pub errors: Vec<String>,
}

impl Vast {
    /// The ad to play: ad pods play in sequence order, standalone ads keep
    /// document order
    pub fn into_primary_ad(self) -> Option<Ad> {
        self.ads
            .into_iter()
            .min_by_key(|ad| ad.sequence.unwrap_or(u32::MAX))
    }
}

/// Represents an Ad within a VAST document
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Ad {
    /// The ad ID
    pub id: Option<String>,

    /// The ad sequence number (for ad pods)
    pub sequence: Option<u32>,

    /// The in-line ad details
    pub inline: Option<InLine>,

    /// The wrapper ad details
    pub wrapper: Option<Wrapper>,
}

/// An InLine ad, which carries media files and tracking information directly
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct InLine {
    pub ad_system: Option<String>,
    pub ad_title: Option<String>,

    /// Impression tracking URLs
    pub impressions: Vec<String>,

    /// Viewable impression tracking URLs (VAST 4 `ViewableImpression/Viewable`)
    pub viewable_impressions: Vec<String>,

    /// Error tracking URLs
    pub errors: Vec<String>,

    pub creatives: Vec<Creative>,
}

/// A Wrapper ad, which references another VAST document
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Wrapper {
    pub ad_system: Option<String>,

    /// The URL of the next VAST document
    pub vast_ad_tag_uri: String,

    pub impressions: Vec<String>,
    pub viewable_impressions: Vec<String>,
    pub errors: Vec<String>,

    /// Wrappers may add tracking to the creatives they wrap
    pub creatives: Vec<Creative>,
}

/// Represents a creative element
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Creative {
    pub id: Option<String>,
    pub ad_id: Option<String>,
    pub linear: Option<Linear>,
    pub companions: Vec<Companion>,
}

/// Represents a linear (video) ad
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Linear {
    /// The duration, as written (`HH:MM:SS` or `HH:MM:SS.mmm`)
    pub duration: Option<String>,

    /// The `skipoffset` attribute, as written
    pub skip_offset: Option<String>,

    pub media_files: Vec<MediaFile>,
    pub video_clicks: Option<VideoClicks>,
    pub tracking_events: Vec<TrackingEvent>,
}

/// Represents a media file
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct MediaFile {
    pub url: String,

    /// The media file MIME type
    pub mime_type: String,

    pub codec: Option<String>,

    /// Bitrate in kbps
    pub bitrate: Option<u32>,

    pub width: Option<u32>,
    pub height: Option<u32>,

    /// Progressive or streaming
    pub delivery: Option<String>,

    /// Declared byte size (VAST 4.1 `fileSize`)
    pub file_size: Option<u64>,

    /// Declared SHA-256 of the file, hex encoded
    pub sha256: Option<String>,
}

/// Represents video click-through and click-tracking URLs
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct VideoClicks {
    pub click_through: Option<String>,
    pub click_tracking: Vec<String>,
}

/// Represents a tracking event
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TrackingEvent {
    /// The event type (e.g., "start", "firstQuartile", "midpoint", "thirdQuartile", "complete", etc.)
    pub event: String,

    pub url: String,
}

/// Kind of resource a companion renders
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub enum ResourceType {
    Static,
    IFrame,
    Html,
}

/// Represents a companion ad
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Companion {
    pub id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,

    /// `creativeType` of a static resource (e.g. "image/png")
    pub creative_type: Option<String>,

    pub resource_type: Option<ResourceType>,

    /// The resource URL or HTML content
    pub resource: String,

    pub click_through: Option<String>,
    pub tracking_events: Vec<TrackingEvent>,
}
