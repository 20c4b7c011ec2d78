use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Engine-assigned identifier of one ad session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// The ad formats a placement can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdFormat {
    Banner,
    Interstitial,
    Video,
    Rewarded,
}

impl AdFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            AdFormat::Banner => "banner",
            AdFormat::Interstitial => "interstitial",
            AdFormat::Video => "video",
            AdFormat::Rewarded => "rewarded",
        }
    }
}

impl fmt::Display for AdFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "banner" => Ok(AdFormat::Banner),
            "interstitial" => Ok(AdFormat::Interstitial),
            "video" => Ok(AdFormat::Video),
            "rewarded" => Ok(AdFormat::Rewarded),
            other => Err(format!("unknown ad format '{}'", other)),
        }
    }
}

/// An ad request as submitted by the embedder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdRequest {
    /// Placement the ad will be shown in
    pub placement: String,

    /// Requested ad format
    pub format: AdFormat,

    /// Opaque targeting and context parameters
    pub targeting: BTreeMap<String, String>,

    /// Test-mode requests are tracked but never billed
    pub test_mode: bool,
}

impl AdRequest {
    pub fn new(placement: impl Into<String>, format: AdFormat) -> Self {
        Self {
            placement: placement.into(),
            format,
            targeting: BTreeMap::new(),
            test_mode: false,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.targeting.insert(key.into(), value.into());
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }
}

/// Declared kind of an ad-decision response body
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    VastXml,
    MraidHtml,
    Static,
    Other(String),
}

impl PayloadKind {
    /// Resolve a declared content type. Parameters such as `; charset=utf-8` are ignored.
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "vast" | "application/xml" | "text/xml" | "application/vast+xml" => PayloadKind::VastXml,
            "mraid" | "text/html" | "application/mraid+html" => PayloadKind::MraidHtml,
            "static" | "application/json" => PayloadKind::Static,
            _ => PayloadKind::Other(essence),
        }
    }
}

/// Raw response from the ad-decision collaborator
#[derive(Debug, Clone)]
pub struct AdResponsePayload {
    pub kind: PayloadKind,
    pub body: Vec<u8>,
}

impl AdResponsePayload {
    pub fn new(kind: PayloadKind, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    pub fn vast(xml: impl Into<String>) -> Self {
        Self::new(PayloadKind::VastXml, xml.into().into_bytes())
    }

    pub fn mraid(markup: impl Into<String>) -> Self {
        Self::new(PayloadKind::MraidHtml, markup.into().into_bytes())
    }

    pub fn from_content_type(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::new(PayloadKind::from_content_type(content_type), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_resolve_to_payload_kinds() {
        assert_eq!(PayloadKind::from_content_type("application/xml"), PayloadKind::VastXml);
        assert_eq!(
            PayloadKind::from_content_type("text/html; charset=utf-8"),
            PayloadKind::MraidHtml
        );
        assert_eq!(PayloadKind::from_content_type("STATIC"), PayloadKind::Static);
        assert_eq!(
            PayloadKind::from_content_type("application/x-shockwave-flash"),
            PayloadKind::Other("application/x-shockwave-flash".to_string())
        );
    }

    #[test]
    fn ad_format_parses_case_insensitively() {
        assert_eq!("Rewarded".parse::<AdFormat>(), Ok(AdFormat::Rewarded));
        assert!("popunder".parse::<AdFormat>().is_err());
    }
}
