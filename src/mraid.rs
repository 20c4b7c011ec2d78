//! MRAID creatives: HTML markup that talks to the host through the `mraid.js` bridge.
//!
//! The markup is validated and scanned for asset URLs only. Script execution
//! belongs to the web view that renders it.

use crate::creative::{AssetRef, Creative, CreativeKind};
use crate::error::{AdError, Result};

/// Script reference every MRAID creative must carry
pub const MRAID_BRIDGE_MARKER: &str = "mraid.js";

/// Attributes whose values name assets the creative loads
const ASSET_ATTRIBUTES: [&str; 3] = ["src=", "poster=", "data-asset="];

pub fn parse_mraid(markup: &str) -> Result<Creative> {
    let markup = markup.trim();
    if markup.is_empty() {
        return Err(AdError::MalformedCreative("empty MRAID markup".to_string()));
    }

    let lowered = markup.to_ascii_lowercase();
    if !lowered.contains(MRAID_BRIDGE_MARKER) {
        return Err(AdError::MalformedCreative(format!(
            "MRAID markup does not reference {}",
            MRAID_BRIDGE_MARKER
        )));
    }

    let mut creative = Creative {
        kind: CreativeKind::Display,
        ad_id: None,
        assets: Vec::new(),
        click_through: None,
        tracking: Default::default(),
        duration: None,
        skip_offset: None,
        markup: Some(markup.to_string()),
    };

    for url in asset_urls(markup, &lowered) {
        if !creative.assets.iter().any(|asset| asset.url == url) {
            creative.assets.push(AssetRef::new(url));
        }
    }

    Ok(creative)
}

/// Absolute http(s) URLs referenced by asset attributes, scripts excluded.
///
/// `lowered` is the ASCII-lowercased markup; byte offsets match `markup`.
fn asset_urls<'a>(markup: &'a str, lowered: &str) -> Vec<&'a str> {
    let mut urls = Vec::new();

    for attribute in ASSET_ATTRIBUTES {
        let mut from = 0;
        while let Some(found) = lowered[from..].find(attribute) {
            let start = from + found;
            from = start + attribute.len();

            // Reject matches inside longer attribute names such as `data-src=`
            let preceded_by_name = markup[..start]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if preceded_by_name {
                continue;
            }

            if let Some(value) = quoted_value(&markup[from..]) {
                if is_asset_url(value) {
                    urls.push(value);
                }
            }
        }
    }

    urls
}

fn quoted_value(rest: &str) -> Option<&str> {
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let body = &rest[1..];
    let end = body.find(quote)?;
    Some(body[..end].trim())
}

fn is_asset_url(value: &str) -> bool {
    let lowered = value.to_ascii_lowercase();
    let path = lowered.split(['?', '#']).next().unwrap_or_default();
    (lowered.starts_with("https://") || lowered.starts_with("http://"))
        && !path.ends_with(".js")
        && !path.contains(MRAID_BRIDGE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_assets_and_keeps_markup() {
        let markup = r#"<html><head><script src="mraid.js"></script>
            <script src="https://cdn.example/app.js?v=2"></script></head>
            <body><img SRC="https://cdn.example/hero.png" alt="">
            <video poster='https://cdn.example/poster.jpg' src="https://cdn.example/clip.mp4"></video>
            <div data-asset="https://cdn.example/hero.png"></div>
            <img data-src="https://cdn.example/lazy.png">
            <img src="/relative.png"></body></html>"#;

        let creative = parse_mraid(markup).unwrap();
        let urls: Vec<&str> = creative.assets.iter().map(|a| a.url.as_str()).collect();

        assert_eq!(creative.kind, CreativeKind::Display);
        assert_eq!(
            urls,
            [
                "https://cdn.example/hero.png",
                "https://cdn.example/clip.mp4",
                "https://cdn.example/poster.jpg"
            ]
        );
        assert!(creative.markup.as_deref().unwrap().contains("mraid.js"));
    }

    #[test]
    fn markup_without_bridge_is_rejected() {
        let err = parse_mraid("<div><img src=\"https://cdn.example/a.png\"></div>").unwrap_err();
        assert!(matches!(err, AdError::MalformedCreative(_)));
    }

    #[test]
    fn bridge_only_markup_has_no_assets() {
        let creative = parse_mraid("<script src='mraid.js'></script><p>hello</p>").unwrap();
        assert!(creative.assets.is_empty());
    }

    #[test]
    fn empty_markup_is_rejected() {
        assert!(parse_mraid("   ").is_err());
    }
}
