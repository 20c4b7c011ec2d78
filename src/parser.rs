use crate::error::{AdError, Result};
use crate::models::*;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::str::from_utf8;

/// Parse a VAST XML string into a Vast struct.
///
/// Elements the engine does not use are skipped, so documents from newer
/// VAST versions still parse.
pub fn parse_vast(xml: &str) -> Result<Vast> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"VAST" => {
                let version = attribute(e, b"version")
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| AdError::MalformedCreative("VAST version missing".to_string()))?;
                return parse_vast_body(&mut reader, version);
            }
            // <VAST version="3.0"/> is a valid no-ad response
            Ok(Event::Empty(ref e)) if e.name().as_ref() == b"VAST" => {
                let version = attribute(e, b"version")
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| AdError::MalformedCreative("VAST version missing".to_string()))?;
                return Ok(Vast {
                    version,
                    ..Vast::default()
                });
            }
            Ok(Event::Start(ref e)) => {
                return Err(AdError::MalformedCreative(format!(
                    "expected VAST root, found <{}>",
                    String::from_utf8_lossy(e.name().as_ref())
                )));
            }
            Ok(Event::Eof) => {
                return Err(AdError::MalformedCreative("no VAST root element".to_string()));
            }
            Err(e) => return Err(AdError::XmlParseError(e)),
            _ => (),
        }
        buf.clear();
    }
}

fn parse_vast_body(reader: &mut Reader<&[u8]>, version: String) -> Result<Vast> {
    let mut vast = Vast {
        version,
        ..Vast::default()
    };

    read_children(reader, b"VAST", |reader, e| {
        match e.name().as_ref() {
            b"Ad" => vast.ads.push(parse_ad(reader, e)?),
            b"Error" => push_non_empty(&mut vast.errors, read_text_element(reader)?),
            _ => return Ok(false),
        }
        Ok(true)
    })?;

    Ok(vast)
}

fn parse_ad(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<Ad> {
    let mut ad = Ad {
        id: attribute(start, b"id"),
        sequence: attribute(start, b"sequence").and_then(|v| v.parse().ok()),
        ..Ad::default()
    };

    read_children(reader, b"Ad", |reader, e| {
        match e.name().as_ref() {
            b"InLine" => ad.inline = Some(parse_inline(reader)?),
            b"Wrapper" => ad.wrapper = Some(parse_wrapper(reader)?),
            _ => return Ok(false),
        }
        Ok(true)
    })?;

    Ok(ad)
}

fn parse_inline(reader: &mut Reader<&[u8]>) -> Result<InLine> {
    let mut inline = InLine::default();

    read_children(reader, b"InLine", |reader, e| {
        match e.name().as_ref() {
            b"AdSystem" => inline.ad_system = Some(read_text_element(reader)?),
            b"AdTitle" => inline.ad_title = Some(read_text_element(reader)?),
            b"Impression" => push_non_empty(&mut inline.impressions, read_text_element(reader)?),
            b"ViewableImpression" => {
                inline.viewable_impressions.extend(parse_viewable_impression(reader)?)
            }
            b"Error" => push_non_empty(&mut inline.errors, read_text_element(reader)?),
            b"Creatives" => inline.creatives = parse_creatives(reader)?,
            _ => return Ok(false),
        }
        Ok(true)
    })?;

    Ok(inline)
}

fn parse_wrapper(reader: &mut Reader<&[u8]>) -> Result<Wrapper> {
    let mut wrapper = Wrapper::default();

    read_children(reader, b"Wrapper", |reader, e| {
        match e.name().as_ref() {
            b"AdSystem" => wrapper.ad_system = Some(read_text_element(reader)?),
            b"VASTAdTagURI" => wrapper.vast_ad_tag_uri = read_text_element(reader)?,
            b"Impression" => push_non_empty(&mut wrapper.impressions, read_text_element(reader)?),
            b"ViewableImpression" => {
                wrapper.viewable_impressions.extend(parse_viewable_impression(reader)?)
            }
            b"Error" => push_non_empty(&mut wrapper.errors, read_text_element(reader)?),
            b"Creatives" => wrapper.creatives = parse_creatives(reader)?,
            _ => return Ok(false),
        }
        Ok(true)
    })?;

    if wrapper.vast_ad_tag_uri.is_empty() {
        return Err(AdError::MalformedCreative(
            "Wrapper without VASTAdTagURI".to_string(),
        ));
    }

    Ok(wrapper)
}

/// Only the `Viewable` URLs are kept; `NotViewable` and `ViewUndetermined` are skipped
fn parse_viewable_impression(reader: &mut Reader<&[u8]>) -> Result<Vec<String>> {
    let mut urls = Vec::new();

    read_children(reader, b"ViewableImpression", |reader, e| {
        if e.name().as_ref() != b"Viewable" {
            return Ok(false);
        }
        push_non_empty(&mut urls, read_text_element(reader)?);
        Ok(true)
    })?;

    Ok(urls)
}

fn parse_creatives(reader: &mut Reader<&[u8]>) -> Result<Vec<Creative>> {
    let mut creatives = Vec::new();

    read_children(reader, b"Creatives", |reader, e| {
        if e.name().as_ref() != b"Creative" {
            return Ok(false);
        }
        creatives.push(parse_creative(reader, e)?);
        Ok(true)
    })?;

    Ok(creatives)
}

fn parse_creative(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<Creative> {
    let mut creative = Creative {
        id: attribute(start, b"id"),
        ad_id: attribute(start, b"adId").or_else(|| attribute(start, b"AdID")),
        ..Creative::default()
    };

    read_children(reader, b"Creative", |reader, e| {
        match e.name().as_ref() {
            b"Linear" => creative.linear = Some(parse_linear(reader, e)?),
            b"CompanionAds" => creative.companions = parse_companion_ads(reader)?,
            _ => return Ok(false),
        }
        Ok(true)
    })?;

    Ok(creative)
}

fn parse_linear(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<Linear> {
    let mut linear = Linear {
        skip_offset: attribute(start, b"skipoffset"),
        ..Linear::default()
    };

    read_children(reader, b"Linear", |reader, e| {
        match e.name().as_ref() {
            b"Duration" => linear.duration = Some(read_text_element(reader)?),
            b"MediaFiles" => linear.media_files = parse_media_files(reader)?,
            b"VideoClicks" => linear.video_clicks = Some(parse_video_clicks(reader)?),
            b"TrackingEvents" => linear.tracking_events = parse_tracking_events(reader)?,
            _ => return Ok(false),
        }
        Ok(true)
    })?;

    Ok(linear)
}

fn parse_media_files(reader: &mut Reader<&[u8]>) -> Result<Vec<MediaFile>> {
    let mut media_files = Vec::new();

    read_children(reader, b"MediaFiles", |reader, e| {
        if e.name().as_ref() != b"MediaFile" {
            return Ok(false);
        }
        media_files.push(parse_media_file(reader, e)?);
        Ok(true)
    })?;

    Ok(media_files)
}

fn parse_media_file(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<MediaFile> {
    let media_file = MediaFile {
        mime_type: attribute(start, b"type").unwrap_or_default(),
        codec: attribute(start, b"codec"),
        bitrate: attribute(start, b"bitrate").and_then(|v| v.parse().ok()),
        width: attribute(start, b"width").and_then(|v| v.parse().ok()),
        height: attribute(start, b"height").and_then(|v| v.parse().ok()),
        delivery: attribute(start, b"delivery"),
        file_size: attribute(start, b"fileSize").and_then(|v| v.parse().ok()),
        sha256: attribute(start, b"sha256")
            .or_else(|| attribute(start, b"hash"))
            .map(|h| h.to_ascii_lowercase()),
        url: read_text_element(reader)?,
    };

    Ok(media_file)
}

fn parse_video_clicks(reader: &mut Reader<&[u8]>) -> Result<VideoClicks> {
    let mut video_clicks = VideoClicks::default();

    read_children(reader, b"VideoClicks", |reader, e| {
        match e.name().as_ref() {
            b"ClickThrough" => {
                let url = read_text_element(reader)?;
                if !url.is_empty() {
                    video_clicks.click_through = Some(url);
                }
            }
            b"ClickTracking" => {
                push_non_empty(&mut video_clicks.click_tracking, read_text_element(reader)?)
            }
            _ => return Ok(false),
        }
        Ok(true)
    })?;

    Ok(video_clicks)
}

fn parse_tracking_events(reader: &mut Reader<&[u8]>) -> Result<Vec<TrackingEvent>> {
    let mut tracking_events = Vec::new();

    read_children(reader, b"TrackingEvents", |reader, e| {
        if e.name().as_ref() != b"Tracking" {
            return Ok(false);
        }
        let event = attribute(e, b"event").unwrap_or_default();
        let url = read_text_element(reader)?;
        if !event.is_empty() && !url.is_empty() {
            tracking_events.push(TrackingEvent { event, url });
        }
        Ok(true)
    })?;

    Ok(tracking_events)
}

fn parse_companion_ads(reader: &mut Reader<&[u8]>) -> Result<Vec<Companion>> {
    let mut companions = Vec::new();

    read_children(reader, b"CompanionAds", |reader, e| {
        if e.name().as_ref() != b"Companion" {
            return Ok(false);
        }
        companions.push(parse_companion(reader, e)?);
        Ok(true)
    })?;

    Ok(companions)
}

fn parse_companion(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<Companion> {
    let mut companion = Companion {
        id: attribute(start, b"id"),
        width: attribute(start, b"width").and_then(|v| v.parse().ok()),
        height: attribute(start, b"height").and_then(|v| v.parse().ok()),
        creative_type: None,
        resource_type: None,
        resource: String::new(),
        click_through: None,
        tracking_events: Vec::new(),
    };

    read_children(reader, b"Companion", |reader, e| {
        match e.name().as_ref() {
            b"StaticResource" => {
                companion.creative_type = attribute(e, b"creativeType");
                companion.resource_type = Some(ResourceType::Static);
                companion.resource = read_text_element(reader)?;
            }
            b"IFrameResource" => {
                companion.resource_type = Some(ResourceType::IFrame);
                companion.resource = read_text_element(reader)?;
            }
            b"HTMLResource" => {
                companion.resource_type = Some(ResourceType::Html);
                companion.resource = read_text_element(reader)?;
            }
            b"CompanionClickThrough" => {
                let url = read_text_element(reader)?;
                if !url.is_empty() {
                    companion.click_through = Some(url);
                }
            }
            b"TrackingEvents" => companion.tracking_events = parse_tracking_events(reader)?,
            _ => return Ok(false),
        }
        Ok(true)
    })?;

    Ok(companion)
}

/// Walk the children of `parent` until its closing tag.
///
/// `visit` returns `false` for children it does not handle; those are
/// skipped with all their descendants.
fn read_children<F>(reader: &mut Reader<&[u8]>, parent: &[u8], mut visit: F) -> Result<()>
where
    F: FnMut(&mut Reader<&[u8]>, &BytesStart) -> Result<bool>,
{
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if !visit(reader, e)? {
                    skip_element(reader)?;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == parent => break,
            Ok(Event::Eof) => return Err(unexpected_eof(parent)),
            Err(e) => return Err(AdError::XmlParseError(e)),
            _ => (),
        }
        buf.clear();
    }

    Ok(())
}

/// Read the text content of the current element, joining text and CDATA parts
fn read_text_element(reader: &mut Reader<&[u8]>) -> Result<String> {
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(e)) => {
                text.push_str(&e.unescape()?);
            }
            Ok(Event::CData(e)) => {
                let value = from_utf8(&e).map_err(|err| {
                    AdError::MalformedCreative(format!("CDATA is not UTF-8: {}", err))
                })?;
                text.push_str(value);
            }
            Ok(Event::Start(_)) => skip_element(reader)?,
            Ok(Event::End(_)) => break,
            Ok(Event::Eof) => {
                return Err(AdError::MalformedCreative(
                    "unexpected end of document inside text element".to_string(),
                ));
            }
            Err(e) => return Err(AdError::XmlParseError(e)),
            _ => (),
        }
        buf.clear();
    }

    Ok(text.trim().to_string())
}

/// Skip the element whose start tag was just read, including all its children
fn skip_element(reader: &mut Reader<&[u8]>) -> Result<()> {
    let mut buf = Vec::new();
    let mut depth = 1usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Ok(Event::Eof) => {
                return Err(AdError::MalformedCreative(
                    "unexpected end of document while skipping element".to_string(),
                ));
            }
            Err(e) => return Err(AdError::XmlParseError(e)),
            _ => (),
        }
        buf.clear();
    }

    Ok(())
}

fn attribute(start: &BytesStart, key: &[u8]) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .and_then(|attr| {
            attr.unescape_value()
                .ok()
                .map(|value| value.trim().to_string())
        })
}

fn push_non_empty(list: &mut Vec<String>, value: String) {
    if !value.is_empty() {
        list.push(value);
    }
}

fn unexpected_eof(parent: &[u8]) -> AdError {
    AdError::MalformedCreative(format!(
        "unexpected end of document inside <{}>",
        String::from_utf8_lossy(parent)
    ))
}
