use crate::fetch::Fetcher;
use crate::parser;
use log::{debug, warn};
use std::collections::HashMap;

/// Supplies the documents VAST wrappers point at.
///
/// Creative parsing never performs I/O; wrapper targets are fetched ahead of
/// time (see [`prefetch_wrapper_chain`]) and looked up through this trait.
pub trait WrapperSource {
    fn resolve(&self, uri: &str) -> Option<&str>;
}

/// Resolves nothing; wrappers fail to unwrap
pub struct NoWrappers;

impl WrapperSource for NoWrappers {
    fn resolve(&self, _uri: &str) -> Option<&str> {
        None
    }
}

/// Wrapper targets keyed by `VASTAdTagURI`
#[derive(Debug, Default, Clone)]
pub struct ResolvedWrappers {
    documents: HashMap<String, String>,
}

impl ResolvedWrappers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uri: impl Into<String>, xml: impl Into<String>) {
        self.documents.insert(uri.into(), xml.into());
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.documents.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl WrapperSource for ResolvedWrappers {
    fn resolve(&self, uri: &str) -> Option<&str> {
        self.documents.get(uri).map(String::as_str)
    }
}

/// Fetch the documents a wrapper chain points at, following the ad each
/// document would play (see [`crate::models::Vast::into_primary_ad`]).
///
/// Stops after `max_depth` documents, on a URI already fetched, on a
/// document that does not parse, or when a fetch fails. The parser then
/// reports the precise failure when it walks the chain.
pub async fn prefetch_wrapper_chain(
    xml: &str,
    fetcher: &dyn Fetcher,
    max_depth: usize,
) -> ResolvedWrappers {
    let mut resolved = ResolvedWrappers::new();
    let mut current = xml.to_string();

    while resolved.len() < max_depth {
        let next_uri = match parser::parse_vast(&current) {
            Ok(vast) => vast
                .into_primary_ad()
                .and_then(|ad| match (ad.inline, ad.wrapper) {
                    (None, Some(wrapper)) => Some(wrapper.vast_ad_tag_uri),
                    _ => None,
                }),
            Err(e) => {
                debug!("Stopping wrapper prefetch on unparsable document: {}", e);
                None
            }
        };

        let Some(uri) = next_uri else {
            break;
        };

        if resolved.contains(&uri) {
            debug!("Cycle detected in wrapper chain at {}", uri);
            break;
        }

        debug!("Following wrapper: {}", uri);

        let body = match fetcher.fetch(&uri).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Error fetching wrapped VAST {}: {}", uri, e);
                break;
            }
        };

        match String::from_utf8(body.to_vec()) {
            Ok(next_xml) => {
                resolved.insert(uri, next_xml.clone());
                current = next_xml;
            }
            Err(e) => {
                warn!("Wrapped VAST {} is not UTF-8: {}", uri, e);
                break;
            }
        }
    }

    resolved
}
