use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the ad-session engine
#[derive(Error, Debug)]
pub enum AdError {
    #[error("placement {0} already has a live session")]
    DuplicatePlacement(String),

    #[error("malformed creative: {0}")]
    MalformedCreative(String),

    #[error("failed to parse XML: {0}")]
    XmlParseError(#[from] quick_xml::Error),

    #[error("unsupported creative type: {0}")]
    UnsupportedCreativeType(String),

    #[error("wrapper chain loops or exceeds depth {max_depth} at {uri}")]
    WrapperLoopOrDepthExceeded { uri: String, max_depth: usize },

    #[error("ad response contained no ad")]
    NoFill,

    #[error("asset {url} unavailable: {reason}")]
    AssetUnavailable { url: String, reason: String },

    #[error("asset {url} failed validation: {detail}")]
    AssetIntegrityMismatch { url: String, detail: String },

    #[error("{operation} is not valid in state {state}")]
    SessionNotReady {
        operation: &'static str,
        state: &'static str,
    },

    #[error("session cancelled by caller")]
    CancelledByCaller,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Failure category reported to the embedder and recorded on a failed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DuplicatePlacement,
    MalformedCreative,
    UnsupportedCreativeType,
    WrapperLoopOrDepthExceeded,
    NoFill,
    AssetUnavailable,
    AssetIntegrityMismatch,
    SessionNotReady,
    CancelledByCaller,
}

impl AdError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdError::DuplicatePlacement(_) => ErrorKind::DuplicatePlacement,
            AdError::MalformedCreative(_)
            | AdError::XmlParseError(_)
            | AdError::UrlError(_)
            | AdError::JsonError(_) => ErrorKind::MalformedCreative,
            AdError::UnsupportedCreativeType(_) => ErrorKind::UnsupportedCreativeType,
            AdError::WrapperLoopOrDepthExceeded { .. } => ErrorKind::WrapperLoopOrDepthExceeded,
            AdError::NoFill => ErrorKind::NoFill,
            AdError::AssetUnavailable { .. } | AdError::IoError(_) => ErrorKind::AssetUnavailable,
            AdError::AssetIntegrityMismatch { .. } => ErrorKind::AssetIntegrityMismatch,
            AdError::SessionNotReady { .. } => ErrorKind::SessionNotReady,
            AdError::CancelledByCaller => ErrorKind::CancelledByCaller,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdError>;
