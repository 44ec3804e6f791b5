use std::time::Duration;

use crate::loader::LoaderState;

/// Failure reported by a [`SegmentFetcher`](crate::fetch::SegmentFetcher) for a single
/// segment request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("request aborted")]
    Aborted,

    #[error("request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("request failed with HTTP {status} for {uri}")]
    HttpStatus { status: u16, uri: String },

    #[error("network error: {reason}")]
    Network { reason: String },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },
}

impl FetchError {
    pub fn timeout(elapsed: Duration) -> Self {
        Self::Timeout { elapsed }
    }

    pub fn http_status(status: u16, uri: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            uri: uri.into(),
        }
    }

    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    /// Cancelled requests are bookkeeping, never a playback failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the failure should be surfaced so the consumer can blacklist the playlist.
    pub fn is_fatal(&self) -> bool {
        !self.is_aborted() && !self.is_timeout()
    }
}

/// Errors raised while inspecting MPEG-TS segment payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InspectError {
    #[error("insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("invalid sync byte 0x{0:02x} at offset {1}")]
    InvalidSyncByte(u8, usize),

    #[error("invalid PES start code")]
    InvalidPesStartCode,

    #[error("invalid PTS/DTS flags: {0:#04b}")]
    InvalidPtsDtsFlags(u8),

    #[error("segment contains no audio or video timestamps")]
    NoTimestamps,
}

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("segment request for media index {media_index} of `{playlist}` failed: {source}")]
    SegmentRequest {
        playlist: String,
        media_index: i64,
        #[source]
        source: FetchError,
    },

    #[error("invalid loader state transition from {from} to {to}")]
    InvalidTransition { from: LoaderState, to: LoaderState },

    #[error("segment inspection failed: {0}")]
    Inspection(#[from] InspectError),

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("no playlist has been set on the loader")]
    MissingPlaylist,

    #[error("loader has been disposed")]
    Disposed,

    #[error("command channel closed")]
    ChannelClosed,
}

impl PlaybackError {
    pub fn segment_request(
        playlist: impl Into<String>,
        media_index: i64,
        source: FetchError,
    ) -> Self {
        Self::SegmentRequest {
            playlist: playlist.into(),
            media_index,
            source,
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// The fetch error behind a failed segment request, if any.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::SegmentRequest { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fetch_errors() {
        assert!(FetchError::Aborted.is_aborted());
        assert!(!FetchError::Aborted.is_fatal());
        assert!(FetchError::timeout(Duration::from_secs(5)).is_timeout());
        assert!(!FetchError::timeout(Duration::from_secs(5)).is_fatal());
        assert!(FetchError::http_status(404, "seg-1.ts").is_fatal());
        assert!(FetchError::decryption("bad key").is_fatal());
    }

    #[test]
    fn segment_request_error_exposes_source() {
        let err = PlaybackError::segment_request("media.m3u8", 3, FetchError::network("reset"));
        assert_eq!(err.fetch_error(), Some(&FetchError::network("reset")));
        assert!(err.to_string().contains("media index 3"));
    }
}
