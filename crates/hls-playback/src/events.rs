use crate::error::FetchError;
use crate::fetch::RequestId;

/// Events produced for ABR, QoS and observability consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// Segment timing or playlist sync information changed
    SyncInfoUpdate,
    /// Bytes arrived for the pending request, or a segment finished appending
    Progress {
        /// The request that progressed, `None` when reported after an append
        request_id: Option<RequestId>,
    },
    /// The bandwidth estimate changed and the rendition should be re-evaluated
    BandwidthUpdate { bandwidth: f64 },
    /// A segment request failed for a reason other than abort or timeout.
    /// Consumers are expected to blacklist `playlist` and switch renditions.
    Error {
        playlist: String,
        media_index: i64,
        error: FetchError,
    },
    /// Playback fell behind the live window and was moved to the live point
    LiveResync { from: f64, to: f64 },
    /// Video stalled in a gap while audio played on; the playhead was re-seeked
    VideoUnderflow {
        current_time: f64,
        gap_start: f64,
        gap_end: f64,
    },
    /// Playback stalled inside buffered content for no known reason
    UnknownWaiting { current_time: f64 },
}

impl PlaybackEvent {
    /// Short lowercase event name, used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            PlaybackEvent::SyncInfoUpdate => "syncinfoupdate",
            PlaybackEvent::Progress { .. } => "progress",
            PlaybackEvent::BandwidthUpdate { .. } => "bandwidthupdate",
            PlaybackEvent::Error { .. } => "error",
            PlaybackEvent::LiveResync { .. } => "liveresync",
            PlaybackEvent::VideoUnderflow { .. } => "videounderflow",
            PlaybackEvent::UnknownWaiting { .. } => "unknownwaiting",
        }
    }
}
