//! Interfaces onto the host media engine.
//!
//! The loader and watcher never own playback state. They read it through
//! [`MediaHost`] and the loader mutates buffered media through [`SourceBuffer`].

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::fetch::RequestId;
use crate::ranges::TimeRanges;

/// Notifications emitted by the host media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Seeking,
    Seeked,
    Pause,
    Playing,
    Error,
    /// The host itself noticed playback is waiting for data
    Waiting,
    /// The seekable window moved, typically after a live playlist refresh
    SeekableChanged,
}

impl HostEvent {
    /// Events that invalidate any in-progress stall detection.
    pub fn cancels_stall_timer(self) -> bool {
        matches!(
            self,
            HostEvent::Seeking
                | HostEvent::Seeked
                | HostEvent::Pause
                | HostEvent::Playing
                | HostEvent::Error
        )
    }
}

/// Read access to host playback state plus the ability to reposition the playhead.
pub trait MediaHost: Send + Sync {
    /// Playback position in seconds.
    fn current_time(&self) -> f64;

    /// Reposition the playhead. The host reports the resulting seek through its events.
    fn set_current_time(&self, time: f64);

    fn paused(&self) -> bool;

    fn seeking(&self) -> bool;

    /// Whether playback has ever started.
    fn has_played(&self) -> bool;

    /// Whether the host reports the end of the presentation.
    fn ended(&self) -> bool;

    /// Presentation duration in seconds, infinite for live streams.
    fn duration(&self) -> f64;

    fn buffered(&self) -> TimeRanges;

    fn seekable(&self) -> TimeRanges;

    /// Attach to host events. Dropping the receiver detaches.
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;
}

/// Media handed to the host buffer after a successful fetch.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub request_id: RequestId,
    /// Initialization segment to append first, only present when it differs from the
    /// last one appended
    pub init_segment: Option<Bytes>,
    pub bytes: Bytes,
    /// Offset mapping the segment's timeline into host media time
    pub timestamp_offset: Option<f64>,
    pub timeline: u64,
}

/// Mutating access to the host's media buffer. Only the loader calls this.
#[async_trait]
pub trait SourceBuffer: Send + Sync {
    /// Append media; resolves once the host has finished updating.
    async fn append(&self, request: AppendRequest);

    /// Drop buffered media in `[start, end)`.
    fn remove(&self, start: f64, end: f64);
}
