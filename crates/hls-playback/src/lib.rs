//! Playback continuity core for HLS clients
//!
//! This crate decides which media segment to fetch next ([`SegmentLoader`]), corrects
//! 33-bit wrapping MPEG-TS timestamps into a monotonic timeline ([`ContinuityCorrector`])
//! and detects and repairs stalled playback ([`PlaybackWatcher`]). The host media
//! engine, the fetcher and the synchronization map are collaborators reached through
//! the traits in [`host`], [`fetch`] and [`playlist`].
//!
//! The components are synchronous state machines. [`SegmentLoaderTask`] and
//! [`PlaybackWatcherTask`] run them on tokio, and [`PlaybackSession`] spawns both.

pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod host;
pub mod loader;
pub mod playlist;
pub mod ranges;
pub mod session;
pub mod timestamp;
pub mod watcher;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{LoaderConfig, LoaderKind, PlaybackConfig, WatcherConfig};
pub use error::{FetchError, InspectError, PlaybackError};
pub use events::PlaybackEvent;
pub use fetch::{
    FetchCompletion, FetchProgress, FetchedSegment, KeyRequest, RequestId, SegmentFetcher,
    SegmentRequest, TransferStats,
};
pub use host::{AppendRequest, HostEvent, MediaHost, SourceBuffer};
pub use loader::{LoaderCommand, LoaderHandle, LoaderState, SegmentLoader, SegmentLoaderTask};
pub use playlist::{Playlist, Segment, SyncController, SyncEvent, SyncPoint};
pub use ranges::{TIME_FUDGE_FACTOR, TimeRange, TimeRanges};
pub use session::PlaybackSession;
pub use timestamp::{ContinuityCorrector, SegmentTiming, StreamKind, TimingProbe, TsTimingProbe};
pub use watcher::{PlaybackWatcher, PlaybackWatcherTask};

/// Result type for playback operations
pub type Result<T> = std::result::Result<T, PlaybackError>;
