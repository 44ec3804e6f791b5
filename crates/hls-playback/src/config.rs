use std::fmt;
use std::time::Duration;

use crate::error::PlaybackError;

/// Which media the loader feeds. Only used to label log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoaderKind {
    #[default]
    Main,
    Audio,
    Subtitle,
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderKind::Main => f.write_str("main"),
            LoaderKind::Audio => f.write_str("audio"),
            LoaderKind::Subtitle => f.write_str("subtitle"),
        }
    }
}

// --- Loader Configuration ---
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Cadence of the buffer check while the loader is unpaused
    pub check_buffer_interval: Duration,
    /// Seconds of forward buffer above which no further segment is requested
    pub goal_buffer_length: f64,
    /// Seconds of already played content kept behind the playhead
    pub back_buffer_length: f64,
    /// An appended segment ending this many target durations behind the playhead
    /// forces a full resync
    pub resync_target_durations: f64,
    /// Bandwidth estimate (bits/s) before the first segment completes
    pub initial_bandwidth: f64,
    /// Bandwidth estimate (bits/s) forced after a request timeout
    pub timeout_bandwidth: f64,
    pub kind: LoaderKind,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            check_buffer_interval: Duration::from_millis(500),
            goal_buffer_length: 30.0,
            back_buffer_length: 60.0,
            resync_target_durations: 3.0,
            initial_bandwidth: 4_194_304.0,
            timeout_bandwidth: 1.0,
            kind: LoaderKind::Main,
        }
    }
}

// --- Watcher Configuration ---
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Period of the current-time poll (250ms is what WebKit uses)
    pub poll_interval: Duration,
    /// Consecutive identical readings before playback is considered stalled
    pub stall_threshold: u32,
    /// Slack applied to both edges of the seekable window
    pub seekable_tolerance: f64,
    /// Positions this close to the final buffered end are treated as plain buffering
    pub buffer_end_tolerance: f64,
    /// Exclusive bounds (seconds behind the playhead) for a gap start that indicates
    /// audio overplayed a video underflow
    pub underflow_window: (f64, f64),
    /// Forward buffer required inside the current range before the last-resort nudge
    pub min_forward_buffer: f64,
    /// Offset added when seeking into the next buffered range
    pub time_fudge_factor: f64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            stall_threshold: 5,
            seekable_tolerance: 0.1,
            buffer_end_tolerance: 0.1,
            underflow_window: (2.0, 4.0),
            min_forward_buffer: 0.5,
            time_fudge_factor: crate::ranges::TIME_FUDGE_FACTOR,
        }
    }
}

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct PlaybackConfig {
    pub loader_config: LoaderConfig,
    pub watcher_config: WatcherConfig,
}

impl PlaybackConfig {
    /// Reject settings that would stop either loop from making progress.
    pub fn validate(&self) -> Result<(), PlaybackError> {
        let loader = &self.loader_config;
        if loader.check_buffer_interval.is_zero() {
            return Err(PlaybackError::configuration(
                "check_buffer_interval must be greater than zero",
            ));
        }
        if !loader.goal_buffer_length.is_finite() || loader.goal_buffer_length <= 0.0 {
            return Err(PlaybackError::configuration(format!(
                "goal_buffer_length must be a positive number, got {}",
                loader.goal_buffer_length
            )));
        }
        if !loader.back_buffer_length.is_finite() || loader.back_buffer_length < 0.0 {
            return Err(PlaybackError::configuration(format!(
                "back_buffer_length must not be negative, got {}",
                loader.back_buffer_length
            )));
        }
        if loader.resync_target_durations <= 0.0 {
            return Err(PlaybackError::configuration(
                "resync_target_durations must be greater than zero",
            ));
        }

        let watcher = &self.watcher_config;
        if watcher.poll_interval.is_zero() {
            return Err(PlaybackError::configuration(
                "poll_interval must be greater than zero",
            ));
        }
        if watcher.stall_threshold == 0 {
            return Err(PlaybackError::configuration(
                "stall_threshold must be at least 1",
            ));
        }
        let (low, high) = watcher.underflow_window;
        if low.is_nan() || high.is_nan() || low >= high {
            return Err(PlaybackError::configuration(format!(
                "underflow_window ({low}, {high}) is empty"
            )));
        }

        Ok(())
    }
}
