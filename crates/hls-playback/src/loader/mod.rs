//! Segment scheduling.
//!
//! [`SegmentLoader`] decides which segment to fetch next and drives the
//! request/append lifecycle. It is synchronous and never sleeps: callers pass the current
//! instant and the loader reports when it wants its next buffer check through
//! [`SegmentLoader::next_check_at`]. [`SegmentLoaderTask`] runs it on a tokio task.

mod init_cache;
mod state;
mod stats;
mod task;

pub use init_cache::{InitSegmentCache, InitSegmentKey};
pub use state::{LoaderState, PendingSegment};
pub use stats::{MediaStats, Throughput};
pub use task::{LoaderCommand, LoaderHandle, SegmentLoaderTask};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::LoaderConfig;
use crate::error::PlaybackError;
use crate::events::PlaybackEvent;
use crate::fetch::{
    FetchCompletion, FetchProgress, FetchedSegment, InitSegmentRequest, KeyRequest, RequestId,
    RequestIdGenerator, SegmentRequest,
};
use crate::host::{AppendRequest, MediaHost, SourceBuffer};
use crate::playlist::{Playlist, SyncController, SyncInfo, SyncPoint};
use crate::ranges::TimeRanges;
use crate::timestamp::{SegmentTiming, TimingProbe};
use state::Phase;

/// A segment chosen by the buffer check, before a request exists for it.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SegmentCandidate {
    media_index: i64,
    start_of_segment: Option<f64>,
    is_sync_request: bool,
}

/// Outcome of one fill-buffer pass.
enum Fill {
    Idle,
    /// Paused until a timestamp offset is announced
    Deferred,
    Request(SegmentRequest),
}

pub struct SegmentLoader {
    config: LoaderConfig,
    host: Arc<dyn MediaHost>,
    source_buffer: Arc<dyn SourceBuffer>,
    sync: Arc<dyn SyncController>,
    probe: Box<dyn TimingProbe>,
    events: broadcast::Sender<PlaybackEvent>,

    phase: Phase,
    playlist: Option<Playlist>,
    media_index: Option<i64>,
    sync_point: Option<SyncPoint>,
    current_timeline: Option<u64>,
    /// Timeline the probe anchors currently belong to
    probe_timeline: Option<u64>,
    fetch_at_buffer: bool,
    /// Deadline of the armed buffer check; `None` while paused
    next_check: Option<Instant>,
    /// Set while fetching is deferred on a missing timestamp offset
    awaiting_timeline: Option<u64>,

    bandwidth: f64,
    round_trip: Option<Duration>,
    throughput: Throughput,
    stats: MediaStats,
    error: Option<PlaybackError>,
    init_segments: InitSegmentCache,
    request_ids: RequestIdGenerator,
    progress: Option<mpsc::UnboundedSender<FetchProgress>>,
}

impl SegmentLoader {
    pub fn new(
        config: LoaderConfig,
        host: Arc<dyn MediaHost>,
        source_buffer: Arc<dyn SourceBuffer>,
        sync: Arc<dyn SyncController>,
        probe: Box<dyn TimingProbe>,
        events: broadcast::Sender<PlaybackEvent>,
    ) -> Self {
        let bandwidth = config.initial_bandwidth;
        Self {
            config,
            host,
            source_buffer,
            sync,
            probe,
            events,
            phase: Phase::Init,
            playlist: None,
            media_index: None,
            sync_point: None,
            current_timeline: None,
            probe_timeline: None,
            fetch_at_buffer: false,
            next_check: None,
            awaiting_timeline: None,
            bandwidth,
            round_trip: None,
            throughput: Throughput::default(),
            stats: MediaStats::default(),
            error: None,
            init_segments: InitSegmentCache::default(),
            request_ids: RequestIdGenerator::default(),
            progress: None,
        }
    }

    /// Attach a channel that every subsequent request reports progress on.
    pub fn set_progress_sink(&mut self, progress: mpsc::UnboundedSender<FetchProgress>) {
        self.progress = Some(progress);
    }

    // --- Accessors ---

    pub fn state(&self) -> LoaderState {
        self.phase.state()
    }

    /// Whether the periodic buffer check is disarmed.
    pub fn paused(&self) -> bool {
        self.next_check.is_none()
    }

    pub fn next_check_at(&self) -> Option<Instant> {
        self.next_check
    }

    pub fn pending(&self) -> Option<&PendingSegment> {
        self.phase.pending()
    }

    pub fn media_index(&self) -> Option<i64> {
        self.media_index
    }

    pub fn sync_point(&self) -> Option<SyncPoint> {
        self.sync_point
    }

    pub fn current_timeline(&self) -> Option<u64> {
        self.current_timeline
    }

    pub fn fetch_at_buffer(&self) -> bool {
        self.fetch_at_buffer
    }

    pub fn awaiting_timeline(&self) -> Option<u64> {
        self.awaiting_timeline
    }

    pub fn playlist(&self) -> Option<&Playlist> {
        self.playlist.as_ref()
    }

    /// Bandwidth estimate in bits per second.
    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    pub fn round_trip(&self) -> Option<Duration> {
        self.round_trip
    }

    pub fn throughput(&self) -> &Throughput {
        &self.throughput
    }

    pub fn stats(&self) -> &MediaStats {
        &self.stats
    }

    /// The last fatal request error.
    pub fn error(&self) -> Option<&PlaybackError> {
        self.error.as_ref()
    }

    pub fn init_segments(&self) -> &InitSegmentCache {
        &self.init_segments
    }

    /// Offset of the timeline the loader currently appends into.
    pub fn timestamp_offset(&self) -> Option<f64> {
        self.current_timeline
            .and_then(|timeline| self.sync.timestamp_offset_for_timeline(timeline))
    }

    // --- Lifecycle ---

    /// Unpause and start filling the buffer once a playlist is known.
    pub fn load(&mut self, now: Instant) -> Result<(), PlaybackError> {
        if self.state() == LoaderState::Disposed {
            return Err(PlaybackError::Disposed);
        }

        self.monitor_buffer(now);

        let Some(playlist) = self.playlist.as_ref() else {
            return Ok(());
        };
        self.sync.set_date_time_mapping(playlist);

        match self.state() {
            LoaderState::Init => self.init(now),
            LoaderState::Ready => {
                self.set_state(LoaderState::Ready, None)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn init(&mut self, now: Instant) -> Result<(), PlaybackError> {
        self.set_state(LoaderState::Ready, None)?;
        self.reset_everything();
        self.monitor_buffer(now);
        Ok(())
    }

    /// Stop issuing requests. An in-flight request still completes.
    pub fn pause(&mut self) {
        self.next_check = None;
    }

    /// Replace the active playlist, either a rendition switch or a live refresh.
    pub fn set_playlist(&mut self, playlist: Playlist, now: Instant) -> Result<(), PlaybackError> {
        if self.state() == LoaderState::Disposed {
            return Err(PlaybackError::Disposed);
        }

        let mut playlist = playlist;
        // before playback starts the head of a live playlist is time zero
        if !self.host.has_played() {
            playlist.sync_info = Some(SyncInfo {
                media_sequence: playlist.media_sequence,
                time: 0.0,
            });
        }

        let old = self.playlist.replace(playlist);
        self.emit(PlaybackEvent::SyncInfoUpdate);

        if self.state() == LoaderState::Init && !self.paused() {
            return self.init(now);
        }

        let Some(playlist) = self.playlist.as_ref() else {
            return Ok(());
        };

        let old = match old {
            Some(old) if old.uri == playlist.uri => old,
            _ => {
                if self.media_index.is_some() {
                    debug!(
                        kind = %self.config.kind,
                        uri = %playlist.uri,
                        "Rendition switched, resyncing loader"
                    );
                    self.resync_loader();
                }
                return Ok(());
            }
        };

        let media_sequence_diff = playlist.media_sequence as i64 - old.media_sequence as i64;
        debug!(
            kind = %self.config.kind,
            media_sequence_diff,
            "Playlist refreshed"
        );

        if let Some(media_index) = self.media_index.as_mut() {
            *media_index -= media_sequence_diff;
        }

        if let Some(pending) = self.phase.pending_mut() {
            pending.media_index -= media_sequence_diff;
            // a segment that slid off the playlist keeps its old snapshot
            if let Some(segment) = playlist.segment(pending.media_index) {
                pending.segment = segment.clone();
            }
        }

        self.sync.save_expired_segment_info(&old, playlist);
        Ok(())
    }

    /// Drop the pending request. When unpaused, fetching resumes immediately.
    pub fn abort(&mut self, now: Instant) -> Result<(), PlaybackError> {
        match self.state() {
            LoaderState::Waiting => {
                if let Some(pending) = self.set_state(LoaderState::Ready, None)? {
                    debug!(
                        kind = %self.config.kind,
                        request_id = %pending.request_id,
                        media_index = pending.media_index,
                        "Aborting segment request"
                    );
                    pending.token.cancel();
                }
                if !self.paused() {
                    self.monitor_buffer(now);
                }
            }
            LoaderState::Appending => {
                // the append runs to completion but no longer advances the loader
                self.set_state(LoaderState::Ready, None)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Terminal teardown: cancels the pending request and clears caches and counters.
    pub fn dispose(&mut self) {
        if self.state() == LoaderState::Disposed {
            return;
        }
        if let Ok(Some(pending)) = self.set_state(LoaderState::Disposed, None) {
            pending.token.cancel();
        }
        self.next_check = None;
        self.awaiting_timeline = None;
        self.init_segments.clear();
        self.stats.reset();
        self.throughput.reset();
        info!(kind = %self.config.kind, "Segment loader disposed");
    }

    /// Drop all buffered media and forget where the loader was.
    pub fn reset_everything(&mut self) {
        self.reset_loader();
        self.remove(0.0, f64::INFINITY);
    }

    /// Resynchronize around the playhead instead of the end of the buffer.
    pub fn reset_loader(&mut self) {
        self.fetch_at_buffer = false;
        self.resync_loader();
    }

    /// Forget the media index and sync point so the next fetch re-derives both.
    pub fn resync_loader(&mut self) {
        self.media_index = None;
        self.sync_point = None;
    }

    fn remove(&self, start: f64, end: f64) {
        trace!(kind = %self.config.kind, start, end, "Removing buffered media");
        self.source_buffer.remove(start, end);
    }

    // --- Buffer monitoring ---

    fn monitor_buffer(&mut self, now: Instant) {
        self.next_check = Some(now);
    }

    /// Run one buffer check. Returns the request to start, if any.
    pub fn monitor_buffer_tick(
        &mut self,
        now: Instant,
    ) -> Result<Option<SegmentRequest>, PlaybackError> {
        if self.state() == LoaderState::Disposed {
            return Ok(None);
        }

        let fill = if self.state() == LoaderState::Ready {
            self.fill_buffer()?
        } else {
            Fill::Idle
        };

        match fill {
            Fill::Deferred => Ok(None),
            Fill::Idle => {
                self.next_check = Some(now + self.config.check_buffer_interval);
                Ok(None)
            }
            Fill::Request(request) => {
                self.next_check = Some(now + self.config.check_buffer_interval);
                Ok(Some(request))
            }
        }
    }

    fn fill_buffer(&mut self) -> Result<Fill, PlaybackError> {
        let Some(playlist) = self.playlist.as_ref() else {
            return Ok(Fill::Idle);
        };

        let current_time = self.host.current_time();
        if self.sync_point.is_none() {
            self.sync_point = self.sync.sync_point(
                playlist,
                self.host.duration(),
                self.current_timeline,
                current_time,
            );
        }

        let buffered = self.host.buffered();
        let Some(candidate) =
            self.check_buffer(&buffered, playlist, self.host.has_played(), current_time)
        else {
            return Ok(Fill::Idle);
        };

        let last_index = playlist.segments.len() as i64 - 1;
        if candidate.media_index == last_index && self.host.ended() && !self.host.seeking() {
            trace!(kind = %self.config.kind, "Presentation ended, nothing left to fetch");
            return Ok(Fill::Idle);
        }

        let Some(timeline) = playlist
            .segment(candidate.media_index)
            .map(|segment| segment.timeline)
        else {
            return Ok(Fill::Idle);
        };

        if self.sync.timestamp_offset_for_timeline(timeline).is_none() {
            debug!(
                kind = %self.config.kind,
                timeline,
                "No timestamp offset for timeline yet, deferring fetch"
            );
            self.awaiting_timeline = Some(timeline);
            self.pause();
            return Ok(Fill::Deferred);
        }

        self.load_segment(candidate).map(Fill::Request)
    }

    /// Decide which segment, if any, to request given the current playback state.
    fn check_buffer(
        &self,
        buffered: &TimeRanges,
        playlist: &Playlist,
        has_played: bool,
        current_time: f64,
    ) -> Option<SegmentCandidate> {
        let last_buffered_end = buffered.end().unwrap_or(0.0);
        let buffered_time = (last_buffered_end - current_time).max(0.0);

        if playlist.segments.is_empty() {
            return None;
        }

        if buffered_time >= self.config.goal_buffer_length {
            return None;
        }

        // one segment is enough until playback starts
        if !has_played && buffered_time >= 1.0 {
            return None;
        }

        trace!(
            kind = %self.config.kind,
            media_index = ?self.media_index,
            has_played,
            current_time,
            sync_point = ?self.sync_point,
            fetch_at_buffer = self.fetch_at_buffer,
            buffered_time,
            "Checking buffer"
        );

        let Some(sync_point) = self.sync_point else {
            let media_index = self.sync_segment_candidate(playlist);
            debug!(kind = %self.config.kind, media_index, "Requesting sync segment");
            return Self::candidate(playlist, media_index, None, true);
        };

        if let Some(media_index) = self.media_index {
            let start_of_segment = playlist
                .segment(media_index)
                .and_then(|segment| segment.end)
                .unwrap_or(last_buffered_end);
            trace!(
                kind = %self.config.kind,
                media_index = media_index + 1,
                "Walking forward"
            );
            return Self::candidate(playlist, media_index + 1, Some(start_of_segment), false);
        }

        let time = if self.fetch_at_buffer {
            last_buffered_end
        } else {
            current_time
        };
        let info = self.sync.media_info_for_time(playlist, time, sync_point);
        debug!(
            kind = %self.config.kind,
            media_index = info.media_index,
            start_of_segment = info.start_time,
            "Mapped time to segment"
        );
        Self::candidate(playlist, info.media_index, Some(info.start_time), false)
    }

    /// A segment whose internal timestamps can establish a sync point.
    fn sync_segment_candidate(&self, playlist: &Playlist) -> i64 {
        let Some(timeline) = self.current_timeline else {
            return 0;
        };

        let on_timeline: Vec<usize> = playlist
            .segments
            .iter()
            .enumerate()
            .filter(|(_, segment)| segment.timeline == timeline)
            .map(|(index, _)| index)
            .collect();

        match on_timeline.get(1).or(on_timeline.first()) {
            Some(&index) => index as i64,
            None => (playlist.segments.len() as i64 - 1).max(0),
        }
    }

    fn candidate(
        playlist: &Playlist,
        media_index: i64,
        start_of_segment: Option<f64>,
        is_sync_request: bool,
    ) -> Option<SegmentCandidate> {
        playlist.segment(media_index)?;
        Some(SegmentCandidate {
            media_index,
            start_of_segment,
            is_sync_request,
        })
    }

    // --- Requests ---

    fn load_segment(
        &mut self,
        candidate: SegmentCandidate,
    ) -> Result<SegmentRequest, PlaybackError> {
        let playlist = self.playlist.as_ref().ok_or(PlaybackError::MissingPlaylist)?;
        let segment = playlist
            .segment(candidate.media_index)
            .ok_or(PlaybackError::MissingPlaylist)?
            .clone();

        let pending = PendingSegment {
            request_id: self.request_ids.next_id(),
            media_index: candidate.media_index,
            is_sync_request: candidate.is_sync_request,
            start_of_segment: candidate.start_of_segment,
            timeline: segment.timeline,
            duration: segment.duration,
            segment,
            playlist_uri: playlist.uri.clone(),
            target_duration: playlist.target_duration,
            media_sequence: playlist.media_sequence,
            token: CancellationToken::new(),
            bytes: None,
            byte_length: 0,
            end_of_all_requests: None,
        };
        let request = self.build_request(&pending);

        debug!(
            kind = %self.config.kind,
            request_id = %pending.request_id,
            media_index = pending.media_index,
            timeline = pending.timeline,
            sync_request = pending.is_sync_request,
            uri = %pending.segment.uri,
            "Requesting segment"
        );

        self.set_state(LoaderState::Waiting, Some(pending))?;
        self.trim_back_buffer();
        Ok(request)
    }

    /// The fetcher's view of a pending segment.
    fn build_request(&self, pending: &PendingSegment) -> SegmentRequest {
        let segment = &pending.segment;

        let key = segment.key.as_ref().map(|key| KeyRequest {
            uri: key.uri.clone(),
            iv: key.iv.unwrap_or_else(|| {
                KeyRequest::sequence_iv(
                    pending.media_sequence.saturating_add_signed(pending.media_index),
                )
            }),
        });

        let map = segment.map.as_ref().map(|map| {
            let cache_key = InitSegmentKey::new(map.uri.clone(), map.byte_range);
            InitSegmentRequest {
                uri: map.uri.clone(),
                byte_range: map.byte_range,
                bytes: self.init_segments.get(&cache_key).cloned(),
            }
        });

        SegmentRequest {
            request_id: pending.request_id,
            uri: segment.uri.clone(),
            byte_range: segment.byte_range,
            key,
            map,
            token: pending.token.clone(),
            progress: self.progress.clone(),
        }
    }

    /// Bound how much already played media the host keeps.
    fn trim_back_buffer(&self) {
        let seekable = self.host.seekable();
        let current_time = self.host.current_time();

        let remove_to = match seekable.start() {
            Some(start) if start > 0.0 && start < current_time => start,
            _ => current_time - self.config.back_buffer_length,
        };

        if remove_to > 0.0 {
            self.remove(0.0, remove_to);
        }
    }

    pub fn handle_progress(&mut self, progress: FetchProgress) {
        let is_current = self
            .phase
            .pending()
            .is_some_and(|pending| pending.request_id == progress.request_id);
        if is_current {
            self.emit(PlaybackEvent::Progress {
                request_id: Some(progress.request_id),
            });
        }
    }

    /// Process a finished fetch. Returns the media to append, if any.
    pub fn handle_fetch_completion(
        &mut self,
        completion: FetchCompletion,
    ) -> Result<Option<AppendRequest>, PlaybackError> {
        // every completion counts, even aborted and stale ones
        self.stats.record_request();

        let Some(pending) = self.phase.pending() else {
            self.stats.record_aborted();
            trace!(
                kind = %self.config.kind,
                request_id = %completion.request_id,
                "Completion arrived after the loader was reset"
            );
            return Ok(None);
        };

        if pending.request_id != completion.request_id || self.state() != LoaderState::Waiting {
            trace!(
                kind = %self.config.kind,
                request_id = %completion.request_id,
                pending = %pending.request_id,
                "Ignoring stale completion"
            );
            return Ok(None);
        }

        if let Some(stats) = &completion.stats {
            self.stats.record_transfer(stats);
        }

        match completion.result {
            Ok(segment) => {
                if let Some(stats) = &completion.stats {
                    self.bandwidth = stats.bandwidth;
                    self.round_trip = Some(stats.round_trip);
                }
                if let Some(map) = &segment.map
                    && let Some(bytes) = &map.bytes
                {
                    self.init_segments.insert(
                        InitSegmentKey::new(map.uri.clone(), map.byte_range),
                        bytes.clone(),
                    );
                }
                self.handle_segment(segment)
            }
            Err(err) => {
                let Some(pending) = self.set_state(LoaderState::Ready, None)? else {
                    return Ok(None);
                };

                if err.is_aborted() {
                    self.stats.record_aborted();
                    return Ok(None);
                }

                self.pause();

                if err.is_timeout() {
                    self.stats.record_timeout();
                    self.bandwidth = self.config.timeout_bandwidth;
                    self.round_trip = None;
                    warn!(
                        kind = %self.config.kind,
                        media_index = pending.media_index,
                        error = %err,
                        "Segment request timed out, collapsing bandwidth estimate"
                    );
                    self.emit(PlaybackEvent::BandwidthUpdate {
                        bandwidth: self.bandwidth,
                    });
                    return Ok(None);
                }

                self.stats.record_error();
                error!(
                    kind = %self.config.kind,
                    playlist = %pending.playlist_uri,
                    media_index = pending.media_index,
                    error = %err,
                    "Segment request failed"
                );
                self.error = Some(PlaybackError::segment_request(
                    pending.playlist_uri.clone(),
                    pending.media_index,
                    err.clone(),
                ));
                self.emit(PlaybackEvent::Error {
                    playlist: pending.playlist_uri,
                    media_index: pending.media_index,
                    error: err,
                });
                Ok(None)
            }
        }
    }

    fn handle_segment(
        &mut self,
        segment: FetchedSegment,
    ) -> Result<Option<AppendRequest>, PlaybackError> {
        let Some(pending) = self.phase.pending_mut() else {
            return Ok(None);
        };
        pending.byte_length = segment.bytes.len();
        pending.end_of_all_requests = Some(segment.end_of_all_requests);
        pending.bytes = Some(segment.bytes.clone());
        let timeline = pending.timeline;

        if let Some(previous) = self.probe_timeline.replace(timeline)
            && previous != timeline
        {
            trace!(
                kind = %self.config.kind,
                previous,
                timeline,
                "Timeline changed, resetting probe"
            );
            self.probe.discontinuity();
        }
        let timing = self.probe.probe(&segment.bytes);
        let offset = self.sync.timestamp_offset_for_timeline(timeline);

        self.update_time_mapping(timing, offset);

        let Some(pending) = self.phase.pending() else {
            return Ok(None);
        };

        if pending.is_sync_request {
            let pending = self.set_state(LoaderState::Ready, None)?;
            if let Some(pending) = pending {
                debug!(
                    kind = %self.config.kind,
                    media_index = pending.media_index,
                    start = ?pending.segment.start,
                    "Sync segment processed"
                );
            }
            self.emit(PlaybackEvent::SyncInfoUpdate);
            return Ok(None);
        }

        let init_segment = pending
            .segment
            .map
            .as_ref()
            .map(|map| InitSegmentKey::new(map.uri.clone(), map.byte_range))
            .and_then(|key| self.init_segments.activate(&key));

        let seconds = match (pending.segment.start, pending.segment.end) {
            (Some(start), Some(end)) => end - start,
            _ => pending.duration,
        };
        let append = AppendRequest {
            request_id: pending.request_id,
            init_segment,
            bytes: segment.bytes,
            timestamp_offset: offset,
            timeline,
        };

        self.stats.record_seconds_loaded(seconds);
        self.set_state(LoaderState::Appending, None)?;
        Ok(Some(append))
    }

    /// Record measured segment timing in host media time on the pending segment and
    /// the active playlist.
    fn update_time_mapping(&mut self, timing: Option<SegmentTiming>, offset: Option<f64>) {
        let last_buffered_end = self.host.buffered().end();
        let Some(pending) = self.phase.pending_mut() else {
            return;
        };

        let (start, end) = match (timing, offset) {
            (Some(timing), Some(offset)) => (timing.start + offset, timing.end + offset),
            _ => {
                // a sync request has no expected start to fall back on
                if pending.is_sync_request {
                    return;
                }
                let Some(start) = pending.start_of_segment.or(last_buffered_end) else {
                    return;
                };
                (start, start + pending.duration)
            }
        };

        pending.segment.start = Some(start);
        pending.segment.end = Some(end);
        let media_index = pending.media_index;
        let playlist_uri = pending.playlist_uri.clone();

        let Some(playlist) = self.playlist.as_mut() else {
            return;
        };
        if playlist.uri != playlist_uri {
            return;
        }
        if let Some(segment) = playlist.segment_mut(media_index) {
            segment.start = Some(start);
            segment.end = Some(end);
        }
        if playlist.sync_info.is_none() {
            playlist.sync_info = Some(SyncInfo {
                media_sequence: playlist.media_sequence.saturating_add_signed(media_index),
                time: start,
            });
        }
        trace!(
            kind = %self.config.kind,
            media_index,
            start,
            end,
            "Updated segment timing"
        );
        self.sync.sync_info_update(playlist);
    }

    /// The host finished appending `request_id`.
    pub fn handle_append_complete(
        &mut self,
        request_id: RequestId,
        now: Instant,
    ) -> Result<(), PlaybackError> {
        let is_current = self.state() == LoaderState::Appending
            && self
                .phase
                .pending()
                .is_some_and(|pending| pending.request_id == request_id);

        if !is_current {
            if self.state() == LoaderState::Ready && !self.paused() {
                self.monitor_buffer(now);
            }
            return Ok(());
        }

        let Some(pending) = self.set_state(LoaderState::Ready, None)? else {
            return Ok(());
        };
        let is_walking_forward = self.media_index.is_some();

        self.record_throughput(&pending, now);
        self.media_index = Some(pending.media_index);
        self.fetch_at_buffer = true;
        self.current_timeline = Some(pending.timeline);

        // seekable must be recalculated before judging whether the guess was good
        self.emit(PlaybackEvent::SyncInfoUpdate);

        if let Some(end) = pending.segment.end {
            let current_time = self.host.current_time();
            let limit = pending.target_duration * self.config.resync_target_durations;
            if current_time - end > limit {
                info!(
                    kind = %self.config.kind,
                    media_index = pending.media_index,
                    segment_end = end,
                    current_time,
                    limit,
                    "Appended segment far behind the playhead, resetting loader"
                );
                self.reset_everything();
                return Ok(());
            }
        }

        if is_walking_forward {
            self.emit(PlaybackEvent::BandwidthUpdate {
                bandwidth: self.bandwidth,
            });
        }
        self.emit(PlaybackEvent::Progress { request_id: None });

        if !self.paused() {
            self.monitor_buffer(now);
        }
        Ok(())
    }

    fn record_throughput(&mut self, pending: &PendingSegment, now: Instant) {
        let processing = pending
            .end_of_all_requests
            .map(|end| now.saturating_duration_since(end))
            .unwrap_or_default();
        let sample = self.throughput.record(pending.byte_length, processing);
        trace!(
            kind = %self.config.kind,
            sample,
            rate = self.throughput.rate(),
            "Recorded throughput"
        );
    }

    /// A timestamp offset became available for `timeline`.
    pub fn handle_timestamp_offset(
        &mut self,
        timeline: u64,
        now: Instant,
    ) -> Result<(), PlaybackError> {
        let Some(awaited) = self.awaiting_timeline.take() else {
            return Ok(());
        };
        debug!(
            kind = %self.config.kind,
            timeline,
            awaited,
            "Timestamp offset announced, resuming"
        );
        self.load(now)
    }

    /// The sync controller refreshed its map; pass the notification on.
    pub fn handle_sync_info_update(&self) {
        self.emit(PlaybackEvent::SyncInfoUpdate);
    }

    fn set_state(
        &mut self,
        to: LoaderState,
        pending: Option<PendingSegment>,
    ) -> Result<Option<PendingSegment>, PlaybackError> {
        let from = self.phase.state();
        let released = self.phase.advance(to, pending)?;
        if from != to {
            trace!(kind = %self.config.kind, %from, %to, "Loader state changed");
        }
        Ok(released)
    }

    fn emit(&self, event: PlaybackEvent) {
        trace!(kind = %self.config.kind, event = event.name(), "Emitting event");
        let _ = self.events.send(event);
    }
}
