//! In-memory collaborators for tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::FetchError;
use crate::fetch::{FetchCompletion, FetchedSegment, SegmentFetcher, SegmentRequest, TransferStats};
use crate::host::{AppendRequest, HostEvent, MediaHost, SourceBuffer};
use crate::playlist::{Playlist, Segment, SyncController, SyncEvent, SyncPoint};
use crate::ranges::TimeRanges;

/// Initialize tracing for tests with appropriate settings
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A playlist of `count` segments of `duration` seconds on timeline 0.
pub fn playlist(uri: &str, media_sequence: u64, count: usize, duration: f64) -> Playlist {
    Playlist::new(uri, media_sequence, duration).with_segments(
        (0..count)
            .map(|i| {
                Segment::new(
                    format!("{uri}-seg-{}.ts", media_sequence + i as u64),
                    duration,
                    0,
                )
            })
            .collect(),
    )
}

#[derive(Debug, Clone)]
struct HostState {
    current_time: f64,
    paused: bool,
    seeking: bool,
    has_played: bool,
    ended: bool,
    duration: f64,
    buffered: TimeRanges,
    seekable: TimeRanges,
    seeks: Vec<f64>,
}

/// Scriptable [`MediaHost`].
///
/// `set_current_time` records the seek and moves the playhead.
pub struct FakeHost {
    state: Mutex<HostState>,
    events: broadcast::Sender<HostEvent>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(HostState {
                current_time: 0.0,
                paused: false,
                seeking: false,
                has_played: true,
                ended: false,
                duration: f64::INFINITY,
                buffered: TimeRanges::empty(),
                seekable: TimeRanges::empty(),
                seeks: Vec::new(),
            }),
            events,
        }
    }

    pub fn set_time(&self, time: f64) {
        self.state.lock().current_time = time;
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    pub fn set_seeking(&self, seeking: bool) {
        self.state.lock().seeking = seeking;
    }

    pub fn set_has_played(&self, has_played: bool) {
        self.state.lock().has_played = has_played;
    }

    pub fn set_ended(&self, ended: bool) {
        self.state.lock().ended = ended;
    }

    pub fn set_buffered(&self, ranges: &[(f64, f64)]) {
        self.state.lock().buffered = TimeRanges::from_pairs(ranges);
    }

    pub fn set_seekable(&self, ranges: &[(f64, f64)]) {
        self.state.lock().seekable = TimeRanges::from_pairs(ranges);
    }

    /// Every position passed to `set_current_time`, oldest first.
    pub fn seeks(&self) -> Vec<f64> {
        self.state.lock().seeks.clone()
    }

    pub fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

impl MediaHost for FakeHost {
    fn current_time(&self) -> f64 {
        self.state.lock().current_time
    }

    fn set_current_time(&self, time: f64) {
        let mut state = self.state.lock();
        state.seeks.push(time);
        state.current_time = time;
    }

    fn paused(&self) -> bool {
        self.state.lock().paused
    }

    fn seeking(&self) -> bool {
        self.state.lock().seeking
    }

    fn has_played(&self) -> bool {
        self.state.lock().has_played
    }

    fn ended(&self) -> bool {
        self.state.lock().ended
    }

    fn duration(&self) -> f64 {
        self.state.lock().duration
    }

    fn buffered(&self) -> TimeRanges {
        self.state.lock().buffered.clone()
    }

    fn seekable(&self) -> TimeRanges {
        self.state.lock().seekable.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }
}

/// [`SourceBuffer`] that records appends and removals.
#[derive(Default)]
pub struct FakeSourceBuffer {
    appends: Mutex<Vec<AppendRequest>>,
    removals: Mutex<Vec<(f64, f64)>>,
}

impl FakeSourceBuffer {
    pub fn appends(&self) -> Vec<AppendRequest> {
        self.appends.lock().clone()
    }

    pub fn removals(&self) -> Vec<(f64, f64)> {
        self.removals.lock().clone()
    }
}

#[async_trait]
impl SourceBuffer for FakeSourceBuffer {
    async fn append(&self, request: AppendRequest) {
        self.appends.lock().push(request);
    }

    fn remove(&self, start: f64, end: f64) {
        self.removals.lock().push((start, end));
    }
}

#[derive(Debug, Default)]
struct SyncState {
    sync_point: Option<SyncPoint>,
    offsets: HashMap<u64, f64>,
    expired_updates: usize,
    sync_info_updates: usize,
    date_time_mappings: usize,
}

/// [`SyncController`] with directly settable answers.
///
/// Starts without a sync point and with timeline 0 mapped at offset 0.
pub struct FakeSync {
    state: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
}

impl Default for FakeSync {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSync {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        let mut state = SyncState::default();
        state.offsets.insert(0, 0.0);
        Self {
            state: Mutex::new(state),
            events,
        }
    }

    pub fn with_sync_point(self, segment_index: i64, time: f64) -> Self {
        self.set_sync_point(Some(SyncPoint {
            segment_index,
            time,
        }));
        self
    }

    pub fn set_sync_point(&self, sync_point: Option<SyncPoint>) {
        self.state.lock().sync_point = sync_point;
    }

    /// Establish the offset for `timeline` and announce it.
    pub fn set_timestamp_offset(&self, timeline: u64, offset: f64) {
        self.state.lock().offsets.insert(timeline, offset);
        let _ = self.events.send(SyncEvent::TimestampOffset { timeline });
    }

    pub fn clear_timestamp_offset(&self, timeline: u64) {
        self.state.lock().offsets.remove(&timeline);
    }

    pub fn announce_sync_info(&self) {
        let _ = self.events.send(SyncEvent::SyncInfoUpdate);
    }

    pub fn expired_updates(&self) -> usize {
        self.state.lock().expired_updates
    }

    pub fn sync_info_updates(&self) -> usize {
        self.state.lock().sync_info_updates
    }

    pub fn date_time_mappings(&self) -> usize {
        self.state.lock().date_time_mappings
    }
}

impl SyncController for FakeSync {
    fn sync_point(
        &self,
        _playlist: &Playlist,
        _duration: f64,
        _timeline: Option<u64>,
        _current_time: f64,
    ) -> Option<SyncPoint> {
        self.state.lock().sync_point
    }

    fn timestamp_offset_for_timeline(&self, timeline: u64) -> Option<f64> {
        self.state.lock().offsets.get(&timeline).copied()
    }

    fn save_expired_segment_info(&self, _old_playlist: &Playlist, _new_playlist: &Playlist) {
        self.state.lock().expired_updates += 1;
    }

    fn sync_info_update(&self, _playlist: &Playlist) {
        self.state.lock().sync_info_updates += 1;
    }

    fn set_date_time_mapping(&self, _playlist: &Playlist) {
        self.state.lock().date_time_mappings += 1;
    }

    fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}

/// Scripted outcome for one [`FakeFetcher`] request.
#[derive(Debug, Clone)]
pub enum FakeResponse {
    Bytes(Bytes),
    Error(FetchError),
    /// Never completes until the request token is cancelled
    Hang,
}

/// [`SegmentFetcher`] that answers from a script, then succeeds with the segment uri
/// as payload.
#[derive(Default)]
pub struct FakeFetcher {
    responses: Mutex<VecDeque<FakeResponse>>,
    requests: Mutex<Vec<SegmentRequest>>,
}

impl FakeFetcher {
    pub fn push_response(&self, response: FakeResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn requests(&self) -> Vec<SegmentRequest> {
        self.requests.lock().clone()
    }

    /// The completion this fetcher would produce for `request` on success.
    pub fn completion(request: &SegmentRequest, bytes: Bytes) -> FetchCompletion {
        let map = request.map.clone().map(|mut map| {
            if map.bytes.is_none() {
                map.bytes = Some(Bytes::from(format!("init:{}", map.uri)));
            }
            map
        });
        let stats = TransferStats::new(bytes.len() as u64, Duration::from_millis(10));
        FetchCompletion::success(
            request.request_id,
            stats,
            FetchedSegment {
                bytes,
                map,
                end_of_all_requests: Instant::now(),
            },
        )
    }
}

#[async_trait]
impl SegmentFetcher for FakeFetcher {
    async fn fetch(&self, request: SegmentRequest) -> FetchCompletion {
        self.requests.lock().push(request.clone());
        let response = self.responses.lock().pop_front();

        match response {
            None => {
                request.report_progress(request.uri.len() as u64);
                let bytes = Bytes::from(request.uri.clone());
                Self::completion(&request, bytes)
            }
            Some(FakeResponse::Bytes(bytes)) => Self::completion(&request, bytes),
            Some(FakeResponse::Error(error)) => {
                FetchCompletion::failure(request.request_id, error)
            }
            Some(FakeResponse::Hang) => {
                request.token.cancelled().await;
                FetchCompletion::failure(request.request_id, FetchError::Aborted)
            }
        }
    }
}
