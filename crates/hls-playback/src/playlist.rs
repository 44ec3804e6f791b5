//! Playlist data model and the synchronization map interface.

use tokio::sync::broadcast;

use crate::ranges::TIME_FUDGE_FACTOR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub length: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    pub uri: String,
    /// Explicit IV. When absent the media sequence number is used.
    pub iv: Option<[u8; 16]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSegmentRef {
    pub uri: String,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Resolved segment URI
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    pub key: Option<SegmentKey>,
    pub map: Option<InitSegmentRef>,
    /// Discontinuity sequence this segment belongs to
    pub timeline: u64,
    /// Declared duration in seconds
    pub duration: f64,
    /// Measured start in host media time, once fetched
    pub start: Option<f64>,
    /// Measured end in host media time, once fetched
    pub end: Option<f64>,
}

impl Segment {
    pub fn new(uri: impl Into<String>, duration: f64, timeline: u64) -> Self {
        Self {
            uri: uri.into(),
            byte_range: None,
            key: None,
            map: None,
            timeline,
            duration,
            start: None,
            end: None,
        }
    }
}

/// Anchor tying a media sequence number to host media time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncInfo {
    pub media_sequence: u64,
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    /// Identity of the rendition; a different uri means a rendition switch
    pub uri: String,
    pub media_sequence: u64,
    pub target_duration: f64,
    pub segments: Vec<Segment>,
    pub end_list: bool,
    pub sync_info: Option<SyncInfo>,
}

impl Playlist {
    pub fn new(uri: impl Into<String>, media_sequence: u64, target_duration: f64) -> Self {
        Self {
            uri: uri.into(),
            media_sequence,
            target_duration,
            segments: Vec::new(),
            end_list: false,
            sync_info: None,
        }
    }

    pub fn with_segments(mut self, segments: Vec<Segment>) -> Self {
        self.segments = segments;
        self
    }

    pub fn segment(&self, index: i64) -> Option<&Segment> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.segments.get(index))
    }

    pub fn segment_mut(&mut self, index: i64) -> Option<&mut Segment> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.segments.get_mut(index))
    }

    /// Sum of durations between two indexes; negative indexes count as target durations.
    pub fn sum_durations(&self, start_index: i64, end_index: i64) -> f64 {
        let (mut start, end) = if start_index > end_index {
            (end_index, start_index)
        } else {
            (start_index, end_index)
        };

        let mut durations = 0.0;
        if start < 0 {
            for _ in start..end.min(0) {
                durations += self.target_duration;
            }
            start = 0;
        }
        for index in start..end {
            if let Some(segment) = self.segment(index) {
                durations += segment.duration;
            }
        }
        durations
    }

    /// Map a host media time to the segment containing it.
    ///
    /// The walk starts from a known anchor (`start_index` begins at `start_time`) and
    /// steps backwards or forwards through segment durations. When the time falls
    /// outside the playlist the first or last segment is returned, starting at `time`.
    pub fn media_info_for_time(&self, time: f64, start_index: i64, start_time: f64) -> MediaInfo {
        let segment_count = self.segments.len() as i64;
        let mut remaining = time - start_time;

        if remaining < 0.0 {
            if start_index > 0 {
                for index in (0..start_index).rev() {
                    let Some(segment) = self.segment(index) else {
                        continue;
                    };
                    remaining += segment.duration + TIME_FUDGE_FACTOR;
                    if remaining > 0.0 {
                        return MediaInfo {
                            media_index: index,
                            start_time: start_time - self.sum_durations(start_index, index),
                        };
                    }
                }
            }
            return MediaInfo {
                media_index: 0,
                start_time: time,
            };
        }

        let mut first = start_index;
        if first < 0 {
            for _ in first..0 {
                remaining -= self.target_duration;
                if remaining < 0.0 {
                    return MediaInfo {
                        media_index: 0,
                        start_time: time,
                    };
                }
            }
            first = 0;
        }

        for index in first..segment_count {
            let Some(segment) = self.segment(index) else {
                continue;
            };
            remaining -= segment.duration + TIME_FUDGE_FACTOR;
            if remaining < 0.0 {
                return MediaInfo {
                    media_index: index,
                    start_time: start_time + self.sum_durations(start_index, index),
                };
            }
        }

        MediaInfo {
            media_index: segment_count - 1,
            start_time: time,
        }
    }
}

/// Result of mapping a time onto a playlist.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaInfo {
    pub media_index: i64,
    pub start_time: f64,
}

/// Assertion that the segment at `segment_index` begins at host media `time`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPoint {
    pub segment_index: i64,
    pub time: f64,
}

/// Notifications from the synchronization map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// A timestamp offset became known for `timeline`
    TimestampOffset { timeline: u64 },
    SyncInfoUpdate,
}

/// The synchronization map relating playlists to host media time.
///
/// Construction and bookkeeping live outside this crate; the loader only consumes
/// these accessors.
pub trait SyncController: Send + Sync {
    /// A sync point for `playlist`, or `None` when nothing is known yet.
    fn sync_point(
        &self,
        playlist: &Playlist,
        duration: f64,
        timeline: Option<u64>,
        current_time: f64,
    ) -> Option<SyncPoint>;

    /// Offset mapping segment timestamps of `timeline` into host media time.
    fn timestamp_offset_for_timeline(&self, timeline: u64) -> Option<f64>;

    /// Keep timing of segments that slid off a refreshed live playlist.
    fn save_expired_segment_info(&self, old_playlist: &Playlist, new_playlist: &Playlist);

    /// The loader synchronized a segment; refresh derived sync information.
    fn sync_info_update(&self, _playlist: &Playlist) {}

    /// Record the program date time mapping of `playlist` before loading starts.
    fn set_date_time_mapping(&self, _playlist: &Playlist) {}

    fn subscribe(&self) -> broadcast::Receiver<SyncEvent>;

    fn media_info_for_time(
        &self,
        playlist: &Playlist,
        time: f64,
        sync_point: SyncPoint,
    ) -> MediaInfo {
        playlist.media_info_for_time(time, sync_point.segment_index, sync_point.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(durations: &[f64]) -> Playlist {
        Playlist::new("media.m3u8", 0, 10.0).with_segments(
            durations
                .iter()
                .enumerate()
                .map(|(i, &duration)| Segment::new(format!("seg-{i}.ts"), duration, 0))
                .collect(),
        )
    }

    #[test]
    fn walks_forward_from_sync_point() {
        let playlist = playlist(&[10.0, 10.0, 10.0, 10.0]);
        let info = playlist.media_info_for_time(25.0, 0, 0.0);
        assert_eq!(info.media_index, 2);
        assert_eq!(info.start_time, 20.0);
    }

    #[test]
    fn walks_backward_from_sync_point() {
        let playlist = playlist(&[10.0, 10.0, 10.0, 10.0]);
        let info = playlist.media_info_for_time(12.0, 3, 30.0);
        assert_eq!(info.media_index, 1);
        assert_eq!(info.start_time, 10.0);
    }

    #[test]
    fn clamps_outside_the_playlist() {
        let playlist = playlist(&[10.0, 10.0]);
        let after = playlist.media_info_for_time(100.0, 0, 0.0);
        assert_eq!(after.media_index, 1);
        assert_eq!(after.start_time, 100.0);

        let before = playlist.media_info_for_time(-5.0, 0, 0.0);
        assert_eq!(before.media_index, 0);
        assert_eq!(before.start_time, -5.0);
    }

    #[test]
    fn negative_sync_index_counts_target_durations() {
        let playlist = playlist(&[10.0, 10.0, 10.0]);
        assert_eq!(playlist.sum_durations(-2, 1), 30.0);

        let inside_expired = playlist.media_info_for_time(5.0, -2, 0.0);
        assert_eq!(inside_expired.media_index, 0);
        assert_eq!(inside_expired.start_time, 5.0);

        let after_expired = playlist.media_info_for_time(25.0, -2, 0.0);
        assert_eq!(after_expired.media_index, 0);
        assert_eq!(after_expired.start_time, 20.0);
    }
}
