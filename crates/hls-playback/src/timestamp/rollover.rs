//! Unwrapping of 33-bit PES timestamps.
//!
//! MPEG-TS carries PTS/DTS on a 90 kHz clock that wraps every 2^33 ticks (about 26.5
//! hours). Each elementary stream keeps its own anchor, the highest decode timestamp seen
//! so far, and every new value is moved into the residue-class representative nearest to
//! that anchor.

use tracing::trace;

/// Modulus of the wrapping PES clock.
pub const MAX_TS: i64 = 1 << 33;

/// Distance beyond which a value is considered to have wrapped.
pub const RO_THRESH: i64 = 1 << 32;

/// Ticks per second of the PES clock.
pub const PES_TIMESCALE: f64 = 90_000.0;

/// Elementary stream class; each keeps an independent anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Audio => f.write_str("audio"),
            StreamKind::Video => f.write_str("video"),
        }
    }
}

/// Move `value` toward `reference` by whole clock periods until they are less than half
/// a period apart.
pub fn handle_rollover(value: i64, reference: i64) -> i64 {
    let direction = if value > reference { -1 } else { 1 };
    let mut value = value;
    while (reference - value).abs() > RO_THRESH {
        value += direction * MAX_TS;
    }
    value
}

/// Timestamps after unwrapping, in ticks and seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectedTimestamp {
    pub pts: i64,
    pub dts: i64,
    pub pts_seconds: f64,
    pub dts_seconds: f64,
}

/// Rollover state for one elementary stream.
#[derive(Debug, Clone)]
pub struct TimestampRollover {
    kind: StreamKind,
    anchor: Option<i64>,
}

impl TimestampRollover {
    pub fn new(kind: StreamKind) -> Self {
        Self { kind, anchor: None }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Highest unwrapped decode timestamp observed, in ticks.
    pub fn anchor(&self) -> Option<i64> {
        self.anchor
    }

    pub fn correct(&mut self, pts: i64, dts: i64) -> CorrectedTimestamp {
        let reference = *self.anchor.get_or_insert(dts);

        let unwrapped_dts = handle_rollover(dts, reference);
        let unwrapped_pts = handle_rollover(pts, reference);
        if unwrapped_dts != dts || unwrapped_pts != pts {
            trace!(
                stream = %self.kind,
                reference,
                raw_pts = pts,
                raw_dts = dts,
                pts = unwrapped_pts,
                dts = unwrapped_dts,
                "Unwrapped timestamp rollover"
            );
        }

        self.anchor = Some(reference.max(unwrapped_dts));

        CorrectedTimestamp {
            pts: unwrapped_pts,
            dts: unwrapped_dts,
            pts_seconds: unwrapped_pts as f64 / PES_TIMESCALE,
            dts_seconds: unwrapped_dts as f64 / PES_TIMESCALE,
        }
    }

    /// Forget the anchor; the next decode timestamp re-establishes it.
    pub fn reset(&mut self) {
        self.anchor = None;
    }
}

/// Per-stream rollover correction for audio and video.
#[derive(Debug, Clone)]
pub struct ContinuityCorrector {
    audio: TimestampRollover,
    video: TimestampRollover,
}

impl Default for ContinuityCorrector {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinuityCorrector {
    pub fn new() -> Self {
        Self {
            audio: TimestampRollover::new(StreamKind::Audio),
            video: TimestampRollover::new(StreamKind::Video),
        }
    }

    fn stream_mut(&mut self, kind: StreamKind) -> &mut TimestampRollover {
        match kind {
            StreamKind::Audio => &mut self.audio,
            StreamKind::Video => &mut self.video,
        }
    }

    pub fn anchor(&self, kind: StreamKind) -> Option<i64> {
        match kind {
            StreamKind::Audio => self.audio.anchor(),
            StreamKind::Video => self.video.anchor(),
        }
    }

    pub fn correct(&mut self, kind: StreamKind, pts: i64, dts: i64) -> CorrectedTimestamp {
        self.stream_mut(kind).correct(pts, dts)
    }

    /// Clear both anchors, used when the source timeline changes.
    pub fn discontinuity(&mut self) {
        self.audio.reset();
        self.video.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unwraps_value_just_past_the_wrap() {
        let mut rollover = TimestampRollover::new(StreamKind::Video);
        let first = rollover.correct(8_589_934_590, 8_589_934_590);
        let second = rollover.correct(5, 5);

        assert_eq!(first.dts, 8_589_934_590);
        assert_eq!(second.dts, 8_589_934_592 + 5);
        assert_eq!(second.pts, 8_589_934_597);
        assert!(second.dts >= first.dts);
        assert_eq!(rollover.anchor(), Some(8_589_934_597));
    }

    #[test]
    fn unwraps_backwards_when_anchor_is_small() {
        assert_eq!(handle_rollover(MAX_TS - 10, 20), -10);
        assert_eq!(handle_rollover(100, 50), 100);
    }

    #[test]
    fn converts_to_seconds() {
        let mut rollover = TimestampRollover::new(StreamKind::Audio);
        let corrected = rollover.correct(180_000, 90_000);
        assert_eq!(corrected.pts_seconds, 2.0);
        assert_eq!(corrected.dts_seconds, 1.0);
    }

    #[test]
    fn anchor_never_decreases() {
        let mut rollover = TimestampRollover::new(StreamKind::Video);
        rollover.correct(900_000, 900_000);
        rollover.correct(450_000, 450_000);
        assert_eq!(rollover.anchor(), Some(900_000));
    }

    #[test]
    fn streams_are_independent() {
        let mut corrector = ContinuityCorrector::new();
        corrector.correct(StreamKind::Video, 8_589_934_590, 8_589_934_590);
        let audio = corrector.correct(StreamKind::Audio, 5, 5);

        assert_eq!(audio.dts, 5);
        assert_eq!(corrector.anchor(StreamKind::Audio), Some(5));
        assert_eq!(corrector.anchor(StreamKind::Video), Some(8_589_934_590));

        corrector.discontinuity();
        assert_eq!(corrector.anchor(StreamKind::Audio), None);
        assert_eq!(corrector.anchor(StreamKind::Video), None);
    }

    proptest! {
        #[test]
        fn rollover_is_idempotent(reference in 0i64..MAX_TS, raw in 0i64..MAX_TS) {
            let unwrapped = handle_rollover(raw, reference);
            prop_assert!((reference - unwrapped).abs() <= RO_THRESH);
            prop_assert_eq!(handle_rollover(unwrapped, reference), unwrapped);
        }

        #[test]
        fn corrected_decode_sequence_is_monotonic(
            start in 0i64..MAX_TS,
            steps in proptest::collection::vec(0i64..900_000, 1..32),
        ) {
            let mut rollover = TimestampRollover::new(StreamKind::Video);
            let mut previous = rollover.correct(start, start).dts;
            let mut raw = start;
            for step in steps {
                raw = (raw + step) % MAX_TS;
                let corrected = rollover.correct(raw, raw).dts;
                prop_assert!(corrected >= previous);
                previous = corrected;
            }
        }
    }
}
