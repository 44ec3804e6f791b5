//! Segment timing probes used by the loader after each successful fetch.

use tracing::debug;

use crate::error::PlaybackError;
use crate::timestamp::inspector::{SegmentInspector, is_transport_stream};
use crate::timestamp::rollover::{ContinuityCorrector, StreamKind};

/// Presentation span of a segment in its own timeline, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentTiming {
    pub start: f64,
    pub end: f64,
}

/// Extracts rollover-corrected timing from fetched segment bytes.
pub trait TimingProbe: Send {
    /// Timing of `segment`, or `None` when the payload carries none this probe can read.
    fn probe(&mut self, segment: &[u8]) -> Option<SegmentTiming>;

    /// The source timeline changed; drop any rollover anchors.
    fn discontinuity(&mut self);
}

/// [`TimingProbe`] for MPEG-TS segments.
///
/// Anchors persist between segments of the same timeline so a wrap that happens at a
/// segment boundary is unwrapped against the previous segment.
#[derive(Debug, Default)]
pub struct TsTimingProbe {
    inspector: SegmentInspector,
    corrector: ContinuityCorrector,
}

impl TsTimingProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn corrector(&self) -> &ContinuityCorrector {
        &self.corrector
    }

    /// Inspect and correct a transport stream segment.
    pub fn timing(&mut self, segment: &[u8]) -> Result<SegmentTiming, PlaybackError> {
        let timestamps = self.inspector.inspect(segment)?;

        let mut start = f64::INFINITY;
        let mut end = f64::NEG_INFINITY;
        for kind in [StreamKind::Video, StreamKind::Audio] {
            let stream = timestamps.stream(kind);
            if let Some(first) = stream.first {
                let corrected = self.corrector.correct(kind, first.pts, first.dts);
                start = start.min(corrected.pts_seconds);
                end = end.max(corrected.pts_seconds);
            }
            if let Some(last) = stream.last {
                let corrected = self.corrector.correct(kind, last.pts, last.dts);
                end = end.max(corrected.pts_seconds);
            }
        }

        Ok(SegmentTiming { start, end })
    }
}

impl TimingProbe for TsTimingProbe {
    fn probe(&mut self, segment: &[u8]) -> Option<SegmentTiming> {
        if !is_transport_stream(segment) {
            return None;
        }
        match self.timing(segment) {
            Ok(timing) => Some(timing),
            Err(e) => {
                debug!(error = %e, "Could not read segment timing");
                None
            }
        }
    }

    fn discontinuity(&mut self) {
        self.corrector.discontinuity();
    }
}
