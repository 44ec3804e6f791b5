//! Timestamp continuity for MPEG-TS segments.

pub mod inspector;
pub mod probe;
pub mod rollover;

pub use inspector::{PesTimestamp, SegmentInspector, SegmentTimestamps, StreamTimestamps};
pub use probe::{SegmentTiming, TimingProbe, TsTimingProbe};
pub use rollover::{
    ContinuityCorrector, CorrectedTimestamp, MAX_TS, PES_TIMESCALE, StreamKind,
    TimestampRollover, handle_rollover,
};
