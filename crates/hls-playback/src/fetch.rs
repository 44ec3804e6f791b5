//! Segment fetch interface.
//!
//! Fetching, byte-range handling and decryption happen elsewhere. The loader hands a
//! [`SegmentRequest`] to a [`SegmentFetcher`] and later receives a [`FetchCompletion`]
//! carrying the same [`RequestId`]; completions whose id no longer matches the pending
//! request are discarded.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::playlist::ByteRange;

/// Correlation token attached to every segment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment-request-{}", self.0)
    }
}

/// Monotonic generator of [`RequestId`]s, owned by a single loader.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: u64,
}

impl RequestIdGenerator {
    pub fn next_id(&mut self) -> RequestId {
        self.next += 1;
        RequestId(self.next)
    }
}

/// Decryption parameters for an encrypted segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub uri: String,
    pub iv: [u8; 16],
}

impl KeyRequest {
    /// IV derived from the segment's media sequence number when the playlist gives none.
    pub fn sequence_iv(media_sequence: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[8..].copy_from_slice(&media_sequence.to_be_bytes());
        iv
    }
}

/// Initialization segment attached to a request. `bytes` is filled from the loader's
/// cache when the segment was fetched before.
#[derive(Debug, Clone, PartialEq)]
pub struct InitSegmentRequest {
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    pub bytes: Option<Bytes>,
}

/// Progress notification for an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub request_id: RequestId,
    pub bytes_received: u64,
}

/// Everything a fetcher needs to retrieve one segment.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    pub request_id: RequestId,
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    pub key: Option<KeyRequest>,
    pub map: Option<InitSegmentRequest>,
    /// Cancelled when the loader aborts the request
    pub token: CancellationToken,
    /// Optional channel for progress reports
    pub progress: Option<mpsc::UnboundedSender<FetchProgress>>,
}

impl SegmentRequest {
    /// Report progress for this request. Reports after the loader went away are dropped.
    pub fn report_progress(&self, bytes_received: u64) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(FetchProgress {
                request_id: self.request_id,
                bytes_received,
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferStats {
    pub bytes_received: u64,
    pub round_trip: Duration,
    /// Measured bandwidth in bits per second
    pub bandwidth: f64,
}

impl TransferStats {
    pub fn new(bytes_received: u64, round_trip: Duration) -> Self {
        let seconds = round_trip.as_secs_f64();
        let bandwidth = if seconds > 0.0 {
            (bytes_received as f64 * 8.0) / seconds
        } else {
            0.0
        };
        Self {
            bytes_received,
            round_trip,
            bandwidth,
        }
    }
}

/// Payload of a successful fetch, already decrypted.
#[derive(Debug, Clone)]
pub struct FetchedSegment {
    pub bytes: Bytes,
    /// Initialization segment bytes when the request carried a map
    pub map: Option<InitSegmentRequest>,
    /// When the last byte of every request involved arrived
    pub end_of_all_requests: Instant,
}

#[derive(Debug, Clone)]
pub struct FetchCompletion {
    pub request_id: RequestId,
    pub stats: Option<TransferStats>,
    pub result: Result<FetchedSegment, FetchError>,
}

impl FetchCompletion {
    pub fn success(request_id: RequestId, stats: TransferStats, segment: FetchedSegment) -> Self {
        Self {
            request_id,
            stats: Some(stats),
            result: Ok(segment),
        }
    }

    pub fn failure(request_id: RequestId, error: FetchError) -> Self {
        Self {
            request_id,
            stats: None,
            result: Err(error),
        }
    }
}

#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    /// Retrieve (and decrypt) a segment. Implementations must resolve with
    /// [`FetchError::Aborted`] once `request.token` is cancelled.
    async fn fetch(&self, request: SegmentRequest) -> FetchCompletion;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_increasing() {
        let mut ids = RequestIdGenerator::default();
        let first = ids.next_id();
        let second = ids.next_id();
        assert!(second > first);
        assert_ne!(first, second);
        assert_eq!(first.to_string(), "segment-request-1");
    }

    #[test]
    fn sequence_iv_places_number_in_low_bytes() {
        let iv = KeyRequest::sequence_iv(0x0102);
        assert_eq!(&iv[..14], &[0u8; 14]);
        assert_eq!(iv[14], 0x01);
        assert_eq!(iv[15], 0x02);
    }

    #[test]
    fn transfer_stats_compute_bandwidth() {
        let stats = TransferStats::new(125_000, Duration::from_secs(1));
        assert_eq!(stats.bandwidth, 1_000_000.0);
        assert_eq!(TransferStats::new(10, Duration::ZERO).bandwidth, 0.0);
    }
}
