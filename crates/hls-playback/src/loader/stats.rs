use std::time::Duration;

use crate::fetch::TransferStats;

/// Media request counters owned by one loader.
///
/// Reset when the loader is disposed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MediaStats {
    /// Total bytes received for accepted completions
    pub bytes_transferred: u64,
    /// Every completion, including aborted, timed out and stale ones
    pub requests: u64,
    pub requests_aborted: u64,
    pub requests_timed_out: u64,
    pub requests_errored: u64,
    /// Sum of round trip times of accepted completions
    pub transfer_duration: Duration,
    /// Seconds of media handed to the host buffer
    pub seconds_loaded: f64,
}

impl MediaStats {
    pub fn record_request(&mut self) {
        self.requests += 1;
    }

    pub fn record_transfer(&mut self, stats: &TransferStats) {
        self.bytes_transferred += stats.bytes_received;
        self.transfer_duration += stats.round_trip;
    }

    pub fn record_aborted(&mut self) {
        self.requests_aborted += 1;
    }

    pub fn record_timeout(&mut self) {
        self.requests_timed_out += 1;
    }

    pub fn record_error(&mut self) {
        self.requests_errored += 1;
    }

    pub fn record_seconds_loaded(&mut self, seconds: f64) {
        self.seconds_loaded += seconds;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Cumulative moving average of the decrypt and append throughput, in bits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Throughput {
    rate: f64,
    count: u64,
}

impl Throughput {
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Fold one processed segment into the average and return its sample.
    ///
    /// One millisecond is added to the processing time so that instant appends do not
    /// divide by zero.
    pub fn record(&mut self, byte_length: usize, processing: Duration) -> f64 {
        let millis = processing.as_millis() as f64 + 1.0;
        let sample = ((byte_length as f64 / millis) * 8.0 * 1000.0).floor();

        self.count += 1;
        self.rate += (sample - self.rate) / self.count as f64;
        sample
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_is_cumulative_moving_average() {
        let mut throughput = Throughput::default();

        // 1000 bytes over 99ms + 1 => 80_000 bits/s
        let first = throughput.record(1000, Duration::from_millis(99));
        assert_eq!(first, 80_000.0);
        assert_eq!(throughput.rate(), 80_000.0);

        // 2000 bytes over 0ms + 1 => 16_000_000 bits/s
        let second = throughput.record(2000, Duration::ZERO);
        assert_eq!(second, 16_000_000.0);
        assert_eq!(throughput.rate(), 8_040_000.0);
        assert_eq!(throughput.count(), 2);

        throughput.reset();
        assert_eq!(throughput.rate(), 0.0);
        assert_eq!(throughput.count(), 0);
    }

    #[test]
    fn sample_is_floored() {
        let mut throughput = Throughput::default();
        // 10 bytes over 3ms => 26_666.66..
        assert_eq!(throughput.record(10, Duration::from_millis(2)), 26_666.0);
    }

    #[test]
    fn stats_accumulate_and_reset() {
        let mut stats = MediaStats::default();
        stats.record_request();
        stats.record_transfer(&TransferStats::new(500, Duration::from_millis(20)));
        stats.record_transfer(&TransferStats::new(700, Duration::from_millis(30)));
        stats.record_timeout();

        assert_eq!(stats.requests, 1);
        assert_eq!(stats.bytes_transferred, 1200);
        assert_eq!(stats.transfer_duration, Duration::from_millis(50));
        assert_eq!(stats.requests_timed_out, 1);

        stats.reset();
        assert_eq!(stats, MediaStats::default());
    }
}
