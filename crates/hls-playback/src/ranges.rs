//! Helpers over host-reported time ranges.
//!
//! Ranges are ordered, non-overlapping `[start, end)` intervals in seconds. Lookups
//! tolerate [`TIME_FUDGE_FACTOR`] of rounding at the edges, roughly one frame at
//! 30fps.

use std::fmt;

/// Slack applied to range boundaries when matching a playback position.
pub const TIME_FUDGE_FACTOR: f64 = 1.0 / 30.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeRanges {
    ranges: Vec<TimeRange>,
}

impl TimeRanges {
    pub fn new(ranges: Vec<TimeRange>) -> Self {
        Self { ranges }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: &[(f64, f64)]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|&(start, end)| TimeRange::new(start, end))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<TimeRange> {
        self.ranges.get(index).copied()
    }

    pub fn first(&self) -> Option<TimeRange> {
        self.ranges.first().copied()
    }

    pub fn last(&self) -> Option<TimeRange> {
        self.ranges.last().copied()
    }

    /// Start of the first range.
    pub fn start(&self) -> Option<f64> {
        self.first().map(|range| range.start)
    }

    /// End of the final range.
    pub fn end(&self) -> Option<f64> {
        self.last().map(|range| range.end)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeRange> {
        self.ranges.iter()
    }

    /// The range containing `time`.
    pub fn find_range(&self, time: f64) -> Option<TimeRange> {
        self.ranges
            .iter()
            .find(|range| {
                range.start - TIME_FUDGE_FACTOR <= time && range.end + TIME_FUDGE_FACTOR >= time
            })
            .copied()
    }

    /// The first range that starts after `time`.
    pub fn find_next_range(&self, time: f64) -> Option<TimeRange> {
        self.ranges
            .iter()
            .find(|range| range.start - TIME_FUDGE_FACTOR >= time)
            .copied()
    }

    /// The unbuffered holes between consecutive ranges.
    pub fn find_gaps(&self) -> TimeRanges {
        let gaps = self
            .ranges
            .windows(2)
            .map(|pair| TimeRange::new(pair[0].end, pair[1].start))
            .collect();
        TimeRanges::new(gaps)
    }
}

impl fmt::Display for TimeRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for range in &self.ranges {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{range}")?;
            first = false;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a TimeRanges {
    type Item = &'a TimeRange;
    type IntoIter = std::slice::Iter<'a, TimeRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}
