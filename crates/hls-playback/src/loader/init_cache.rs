use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::playlist::ByteRange;

/// Identity of an initialization segment: `(byte length, byte offset, uri)`.
///
/// A map without a byte range covers the whole resource, recorded as an unbounded
/// length at offset zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitSegmentKey {
    length: Option<u64>,
    offset: u64,
    uri: String,
}

impl InitSegmentKey {
    pub fn new(uri: impl Into<String>, byte_range: Option<ByteRange>) -> Self {
        Self {
            length: byte_range.map(|range| range.length),
            offset: byte_range.map_or(0, |range| range.offset),
            uri: uri.into(),
        }
    }
}

impl fmt::Display for InitSegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.length {
            Some(length) => write!(f, "{},{},{}", length, self.offset, self.uri),
            None => write!(f, "inf,{},{}", self.offset, self.uri),
        }
    }
}

/// Initialization segments fetched during one loader lifetime.
#[derive(Debug, Default)]
pub struct InitSegmentCache {
    segments: HashMap<InitSegmentKey, Bytes>,
    /// The init segment most recently handed to the host buffer
    active: Option<InitSegmentKey>,
}

impl InitSegmentCache {
    pub fn get(&self, key: &InitSegmentKey) -> Option<&Bytes> {
        self.segments.get(key)
    }

    pub fn insert(&mut self, key: InitSegmentKey, bytes: Bytes) {
        self.segments.insert(key, bytes);
    }

    /// Bytes to append ahead of the next media segment, or `None` when `key` is already
    /// the active init segment or was never fetched.
    pub fn activate(&mut self, key: &InitSegmentKey) -> Option<Bytes> {
        if self.active.as_ref() == Some(key) {
            return None;
        }
        let bytes = self.segments.get(key)?.clone();
        self.active = Some(key.clone());
        Some(bytes)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.active = None;
    }
}
