use std::fmt;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PlaybackError;
use crate::fetch::RequestId;
use crate::playlist::Segment;

/// Lifecycle state of a [`SegmentLoader`](super::SegmentLoader).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderState {
    /// No playlist has been started yet
    Init,
    /// Idle; the buffer check may start a request
    Ready,
    /// A segment request is in flight
    Waiting,
    /// A fetched segment is being appended to the host buffer
    Appending,
    /// Terminal
    Disposed,
}

impl LoaderState {
    /// Whether moving from `self` to `next` is a legal loader transition.
    pub fn can_transition_to(self, next: LoaderState) -> bool {
        use LoaderState::*;

        match (self, next) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Init, Ready) => true,
            (Ready, Ready) | (Ready, Waiting) => true,
            (Waiting, Appending) => true,
            (Waiting, Ready) | (Appending, Ready) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoaderState::Init => "INIT",
            LoaderState::Ready => "READY",
            LoaderState::Waiting => "WAITING",
            LoaderState::Appending => "APPENDING",
            LoaderState::Disposed => "DISPOSED",
        }
    }
}

impl fmt::Display for LoaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The in-flight request descriptor. Exists exactly while the loader is
/// [`LoaderState::Waiting`] or [`LoaderState::Appending`].
#[derive(Debug, Clone)]
pub struct PendingSegment {
    pub request_id: RequestId,
    /// Index in the playlist, shifted when a live refresh moves the window
    pub media_index: i64,
    /// Fetched only to establish a sync point; never appended
    pub is_sync_request: bool,
    /// Expected start in host media time, unknown for sync requests
    pub start_of_segment: Option<f64>,
    pub timeline: u64,
    pub duration: f64,
    /// Snapshot of the playlist entry, kept in case the playlist is refreshed meanwhile
    pub segment: Segment,
    pub playlist_uri: String,
    pub target_duration: f64,
    pub media_sequence: u64,
    pub token: CancellationToken,
    pub bytes: Option<Bytes>,
    pub byte_length: usize,
    pub end_of_all_requests: Option<Instant>,
}

/// Loader state with the pending segment embedded in the variants that own one.
#[derive(Debug, Default)]
pub(crate) enum Phase {
    #[default]
    Init,
    Ready,
    Waiting(PendingSegment),
    Appending(PendingSegment),
    Disposed,
}

impl Phase {
    pub(crate) fn state(&self) -> LoaderState {
        match self {
            Phase::Init => LoaderState::Init,
            Phase::Ready => LoaderState::Ready,
            Phase::Waiting(_) => LoaderState::Waiting,
            Phase::Appending(_) => LoaderState::Appending,
            Phase::Disposed => LoaderState::Disposed,
        }
    }

    pub(crate) fn pending(&self) -> Option<&PendingSegment> {
        match self {
            Phase::Waiting(pending) | Phase::Appending(pending) => Some(pending),
            _ => None,
        }
    }

    pub(crate) fn pending_mut(&mut self) -> Option<&mut PendingSegment> {
        match self {
            Phase::Waiting(pending) | Phase::Appending(pending) => Some(pending),
            _ => None,
        }
    }

    /// Move to `to`.
    ///
    /// Entering `Waiting` requires a fresh `pending` segment; entering `Appending` carries
    /// the held one along. Any other target releases the held segment, which is returned.
    pub(crate) fn advance(
        &mut self,
        to: LoaderState,
        pending: Option<PendingSegment>,
    ) -> Result<Option<PendingSegment>, PlaybackError> {
        let from = self.state();
        let invalid = PlaybackError::InvalidTransition { from, to };
        if !from.can_transition_to(to) {
            return Err(invalid);
        }

        match to {
            LoaderState::Waiting => {
                let Some(pending) = pending else {
                    return Err(invalid);
                };
                *self = Phase::Waiting(pending);
                Ok(None)
            }
            LoaderState::Appending => match std::mem::take(self) {
                Phase::Waiting(held) => {
                    *self = Phase::Appending(held);
                    Ok(None)
                }
                other => {
                    *self = other;
                    Err(invalid)
                }
            },
            LoaderState::Init | LoaderState::Ready | LoaderState::Disposed => {
                let next = match to {
                    LoaderState::Init => Phase::Init,
                    LoaderState::Ready => Phase::Ready,
                    _ => Phase::Disposed,
                };
                match std::mem::replace(self, next) {
                    Phase::Waiting(held) | Phase::Appending(held) => Ok(Some(held)),
                    _ => Ok(None),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::RequestIdGenerator;
    use rstest::rstest;

    fn pending() -> PendingSegment {
        PendingSegment {
            request_id: RequestIdGenerator::default().next_id(),
            media_index: 0,
            is_sync_request: false,
            start_of_segment: Some(0.0),
            timeline: 0,
            duration: 10.0,
            segment: Segment::new("seg-0.ts", 10.0, 0),
            playlist_uri: "media.m3u8".to_string(),
            target_duration: 10.0,
            media_sequence: 0,
            token: CancellationToken::new(),
            bytes: None,
            byte_length: 0,
            end_of_all_requests: None,
        }
    }

    #[rstest]
    #[case(LoaderState::Init, LoaderState::Ready, true)]
    #[case(LoaderState::Init, LoaderState::Waiting, false)]
    #[case(LoaderState::Ready, LoaderState::Waiting, true)]
    #[case(LoaderState::Ready, LoaderState::Appending, false)]
    #[case(LoaderState::Waiting, LoaderState::Appending, true)]
    #[case(LoaderState::Waiting, LoaderState::Ready, true)]
    #[case(LoaderState::Appending, LoaderState::Ready, true)]
    #[case(LoaderState::Appending, LoaderState::Waiting, false)]
    #[case(LoaderState::Waiting, LoaderState::Disposed, true)]
    #[case(LoaderState::Init, LoaderState::Disposed, true)]
    #[case(LoaderState::Disposed, LoaderState::Ready, false)]
    #[case(LoaderState::Disposed, LoaderState::Disposed, false)]
    fn transition_table(#[case] from: LoaderState, #[case] to: LoaderState, #[case] legal: bool) {
        assert_eq!(from.can_transition_to(to), legal);
    }

    #[test]
    fn pending_travels_with_the_phase() {
        let mut phase = Phase::Ready;
        assert!(phase.pending().is_none());

        phase.advance(LoaderState::Waiting, Some(pending())).unwrap();
        assert_eq!(phase.state(), LoaderState::Waiting);
        assert!(phase.pending().is_some());

        phase.advance(LoaderState::Appending, None).unwrap();
        assert_eq!(phase.state(), LoaderState::Appending);
        assert!(phase.pending().is_some());

        let released = phase.advance(LoaderState::Ready, None).unwrap();
        assert!(released.is_some());
        assert!(phase.pending().is_none());
    }

    #[test]
    fn illegal_transition_keeps_phase() {
        let mut phase = Phase::Init;
        let err = phase.advance(LoaderState::Appending, None).unwrap_err();
        assert!(matches!(
            err,
            PlaybackError::InvalidTransition {
                from: LoaderState::Init,
                to: LoaderState::Appending
            }
        ));
        assert_eq!(phase.state(), LoaderState::Init);

        let mut ready = Phase::Ready;
        assert!(ready.advance(LoaderState::Waiting, None).is_err());
        assert_eq!(ready.state(), LoaderState::Ready);
    }

    #[test]
    fn display_uses_upper_case_names() {
        assert_eq!(LoaderState::Appending.to_string(), "APPENDING");
    }
}
