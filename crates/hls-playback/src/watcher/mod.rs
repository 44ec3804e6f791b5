//! Stall detection and recovery.
//!
//! [`PlaybackWatcher`] polls the host playhead and reacts to host `waiting` notifications,
//! repairing bad seeks, live window fallout, video underflow and small buffer gaps.
//! Like the loader it is synchronous; [`PlaybackWatcherTask`] drives the poll, the host
//! events and the gap skip timer.

mod task;

pub use task::PlaybackWatcherTask;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::WatcherConfig;
use crate::events::PlaybackEvent;
use crate::host::{HostEvent, MediaHost};
use crate::ranges::{TimeRange, TimeRanges};

/// A scheduled seek over the gap ahead of the playhead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapSkipTimer {
    pub fire_at: Instant,
    /// Playhead position when the timer was armed; the skip only happens if playback
    /// is still stuck there
    pub scheduled_time: f64,
}

pub struct PlaybackWatcher {
    config: WatcherConfig,
    host: Arc<dyn MediaHost>,
    events: broadcast::Sender<PlaybackEvent>,

    consecutive_updates: u32,
    last_recorded_time: Option<f64>,
    gap_timer: Option<GapSkipTimer>,
    disposed: bool,
}

impl PlaybackWatcher {
    pub fn new(
        config: WatcherConfig,
        host: Arc<dyn MediaHost>,
        events: broadcast::Sender<PlaybackEvent>,
    ) -> Self {
        debug!("Playback watcher initialized");
        Self {
            config,
            host,
            events,
            consecutive_updates: 0,
            last_recorded_time: None,
            gap_timer: None,
            disposed: false,
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn consecutive_updates(&self) -> u32 {
        self.consecutive_updates
    }

    pub fn last_recorded_time(&self) -> Option<f64> {
        self.last_recorded_time
    }

    pub fn gap_timer(&self) -> Option<GapSkipTimer> {
        self.gap_timer
    }

    /// When the armed gap skip should run.
    pub fn next_gap_skip_at(&self) -> Option<Instant> {
        self.gap_timer.map(|timer| timer.fire_at)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// One poll of the playhead. Emulates the host `waiting` notification for hosts that
    /// stall silently.
    pub fn check_current_time(&mut self, now: Instant) {
        if self.disposed {
            return;
        }

        if self.host.seeking() && self.fixes_bad_seeks() {
            self.consecutive_updates = 0;
            self.last_recorded_time = Some(self.host.current_time());
            return;
        }

        if self.host.paused() || self.host.seeking() {
            return;
        }

        let current_time = self.host.current_time();
        let buffered = self.host.buffered();

        // sitting on the final buffered edge is plain buffering, not a stall
        if let Some(end) = buffered.end()
            && current_time + self.config.buffer_end_tolerance >= end
        {
            return;
        }

        let unchanged = self.last_recorded_time == Some(current_time);
        if unchanged && self.consecutive_updates >= self.config.stall_threshold {
            self.consecutive_updates += 1;
            trace!(
                current_time,
                consecutive_updates = self.consecutive_updates,
                "Playhead has not moved"
            );
            self.waiting(now);
        } else if unchanged {
            self.consecutive_updates += 1;
        } else {
            self.consecutive_updates = 0;
            self.last_recorded_time = Some(current_time);
        }
    }

    /// React to a host notification.
    pub fn handle_host_event(&mut self, event: HostEvent, now: Instant) {
        if self.disposed {
            return;
        }

        trace!(?event, "Host event");
        match event {
            HostEvent::Waiting => {
                self.tech_waiting(now);
            }
            HostEvent::SeekableChanged => {
                self.fixes_bad_seeks();
            }
            event if event.cancels_stall_timer() => self.cancel_timer(),
            _ => {}
        }
    }

    /// Reset stall counting and disarm the gap skip timer.
    pub fn cancel_timer(&mut self) {
        self.consecutive_updates = 0;
        if let Some(timer) = self.gap_timer.take() {
            debug!(scheduled_time = timer.scheduled_time, "Gap skip timer cancelled");
        }
    }

    /// Move a seek that landed outside the seekable window to the window's end.
    ///
    /// Returns whether a corrective seek was issued.
    pub fn fixes_bad_seeks(&mut self) -> bool {
        if self.disposed || !self.host.seeking() {
            return false;
        }

        let seekable = self.host.seekable();
        let current_time = self.host.current_time();
        if !self.outside_of_seekable_window(&seekable, current_time) {
            return false;
        }
        let Some(seekable_end) = seekable.end() else {
            return false;
        };

        warn!(
            current_time,
            seekable = %seekable,
            seekable_end,
            "Seek outside of seekable window, seeking to seekable end"
        );
        self.host.set_current_time(seekable_end);
        true
    }

    /// Stall handling shared by the poll and the host `waiting` notification.
    ///
    /// Returns `true` when the situation is handled or needs no action, `false` when no
    /// check applied.
    pub fn tech_waiting(&mut self, now: Instant) -> bool {
        if self.disposed {
            return true;
        }

        if self.host.seeking() && self.fixes_bad_seeks() {
            return true;
        }

        if self.host.seeking() || self.gap_timer.is_some() {
            return true;
        }

        let seekable = self.host.seekable();
        let current_time = self.host.current_time();

        if Self::fell_out_of_live_window(&seekable, current_time)
            && let Some(live_point) = seekable.end()
        {
            warn!(
                current_time,
                live_point,
                seekable = %seekable,
                "Fell out of live window, seeking to live point"
            );
            self.cancel_timer();
            self.host.set_current_time(live_point);
            self.emit(PlaybackEvent::LiveResync {
                from: current_time,
                to: live_point,
            });
            return true;
        }

        let buffered = self.host.buffered();
        let next_range = buffered.find_next_range(current_time);

        if next_range.is_none()
            && let Some(gap) = self.gap_from_video_underflow(&buffered, current_time)
        {
            // audio played past the gap video is stuck in; reseek so video catches up
            info!(
                current_time,
                gap_start = gap.start,
                gap_end = gap.end,
                "Video underflow in gap, seeking to current time"
            );
            self.cancel_timer();
            self.host.set_current_time(current_time);
            self.emit(PlaybackEvent::VideoUnderflow {
                current_time,
                gap_start: gap.start,
                gap_end: gap.end,
            });
            return true;
        }

        if let Some(next) = next_range {
            let difference = next.start - current_time;
            let Some(fire_at) = Duration::try_from_secs_f64(difference)
                .ok()
                .and_then(|delay| now.checked_add(delay))
            else {
                warn!(
                    current_time,
                    next_start = next.start,
                    difference,
                    "Gap before buffered range cannot be timed, not scheduling gap skip"
                );
                return false;
            };
            info!(
                current_time,
                next_start = next.start,
                difference,
                "Stopped before buffered range, scheduling gap skip"
            );
            self.gap_timer = Some(GapSkipTimer {
                fire_at,
                scheduled_time: current_time,
            });
            return true;
        }

        false
    }

    /// Stall detected by the poll: the host checks first, then a last resort nudge.
    fn waiting(&mut self, now: Instant) {
        if self.tech_waiting(now) {
            return;
        }

        let current_time = self.host.current_time();
        let buffered = self.host.buffered();
        let Some(range) = buffered.find_range(current_time) else {
            return;
        };

        // stuck inside buffered media for no visible reason; seeking in place usually
        // restarts the host
        if current_time <= range.end - self.config.min_forward_buffer {
            info!(
                current_time,
                range_start = range.start,
                range_end = range.end,
                "Stalled inside buffered range, seeking to current time"
            );
            self.cancel_timer();
            self.host.set_current_time(current_time);
            self.emit(PlaybackEvent::UnknownWaiting { current_time });
        }
    }

    /// Gap skip timer callback. Seeks into the next buffered range if the playhead has
    /// not moved since the timer was armed.
    pub fn skip_the_gap(&mut self) {
        let Some(timer) = self.gap_timer else {
            return;
        };
        self.cancel_timer();
        if self.disposed {
            return;
        }

        let current_time = self.host.current_time();
        let buffered = self.host.buffered();
        let Some(next) = buffered.find_next_range(current_time) else {
            return;
        };
        if current_time != timer.scheduled_time {
            trace!(
                current_time,
                scheduled_time = timer.scheduled_time,
                "Playback moved on, gap skip not needed"
            );
            return;
        }

        let target = next.start + self.config.time_fudge_factor;
        info!(
            current_time,
            scheduled_time = timer.scheduled_time,
            next_start = next.start,
            target,
            "Skipping gap"
        );
        self.host.set_current_time(target);
    }

    /// Stop reacting. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.cancel_timer();
        self.disposed = true;
        debug!("Playback watcher disposed");
    }

    fn outside_of_seekable_window(&self, seekable: &TimeRanges, current_time: f64) -> bool {
        let (Some(start), Some(end)) = (seekable.start(), seekable.end()) else {
            return false;
        };
        let tolerance = self.config.seekable_tolerance;
        current_time < start - tolerance || current_time > end + tolerance
    }

    /// A start above zero marks a live window; VOD windows start at zero.
    fn fell_out_of_live_window(seekable: &TimeRanges, current_time: f64) -> bool {
        seekable
            .start()
            .is_some_and(|start| start > 0.0 && current_time < start)
    }

    /// A gap starting a few seconds behind the playhead, left when audio kept playing
    /// after video ran out.
    fn gap_from_video_underflow(
        &self,
        buffered: &TimeRanges,
        current_time: f64,
    ) -> Option<TimeRange> {
        let (low, high) = self.config.underflow_window;
        buffered.find_gaps().iter().copied().find(|gap| {
            let behind = current_time - gap.start;
            behind > low && behind < high
        })
    }

    fn emit(&self, event: PlaybackEvent) {
        trace!(event = event.name(), "Emitting event");
        let _ = self.events.send(event);
    }
}
