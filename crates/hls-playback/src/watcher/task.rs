use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::PlaybackWatcher;
use crate::host::HostEvent;

/// Drives a [`PlaybackWatcher`]: the periodic playhead poll, host notifications and the
/// gap skip timer, all on one task.
pub struct PlaybackWatcherTask {
    watcher: PlaybackWatcher,
    host_events: broadcast::Receiver<HostEvent>,
    token: CancellationToken,
}

impl PlaybackWatcherTask {
    /// Subscribes to host events immediately so nothing emitted after construction is
    /// missed.
    pub fn new(watcher: PlaybackWatcher, token: CancellationToken) -> Self {
        let host_events = watcher.host.subscribe();
        Self {
            watcher,
            host_events,
            token,
        }
    }

    pub async fn run(mut self) {
        info!("Playback watcher task started");

        let mut poll = tokio::time::interval(self.watcher.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut host_open = true;

        loop {
            let gap_skip_at = self.watcher.next_gap_skip_at();

            tokio::select! {
                biased;

                // 1. Cancellation
                _ = self.token.cancelled() => {
                    info!("Cancellation token received, stopping playback watcher");
                    break;
                }

                // 2. Host notifications
                event = self.host_events.recv(), if host_open => {
                    match event {
                        Ok(event) => self.watcher.handle_host_event(event, Instant::now()),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Host events lagged");
                        }
                        Err(RecvError::Closed) => {
                            debug!("Host event channel closed");
                            host_open = false;
                        }
                    }
                }

                // 3. Gap skip timer
                _ = tokio::time::sleep_until(gap_skip_at.unwrap_or_else(Instant::now)), if gap_skip_at.is_some() => {
                    self.watcher.skip_the_gap();
                }

                // 4. Playhead poll
                _ = poll.tick() => {
                    self.watcher.check_current_time(Instant::now());
                }
            }
        }

        self.watcher.dispose();
        info!("Playback watcher task finished");
    }
}
