//! Wiring of a loader and a watcher onto one host.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::PlaybackConfig;
use crate::error::PlaybackError;
use crate::events::PlaybackEvent;
use crate::fetch::SegmentFetcher;
use crate::host::{MediaHost, SourceBuffer};
use crate::loader::{LoaderHandle, SegmentLoader, SegmentLoaderTask};
use crate::playlist::SyncController;
use crate::timestamp::TimingProbe;
use crate::watcher::{PlaybackWatcher, PlaybackWatcherTask};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A running segment loader and playback watcher sharing one event stream.
pub struct PlaybackSession {
    loader: LoaderHandle,
    events: broadcast::Sender<PlaybackEvent>,
    token: CancellationToken,
    loader_handle: JoinHandle<()>,
    watcher_handle: JoinHandle<()>,
}

impl PlaybackSession {
    /// Validate `config` and spawn both tasks on the current runtime.
    ///
    /// Cancelling `token` stops the session just like [`PlaybackSession::shutdown`].
    pub fn spawn(
        config: PlaybackConfig,
        host: Arc<dyn MediaHost>,
        source_buffer: Arc<dyn SourceBuffer>,
        sync: Arc<dyn SyncController>,
        fetcher: Arc<dyn SegmentFetcher>,
        probe: Box<dyn TimingProbe>,
        token: CancellationToken,
    ) -> Result<Self, PlaybackError> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let token_for_loader = token.child_token();
        let token_for_watcher = token.child_token();

        let loader = SegmentLoader::new(
            config.loader_config.clone(),
            Arc::clone(&host),
            source_buffer,
            sync,
            probe,
            events.clone(),
        );
        let (loader_task, loader) = SegmentLoaderTask::new(loader, fetcher, token_for_loader);

        let watcher = PlaybackWatcher::new(config.watcher_config.clone(), host, events.clone());
        let watcher_task = PlaybackWatcherTask::new(watcher, token_for_watcher);

        let loader_handle = tokio::spawn(async move {
            loader_task.run().await;
            debug!("Segment loader task exited.");
        });
        let watcher_handle = tokio::spawn(async move {
            watcher_task.run().await;
            debug!("Playback watcher task exited.");
        });

        info!(kind = %config.loader_config.kind, "Playback session started");
        Ok(Self {
            loader,
            events,
            token,
            loader_handle,
            watcher_handle,
        })
    }

    /// Command handle of the segment loader.
    pub fn loader(&self) -> &LoaderHandle {
        &self.loader
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    /// Cancel both tasks and wait for them to dispose their components.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.loader_handle.await {
            error!(error = %e, "Segment loader task panicked");
        }
        if let Err(e) = self.watcher_handle.await {
            error!(error = %e, "Playback watcher task panicked");
        }
        info!("Playback session stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::WatcherConfig;
    use crate::host::HostEvent;
    use crate::testing::{
        FakeFetcher, FakeHost, FakeSourceBuffer, FakeSync, init_tracing, playlist,
    };
    use crate::timestamp::TsTimingProbe;

    struct Fakes {
        host: Arc<FakeHost>,
        buffer: Arc<FakeSourceBuffer>,
        fetcher: Arc<FakeFetcher>,
    }

    fn spawn(
        config: PlaybackConfig,
        token: CancellationToken,
    ) -> (Result<PlaybackSession, PlaybackError>, Fakes) {
        init_tracing();
        let fakes = Fakes {
            host: Arc::new(FakeHost::new()),
            buffer: Arc::new(FakeSourceBuffer::default()),
            fetcher: Arc::new(FakeFetcher::default()),
        };
        let session = PlaybackSession::spawn(
            config,
            fakes.host.clone(),
            fakes.buffer.clone(),
            Arc::new(FakeSync::new().with_sync_point(0, 0.0)),
            fakes.fetcher.clone(),
            Box::new(TsTimingProbe::new()),
            token,
        );
        (session, fakes)
    }

    #[tokio::test(start_paused = true)]
    async fn session_loads_and_watches() {
        let (session, fakes) = spawn(PlaybackConfig::default(), CancellationToken::new());
        let session = session.unwrap();
        let mut events = session.subscribe();

        fakes.host.set_time(2.0);
        fakes.host.set_buffered(&[(0.0, 10.0)]);
        session
            .loader()
            .set_playlist(playlist("media.m3u8", 0, 3, 10.0))
            .await
            .unwrap();
        session.loader().load().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(fakes.buffer.appends().len(), 3);
        assert_eq!(fakes.fetcher.requests().len(), 3);

        // the host never moved, so the watcher nudged it
        assert_eq!(fakes.host.seeks(), vec![2.0]);

        let mut unknown_waiting = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PlaybackEvent::UnknownWaiting { .. }) {
                unknown_waiting += 1;
            }
        }
        assert_eq!(unknown_waiting, 1);

        session.shutdown().await;
        assert_eq!(fakes.host.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_token_stops_the_session() {
        let token = CancellationToken::new();
        let (session, fakes) = spawn(PlaybackConfig::default(), token.clone());
        let session = session.unwrap();

        token.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.loader().load().await.is_err());
        fakes.host.emit(HostEvent::Waiting);
        assert_eq!(fakes.host.subscriber_count(), 0);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = PlaybackConfig {
            watcher_config: WatcherConfig {
                underflow_window: (4.0, 2.0),
                ..WatcherConfig::default()
            },
            ..PlaybackConfig::default()
        };
        let (session, _fakes) = spawn(config, CancellationToken::new());
        assert!(matches!(session, Err(PlaybackError::Configuration { .. })));
    }
}
