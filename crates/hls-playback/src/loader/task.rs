use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::SegmentLoader;
use crate::error::PlaybackError;
use crate::fetch::{FetchCompletion, FetchProgress, RequestId, SegmentFetcher, SegmentRequest};
use crate::host::{AppendRequest, SourceBuffer};
use crate::playlist::{Playlist, SyncEvent};

/// Requests accepted by a running [`SegmentLoaderTask`].
#[derive(Debug)]
pub enum LoaderCommand {
    Load,
    Pause,
    SetPlaylist(Playlist),
    Abort,
    ResetEverything,
    Dispose,
}

/// Cloneable front end to a running [`SegmentLoaderTask`].
#[derive(Debug, Clone)]
pub struct LoaderHandle {
    commands: mpsc::Sender<LoaderCommand>,
}

impl LoaderHandle {
    pub async fn send(&self, command: LoaderCommand) -> Result<(), PlaybackError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PlaybackError::ChannelClosed)
    }

    pub async fn load(&self) -> Result<(), PlaybackError> {
        self.send(LoaderCommand::Load).await
    }

    pub async fn pause(&self) -> Result<(), PlaybackError> {
        self.send(LoaderCommand::Pause).await
    }

    pub async fn set_playlist(&self, playlist: Playlist) -> Result<(), PlaybackError> {
        self.send(LoaderCommand::SetPlaylist(playlist)).await
    }

    pub async fn abort(&self) -> Result<(), PlaybackError> {
        self.send(LoaderCommand::Abort).await
    }

    pub async fn reset_everything(&self) -> Result<(), PlaybackError> {
        self.send(LoaderCommand::ResetEverything).await
    }

    pub async fn dispose(&self) -> Result<(), PlaybackError> {
        self.send(LoaderCommand::Dispose).await
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Drives a [`SegmentLoader`]: runs its buffer checks on schedule, performs the fetches
/// and appends it asks for and feeds their results back.
pub struct SegmentLoaderTask {
    loader: SegmentLoader,
    fetcher: Arc<dyn SegmentFetcher>,
    source_buffer: Arc<dyn SourceBuffer>,
    commands: mpsc::Receiver<LoaderCommand>,
    progress: mpsc::UnboundedReceiver<FetchProgress>,
    sync_events: broadcast::Receiver<SyncEvent>,
    token: CancellationToken,
}

impl SegmentLoaderTask {
    pub fn new(
        mut loader: SegmentLoader,
        fetcher: Arc<dyn SegmentFetcher>,
        token: CancellationToken,
    ) -> (Self, LoaderHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (progress_tx, progress) = mpsc::unbounded_channel();
        loader.set_progress_sink(progress_tx);

        let task = Self {
            source_buffer: Arc::clone(&loader.source_buffer),
            sync_events: loader.sync.subscribe(),
            loader,
            fetcher,
            commands,
            progress,
            token,
        };
        (
            task,
            LoaderHandle {
                commands: commands_tx,
            },
        )
    }

    pub async fn run(mut self) {
        let kind = self.loader.config.kind;
        info!(%kind, "Segment loader task started");

        let mut fetches: FuturesUnordered<BoxFuture<'static, FetchCompletion>> =
            FuturesUnordered::new();
        // the host buffer takes one append at a time
        let mut appends: FuturesUnordered<BoxFuture<'static, RequestId>> =
            FuturesUnordered::new();
        let mut queued_appends: VecDeque<AppendRequest> = VecDeque::new();
        let mut sync_open = true;

        loop {
            let next_check = self.loader.next_check_at();

            tokio::select! {
                biased;

                // 1. Cancellation
                _ = self.token.cancelled() => {
                    info!(%kind, "Cancellation token received, stopping segment loader");
                    break;
                }

                // 2. Commands
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        info!(%kind, "All loader handles dropped, stopping segment loader");
                        break;
                    };
                    if self.handle_command(command).is_break() {
                        break;
                    }
                }

                // 3. Fetch progress, drained before the completion it belongs to
                Some(progress) = self.progress.recv() => {
                    self.loader.handle_progress(progress);
                }

                // 4. Finished appends
                Some(request_id) = appends.next(), if !appends.is_empty() => {
                    trace!(%kind, %request_id, "Append finished");
                    if let Some(next) = queued_appends.pop_front() {
                        appends.push(Self::append(Arc::clone(&self.source_buffer), next));
                    }
                    if let Err(err) = self.loader.handle_append_complete(request_id, Instant::now()) {
                        warn!(%kind, error = %err, "Failed to finish append");
                    }
                }

                // 5. Finished fetches
                Some(completion) = fetches.next(), if !fetches.is_empty() => {
                    match self.loader.handle_fetch_completion(completion) {
                        Ok(Some(append)) if appends.is_empty() => {
                            appends.push(Self::append(Arc::clone(&self.source_buffer), append));
                        }
                        Ok(Some(append)) => {
                            debug!(%kind, request_id = %append.request_id, "Host buffer busy, queueing append");
                            queued_appends.push_back(append);
                        }
                        Ok(None) => {}
                        Err(err) => warn!(%kind, error = %err, "Failed to process fetched segment"),
                    }
                }

                // 6. Sync controller notifications
                event = self.sync_events.recv(), if sync_open => {
                    match event {
                        Ok(SyncEvent::TimestampOffset { timeline }) => {
                            if let Err(err) = self.loader.handle_timestamp_offset(timeline, Instant::now()) {
                                warn!(%kind, timeline, error = %err, "Failed to resume after timestamp offset");
                            }
                        }
                        Ok(SyncEvent::SyncInfoUpdate) => self.loader.handle_sync_info_update(),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(%kind, skipped, "Sync events lagged");
                            self.resume_if_offset_known();
                        }
                        Err(RecvError::Closed) => {
                            debug!(%kind, "Sync controller event channel closed");
                            sync_open = false;
                        }
                    }
                }

                // 7. Buffer check
                _ = tokio::time::sleep_until(next_check.unwrap_or_else(Instant::now)), if next_check.is_some() => {
                    match self.loader.monitor_buffer_tick(Instant::now()) {
                        Ok(Some(request)) => {
                            fetches.push(Self::fetch(Arc::clone(&self.fetcher), request));
                        }
                        Ok(None) => {}
                        Err(err) => {
                            error!(%kind, error = %err, "Buffer check failed, pausing loader");
                            self.loader.pause();
                        }
                    }
                }
            }
        }

        self.loader.dispose();
        info!(%kind, "Segment loader task finished");
    }

    fn handle_command(&mut self, command: LoaderCommand) -> std::ops::ControlFlow<()> {
        let kind = self.loader.config.kind;
        let now = Instant::now();
        trace!(%kind, ?command, "Loader command");

        let result = match command {
            LoaderCommand::Load => self.loader.load(now),
            LoaderCommand::Pause => {
                self.loader.pause();
                Ok(())
            }
            LoaderCommand::SetPlaylist(playlist) => self.loader.set_playlist(playlist, now),
            LoaderCommand::Abort => self.loader.abort(now),
            LoaderCommand::ResetEverything => {
                self.loader.reset_everything();
                Ok(())
            }
            LoaderCommand::Dispose => return std::ops::ControlFlow::Break(()),
        };

        if let Err(err) = result {
            warn!(%kind, error = %err, "Loader command failed");
            if matches!(err, PlaybackError::Disposed) {
                return std::ops::ControlFlow::Break(());
            }
        }
        std::ops::ControlFlow::Continue(())
    }

    /// Recover from missed offset announcements.
    fn resume_if_offset_known(&mut self) {
        let Some(timeline) = self.loader.awaiting_timeline() else {
            return;
        };
        if self.loader.sync.timestamp_offset_for_timeline(timeline).is_some()
            && let Err(err) = self.loader.handle_timestamp_offset(timeline, Instant::now())
        {
            warn!(kind = %self.loader.config.kind, timeline, error = %err, "Failed to resume loader");
        }
    }

    fn fetch(
        fetcher: Arc<dyn SegmentFetcher>,
        request: SegmentRequest,
    ) -> BoxFuture<'static, FetchCompletion> {
        async move { fetcher.fetch(request).await }.boxed()
    }

    fn append(
        source_buffer: Arc<dyn SourceBuffer>,
        request: AppendRequest,
    ) -> BoxFuture<'static, RequestId> {
        async move {
            let request_id = request.request_id;
            source_buffer.append(request).await;
            request_id
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::*;
    use crate::config::LoaderConfig;
    use crate::error::FetchError;
    use crate::events::PlaybackEvent;
    use crate::testing::{
        FakeFetcher, FakeHost, FakeResponse, FakeSourceBuffer, FakeSync, init_tracing, playlist,
    };
    use crate::timestamp::TsTimingProbe;

    struct Driver {
        handle: LoaderHandle,
        join: tokio::task::JoinHandle<()>,
        host: Arc<FakeHost>,
        buffer: Arc<FakeSourceBuffer>,
        sync: Arc<FakeSync>,
        fetcher: Arc<FakeFetcher>,
        events: broadcast::Receiver<PlaybackEvent>,
        token: CancellationToken,
    }

    fn spawn(sync: FakeSync) -> Driver {
        init_tracing();
        let host = Arc::new(FakeHost::new());
        let buffer = Arc::new(FakeSourceBuffer::default());
        let sync = Arc::new(sync);
        let fetcher = Arc::new(FakeFetcher::default());
        let (events_tx, events) = broadcast::channel(256);
        let token = CancellationToken::new();

        let loader = SegmentLoader::new(
            LoaderConfig::default(),
            host.clone(),
            buffer.clone(),
            sync.clone(),
            Box::new(TsTimingProbe::new()),
            events_tx,
        );
        let (task, handle) = SegmentLoaderTask::new(loader, fetcher.clone(), token.clone());
        let join = tokio::spawn(task.run());

        Driver {
            handle,
            join,
            host,
            buffer,
            sync,
            fetcher,
            events,
            token,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fills_buffer_until_playlist_end() {
        let driver = spawn(FakeSync::new().with_sync_point(0, 0.0));
        driver
            .handle
            .set_playlist(playlist("media.m3u8", 0, 5, 10.0))
            .await
            .unwrap();
        driver.handle.load().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;

        let appends = driver.buffer.appends();
        assert_eq!(appends.len(), 5);
        assert_eq!(
            appends[4].bytes,
            bytes::Bytes::from_static(b"media.m3u8-seg-4.ts")
        );
        assert_eq!(driver.fetcher.requests().len(), 5);
        assert!(driver.host.seeks().is_empty());

        driver.handle.dispose().await.unwrap();
        driver.join.await.unwrap();
        assert!(driver.handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_reaches_event_stream() {
        let mut driver = spawn(FakeSync::new().with_sync_point(0, 0.0));
        driver
            .handle
            .set_playlist(playlist("media.m3u8", 0, 1, 10.0))
            .await
            .unwrap();
        driver.handle.load().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut saw_request_progress = false;
        let mut saw_append_progress = false;
        while let Ok(event) = driver.events.try_recv() {
            match event {
                PlaybackEvent::Progress {
                    request_id: Some(_),
                } => saw_request_progress = true,
                PlaybackEvent::Progress { request_id: None } => saw_append_progress = true,
                _ => {}
            }
        }
        assert!(saw_request_progress);
        assert!(saw_append_progress);
        driver.token.cancel();
        driver.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_when_timestamp_offset_is_announced() {
        let driver = spawn(FakeSync::new().with_sync_point(0, 0.0));
        let mut live = playlist("live.m3u8", 0, 3, 10.0);
        for segment in &mut live.segments {
            segment.timeline = 2;
        }
        driver.handle.set_playlist(live).await.unwrap();
        driver.handle.load().await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(driver.fetcher.requests().is_empty());

        driver.sync.set_timestamp_offset(2, 0.0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(driver.fetcher.requests().len(), 3);
        assert!(driver.buffer.appends().iter().all(|append| append.timeline == 2));

        driver.token.cancel();
        driver.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_in_flight_request() {
        let driver = spawn(FakeSync::new().with_sync_point(0, 0.0));
        driver.fetcher.push_response(FakeResponse::Hang);
        driver
            .handle
            .set_playlist(playlist("media.m3u8", 0, 5, 10.0))
            .await
            .unwrap();
        driver.handle.load().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let requests = driver.fetcher.requests();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].token.is_cancelled());

        driver.token.cancel();
        driver.join.await.unwrap();
        assert!(requests[0].token.is_cancelled());
        assert!(driver.handle.load().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_fetch_error_pauses_loading() {
        let mut driver = spawn(FakeSync::new().with_sync_point(0, 0.0));
        driver
            .fetcher
            .push_response(FakeResponse::Error(FetchError::http_status(
                500,
                "media.m3u8-seg-0.ts",
            )));
        driver
            .handle
            .set_playlist(playlist("media.m3u8", 0, 5, 10.0))
            .await
            .unwrap();
        driver.handle.load().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(driver.fetcher.requests().len(), 1);
        assert!(driver.buffer.appends().is_empty());

        let mut errors = 0;
        while let Ok(event) = driver.events.try_recv() {
            if matches!(event, PlaybackEvent::Error { media_index: 0, .. }) {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);

        // loading again retries from where it stopped
        driver.handle.load().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(driver.buffer.appends().len(), 5);

        driver.token.cancel();
        driver.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fetched_payload_is_appended_unchanged() {
        let driver = spawn(FakeSync::new().with_sync_point(0, 0.0));
        let payload = bytes::Bytes::from_static(b"scripted segment body");
        driver
            .fetcher
            .push_response(FakeResponse::Bytes(payload.clone()));
        driver
            .handle
            .set_playlist(playlist("media.m3u8", 0, 2, 10.0))
            .await
            .unwrap();
        driver.handle.load().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let appends = driver.buffer.appends();
        assert_eq!(appends.len(), 2);
        assert_eq!(appends[0].bytes, payload);
        assert_eq!(
            appends[1].bytes,
            bytes::Bytes::from_static(b"media.m3u8-seg-1.ts")
        );

        driver.token.cancel();
        driver.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_sync_info_updates() {
        let mut driver = spawn(FakeSync::new().with_sync_point(0, 0.0));
        tokio::time::sleep(Duration::from_millis(10)).await;

        driver.sync.announce_sync_info();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut updates = 0;
        while let Ok(event) = driver.events.try_recv() {
            if event == PlaybackEvent::SyncInfoUpdate {
                updates += 1;
            }
        }
        assert_eq!(updates, 1);

        driver.token.cancel();
        driver.join.await.unwrap();
    }
}
