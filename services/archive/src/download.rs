use crate::error::{ArchiveError, Result};
use crate::locator::RecordingLocator;
use crate::progress::{self, Progress, ProgressFn};
use crate::remux::{remux_files, RemuxSummary};
use crate::scratch::ScratchDir;
use crate::segment::{MediaExt, SegmentKey, SegmentName};
use crate::store::ObjectStore;
use crate::timeline::{TimeWindow, TimelineQuery};
use crate::zone::ArchiveZone;
use bytes::Bytes;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Container shared by every segment of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    Ts,
    Fmp4,
}

/// What a finished download produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadOutcome {
    /// TS segments concatenated into the sink.
    Streamed { segments: usize, bytes: u64 },
    /// fMP4 segments merged into `path` and copied to the sink. `path` is
    /// removed from scratch once the copy completes.
    Merged {
        path: PathBuf,
        segments: usize,
        bytes: u64,
        summary: RemuxSummary,
    },
}

/// Handle to a download running in the background.
pub struct DownloadJob {
    pub job_id: Uuid,
    pub progress: mpsc::UnboundedReceiver<Progress>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<PathBuf>>,
}

pub struct Downloader {
    query: TimelineQuery,
    scratch: Arc<ScratchDir>,
    max_window: Duration,
}

impl Downloader {
    pub fn new(query: TimelineQuery, scratch: Arc<ScratchDir>, max_window: Duration) -> Self {
        Self {
            query,
            scratch,
            max_window,
        }
    }

    fn store(&self) -> &dyn ObjectStore {
        self.query.store().as_ref()
    }

    /// Resolve the window and write its recording into `sink`.
    ///
    /// Progress events are `(n + 1, i, key)` for each of the `n` segments,
    /// followed by a final `(n + 1, n + 1, output)` event whose id is the
    /// merged file path, or empty for streamed TS.
    #[instrument(skip(self, sink, progress, cancel), fields(locator = %locator, start_ms = window.start_ms(), end_ms = window.end_ms()))]
    pub async fn download_window<W>(
        &self,
        locator: &RecordingLocator,
        window: TimeWindow,
        sink: &mut W,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let (segments, container) = self.resolve(locator, window, cancel).await?;
        let total = segments.len() + 1;

        match container {
            Container::Ts => {
                let bytes = self.stream_segments(&segments, sink, total, &progress, cancel).await?;
                sink.flush().await?;
                progress(Progress::ok(total, total, ""));
                info!(segments = segments.len(), bytes, "Streamed TS window");
                Ok(DownloadOutcome::Streamed {
                    segments: segments.len(),
                    bytes,
                })
            }
            Container::Fmp4 => {
                let job_dir = self.scratch.job_dir(Uuid::new_v4()).await?;
                let (path, summary) = self
                    .merge_segments(&segments, window, &job_dir, total, &progress, cancel)
                    .await?;

                let copied = async {
                    let mut merged = tokio::fs::File::open(&path).await?;
                    let bytes = tokio::io::copy(&mut merged, sink).await?;
                    sink.flush().await?;
                    Ok::<_, std::io::Error>(bytes)
                }
                .await;
                // The sink owns the result; nothing of this job stays in scratch.
                remove_job_dir(&job_dir).await;
                let bytes = copied?;
                progress(Progress::ok(total, total, path.display().to_string()));
                Ok(DownloadOutcome::Merged {
                    path,
                    segments: segments.len(),
                    bytes,
                    summary,
                })
            }
        }
    }

    /// Run a download into the scratch directory as a background task.
    ///
    /// The job's output file stays in its scratch directory until the
    /// sweeper removes it. The final progress event carries its path.
    pub fn spawn_download(self: Arc<Self>, locator: RecordingLocator, window: TimeWindow) -> DownloadJob {
        let job_id = Uuid::new_v4();
        let (report, rx) = progress::channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let result = self.run_job(job_id, &locator, window, &report, &token).await;
            if let Err(e) = &result {
                warn!(job_id = %job_id, error = %e, "Download job failed");
                report(Progress::failed(0, 0, job_id.to_string(), e));
            }
            result
        });

        DownloadJob {
            job_id,
            progress: rx,
            cancel,
            handle,
        }
    }

    async fn run_job(
        &self,
        job_id: Uuid,
        locator: &RecordingLocator,
        window: TimeWindow,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let (segments, container) = self.resolve(locator, window, cancel).await?;
        let total = segments.len() + 1;
        let job_dir = self.scratch.job_dir(job_id).await?;

        let path = match container {
            Container::Ts => {
                let path = job_dir.join(output_name(window, "ts"));
                let mut file = tokio::fs::File::create(&path).await?;
                match self.stream_segments(&segments, &mut file, total, progress, cancel).await {
                    Ok(_) => file.flush().await?,
                    Err(e) => {
                        drop(file);
                        remove_quietly(&path).await;
                        return Err(e);
                    }
                }
                path
            }
            Container::Fmp4 => {
                self.merge_segments(&segments, window, &job_dir, total, progress, cancel)
                    .await?
                    .0
            }
        };

        progress(Progress::ok(total, total, path.display().to_string()));
        info!(job_id = %job_id, output = %path.display(), "Download job finished");
        Ok(path)
    }

    /// Ordered segments of the window, all of one container.
    async fn resolve(
        &self,
        locator: &RecordingLocator,
        window: TimeWindow,
        cancel: &CancellationToken,
    ) -> Result<(Vec<SegmentKey>, Container)> {
        let max_ms = i64::try_from(self.max_window.as_millis()).unwrap_or(i64::MAX);
        if window.duration_ms() > max_ms {
            return Err(ArchiveError::InvalidWindow(format!(
                "window of {} ms exceeds the {} s download limit",
                window.duration_ms(),
                self.max_window.as_secs()
            )));
        }

        let set = self.query.segments_cancellable(locator, window, cancel).await?;
        if set.is_empty() {
            return Err(ArchiveError::NoRecordings);
        }
        let container = container_of(&set.segments)?;
        debug!(segments = set.segments.len(), ?container, "Resolved download window");
        Ok((set.segments, container))
    }

    /// Copy each segment's body into `sink` in order.
    async fn stream_segments<W>(
        &self,
        segments: &[SegmentKey],
        sink: &mut W,
        total: usize,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut written = 0u64;
        for (i, segment) in segments.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let mut body = self.store().get_object(segment.key()).await?;
            let copied = tokio::io::copy(&mut body, sink).await?;
            written += copied;
            metrics::counter!("archive.download.bytes").increment(copied);
            progress(Progress::ok(total, i + 1, segment.key()));
        }
        Ok(written)
    }

    /// Fetch every segment into `job_dir` and remux them into one file.
    ///
    /// The per-segment inputs are removed whether or not the merge worked;
    /// a partial output is removed on failure.
    async fn merge_segments(
        &self,
        segments: &[SegmentKey],
        window: TimeWindow,
        job_dir: &Path,
        total: usize,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, RemuxSummary)> {
        let mut inputs = Vec::with_capacity(segments.len());
        let result = self
            .fetch_and_remux(segments, window, job_dir, total, progress, cancel, &mut inputs)
            .await;

        for (path, _) in &inputs {
            remove_quietly(path).await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_and_remux(
        &self,
        segments: &[SegmentKey],
        window: TimeWindow,
        job_dir: &Path,
        total: usize,
        progress: &ProgressFn,
        cancel: &CancellationToken,
        inputs: &mut Vec<(PathBuf, i64)>,
    ) -> Result<(PathBuf, RemuxSummary)> {
        for (i, segment) in segments.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let path = job_dir.join(format!("{i}.m4s"));
            inputs.push((path.clone(), segment.duration_ms()));

            let mut body = self.store().get_object(segment.key()).await?;
            let mut file = tokio::fs::File::create(&path).await?;
            let copied = tokio::io::copy(&mut body, &mut file).await?;
            file.flush().await?;
            metrics::counter!("archive.download.bytes").increment(copied);
            progress(Progress::ok(total, i + 1, segment.key()));
        }

        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let output = job_dir.join(output_name(window, "mp4"));
        let remux_inputs = inputs.clone();
        let remux_output = output.clone();
        let outcome = tokio::task::spawn_blocking(move || remux_files(&remux_inputs, &remux_output))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        match outcome {
            Ok(summary) => Ok((output, summary)),
            Err(e) => {
                remove_quietly(&output).await;
                Err(e)
            }
        }
    }
}

/// Store one segment under its canonical key and return that key.
#[instrument(skip(store, body), fields(locator = %locator, name = %name.file_name()))]
pub async fn import_segment(
    store: &dyn ObjectStore,
    locator: &RecordingLocator,
    name: SegmentName,
    body: Bytes,
    zone: ArchiveZone,
) -> Result<String> {
    let key = SegmentKey::for_locator(locator, name, zone).into_key();
    store.put_object(&key, body).await?;
    debug!(key = %key, "Imported segment");
    Ok(key)
}

fn container_of(segments: &[SegmentKey]) -> Result<Container> {
    let ts = segments.iter().filter(|s| s.ext() == MediaExt::Ts).count();
    if ts == segments.len() {
        Ok(Container::Ts)
    } else if ts == 0 {
        Ok(Container::Fmp4)
    } else {
        Err(ArchiveError::UnsupportedMixedFormat)
    }
}

fn output_name(window: TimeWindow, ext: &str) -> String {
    format!("{}_{}_out.{ext}", window.start_ms(), window.end_ms())
}

async fn remove_job_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %dir.display(), error = %e, "Failed to remove scratch job directory");
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remux::fixtures::{input, parse_output, track_times, traf, video};
    use crate::segment::StartEncoding;
    use crate::store::memory::InMemoryStore;
    use chrono::NaiveDate;

    const MIDNIGHT_UTC: i64 = 1_717_804_800_000; // 2024-06-08T00:00:00Z

    fn utc() -> ArchiveZone {
        ArchiveZone::utc()
    }

    fn locator() -> RecordingLocator {
        RecordingLocator::new("r", "dev", "1").unwrap()
    }

    fn downloader(store: Arc<InMemoryStore>, scratch: &Path) -> Downloader {
        let query = TimelineQuery::new(store, utc());
        Downloader::new(
            query,
            Arc::new(ScratchDir::new(scratch, Duration::from_secs(3600))),
            Duration::from_secs(3 * 24 * 3600),
        )
    }

    fn key(start_ms: i64, duration_ms: i64, ext: &str) -> String {
        format!("r/dev/1/20240608/{start_ms}-{duration_ms}.{ext}")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Progress>) -> Vec<Progress> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        for job in std::fs::read_dir(dir).unwrap() {
            for file in std::fs::read_dir(job.unwrap().path()).unwrap() {
                names.push(file.unwrap().file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_ts_window_streams_in_order() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(key(MIDNIGHT_UTC + 4000, 2000, "ts"), "second|");
        store.insert(key(MIDNIGHT_UTC + 2000, 2000, "ts"), "first|");
        store.insert(key(MIDNIGHT_UTC + 60_000, 2000, "ts"), "outside");
        let tmp = tempfile::tempdir().unwrap();

        let (report, mut rx) = progress::channel();
        let mut sink = Vec::new();
        let outcome = downloader(store, tmp.path())
            .download_window(
                &locator(),
                TimeWindow::new(MIDNIGHT_UTC + 2000, MIDNIGHT_UTC + 5000),
                &mut sink,
                report,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(sink, b"first|second|");
        assert_eq!(outcome, DownloadOutcome::Streamed { segments: 2, bytes: 13 });

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.total == 3 && !e.is_error()));
        assert_eq!(events[0].id, key(MIDNIGHT_UTC + 2000, 2000, "ts"));
        assert_eq!(events[2].current, 3);
    }

    #[tokio::test]
    async fn test_mixed_window_rejected_before_fetch() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(key(MIDNIGHT_UTC + 2000, 2000, "ts"), "a");
        store.insert(key(MIDNIGHT_UTC + 4000, 2000, "m4s"), "b");
        let tmp = tempfile::tempdir().unwrap();

        let mut sink = Vec::new();
        let err = downloader(store, tmp.path())
            .download_window(
                &locator(),
                TimeWindow::new(MIDNIGHT_UTC + 2000, MIDNIGHT_UTC + 5000),
                &mut sink,
                progress::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::UnsupportedMixedFormat));
        assert!(sink.is_empty());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_window_is_no_recordings() {
        let store = Arc::new(InMemoryStore::new());
        let tmp = tempfile::tempdir().unwrap();

        let err = downloader(store, tmp.path())
            .download_window(
                &locator(),
                TimeWindow::new(MIDNIGHT_UTC + 2000, MIDNIGHT_UTC + 5000),
                &mut Vec::new(),
                progress::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NoRecordings));
    }

    #[tokio::test]
    async fn test_window_over_limit_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let tmp = tempfile::tempdir().unwrap();
        let d = downloader(store.clone(), tmp.path());

        let err = d
            .download_window(
                &locator(),
                TimeWindow::new(MIDNIGHT_UTC, MIDNIGHT_UTC + 4 * 24 * 3_600_000),
                &mut Vec::new(),
                progress::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidWindow(_)));
        assert_eq!(store.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_fmp4_window_merged() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(
            key(MIDNIGHT_UTC + 2000, 2000, "m4s"),
            input(&video(), vec![vec![traf(1, 500, &[90_000, 90_000])]]),
        );
        store.insert(
            key(MIDNIGHT_UTC + 4000, 2000, "m4s"),
            input(&video(), vec![vec![traf(1, 7_000, &[90_000, 90_000])]]),
        );
        let tmp = tempfile::tempdir().unwrap();

        let (report, mut rx) = progress::channel();
        let mut sink = Vec::new();
        let outcome = downloader(store, tmp.path())
            .download_window(
                &locator(),
                TimeWindow::new(MIDNIGHT_UTC + 2000, MIDNIGHT_UTC + 5000),
                &mut sink,
                report,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let DownloadOutcome::Merged { path, segments, bytes, summary } = outcome else {
            panic!("expected a merged download");
        };
        assert_eq!(segments, 2);
        assert_eq!(summary.inputs, 2);
        assert_eq!(bytes, sink.len() as u64);
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("{}_{}_out.mp4", MIDNIGHT_UTC + 2000, MIDNIGHT_UTC + 5000)
        );
        assert_eq!(track_times(&parse_output(&sink), 1), vec![0, 180_000]);

        // Copied to the sink, so the merged file and its job dir are gone.
        assert!(!path.exists());
        assert!(files_in(tmp.path()).is_empty());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);

        let events = drain(&mut rx);
        let last = events.last().unwrap();
        assert_eq!((last.total, last.current), (3, 3));
        assert_eq!(last.id, path.display().to_string());
    }

    #[tokio::test]
    async fn test_corrupt_fragment_cleans_scratch() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(
            key(MIDNIGHT_UTC + 2000, 2000, "m4s"),
            input(&video(), vec![vec![traf(1, 0, &[90_000])]]),
        );
        let mut broken = input(&video(), vec![vec![traf(1, 0, &[90_000])]]);
        broken.truncate(broken.len() - 5);
        store.insert(key(MIDNIGHT_UTC + 4000, 2000, "m4s"), broken);
        let tmp = tempfile::tempdir().unwrap();

        let err = downloader(store, tmp.path())
            .download_window(
                &locator(),
                TimeWindow::new(MIDNIGHT_UTC + 2000, MIDNIGHT_UTC + 5000),
                &mut Vec::new(),
                progress::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::RemuxCorruption { input: 1, .. }));
        assert!(files_in(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_download() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(key(MIDNIGHT_UTC + 2000, 2000, "ts"), "a");
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = downloader(store, tmp.path())
            .download_window(
                &locator(),
                TimeWindow::new(MIDNIGHT_UTC + 2000, MIDNIGHT_UTC + 5000),
                &mut Vec::new(),
                progress::noop(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
    }

    #[tokio::test]
    async fn test_spawned_job_reports_output_path() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(key(MIDNIGHT_UTC + 2000, 2000, "ts"), "abc");
        store.insert(key(MIDNIGHT_UTC + 4000, 2000, "ts"), "def");
        let tmp = tempfile::tempdir().unwrap();

        let d = Arc::new(downloader(store, tmp.path()));
        let mut job = d.spawn_download(
            locator(),
            TimeWindow::new(MIDNIGHT_UTC + 2000, MIDNIGHT_UTC + 5000),
        );

        let path = job.handle.await.unwrap().unwrap();
        assert!(path.starts_with(tmp.path().join(job.job_id.to_string())));
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");

        let events = drain(&mut job.progress);
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].id, path.display().to_string());
    }

    #[tokio::test]
    async fn test_spawned_job_reports_failure() {
        let store = Arc::new(InMemoryStore::new());
        let tmp = tempfile::tempdir().unwrap();

        let d = Arc::new(downloader(store, tmp.path()));
        let mut job = d.spawn_download(
            locator(),
            TimeWindow::new(MIDNIGHT_UTC + 2000, MIDNIGHT_UTC + 5000),
        );

        let err = job.handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ArchiveError::NoRecordings));
        let events = drain(&mut job.progress);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_error());
    }

    #[tokio::test]
    async fn test_import_segment_uses_day_partition() {
        let store = InMemoryStore::new();
        let name = SegmentName::new(
            MIDNIGHT_UTC + 59_000,
            30_000,
            MediaExt::Ts,
            StartEncoding::Compact,
            utc(),
        )
        .unwrap();
        assert_eq!(name.day(utc()), NaiveDate::from_ymd_opt(2024, 6, 8).unwrap());

        let key = import_segment(&store, &locator(), name, Bytes::from_static(b"ts"), utc())
            .await
            .unwrap();
        assert_eq!(key, "r/dev/1/20240608/20240608000059-30000.ts");
        assert_eq!(store.get(&key).unwrap(), "ts");
    }
}
