//! Resumable, size-checked, retried downloads.

use super::progress::{SpeedTracker, TransferProgress};
use super::retry::{retry_async, RetryConfig};
use super::source::ByteSource;
use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::TransferError;
use crate::planner::DownloadJob;
use futures::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Runs [`DownloadJob`]s against a [`ByteSource`].
///
/// Every job streams into `<destination>.part`, which survives failures and
/// cancellation so the next attempt (or the next cycle) resumes from it. The
/// partial is renamed onto the destination only after its size checks out.
#[derive(Clone)]
pub struct TransferExecutor {
    source: Arc<dyn ByteSource>,
    retry: RetryConfig,
    cancel: CancellationToken,
    progress_tx: Option<mpsc::Sender<TransferProgress>>,
    progress_interval: Duration,
}

impl TransferExecutor {
    pub fn new(source: Arc<dyn ByteSource>, cancel: CancellationToken) -> Self {
        Self {
            source,
            retry: RetryConfig::default(),
            cancel,
            progress_tx: None,
            progress_interval: NetworkConfig::PROGRESS_INTERVAL,
        }
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.retry = self
            .retry
            .with_base_delay(base_delay)
            .with_max_delay(max_delay);
        self
    }

    /// Randomize backoff delays (off by default, so delays strictly increase).
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.retry = self.retry.with_jitter(jitter);
        self
    }

    pub fn with_progress(mut self, progress_tx: mpsc::Sender<TransferProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Download `job`, retrying transient failures up to `retries` extra times.
    ///
    /// Returns the number of bytes fetched in this call (resumed bytes that
    /// were already on disk are not counted).
    pub async fn execute(&self, job: &DownloadJob, retries: u32) -> Result<u64, TransferError> {
        self.cancel.check()?;

        if let Some(parent) = job.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(e, parent))?;
        }

        let config = self.retry.clone().with_retries(retries);
        let part = job.partial_path();
        let counter = AtomicU64::new(0);
        let part_path = part.as_path();
        let written = &counter;

        let (result, stats) = retry_async(
            &config,
            &self.cancel,
            move || self.attempt(job, part_path, written),
            TransferError::is_retryable,
        )
        .await;
        let fetched = counter.load(Ordering::Relaxed);

        match result {
            Ok(()) => {
                tokio::fs::rename(part_path, &job.destination)
                    .await
                    .map_err(|e| TransferError::io(e, &job.destination))?;
                info!(
                    "Downloaded {} ({} fetched, {} attempt(s), {:?} backing off)",
                    job.destination.display(),
                    fetched,
                    stats.attempts,
                    stats.total_delay
                );
                Ok(fetched)
            }
            Err(TransferError::Cancelled) => {
                info!(
                    "Download of {} cancelled, keeping {}",
                    job.item.title,
                    part_path.display()
                );
                Err(TransferError::Cancelled)
            }
            Err(e) => {
                warn!(
                    "Giving up on {} after {} attempt(s) and {:?} backing off: {}",
                    job.item.title, stats.attempts, stats.total_delay, e
                );
                Err(TransferError::Failed {
                    url: job.item.url.clone(),
                    attempts: stats.attempts,
                    fetched,
                    message: e.to_string(),
                })
            }
        }
    }

    /// One attempt: resume or restart the partial, stream, verify its size.
    async fn attempt(
        &self,
        job: &DownloadJob,
        part_path: &Path,
        written: &AtomicU64,
    ) -> Result<(), TransferError> {
        let url = job.item.url.as_str();
        let expected = job.item.expected_size;

        let mut offset = match tokio::fs::metadata(part_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(TransferError::io(e, part_path)),
        };

        if let Some(expected) = expected {
            if offset > expected {
                warn!(
                    "{} is larger than expected ({} > {} bytes), restarting",
                    part_path.display(),
                    offset,
                    expected
                );
                truncate(part_path).await?;
                offset = 0;
            } else if offset == expected && offset > 0 {
                debug!("{} is already complete", part_path.display());
                return Ok(());
            }
        }

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            opened = self.source.open(url, offset) => opened,
        };
        let body = match opened {
            Ok(body) => body,
            Err(e @ TransferError::RangeNotSatisfiable { .. }) => {
                warn!("Server rejected resume of {}, restarting from zero", url);
                truncate(part_path).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if offset > 0 && !body.resumed {
            warn!("Server does not support Range requests for {}, restarting from zero", url);
        } else if body.resumed {
            info!("Resuming {} from byte {}", job.item.title, offset);
        }

        let mut file = if body.resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(part_path)
                .await
        } else {
            tokio::fs::File::create(part_path).await
        }
        .map_err(|e| TransferError::io(e, part_path))?;

        let total = expected.or(body.total_size);
        let mut received = if body.resumed { offset } else { 0 };
        let mut tracker = SpeedTracker::new();
        let mut last_report = Instant::now();
        let mut chunks = body.chunks;

        self.report(job, received, total, 0.0);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    file.flush().await.map_err(|e| TransferError::io(e, part_path))?;
                    return Err(TransferError::Cancelled);
                }
                next = chunks.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    file.flush().await.map_err(|e| TransferError::io(e, part_path))?;
                    return Err(e);
                }
                None => break,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(e, part_path))?;
            let len = chunk.len() as u64;
            received += len;
            written.fetch_add(len, Ordering::Relaxed);
            tracker.record(len);

            if last_report.elapsed() >= self.progress_interval {
                self.report(job, received, total, tracker.speed());
                last_report = Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|e| TransferError::io(e, part_path))?;
        drop(file);
        self.report(job, received, total, tracker.speed());

        let actual = tokio::fs::metadata(part_path)
            .await
            .map_err(|e| TransferError::io(e, part_path))?
            .len();
        if let Some(expected) = total {
            if actual != expected {
                if actual > expected {
                    truncate(part_path).await?;
                }
                return Err(TransferError::SizeMismatch {
                    path: part_path.to_path_buf(),
                    expected,
                    actual,
                });
            }
        }

        Ok(())
    }

    fn report(&self, job: &DownloadJob, received: u64, total: Option<u64>, speed: f64) {
        if let Some(ref tx) = self.progress_tx {
            let progress = TransferProgress::new(
                &job.item.title,
                job.destination.clone(),
                received,
                total,
                speed,
            );
            // A slow consumer drops updates instead of stalling the transfer
            if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(progress) {
                debug!("Progress receiver closed");
            }
        }
    }
}

async fn truncate(path: &Path) -> Result<(), TransferError> {
    tokio::fs::File::create(path)
        .await
        .map(|_| ())
        .map_err(|e| TransferError::io(e, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MediaFormat, RemoteItem};
    use crate::transfer::source::RemoteBody;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory byte source with scripted failures.
    struct MockSource {
        data: Vec<u8>,
        ranges: bool,
        chunk_size: usize,
        fail_opens: AtomicU32,
        cut_after_chunks: Mutex<Option<usize>>,
        stall: bool,
        hang_open: bool,
        opens: Mutex<Vec<(u64, Instant)>>,
    }

    impl MockSource {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                ranges: true,
                chunk_size: 16,
                fail_opens: AtomicU32::new(0),
                cut_after_chunks: Mutex::new(None),
                stall: false,
                hang_open: false,
                opens: Mutex::new(Vec::new()),
            }
        }

        fn offsets(&self) -> Vec<u64> {
            self.opens.lock().unwrap().iter().map(|(o, _)| *o).collect()
        }
    }

    #[async_trait]
    impl ByteSource for MockSource {
        async fn open(&self, url: &str, offset: u64) -> Result<RemoteBody, TransferError> {
            self.opens.lock().unwrap().push((offset, Instant::now()));
            if self.hang_open {
                futures::future::pending::<()>().await;
            }
            if self.fail_opens.load(Ordering::SeqCst) > 0 {
                self.fail_opens.fetch_sub(1, Ordering::SeqCst);
                return Err(TransferError::transient(url, "connection reset"));
            }

            let resumed = self.ranges && offset > 0;
            let start = if resumed { offset as usize } else { 0 };
            let mut items: Vec<Result<Bytes, TransferError>> = self.data[start.min(self.data.len())..]
                .chunks(self.chunk_size)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            if let Some(cut) = self.cut_after_chunks.lock().unwrap().take() {
                items.truncate(cut);
                items.push(Err(TransferError::transient(url, "connection reset")));
            }

            let stream = futures::stream::iter(items);
            let chunks = if self.stall {
                stream.chain(futures::stream::pending()).boxed()
            } else {
                stream.boxed()
            };
            Ok(RemoteBody {
                resumed,
                total_size: Some(self.data.len() as u64),
                chunks,
            })
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn job(dir: &Path, size: Option<u64>) -> DownloadJob {
        let item = RemoteItem::release("Talk", "https://cdn.example/talk.mp4", MediaFormat::Mp4, size);
        DownloadJob::new(item, dir.join("releases").join("Talk.mp4"))
    }

    fn executor(source: Arc<MockSource>) -> TransferExecutor {
        TransferExecutor::new(source, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_fresh_download() {
        let temp_dir = TempDir::new().unwrap();
        let data = payload(100);
        let source = Arc::new(MockSource::new(data.clone()));
        let job = job(temp_dir.path(), Some(100));

        let fetched = executor(source.clone()).execute(&job, 3).await.unwrap();

        assert_eq!(fetched, 100);
        assert_eq!(std::fs::read(&job.destination).unwrap(), data);
        assert!(!job.partial_path().exists());
        assert_eq!(source.offsets(), vec![0]);
    }

    #[tokio::test]
    async fn test_resume_appends_to_partial() {
        let temp_dir = TempDir::new().unwrap();
        let data = payload(100);
        let source = Arc::new(MockSource::new(data.clone()));
        let job = job(temp_dir.path(), Some(100));
        std::fs::create_dir_all(job.destination.parent().unwrap()).unwrap();
        std::fs::write(job.partial_path(), &data[..40]).unwrap();

        let fetched = executor(source.clone()).execute(&job, 3).await.unwrap();

        assert_eq!(fetched, 60);
        assert_eq!(std::fs::read(&job.destination).unwrap(), data);
        assert_eq!(source.offsets(), vec![40]);
    }

    #[tokio::test]
    async fn test_ignored_range_restarts_from_zero() {
        let temp_dir = TempDir::new().unwrap();
        let data = payload(100);
        let mut mock = MockSource::new(data.clone());
        mock.ranges = false;
        let source = Arc::new(mock);
        let job = job(temp_dir.path(), Some(100));
        std::fs::create_dir_all(job.destination.parent().unwrap()).unwrap();
        std::fs::write(job.partial_path(), vec![0xAA; 40]).unwrap();

        let fetched = executor(source).execute(&job, 0).await.unwrap();

        assert_eq!(fetched, 100);
        assert_eq!(std::fs::read(&job.destination).unwrap(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_stream_resumes_across_attempts() {
        let temp_dir = TempDir::new().unwrap();
        let data = payload(100);
        let mock = MockSource::new(data.clone());
        *mock.cut_after_chunks.lock().unwrap() = Some(2);
        let source = Arc::new(mock);
        let job = job(temp_dir.path(), Some(100));

        executor(source.clone()).execute(&job, 3).await.unwrap();

        assert_eq!(std::fs::read(&job.destination).unwrap(), data);
        assert_eq!(source.offsets(), vec![0, 32]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_with_increasing_backoff() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(MockSource::new(payload(100)));
        source.fail_opens.store(u32::MAX, Ordering::SeqCst);
        let job = job(temp_dir.path(), Some(100));
        std::fs::create_dir_all(job.destination.parent().unwrap()).unwrap();
        std::fs::write(job.partial_path(), payload(10)).unwrap();

        let err = executor(source.clone()).execute(&job, 3).await.unwrap_err();

        assert!(matches!(err, TransferError::Failed { attempts: 4, .. }), "{err}");
        let opens = source.opens.lock().unwrap().clone();
        assert_eq!(opens.len(), 4);
        let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1].1 - w[0].1).collect();
        assert!(gaps.windows(2).all(|g| g[0] < g[1]), "{gaps:?}");
        assert!(gaps[0] >= NetworkConfig::RETRY_BASE_DELAY);
        // The partial survives for the next cycle.
        assert_eq!(std::fs::metadata(job.partial_path()).unwrap().len(), 10);
        assert!(!job.destination.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_mismatch_is_detected() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(MockSource::new(payload(100)));
        let job = job(temp_dir.path(), Some(200));

        let err = executor(source.clone()).execute(&job, 1).await.unwrap_err();

        match err {
            TransferError::Failed {
                attempts,
                fetched,
                message,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(fetched, 100);
                assert!(message.contains("Size mismatch"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!job.destination.exists());
    }

    #[tokio::test]
    async fn test_oversized_partial_is_restarted() {
        let temp_dir = TempDir::new().unwrap();
        let data = payload(100);
        let source = Arc::new(MockSource::new(data.clone()));
        let job = job(temp_dir.path(), Some(100));
        std::fs::create_dir_all(job.destination.parent().unwrap()).unwrap();
        std::fs::write(job.partial_path(), payload(150)).unwrap();

        executor(source.clone()).execute(&job, 0).await.unwrap();

        assert_eq!(std::fs::read(&job.destination).unwrap(), data);
        assert_eq!(source.offsets(), vec![0]);
    }

    #[tokio::test]
    async fn test_complete_partial_is_finalized_without_request() {
        let temp_dir = TempDir::new().unwrap();
        let data = payload(100);
        let source = Arc::new(MockSource::new(data.clone()));
        let job = job(temp_dir.path(), Some(100));
        std::fs::create_dir_all(job.destination.parent().unwrap()).unwrap();
        std::fs::write(job.partial_path(), &data).unwrap();

        let fetched = executor(source.clone()).execute(&job, 0).await.unwrap();

        assert_eq!(fetched, 0);
        assert!(source.offsets().is_empty());
        assert_eq!(std::fs::read(&job.destination).unwrap(), data);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(MockSource::new(payload(100)));
        let executor = executor(source.clone());
        executor.cancellation_token().cancel();

        let err = executor.execute(&job(temp_dir.path(), Some(100)), 3).await.unwrap_err();

        assert!(matches!(err, TransferError::Cancelled));
        assert!(source.offsets().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_partial() {
        let temp_dir = TempDir::new().unwrap();
        let mut mock = MockSource::new(payload(100));
        mock.stall = true;
        mock.chunk_size = 100;
        let source = Arc::new(mock);
        let executor = executor(source);
        let job = job(temp_dir.path(), Some(200));

        let token = executor.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = executor.execute(&job, 3).await.unwrap_err();

        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(std::fs::metadata(job.partial_path()).unwrap().len(), 100);
        assert!(!job.destination.exists());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_response() {
        let temp_dir = TempDir::new().unwrap();
        let mut mock = MockSource::new(payload(100));
        mock.hang_open = true;
        let source = Arc::new(mock);
        let executor = executor(source.clone());
        let job = job(temp_dir.path(), Some(100));

        let token = executor.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), executor.execute(&job, 3)).await;

        assert!(matches!(result, Ok(Err(TransferError::Cancelled))));
        assert_eq!(source.offsets(), vec![0]);
        assert!(!job.destination.exists());
    }

    #[tokio::test]
    async fn test_full_progress_channel_does_not_block() {
        let temp_dir = TempDir::new().unwrap();
        let mut mock = MockSource::new(payload(64));
        mock.chunk_size = 8;
        let source = Arc::new(mock);
        let (tx, _rx) = mpsc::channel(1);
        let executor = executor(source).with_progress(tx);
        let job = job(temp_dir.path(), Some(64));

        let result = tokio::time::timeout(Duration::from_secs(5), executor.execute(&job, 0)).await;

        assert!(matches!(result, Ok(Ok(64))));
        assert_eq!(std::fs::read(&job.destination).unwrap(), payload(64));
    }

    #[tokio::test]
    async fn test_progress_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(MockSource::new(payload(64)));
        let (tx, mut rx) = mpsc::channel(64);
        let executor = executor(source).with_progress(tx);
        let job = job(temp_dir.path(), Some(64));

        executor.execute(&job, 0).await.unwrap();
        drop(executor);

        let mut last = None;
        while let Some(progress) = rx.recv().await {
            last = Some(progress);
        }
        let last = last.unwrap();
        assert_eq!(last.bytes_transferred, 64);
        assert_eq!(last.percent, Some(100.0));
        assert_eq!(last.destination, PathBuf::from(&job.destination));
    }
}
