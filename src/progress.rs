//! Progress and cancellation of long-running transfers.
//!
//! `TransferProgressTracker` turns byte counts into a completion fraction. The expected size may
//! be corrected once after the transfer started (an archive that turns out larger once
//! extracted); progress made so far is rescaled so the fraction stays meaningful.
//!
//! `ProgressReporter` samples a tracker on a ticker and tells a listener when the value moved.
//! `copy_with_progress` is the transfer loop itself, with cancel/pause and a read timeout.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::error::{ExecError, Result};
use crate::periodic::Ticker;

const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug)]
struct ProgressState {
    expected_size: i64,
    bytes: u64,
    value: f64,
    adjustable: bool,
}

impl ProgressState {
    /// Fraction of the expected size one byte represents. Zero disables reporting.
    fn factor(&self) -> f64 {
        if self.expected_size > 0 {
            1.0 / self.expected_size as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug)]
pub struct TransferProgressTracker {
    state: Mutex<ProgressState>,
}

impl TransferProgressTracker {
    /// A tracker for `expected_size` bytes. `needs_late_adjust` allows one later `adjust`.
    pub fn new(expected_size: i64, needs_late_adjust: bool) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                expected_size,
                bytes: 0,
                value: 0.0,
                adjustable: needs_late_adjust,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, bytes: u64) {
        let mut state = self.state();
        state.bytes += bytes;
        if state.expected_size > 0 {
            state.value += bytes as f64 / state.expected_size as f64;
        }
    }

    /// Replaces the expected size, rescaling the progress made so far. Works at most once;
    /// returns whether the adjustment was applied.
    pub fn adjust(&self, new_size: i64) -> bool {
        let mut state = self.state();
        if !state.adjustable {
            return false;
        }
        state.adjustable = false;
        let old_size = state.expected_size;
        state.expected_size = new_size;
        state.value = if new_size <= 0 {
            0.0
        } else if old_size > 0 {
            state.value * old_size as f64 / new_size as f64
        } else {
            state.bytes as f64 / new_size as f64
        };
        tracing::debug!(old_size, new_size, value = state.value, "Transfer size adjusted");
        true
    }

    /// Completion fraction. May slightly exceed 1.0 when more bytes arrive than expected.
    pub fn value(&self) -> f64 {
        self.state().value
    }

    pub fn factor(&self) -> f64 {
        self.state().factor()
    }

    pub fn bytes(&self) -> u64 {
        self.state().bytes
    }

    pub fn expected_size(&self) -> i64 {
        self.state().expected_size
    }
}

pub trait ProgressListener: Send + Sync {
    /// `value` is in [0, 1].
    fn on_progress(&self, value: f64);
}

/// Reports a tracker's value on every tick where it changed.
///
/// Reporting ends when `stop` is called or progress reaches 1.0.
pub struct ProgressReporter {
    ticker: Ticker,
}

impl ProgressReporter {
    pub fn start(
        tracker: Arc<TransferProgressTracker>,
        listener: Arc<dyn ProgressListener>,
        period: Duration,
    ) -> Self {
        let mut last: Option<f64> = None;
        let ticker = Ticker::start("progress", period, move || {
            let value = tracker.value().min(1.0);
            if last != Some(value) {
                listener.on_progress(value);
                last = Some(value);
            }
            let flow = if value >= 1.0 {
                std::ops::ControlFlow::Break(())
            } else {
                std::ops::ControlFlow::Continue(())
            };
            std::future::ready(flow)
        });
        Self { ticker }
    }

    pub fn is_finished(&self) -> bool {
        self.ticker.is_finished()
    }

    pub async fn stop(self) {
        self.ticker.stop().await;
    }
}

/// Cancel and pause switches shared between a transfer and whoever controls it.
#[derive(Debug, Default)]
pub struct TransferControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
    changed: Notify,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Clears cancellation and pause so the control can drive a new transfer.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.resume();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Resolves once the transfer is unpaused or cancelled.
    async fn wait_while_paused(&self) {
        loop {
            let changed = self.changed.notified();
            if !self.is_paused() || self.is_cancelled() {
                return;
            }
            changed.await;
        }
    }
}

/// Copies `reader` into `writer`, feeding `tracker`. Fails with `TransferTimeout` (and cancels
/// `control`) when a read makes no progress within `read_timeout`.
pub async fn copy_with_progress<R, W>(
    reader: &mut R,
    writer: &mut W,
    tracker: &TransferProgressTracker,
    control: &TransferControl,
    read_timeout: Duration,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        control.wait_while_paused().await;
        if control.is_cancelled() {
            return Err(ExecError::TransferCancelled);
        }
        let read = match tokio::time::timeout(read_timeout, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                control.cancel();
                return Err(ExecError::TransferTimeout(read_timeout));
            }
        };
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
        tracker.add(read as u64);
        total += read as u64;
    }
    writer.flush().await?;
    Ok(total)
}

/// Retrieves products to local storage.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches `product` into `destination` and returns the local path.
    async fn fetch(
        &self,
        product: &str,
        destination: &Path,
        tracker: Arc<TransferProgressTracker>,
    ) -> Result<PathBuf>;

    fn cancel(&self);

    /// Unpauses, and allows fetching again after a cancel.
    fn resume(&self);
}

/// Fetches products from a directory visible to this host, such as a mounted archive.
pub struct LocalFetcher {
    root: PathBuf,
    control: Arc<TransferControl>,
    read_timeout: Duration,
}

impl LocalFetcher {
    pub fn new(root: impl Into<PathBuf>, read_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            control: Arc::new(TransferControl::new()),
            read_timeout,
        }
    }

    pub fn control(&self) -> &Arc<TransferControl> {
        &self.control
    }
}

#[async_trait]
impl Fetcher for LocalFetcher {
    async fn fetch(
        &self,
        product: &str,
        destination: &Path,
        tracker: Arc<TransferProgressTracker>,
    ) -> Result<PathBuf> {
        let source = self.root.join(product);
        let target = destination.join(product);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut reader = tokio::fs::File::open(&source).await?;
        let mut writer = tokio::fs::File::create(&target).await?;
        let copied = copy_with_progress(
            &mut reader,
            &mut writer,
            &tracker,
            &self.control,
            self.read_timeout,
        )
        .await;
        match copied {
            Ok(bytes) => {
                tracing::info!(product, bytes, target = %target.display(), "Product fetched");
                Ok(target)
            }
            Err(e) => {
                drop(writer);
                if let Err(remove) = tokio::fs::remove_file(&target).await {
                    tracing::debug!(error = %remove, "Could not remove partial download");
                }
                Err(e)
            }
        }
    }

    fn cancel(&self) {
        self.control.cancel();
    }

    fn resume(&self) {
        self.control.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_rescale_keeps_progress() {
        let tracker = TransferProgressTracker::new(1000, true);
        tracker.add(500);
        assert!(close(tracker.value(), 0.5));
        assert!(tracker.adjust(2000));
        assert!(close(tracker.value(), 0.25));
        tracker.add(500);
        assert!(close(tracker.value(), 0.5));
        assert!(close(tracker.factor(), 1.0 / 2000.0));
    }

    #[test]
    fn test_adjust_at_most_once() {
        let tracker = TransferProgressTracker::new(1000, true);
        assert!(tracker.adjust(500));
        assert!(!tracker.adjust(4000));
        assert_eq!(tracker.expected_size(), 500);

        let fixed = TransferProgressTracker::new(1000, false);
        assert!(!fixed.adjust(2000));
        assert_eq!(fixed.expected_size(), 1000);
    }

    #[test]
    fn test_unknown_size_disables_progress() {
        let tracker = TransferProgressTracker::new(0, true);
        tracker.add(300);
        assert_eq!(tracker.value(), 0.0);
        assert_eq!(tracker.factor(), 0.0);
        assert_eq!(tracker.bytes(), 300);
        tracker.adjust(600);
        assert!(close(tracker.value(), 0.5));
    }

    #[test]
    fn test_overshoot_is_not_clamped() {
        let tracker = TransferProgressTracker::new(100, false);
        tracker.add(60);
        tracker.add(60);
        assert!(close(tracker.value(), 1.2));
    }

    struct Collect(Mutex<Vec<f64>>);

    impl ProgressListener for Collect {
        fn on_progress(&self, value: f64) {
            self.0.lock().unwrap().push(value);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_notifies_on_change_and_stops() {
        let tracker = Arc::new(TransferProgressTracker::new(100, false));
        let listener = Arc::new(Collect(Mutex::new(Vec::new())));
        let reporter = ProgressReporter::start(
            Arc::clone(&tracker),
            Arc::clone(&listener) as Arc<dyn ProgressListener>,
            Duration::from_secs(1),
        );
        tokio::time::sleep(Duration::from_millis(1500)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        tracker.add(40);
        tokio::time::sleep(Duration::from_secs(1)).await;
        tracker.add(70);
        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(reporter.is_finished());
        assert_eq!(*listener.0.lock().unwrap(), vec![0.0, 0.4, 1.0]);
    }

    #[tokio::test]
    async fn test_copy_with_progress() {
        let data = vec![7u8; 200_000];
        let tracker = TransferProgressTracker::new(data.len() as i64, false);
        let control = TransferControl::new();
        let mut writer = Vec::new();
        let copied = copy_with_progress(
            &mut data.as_slice(),
            &mut writer,
            &tracker,
            &control,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(copied, 200_000);
        assert_eq!(writer, data);
        assert!(close(tracker.value(), 1.0));
    }

    #[tokio::test]
    async fn test_cancelled_copy() {
        let tracker = TransferProgressTracker::new(10, false);
        let control = TransferControl::new();
        control.cancel();
        let mut writer = Vec::new();
        let result = copy_with_progress(
            &mut &b"0123456789"[..],
            &mut writer,
            &tracker,
            &control,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(ExecError::TransferCancelled)));
        assert!(writer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_cancels() {
        // The write half stays open and never sends anything.
        let (mut reader, _writer) = tokio::io::duplex(64);
        let tracker = TransferProgressTracker::new(10, false);
        let control = TransferControl::new();
        let mut sink = Vec::new();
        let result = copy_with_progress(
            &mut reader,
            &mut sink,
            &tracker,
            &control,
            Duration::from_secs(30),
        )
        .await;
        assert!(matches!(result, Err(ExecError::TransferTimeout(_))));
        assert!(control.is_cancelled());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let control = Arc::new(TransferControl::new());
        control.pause();
        let (mut reader, mut writer) = tokio::io::duplex(64);
        let copy = {
            let control = Arc::clone(&control);
            tokio::spawn(async move {
                let tracker = TransferProgressTracker::new(3, false);
                let mut sink = Vec::new();
                copy_with_progress(
                    &mut reader,
                    &mut sink,
                    &tracker,
                    &control,
                    Duration::from_secs(5),
                )
                .await
                .map(|n| (n, sink))
            })
        };
        writer.write_all(b"abc").await.unwrap();
        drop(writer);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!copy.is_finished());
        control.resume();
        let (copied, sink) = copy.await.unwrap().unwrap();
        assert_eq!(copied, 3);
        assert_eq!(sink, b"abc");
    }

    #[tokio::test]
    async fn test_local_fetcher() {
        let root = tempfile::tempdir().unwrap();
        let destination = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("S2A_TILE.zip"), vec![1u8; 4096]).unwrap();

        let fetcher = LocalFetcher::new(root.path(), Duration::from_secs(5));
        let tracker = Arc::new(TransferProgressTracker::new(4096, false));
        let path = fetcher
            .fetch("S2A_TILE.zip", destination.path(), Arc::clone(&tracker))
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
        assert!(close(tracker.value(), 1.0));

        fetcher.cancel();
        let again = fetcher
            .fetch(
                "S2A_TILE.zip",
                destination.path(),
                Arc::new(TransferProgressTracker::new(4096, false)),
            )
            .await;
        assert!(matches!(again, Err(ExecError::TransferCancelled)));
        assert!(!destination.path().join("S2A_TILE.zip").exists());

        fetcher.resume();
        assert!(fetcher
            .fetch("S2A_TILE.zip", destination.path(), tracker)
            .await
            .is_ok());
    }
}
