//! Session controller: one complete capture run.
//!
//! ```text
//! open → configure → create file + header → arm
//!   ├─ acquisition task: pull → ring buffer push
//!   └─ persistence task: ring buffer pop → write_record
//! stop → abort device → close writer → close device
//! ```
//!
//! The two tasks share nothing but the ring buffer and the progress counters.
//! A run stops when the capture budget is exhausted, the device fails, the
//! writer fails or the caller cancels. On cancellation the acquisition task
//! stops pulling and closes the ring; the persistence task then drains what is
//! already buffered before closing the file. A writer failure cancels
//! acquisition so no further samples are produced for a writer that cannot
//! persist them.

use crate::acquisition::shutdown::{cancellation, CancelHandle, CancelToken};
use crate::acquisition::source::{PullError, SampleSource};
use crate::config::{AcquisitionConfig, PipelineConfig, Settings, StorageConfig};
use crate::data::ring_buffer::{PopError, PushError, RingBuffer};
use crate::data::storage::{CsvRecordWriter, RowSink, WriterSummary};
use crate::error::{DaqError, DeviceError, DeviceErrorKind, StorageError};
use crate::hardware::{AnalyzerDriver, DeviceSession};
use crate::measurement_types::SampleRecord;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::Instrument;

/// Termination condition of a capture run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBudget {
    /// Stop after this many records
    Samples(u64),
    /// Stop once this much wall-clock time has passed since arming
    Duration(Duration),
}

impl fmt::Display for CaptureBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureBudget::Samples(n) => write!(f, "{n} records"),
            CaptureBudget::Duration(d) => write!(f, "{d:?}"),
        }
    }
}

/// Why a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The capture budget was exhausted
    Completed,
    /// External cancellation; buffered records were still written
    Cancelled,
}

/// Live counters of a running capture, readable from any thread.
#[derive(Debug, Default)]
pub struct CaptureProgress {
    produced: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    timeouts: AtomicU64,
}

impl CaptureProgress {
    /// Records pulled from the device and handed to the ring buffer.
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Acquire)
    }

    /// Rows durably written to the output file.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Records evicted from the ring buffer.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Pull timeouts seen so far.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.produced.store(0, Ordering::Release);
        self.written.store(0, Ordering::Release);
        self.dropped.store(0, Ordering::Release);
        self.timeouts.store(0, Ordering::Release);
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    /// Output file
    pub path: PathBuf,
    /// Data rows in the output file
    pub rows_written: u64,
    /// Records pulled from the device
    pub records_produced: u64,
    /// Records evicted under `DropOldest`
    pub dropped: u64,
    /// Recoverable pull timeouts
    pub timeouts: u64,
    /// Time from arming to the last row
    pub elapsed: Duration,
    /// Why the run ended
    pub stop_reason: StopReason,
}

/// A failed run: the cause plus how far it got.
#[derive(Error, Debug)]
#[error("{source} ({rows_written} rows written)")]
pub struct CaptureError {
    /// What went wrong
    #[source]
    pub source: DaqError,
    /// Data rows durably written before the failure
    pub rows_written: u64,
    /// Records pulled from the device
    pub records_produced: u64,
    /// Records evicted under `DropOldest`
    pub dropped: u64,
}

impl CaptureError {
    fn before_start(source: impl Into<DaqError>) -> Self {
        Self {
            source: source.into(),
            rows_written: 0,
            records_produced: 0,
            dropped: 0,
        }
    }
}

/// How the acquisition loop ended.
enum AcquisitionEnd {
    Completed,
    Cancelled,
    WriterGone,
    Failed(DeviceError),
}

/// Drives capture runs against one analyzer driver.
pub struct SessionController<D: AnalyzerDriver + 'static> {
    driver: Arc<D>,
    acquisition: AcquisitionConfig,
    pipeline: PipelineConfig,
    storage: StorageConfig,
    progress: Arc<CaptureProgress>,
}

impl<D: AnalyzerDriver + 'static> SessionController<D> {
    /// Create a controller from validated settings.
    pub fn new(driver: Arc<D>, settings: &Settings) -> Self {
        Self {
            driver,
            acquisition: settings.acquisition.clone(),
            pipeline: settings.pipeline.clone(),
            storage: settings.storage.clone(),
            progress: Arc::new(CaptureProgress::default()),
        }
    }

    /// Counters of the current (or last) run. Zeroed when a run starts.
    pub fn progress(&self) -> Arc<CaptureProgress> {
        self.progress.clone()
    }

    /// Run one capture into a new file at `output`.
    ///
    /// Device and writer are released on every exit path. A device that fails
    /// to open leaves no output file behind.
    pub async fn run(
        &self,
        budget: CaptureBudget,
        output: &Path,
        cancel: CancelToken,
    ) -> Result<CaptureReport, CaptureError> {
        let mode = self.acquisition.mode;
        let span = tracing::info_span!("capture", %mode, output = %output.display());
        self.run_inner(budget, output, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        budget: CaptureBudget,
        output: &Path,
        cancel: CancelToken,
    ) -> Result<CaptureReport, CaptureError> {
        let mode = self.acquisition.mode;
        self.progress.reset();
        tracing::info!(%budget, "Starting capture");

        let mut session = DeviceSession::open(self.driver.clone())
            .await
            .map_err(CaptureError::before_start)?;

        if let Err(e) = session.configure(&self.acquisition).await {
            close_session(session);
            return Err(CaptureError::before_start(e));
        }

        let options = self.storage.writer_options();
        let header = options.schema.header(mode);
        let mut writer = match CsvRecordWriter::create(output, mode, options) {
            Ok(writer) => writer,
            Err(e) => {
                close_session(session);
                return Err(CaptureError::before_start(e));
            }
        };
        if let Err(e) = writer.write_header(header) {
            close_session(session);
            return Err(CaptureError::before_start(e));
        }

        if let Err(e) = session.arm(mode).await {
            if let Err(close_err) = writer.close() {
                tracing::warn!(error = %close_err, "Failed to close output after arm failure");
            }
            close_session(session);
            return Err(CaptureError::before_start(e));
        }

        let source = match SampleSource::new(session, self.pipeline.iq_block_size).await {
            Ok(source) => source,
            Err(e) => {
                // The session was dropped with the source, which closes it
                if let Err(close_err) = writer.close() {
                    tracing::warn!(
                        error = %close_err,
                        "Failed to close output after source setup failure"
                    );
                }
                return Err(CaptureError::before_start(e));
            }
        };

        let started = Instant::now();
        let ring = Arc::new(RingBuffer::new(
            self.pipeline.buffer_capacity,
            self.pipeline.overflow_policy,
        ));
        let (writer_failed, writer_failed_token) = cancellation();

        let acquisition = tokio::spawn(
            acquire(
                source,
                ring.clone(),
                budget,
                self.pipeline.clone(),
                self.progress.clone(),
                cancel,
                writer_failed_token,
            )
            .in_current_span(),
        );
        let persistence = tokio::spawn(
            persist(
                writer,
                ring.clone(),
                self.pipeline.poll_interval,
                self.progress.clone(),
                writer_failed,
            )
            .in_current_span(),
        );

        let (acquired, persisted) = tokio::join!(acquisition, persistence);
        let elapsed = started.elapsed();
        self.progress.dropped.store(ring.dropped(), Ordering::Release);

        let (end, session_close) = match acquired {
            Ok((end, session)) => (end, close_session_checked(session)),
            Err(join_err) => {
                // The session was dropped during unwind, which closes it
                ring.close();
                (
                    AcquisitionEnd::Failed(DeviceError::new(
                        DeviceErrorKind::DriverFault,
                        format!("acquisition task failed: {join_err}"),
                    )),
                    Ok(()),
                )
            }
        };

        let rows_written = match &persisted {
            Ok(Ok(rows)) => *rows,
            Ok(Err((_, rows))) => *rows,
            Err(_) => self.progress.written(),
        };
        let fail = |source: DaqError| CaptureError {
            source,
            rows_written,
            records_produced: self.progress.produced(),
            dropped: ring.dropped(),
        };

        let stop_reason = match (end, persisted) {
            (_, Err(join_err)) => {
                return Err(fail(DaqError::TaskFailed(format!(
                    "persistence task failed: {join_err}"
                ))))
            }
            (AcquisitionEnd::WriterGone, Ok(Err((e, _)))) => return Err(fail(e.into())),
            (AcquisitionEnd::Failed(e), _) => {
                tracing::error!(error = %e, rows_written, "Capture failed");
                return Err(fail(e.into()));
            }
            (_, Ok(Err((e, _)))) => return Err(fail(e.into())),
            (AcquisitionEnd::WriterGone, Ok(Ok(_))) => {
                return Err(fail(DaqError::TaskFailed(
                    "ring buffer closed before the capture finished".to_string(),
                )))
            }
            (AcquisitionEnd::Completed, Ok(Ok(_))) => StopReason::Completed,
            (AcquisitionEnd::Cancelled, Ok(Ok(_))) => StopReason::Cancelled,
        };

        if let Err(e) = session_close {
            return Err(fail(e.into()));
        }

        let report = CaptureReport {
            path: output.to_path_buf(),
            rows_written,
            records_produced: self.progress.produced(),
            dropped: ring.dropped(),
            timeouts: self.progress.timeouts(),
            elapsed,
            stop_reason,
        };
        tracing::info!(
            rows = report.rows_written,
            dropped = report.dropped,
            timeouts = report.timeouts,
            elapsed = ?report.elapsed,
            reason = ?report.stop_reason,
            "Capture finished"
        );
        Ok(report)
    }
}

/// Acquisition task: pull records and push them into the ring until the run
/// ends. Always aborts the device and closes the ring before returning.
async fn acquire<D: AnalyzerDriver>(
    mut source: SampleSource<D>,
    ring: Arc<RingBuffer<SampleRecord>>,
    budget: CaptureBudget,
    pipeline: PipelineConfig,
    progress: Arc<CaptureProgress>,
    cancel: CancelToken,
    writer_failed: CancelToken,
) -> (AcquisitionEnd, DeviceSession<D>) {
    let deadline = match budget {
        CaptureBudget::Duration(d) => Some(Instant::now() + d),
        CaptureBudget::Samples(_) => None,
    };
    let target = match budget {
        CaptureBudget::Samples(n) => Some(n),
        CaptureBudget::Duration(_) => None,
    };
    let budget_elapsed = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(budget_elapsed);

    let mut produced = 0u64;
    let mut consecutive_timeouts = 0u32;
    let mut reported_drops = 0u64;

    let end = 'run: loop {
        if target.is_some_and(|n| produced >= n) {
            break AcquisitionEnd::Completed;
        }

        let pulled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break AcquisitionEnd::Cancelled,
            _ = writer_failed.cancelled() => break AcquisitionEnd::WriterGone,
            _ = &mut budget_elapsed => break AcquisitionEnd::Completed,
            pulled = source.pull(pipeline.pull_timeout) => pulled,
        };

        let mut record = match pulled {
            Ok(record) => {
                consecutive_timeouts = 0;
                record
            }
            Err(PullError::Timeout(waited)) => {
                consecutive_timeouts += 1;
                progress.timeouts.fetch_add(1, Ordering::AcqRel);
                tracing::warn!(
                    ?waited,
                    consecutive = consecutive_timeouts,
                    "No sample from device"
                );
                if consecutive_timeouts > pipeline.max_consecutive_timeouts {
                    break AcquisitionEnd::Failed(DeviceError::new(
                        DeviceErrorKind::InitiationFailed,
                        format!(
                            "device delivered no data for {consecutive_timeouts} consecutive pulls"
                        ),
                    ));
                }
                continue;
            }
            Err(PullError::Device(e)) => break AcquisitionEnd::Failed(e),
        };

        // Block policy waits here for the writer; checked against both signals
        loop {
            let pushed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'run AcquisitionEnd::Cancelled,
                _ = writer_failed.cancelled() => break 'run AcquisitionEnd::WriterGone,
                pushed = ring.push_timeout(record, pipeline.poll_interval) => pushed,
            };
            match pushed {
                Ok(()) => break,
                Err(PushError::Timeout(rejected)) | Err(PushError::Full(rejected)) => {
                    record = rejected;
                }
                Err(PushError::Closed(_)) => break 'run AcquisitionEnd::WriterGone,
            }
        }

        produced += 1;
        progress.produced.store(produced, Ordering::Release);

        let dropped = ring.dropped();
        if dropped != reported_drops {
            progress.dropped.store(dropped, Ordering::Release);
            if dropped / 100 != reported_drops / 100 || reported_drops == 0 {
                tracing::warn!(dropped, "Ring buffer overflow, oldest records dropped");
            }
            reported_drops = dropped;
        }
    };

    ring.close();
    let mut session = source.into_session();
    if let Err(e) = session.abort() {
        tracing::warn!(error = %e, "Abort after acquisition failed");
    }
    tracing::debug!(produced, "Acquisition task finished");
    (end, session)
}

/// Persistence task: drain the ring into the writer until the ring is closed
/// and empty. Returns committed rows, or the storage error with the rows that
/// made it to disk.
async fn persist<S: RowSink>(
    mut writer: CsvRecordWriter<S>,
    ring: Arc<RingBuffer<SampleRecord>>,
    poll_interval: Duration,
    progress: Arc<CaptureProgress>,
    writer_failed: CancelHandle,
) -> Result<u64, (StorageError, u64)> {
    let result = drain(&mut writer, &ring, poll_interval, &progress).await;
    let closed = writer.close();
    progress.written.store(writer.rows_written(), Ordering::Release);

    match result.and(closed) {
        Ok(summary) => {
            tracing::debug!(rows = summary.rows_written, "Persistence task finished");
            Ok(summary.rows_written)
        }
        Err(e) => {
            tracing::error!(error = %e, rows = writer.rows_written(), "Writer failed");
            writer_failed.cancel();
            ring.close();
            Err((e, writer.rows_written()))
        }
    }
}

async fn drain<S: RowSink>(
    writer: &mut CsvRecordWriter<S>,
    ring: &RingBuffer<SampleRecord>,
    poll_interval: Duration,
    progress: &CaptureProgress,
) -> Result<WriterSummary, StorageError> {
    loop {
        match ring.pop(poll_interval).await {
            Ok(record) => {
                writer.write_record(&record)?;
                progress.written.store(writer.rows_written(), Ordering::Release);
            }
            Err(PopError::Timeout) => {
                writer.flush_if_due()?;
                progress.written.store(writer.rows_written(), Ordering::Release);
            }
            Err(PopError::Empty) => return Ok(writer.summary()),
        }
    }
}

fn close_session<D: AnalyzerDriver>(session: DeviceSession<D>) {
    if let Err(e) = close_session_checked(session) {
        tracing::warn!(error = %e, "Device close failed");
    }
}

fn close_session_checked<D: AnalyzerDriver>(mut session: DeviceSession<D>) -> Result<(), DeviceError> {
    session.close()
}
