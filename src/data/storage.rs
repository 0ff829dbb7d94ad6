//! Delimited-text writer for captured records.
//!
//! `CsvRecordWriter` is the persistence end of the pipeline. It writes a header
//! row followed by one row per [`SampleRecord`], with a fixed field order, a
//! configurable delimiter and line terminator.
//!
//! # Batching and durability
//!
//! Rows are serialized into an in-memory batch and handed to the sink in one
//! `write_all` once `batch_rows` rows are pending or `batch_interval` has
//! elapsed, whichever comes first. Only complete rows ever reach the sink, and
//! the committed row counter advances only after the whole batch is written.
//! If a batch write fails part-way, the sink is truncated back to the last
//! committed byte, so the file always holds a valid header plus N complete
//! rows. `close` always attempts a final flush.
//!
//! # File creation
//!
//! Output files are create-or-error: an existing file is never overwritten.

use crate::config::CaptureMode;
use crate::error::{StorageError, StorageErrorKind};
use crate::measurement_types::SampleRecord;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Generated output file name for `mode`, e.g. `iq_20250114_093000.csv`.
pub fn timestamped_path(dir: &Path, mode: CaptureMode, now: DateTime<Local>) -> PathBuf {
    let prefix = match mode {
        CaptureMode::Iq => "iq",
        CaptureMode::RealTime => "realtime",
    };
    dir.join(format!("{}_{}.csv", prefix, now.format("%Y%m%d_%H%M%S")))
}

/// Column layout of the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowSchema {
    /// Two columns: `iq-data,index` or `frame-sample,max-hold`.
    #[default]
    Standard,
    /// Adds the quadrature component (IQ) or the frame index (real-time).
    Extended,
}

impl RowSchema {
    /// Header fields for a capture mode.
    pub fn header(self, mode: CaptureMode) -> &'static [&'static str] {
        match (mode, self) {
            (CaptureMode::Iq, RowSchema::Standard) => &["iq-data", "index"],
            (CaptureMode::Iq, RowSchema::Extended) => &["i", "q", "index"],
            (CaptureMode::RealTime, RowSchema::Standard) => &["frame-sample", "max-hold"],
            (CaptureMode::RealTime, RowSchema::Extended) => {
                &["frame-sample", "max-hold", "frame-index"]
            }
        }
    }

    fn fields(self, record: &SampleRecord) -> Vec<String> {
        match (record, self) {
            (SampleRecord::Iq(s), RowSchema::Standard) => {
                vec![s.i.to_string(), s.index.to_string()]
            }
            (SampleRecord::Iq(s), RowSchema::Extended) => {
                vec![s.i.to_string(), s.q.to_string(), s.index.to_string()]
            }
            (SampleRecord::Frame(f), RowSchema::Standard) => {
                vec![f.peak().to_string(), f.max_hold_peak().to_string()]
            }
            (SampleRecord::Frame(f), RowSchema::Extended) => vec![
                f.peak().to_string(),
                f.max_hold_peak().to_string(),
                f.frame_index.to_string(),
            ],
        }
    }
}

/// Row terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineTerminator {
    /// `\n`
    #[default]
    Lf,
    /// `\r\n`
    CrLf,
}

impl LineTerminator {
    fn as_csv(self) -> csv::Terminator {
        match self {
            LineTerminator::Lf => csv::Terminator::Any(b'\n'),
            LineTerminator::CrLf => csv::Terminator::CRLF,
        }
    }
}

/// Formatting and batching options for [`CsvRecordWriter`].
#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    /// Field delimiter (ASCII)
    pub delimiter: u8,
    /// Row terminator
    pub terminator: LineTerminator,
    /// Column layout
    pub schema: RowSchema,
    /// Flush after this many pending rows
    pub batch_rows: usize,
    /// Flush once this much time has passed since the last flush
    pub batch_interval: Duration,
    /// Issue `fsync` after every flush
    pub sync_on_flush: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            terminator: LineTerminator::Lf,
            schema: RowSchema::Standard,
            batch_rows: 256,
            batch_interval: Duration::from_millis(500),
            sync_on_flush: false,
        }
    }
}

/// Destination that can discard a partially written tail.
pub trait RowSink: Write {
    /// Shrink the sink to `len` bytes and continue writing from there.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;

    /// Make written data durable.
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RowSink for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Final counters of a closed writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSummary {
    /// Data rows durably written (header excluded)
    pub rows_written: u64,
    /// Bytes committed to the sink, header included
    pub bytes_written: u64,
}

/// Batched, torn-row-free writer of [`SampleRecord`] rows.
pub struct CsvRecordWriter<S: RowSink = File> {
    path: Option<PathBuf>,
    sink: Option<S>,
    options: WriterOptions,
    mode: CaptureMode,
    builder: csv::WriterBuilder,
    encoder: csv::Writer<Vec<u8>>,
    pending_rows: usize,
    committed_bytes: u64,
    rows_written: u64,
    header_written: bool,
    failed: bool,
    last_flush: Instant,
}

impl CsvRecordWriter<File> {
    /// Create a new output file. Fails if `path` already exists.
    pub fn create(
        path: &Path,
        mode: CaptureMode,
        options: WriterOptions,
    ) -> Result<Self, StorageError> {
        if path.as_os_str().is_empty() {
            return Err(StorageError::new(
                StorageErrorKind::PathInvalid,
                "output path is empty",
            ));
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                StorageError::from_io(
                    &e,
                    StorageErrorKind::PathInvalid,
                    &format!("failed to create '{}'", path.display()),
                )
            })?;

        tracing::info!(path = %path.display(), %mode, "Output file created");
        let mut writer = Self::from_sink(file, mode, options);
        writer.path = Some(path.to_path_buf());
        Ok(writer)
    }
}

impl<S: RowSink> CsvRecordWriter<S> {
    /// Wrap an already opened sink.
    pub fn from_sink(sink: S, mode: CaptureMode, options: WriterOptions) -> Self {
        let mut builder = csv::WriterBuilder::new();
        builder
            .delimiter(options.delimiter)
            .terminator(options.terminator.as_csv())
            .has_headers(false);
        let encoder = builder.from_writer(Vec::new());

        Self {
            path: None,
            sink: Some(sink),
            options,
            mode,
            builder,
            encoder,
            pending_rows: 0,
            committed_bytes: 0,
            rows_written: 0,
            header_written: false,
            failed: false,
            last_flush: Instant::now(),
        }
    }

    /// Path of the output file, when backed by one.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Data rows durably written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Rows accepted but not yet flushed.
    pub fn pending_rows(&self) -> usize {
        self.pending_rows
    }

    /// Borrow the underlying sink (`None` once closed).
    pub fn sink(&self) -> Option<&S> {
        self.sink.as_ref()
    }

    /// Write and immediately commit the header row.
    ///
    /// Must be called exactly once, before any record, with as many fields as
    /// the configured schema produces per row.
    pub fn write_header(&mut self, fields: &[&str]) -> Result<(), StorageError> {
        self.ensure_usable()?;
        if self.header_written {
            return Err(StorageError::new(
                StorageErrorKind::WriteFailed,
                "header already written",
            ));
        }
        let expected = self.options.schema.header(self.mode).len();
        if fields.len() != expected {
            return Err(StorageError::new(
                StorageErrorKind::WriteFailed,
                format!(
                    "header has {} fields but {} rows have {}",
                    fields.len(),
                    self.mode,
                    expected
                ),
            ));
        }

        self.encode(fields)?;
        self.header_written = true;
        // The header is not a data row
        self.pending_rows = 0;
        self.commit(0)
    }

    /// Accept one record. May trigger a batch flush.
    pub fn write_record(&mut self, record: &SampleRecord) -> Result<(), StorageError> {
        self.ensure_usable()?;
        if !self.header_written {
            return Err(StorageError::new(
                StorageErrorKind::WriteFailed,
                "record written before header",
            ));
        }
        let matches_mode = matches!(
            (record, self.mode),
            (SampleRecord::Iq(_), CaptureMode::Iq) | (SampleRecord::Frame(_), CaptureMode::RealTime)
        );
        if !matches_mode {
            return Err(StorageError::new(
                StorageErrorKind::WriteFailed,
                format!("record does not belong to a {} capture", self.mode),
            ));
        }

        let fields = self.options.schema.fields(record);
        self.encode(&fields)?;
        self.pending_rows += 1;

        if self.pending_rows >= self.options.batch_rows.max(1) || self.flush_due() {
            self.flush()?;
        }
        Ok(())
    }

    /// Whether the batch interval has elapsed with rows pending.
    pub fn flush_due(&self) -> bool {
        self.pending_rows > 0 && self.last_flush.elapsed() >= self.options.batch_interval
    }

    /// Flush only if the batch interval has elapsed. Lets an idle consumer honour
    /// the time bound.
    pub fn flush_if_due(&mut self) -> Result<(), StorageError> {
        if self.flush_due() {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Write every pending row to the sink.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        self.ensure_usable()?;
        let rows = self.pending_rows as u64;
        self.pending_rows = 0;
        self.commit(rows)
    }

    /// Final flush and release of the sink. Idempotent.
    pub fn close(&mut self) -> Result<WriterSummary, StorageError> {
        let result = if self.sink.is_some() && !self.failed {
            self.flush()
        } else {
            Ok(())
        };
        if self.sink.take().is_some() {
            tracing::info!(
                rows = self.rows_written,
                bytes = self.committed_bytes,
                "Output file closed"
            );
        }
        result.map(|()| self.summary())
    }

    /// Counters as of now.
    pub fn summary(&self) -> WriterSummary {
        WriterSummary {
            rows_written: self.rows_written,
            bytes_written: self.committed_bytes,
        }
    }

    fn ensure_usable(&self) -> Result<(), StorageError> {
        if self.sink.is_none() {
            return Err(StorageError::new(
                StorageErrorKind::WriteFailed,
                "writer is closed",
            ));
        }
        if self.failed {
            return Err(StorageError::new(
                StorageErrorKind::WriteFailed,
                format!(
                    "writer failed earlier; {} rows were committed",
                    self.rows_written
                ),
            ));
        }
        Ok(())
    }

    fn encode<I, F>(&mut self, fields: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        self.encoder.write_record(fields).map_err(|e| {
            StorageError::new(
                StorageErrorKind::WriteFailed,
                format!("failed to encode row: {e}"),
            )
        })
    }

    /// Move the encoded batch into the sink; `rows` data rows become durable.
    fn commit(&mut self, rows: u64) -> Result<(), StorageError> {
        let encoder = std::mem::replace(&mut self.encoder, self.builder.from_writer(Vec::new()));
        let batch = encoder.into_inner().map_err(|e| {
            StorageError::new(
                StorageErrorKind::WriteFailed,
                format!("failed to finish row batch: {}", e.error()),
            )
        })?;
        self.last_flush = Instant::now();
        if batch.is_empty() {
            return Ok(());
        }

        let committed = self.committed_bytes;
        let sync = self.options.sync_on_flush;
        let Some(sink) = self.sink.as_mut() else {
            return Err(StorageError::new(
                StorageErrorKind::WriteFailed,
                "writer is closed",
            ));
        };

        let written = sink
            .write_all(&batch)
            .and_then(|()| sink.flush())
            .and_then(|()| if sync { sink.sync() } else { Ok(()) });

        if let Err(e) = written {
            self.failed = true;
            if let Err(rollback) = sink.truncate_to(committed) {
                tracing::error!(error = %rollback, "Failed to roll back partial batch");
            }
            let mut err = StorageError::from_io(&e, StorageErrorKind::WriteFailed, "batch write failed");
            err.message = format!(
                "{}; {} rows committed, {} rows lost",
                err.message, self.rows_written, rows
            );
            return Err(err);
        }

        self.committed_bytes += batch.len() as u64;
        self.rows_written += rows;
        tracing::debug!(
            rows,
            bytes = batch.len(),
            total_rows = self.rows_written,
            "Flushed row batch"
        );
        Ok(())
    }
}

impl<S: RowSink> Drop for CsvRecordWriter<S> {
    fn drop(&mut self) {
        if self.sink.is_some() && !self.failed && self.pending_rows > 0 {
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, "Final flush on drop failed");
            }
        }
    }
}
