//! End-to-end capture runs against the simulated analyzer.
//!
//! Each test drives a full `SessionController::run`: open, configure, create
//! the file, arm, run both pipeline tasks and tear everything down.

use spectrum_daq::acquisition::{CancelToken, CaptureBudget, SessionController, StopReason};
use spectrum_daq::config::{CaptureMode, Settings};
use spectrum_daq::data::ring_buffer::OverflowPolicy;
use spectrum_daq::data::storage::RowSchema;
use spectrum_daq::error::DeviceErrorKind;
use spectrum_daq::hardware::{FaultScenario, MockAnalyzer};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_settings(mode: CaptureMode) -> Settings {
    let mut settings = Settings::default();
    settings.acquisition.mode = mode;
    settings.pipeline.pull_timeout = Duration::from_millis(500);
    settings.pipeline.poll_interval = Duration::from_millis(10);
    settings.pipeline.iq_block_size = 4;
    settings
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ten_iq_samples_ramp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iq.csv");
    let mock = Arc::new(MockAnalyzer::new());
    let controller = SessionController::new(mock.clone(), &test_settings(CaptureMode::Iq));

    let report = controller
        .run(CaptureBudget::Samples(10), &path, CancelToken::never())
        .await
        .expect("capture should succeed");

    assert_eq!(report.rows_written, 10);
    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.dropped, 0);

    let mut expected = String::from("iq-data,index\n");
    for k in 0..10 {
        expected.push_str(&format!("{k},{k}\n"));
    }
    assert_eq!(std::fs::read_to_string(&path).unwrap(), expected);

    let counters = mock.counters();
    assert_eq!(counters.opens, 1);
    assert_eq!(counters.closes, 1);
    assert_eq!(counters.initiates, 1);
    assert_eq!(counters.aborts, 1);
}

#[tokio::test]
async fn test_busy_device_creates_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iq.csv");
    let mock = Arc::new(
        MockAnalyzer::new().with_fault(FaultScenario::OpenFails(DeviceErrorKind::Busy)),
    );
    let controller = SessionController::new(mock.clone(), &test_settings(CaptureMode::Iq));

    let err = controller
        .run(CaptureBudget::Samples(10), &path, CancelToken::never())
        .await
        .unwrap_err();

    assert_eq!(err.source.device_kind(), Some(DeviceErrorKind::Busy));
    assert_eq!(err.rows_written, 0);
    assert!(!path.exists());
    assert_eq!(mock.counters().opens, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_real_time_frames_with_device_latency() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("realtime.csv");
    let mock = Arc::new(MockAnalyzer::new().with_latency(Duration::from_millis(50)));

    let mut settings = test_settings(CaptureMode::RealTime);
    settings.acquisition.frame_rate = 30;
    settings.pipeline.buffer_capacity = 2;
    settings.pipeline.overflow_policy = OverflowPolicy::Block;
    let controller = SessionController::new(mock, &settings);

    let start = Instant::now();
    let report = controller
        .run(CaptureBudget::Samples(30), &path, CancelToken::never())
        .await
        .expect("capture should succeed");
    let wall = start.elapsed();

    assert!(wall >= Duration::from_millis(1500), "finished in {wall:?}");
    assert_eq!(report.rows_written, 30);
    assert_eq!(report.dropped, 0);

    let contents = std::fs::read_to_string(&path).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some("frame-sample,max-hold"));
    let rows: Vec<(f32, f32)> = lines
        .map(|line| {
            let (peak, hold) = line.split_once(',').unwrap();
            (peak.parse().unwrap(), hold.parse().unwrap())
        })
        .collect();
    assert_eq!(rows.len(), 30);
    for (peak, hold) in &rows {
        assert!(hold >= peak);
    }
    // Max-hold never decreases over a run
    assert!(rows.windows(2).all(|w| w[1].1 >= w[0].1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_extended_iq_schema() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iq.csv");
    let mut settings = test_settings(CaptureMode::Iq);
    settings.storage.schema = RowSchema::Extended;
    settings.storage.delimiter = ';';
    let controller = SessionController::new(Arc::new(MockAnalyzer::new()), &settings);

    controller
        .run(CaptureBudget::Samples(3), &path, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "i;q;index\n0;0;0\n1;-1;1\n2;-2;2\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_fault_keeps_complete_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iq.csv");
    let mock = Arc::new(MockAnalyzer::new().with_fault(FaultScenario::FailAfterFetches(2)));
    let controller = SessionController::new(mock.clone(), &test_settings(CaptureMode::Iq));

    let err = controller
        .run(CaptureBudget::Samples(100), &path, CancelToken::never())
        .await
        .unwrap_err();

    assert_eq!(err.source.device_kind(), Some(DeviceErrorKind::DriverFault));
    // Two blocks of four made it through before the fault
    assert_eq!(err.rows_written, 8);
    assert!(err.to_string().contains("8 rows written"));

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 9);
    assert!(contents.ends_with('\n'));
    assert!(!mock.is_open());
}

/// Producer outruns the writer on a single-threaded runtime, so most records
/// are evicted. Every produced record is either in the file or counted.
#[tokio::test]
async fn test_drop_oldest_accounts_for_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iq.csv");
    let mut settings = test_settings(CaptureMode::Iq);
    settings.pipeline.iq_block_size = 512;
    settings.pipeline.buffer_capacity = 2;
    settings.pipeline.overflow_policy = OverflowPolicy::DropOldest;
    settings.storage.batch_rows = 1;
    let controller = SessionController::new(Arc::new(MockAnalyzer::new()), &settings);
    let progress = controller.progress();

    let report = controller
        .run(CaptureBudget::Samples(5_000), &path, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(report.records_produced, 5_000);
    assert!(report.dropped > 0, "writer kept up with an unthrottled producer");
    assert_eq!(report.rows_written + report.dropped, report.records_produced);
    assert_eq!(progress.dropped(), report.dropped);

    let contents = std::fs::read_to_string(&path).unwrap();
    let indices: Vec<u64> = contents
        .lines()
        .skip(1)
        .map(|line| line.split(',').nth(1).unwrap().parse().unwrap())
        .collect();
    assert_eq!(indices.len() as u64, report.rows_written);
    assert!(indices.windows(2).all(|w| w[0] < w[1]));
    // The newest record is never the one evicted
    assert_eq!(indices.last(), Some(&4_999));
}
