//! Integration tests for graceful shutdown behavior.
//!
//! Cancellation stops acquisition, but every record already in the ring
//! buffer still reaches the file.

use spectrum_daq::acquisition::{
    cancellation, CancelToken, CaptureBudget, SessionController, StopReason,
};
use spectrum_daq::config::{CaptureMode, Settings};
use spectrum_daq::hardware::{FaultScenario, MockAnalyzer};
use std::sync::Arc;
use std::time::Duration;

/// Settings that keep accepted rows in memory until the writer closes.
fn buffered_settings() -> Settings {
    let mut settings = Settings::default();
    settings.acquisition.mode = CaptureMode::Iq;
    settings.pipeline.iq_block_size = 1;
    settings.pipeline.pull_timeout = Duration::from_millis(50);
    settings.pipeline.max_consecutive_timeouts = 1_000;
    settings.pipeline.poll_interval = Duration::from_millis(10);
    settings.storage.batch_rows = 1_000;
    settings.storage.batch_interval = Duration::from_secs(3600);
    settings
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_writes_buffered_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iq.csv");
    // The device delivers four samples, then goes quiet
    let mock = Arc::new(MockAnalyzer::new().with_fault(FaultScenario::StallAfterFetches(4)));
    let controller = Arc::new(SessionController::new(mock.clone(), &buffered_settings()));
    let progress = controller.progress();
    let (cancel, token) = cancellation();

    let run = tokio::spawn({
        let controller = controller.clone();
        let path = path.clone();
        async move {
            controller
                .run(CaptureBudget::Samples(10), &path, token)
                .await
        }
    });

    wait_until(|| progress.produced() == 4).await;
    assert_eq!(progress.written(), 0, "rows should still be buffered");
    cancel.cancel();

    let report = run.await.unwrap().expect("cancelled run is not an error");
    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert_eq!(report.rows_written, 4);

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "iq-data,index\n0,0\n1,1\n2,2\n3,3\n"
    );
    let counters = mock.counters();
    assert_eq!(counters.aborts, 1);
    assert_eq!(counters.closes, 1);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iq.csv");
    let mock = Arc::new(MockAnalyzer::new());
    let controller = SessionController::new(mock.clone(), &buffered_settings());
    let (cancel, token) = cancellation();
    cancel.cancel();

    let report = controller
        .run(CaptureBudget::Samples(10), &path, token)
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert_eq!(report.rows_written, 0);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "iq-data,index\n");
    assert!(!mock.is_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_during_duration_budget() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("realtime.csv");
    let mut settings = buffered_settings();
    settings.acquisition.mode = CaptureMode::RealTime;
    settings.acquisition.frame_rate = 50;
    let mock = Arc::new(MockAnalyzer::new());
    let controller = SessionController::new(mock.clone(), &settings);
    let (cancel, token) = cancellation();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        controller.run(
            CaptureBudget::Duration(Duration::from_secs(60)),
            &path,
            token,
        ),
    )
    .await
    .expect("cancellation should end the run early")
    .unwrap();
    canceller.await.unwrap();

    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert!(report.rows_written > 0);
    let rows = std::fs::read_to_string(&path).unwrap().lines().count() as u64;
    assert_eq!(rows, report.rows_written + 1);
    assert!(!mock.is_open());
}

#[tokio::test]
async fn test_never_token_is_not_cancelled() {
    let token = CancelToken::never();
    assert!(!token.is_cancelled());
    let waited = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
    assert!(waited.is_err());
}
