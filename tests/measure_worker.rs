//! Background worker: single outstanding task, one completion per task.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::timeout;

use common::{small_offsets, small_params, BenchBuilder};
use demod_char::config::AppConfig;
use demod_char::error::DaqError;
use demod_char::instrument::Role;
use demod_char::measurement::{
    InstrumentController, MeasureEvent, MeasureWorker, SettlingPolicy, TaskKind, TaskOutcome,
};

fn controller(settling: SettlingPolicy) -> (Arc<InstrumentController>, common::Bench) {
    let bench = BenchBuilder::new().build();
    let controller = InstrumentController::with_bank(AppConfig::default(), bench.bank.clone())
        .with_secondary(small_params())
        .with_offsets(small_offsets())
        .with_settling(settling);
    (Arc::new(controller), bench)
}

fn slow() -> SettlingPolicy {
    SettlingPolicy {
        output: Duration::from_millis(500),
        marker: Duration::from_millis(100),
        shutdown: Duration::from_millis(100),
    }
}

#[tokio::test]
async fn test_measure_completes_once() {
    let (controller, _bench) = controller(SettlingPolicy::none());
    controller.connect().await.unwrap();
    let (worker, mut completions) = MeasureWorker::new(Arc::clone(&controller));

    worker.start(TaskKind::Measure, "demodulator").unwrap();
    let done = timeout(Duration::from_secs(5), completions.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(done.kind, TaskKind::Measure);
    assert_eq!(done.device, "demodulator");
    assert_eq!(done.outcome, TaskOutcome::Completed);
    assert!(!worker.is_busy());
    assert!(matches!(completions.try_recv(), Err(TryRecvError::Empty)));

    assert!(controller.has_result());
    let result = controller.result();
    let result = result.read();
    assert!(result.is_ready());
    assert_eq!(result.raw().len(), 6);
    assert_eq!(result.curves().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_second_task_refused_while_running() {
    let (controller, _bench) = controller(slow());
    controller.connect().await.unwrap();
    let (worker, mut completions) = MeasureWorker::new(controller);

    worker.start(TaskKind::Measure, "demodulator").unwrap();
    assert!(worker.is_busy());
    assert!(matches!(
        worker.start(TaskKind::Check, "demodulator"),
        Err(DaqError::WorkerBusy)
    ));

    let done = completions.recv().await.unwrap();
    assert_eq!(done.kind, TaskKind::Measure);
    assert!(done.outcome.is_success());

    // Idle again: the next task is accepted
    worker.start(TaskKind::Check, "demodulator").unwrap();
    let done = completions.recv().await.unwrap();
    assert_eq!(done.kind, TaskKind::Check);
    assert_eq!(done.outcome, TaskOutcome::Completed);
    assert!(matches!(completions.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reports_cancelled_after_shutdown() {
    let (controller, bench) = controller(slow());
    controller.connect().await.unwrap();
    let mut events = controller.subscribe();
    let (worker, mut completions) = MeasureWorker::new(Arc::clone(&controller));

    let token = worker.start(TaskKind::Measure, "demodulator").unwrap();
    loop {
        if let MeasureEvent::PointReady { index: 1, .. } = events.recv().await.unwrap() {
            break;
        }
    }
    assert!(worker.cancel());
    assert!(token.is_cancelled());
    assert!(!worker.cancel(), "second cancel is a no-op");

    let done = completions.recv().await.unwrap();
    assert_eq!(done.outcome, TaskOutcome::Cancelled);
    assert!(!controller.has_result());

    // The point in flight when cancel arrived may still complete
    let points = controller.result().read().raw().len();
    assert!((2..=3).contains(&points), "got {points} points");
    assert!(!controller.result().read().is_ready());
    assert_eq!(bench.count(Role::Source, "OUTPut OFF"), 1);
}

#[tokio::test]
async fn test_failure_is_reported_not_raised() {
    let (controller, _bench) = controller(SettlingPolicy::none());
    let (worker, mut completions) = MeasureWorker::new(controller);

    // Never connected
    worker.start(TaskKind::Measure, "demodulator").unwrap();
    let done = completions.recv().await.unwrap();
    match done.outcome {
        TaskOutcome::Failed(reason) => assert!(reason.contains("not connected")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!worker.is_busy());
    assert!(!worker.cancel());
}

#[tokio::test]
async fn test_check_unknown_device_fails() {
    let (controller, _bench) = controller(SettlingPolicy::none());
    controller.connect().await.unwrap();
    let (worker, mut completions) = MeasureWorker::new(Arc::clone(&controller));

    worker.start(TaskKind::Check, "mixer").unwrap();
    let done = completions.recv().await.unwrap();
    assert!(matches!(done.outcome, TaskOutcome::Failed(ref reason) if reason.contains("mixer")));
    assert!(!controller.is_present());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_targets_current_task_only() {
    let (controller, _bench) = controller(slow());
    controller.connect().await.unwrap();
    let (worker, mut completions) = MeasureWorker::new(controller);

    let first = worker.start(TaskKind::Check, "demodulator").unwrap();
    assert_eq!(completions.recv().await.unwrap().outcome, TaskOutcome::Completed);

    // The finished task's token is released, not cancelled after the fact
    assert!(!worker.cancel());
    assert!(!first.is_cancelled());

    let second = worker.start(TaskKind::Measure, "demodulator").unwrap();
    assert!(worker.cancel());
    assert!(second.is_cancelled());
    assert!(!first.is_cancelled());

    let done = completions.recv().await.unwrap();
    assert_eq!(done.kind, TaskKind::Measure);
    assert_eq!(done.outcome, TaskOutcome::Cancelled);
    assert!(!worker.is_busy());
    assert!(!worker.cancel());
}
