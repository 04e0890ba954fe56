//! Background measurement worker.
//!
//! At most one check or measure task runs at a time. The task executes on the
//! tokio runtime so the invoking context never waits on instrument I/O or
//! settling delays. When the task ends, exactly one `TaskCompletion` is sent on
//! the completion channel handed out by `MeasureWorker::new`; the invoking
//! context drains it from its own loop.
//!
//! Errors never escape the task: they are logged and folded into the
//! completion's `TaskOutcome`. A panic inside the task is reported the same way.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::cancel::CancelToken;
use super::controller::InstrumentController;
use crate::error::{DaqError, DaqResult};

/// Which controller operation a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Device presence check
    Check,
    /// Full characterization sweep
    Measure,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Check => f.write_str("check"),
            TaskKind::Measure => f.write_str("measure"),
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Ran to the end
    Completed,
    /// Stopped at a checkpoint after the instrument shutdown ran
    Cancelled,
    /// Ended with an error, carried as its message
    Failed(String),
}

impl TaskOutcome {
    /// True only for `Completed`.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }

    fn from_result(result: DaqResult<()>) -> Self {
        match result {
            Ok(()) => TaskOutcome::Completed,
            Err(e) if e.is_cancelled() => TaskOutcome::Cancelled,
            Err(e) => TaskOutcome::Failed(e.to_string()),
        }
    }
}

/// Completion notice for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletion {
    /// Operation that ran
    pub kind: TaskKind,
    /// Device name the task was started for
    pub device: String,
    /// How it ended
    pub outcome: TaskOutcome,
}

/// Runs check and measure tasks in the background, one at a time.
pub struct MeasureWorker {
    controller: Arc<InstrumentController>,
    busy: Arc<AtomicBool>,
    /// Token of the running task; `busy` only changes while this is locked
    token: Arc<Mutex<Option<CancelToken>>>,
    completions: mpsc::UnboundedSender<TaskCompletion>,
}

impl MeasureWorker {
    /// Create a worker and the receiving end of its completion channel.
    pub fn new(
        controller: Arc<InstrumentController>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskCompletion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Self {
            controller,
            busy: Arc::new(AtomicBool::new(false)),
            token: Arc::new(Mutex::new(None)),
            completions: tx,
        };
        (worker, rx)
    }

    /// Start a task with a fresh cancel token.
    ///
    /// Fails with `WorkerBusy` while a previous task has not completed. Must be
    /// called from within a tokio runtime.
    pub fn start(&self, kind: TaskKind, device: &str) -> DaqResult<CancelToken> {
        let token = {
            let mut slot = self.token.lock();
            if self.busy.swap(true, Ordering::SeqCst) {
                return Err(DaqError::WorkerBusy);
            }
            let token = CancelToken::new();
            *slot = Some(token.clone());
            token
        };

        let controller = Arc::clone(&self.controller);
        let busy = Arc::clone(&self.busy);
        let slot = Arc::clone(&self.token);
        let completions = self.completions.clone();
        let device = device.to_string();
        let task_token = token.clone();

        info!(%kind, device = %device, "Starting task");
        tokio::spawn(async move {
            let run_device = device.clone();
            let run = tokio::spawn(async move {
                match kind {
                    TaskKind::Check => controller.check(&task_token, &run_device).await,
                    TaskKind::Measure => controller.measure(&task_token, &run_device).await,
                }
            });

            let outcome = match run.await {
                Ok(result) => TaskOutcome::from_result(result),
                Err(e) => TaskOutcome::Failed(format!("task aborted: {e}")),
            };
            match &outcome {
                TaskOutcome::Completed => info!(%kind, "Task completed"),
                TaskOutcome::Cancelled => warn!(%kind, "Task cancelled"),
                TaskOutcome::Failed(reason) => error!(%kind, reason = %reason, "Task failed"),
            }

            {
                let mut slot = slot.lock();
                *slot = None;
                busy.store(false, Ordering::SeqCst);
            }
            if completions
                .send(TaskCompletion {
                    kind,
                    device,
                    outcome,
                })
                .is_err()
            {
                warn!("Completion receiver dropped");
            }
        });

        Ok(token)
    }

    /// Request cancellation of the running task. Returns `false` when no task
    /// is running or it was already cancelled.
    pub fn cancel(&self) -> bool {
        match self.token.lock().as_ref() {
            Some(token) => token.cancel(),
            None => false,
        }
    }

    /// Whether a task is running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}
