use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use pipesync_core::error::{PipesyncError, Result};
use pipesync_core::traits::{ExecutionEngine, SyncOutcome};
use pipesync_core::types::{Run, RunStatus};

/// One scripted answer to `sync_progress`.
#[derive(Debug, Clone)]
pub enum SyncStep {
    /// The engine has nothing new.
    Unchanged,
    /// The engine reports this status.
    Status(RunStatus),
    Error(String),
}

/// Execution engine with canned answers that records what it was asked.
pub struct ScriptedEngine {
    precheck: Mutex<std::result::Result<bool, String>>,
    launch: Mutex<std::result::Result<(), String>>,
    sync: Mutex<VecDeque<SyncStep>>,
    hang_precheck: AtomicBool,
    launched: Mutex<Vec<Run>>,
    precheck_calls: AtomicUsize,
    sync_calls: AtomicUsize,
}

impl ScriptedEngine {
    /// An engine whose precheck reports ready and whose launches succeed.
    pub fn ready() -> Self {
        Self::with_precheck(Ok(true))
    }

    /// An engine that keeps reporting not ready.
    pub fn not_ready() -> Self {
        Self::with_precheck(Ok(false))
    }

    /// An engine whose precheck errors.
    pub fn failing_precheck(message: &str) -> Self {
        Self::with_precheck(Err(message.to_string()))
    }

    fn with_precheck(precheck: std::result::Result<bool, String>) -> Self {
        Self {
            precheck: Mutex::new(precheck),
            launch: Mutex::new(Ok(())),
            sync: Mutex::new(VecDeque::new()),
            hang_precheck: AtomicBool::new(false),
            launched: Mutex::new(Vec::new()),
            precheck_calls: AtomicUsize::new(0),
            sync_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        *self.precheck.lock().unwrap() = Ok(ready);
    }

    pub fn fail_launch(&self, message: &str) {
        *self.launch.lock().unwrap() = Err(message.to_string());
    }

    /// Make precheck never return (for timeout tests).
    pub fn hang_precheck(&self) {
        self.hang_precheck.store(true, Ordering::SeqCst);
    }

    /// Queue an answer for the next `sync_progress` call. An empty queue
    /// answers `Unchanged`.
    pub fn push_sync(&self, step: SyncStep) {
        self.sync.lock().unwrap().push_back(step);
    }

    /// Runs exactly as they were handed to `launch`.
    pub fn launched(&self) -> Vec<Run> {
        self.launched.lock().unwrap().clone()
    }

    pub fn precheck_calls(&self) -> usize {
        self.precheck_calls.load(Ordering::SeqCst)
    }

    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }
}

impl ExecutionEngine for ScriptedEngine {
    fn precheck<'a>(&'a self, _run: &'a Run) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.precheck_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_precheck.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            let answer = self.precheck.lock().unwrap().clone();
            answer.map_err(PipesyncError::Engine)
        })
    }

    fn launch<'a>(&'a self, run: &'a Run) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let answer = self.launch.lock().unwrap().clone();
            if answer.is_ok() {
                self.launched.lock().unwrap().push(run.clone());
            }
            answer.map_err(PipesyncError::Engine)
        })
    }

    fn sync_progress<'a>(&'a self, run: &'a Run) -> BoxFuture<'a, Result<SyncOutcome>> {
        Box::pin(async move {
            self.sync_calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .sync
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(SyncStep::Unchanged);
            match step {
                SyncStep::Unchanged => Ok(SyncOutcome {
                    run: run.clone(),
                    changed: false,
                }),
                SyncStep::Status(status) => {
                    let mut next = run.clone();
                    next.status = status;
                    Ok(SyncOutcome {
                        run: next,
                        changed: true,
                    })
                }
                SyncStep::Error(message) => Err(PipesyncError::Engine(message)),
            }
        })
    }
}
