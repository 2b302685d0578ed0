//! Run lifecycle as an explicit state machine.
//!
//! A run's phase is derived from its three conditions and its execution
//! state. The phase picks the engine call to make, and [`transition`] maps
//! the phase plus the engine's answer to the next run record. Nothing here
//! performs I/O; the caller persists the returned record.

use pipesync_core::types::{ConditionStatus, ConditionType, ExecutionState, Run, RunStatus};

/// Progress message recorded on `Provisioned` once the engine accepted a run.
pub const LAUNCHED_MESSAGE: &str = "Assigning jobs to pipeline engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    /// `Initialized` is Unknown and nothing has been reported yet.
    Pending,
    /// `Initialized` is Unknown; the engine was not ready and the run says so.
    Initializing,
    /// Launched; the engine owns progress.
    Running,
    /// `Built` resolved to True or the engine reported success.
    Succeeded,
    /// A condition resolved to False or the engine reported a failed state.
    Failed,
}

/// What the reconciler does with a run in a given phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Precheck, then launch when ready.
    Launch,
    /// Pull progress from the engine.
    Sync,
    /// No engine call; only make sure the finish marker is persisted.
    Settle,
}

impl RunPhase {
    pub fn of(status: &RunStatus) -> Self {
        if status.any_false()
            || matches!(
                status.execution_state,
                ExecutionState::Failed | ExecutionState::Aborted | ExecutionState::Denied
            )
        {
            return RunPhase::Failed;
        }
        if status.is_true(ConditionType::Initialized) {
            if status.is_true(ConditionType::Built)
                || status.execution_state == ExecutionState::Success
            {
                RunPhase::Succeeded
            } else {
                RunPhase::Running
            }
        } else if status.message(ConditionType::Initialized).is_empty() {
            RunPhase::Pending
        } else {
            RunPhase::Initializing
        }
    }

    pub fn action(self) -> Action {
        match self {
            RunPhase::Pending | RunPhase::Initializing => Action::Launch,
            RunPhase::Running => Action::Sync,
            RunPhase::Succeeded | RunPhase::Failed => Action::Settle,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Succeeded | RunPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Pending => "pending",
            RunPhase::Initializing => "initializing",
            RunPhase::Running => "running",
            RunPhase::Succeeded => "succeeded",
            RunPhase::Failed => "failed",
        }
    }
}

/// The engine's answer to the call the phase asked for.
#[derive(Debug, Clone)]
pub enum Outcome<'a> {
    PrecheckFailed(&'a str),
    NotReady { message: &'a str },
    Launched,
    LaunchFailed(&'a str),
    /// The engine reported a change; carries the (already guarded) status.
    Synced(RunStatus),
    SyncFailed(&'a str),
}

/// Next run record for `run` given an engine outcome.
///
/// Returns `None` when nothing changes, including outcomes that do not
/// belong to the run's current phase.
pub fn transition(run: &Run, outcome: Outcome<'_>) -> Option<Run> {
    let action = RunPhase::of(&run.status).action();
    let mut next = run.clone();

    match (action, outcome) {
        (Action::Launch, Outcome::PrecheckFailed(err)) | (Action::Sync, Outcome::SyncFailed(err)) => {
            next.status.set_failed(ConditionType::Built, err);
            next.status.execution_state = ExecutionState::Failed;
        }
        (Action::Launch, Outcome::NotReady { message }) => {
            if !run.status.message(ConditionType::Initialized).is_empty() {
                return None;
            }
            next.status.set_message(ConditionType::Initialized, message);
        }
        (Action::Launch, Outcome::Launched) => {
            next.status.set_status(ConditionType::Initialized, ConditionStatus::True);
            next.status.ensure_condition(ConditionType::Provisioned);
            next.status.set_message(ConditionType::Provisioned, LAUNCHED_MESSAGE);
        }
        (Action::Launch, Outcome::LaunchFailed(err)) => {
            next.status.set_failed(ConditionType::Provisioned, err);
            next.status.execution_state = ExecutionState::Failed;
        }
        (Action::Sync, Outcome::Synced(status)) => {
            next.status = status;
        }
        _ => return None,
    }

    (next != *run).then_some(next)
}

/// Merge an engine-reported status over the stored one without ever moving
/// a resolved condition back to Unknown.
///
/// Returns the merged status and the conditions whose regression was refused.
pub fn guard_monotonic(
    before: &RunStatus,
    mut after: RunStatus,
) -> (RunStatus, Vec<ConditionType>) {
    let mut refused = Vec::new();

    for kind in ConditionType::ALL {
        let Some(prev) = before.condition(kind) else {
            continue;
        };
        if !prev.status.is_resolved() {
            // Unknown conditions the engine dropped are kept as they were.
            if after.condition(kind).is_none() {
                after.conditions.push(prev.clone());
            }
            continue;
        }
        if !after.status_of(kind).is_resolved() {
            after.conditions.retain(|c| c.kind != kind);
            after.conditions.push(prev.clone());
            refused.push(kind);
        }
    }

    // The end time belongs to the persistence step.
    after.ended = before.ended.clone();

    (after, refused)
}
