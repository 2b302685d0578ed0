//! Writes a reconciled run and keeps its parent pipeline's last-run state in step.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use pipesync_core::error::{PipesyncError, Result};
use pipesync_core::reference::ObjectRef;
use pipesync_core::traits::{PipelineStore, RunStore};
use pipesync_core::types::{ConditionType, Pipeline, Run, RunStatus, FINISHED_LABEL};

/// Whether a run has reached the end of its lifecycle.
pub fn is_finished(status: &RunStatus) -> bool {
    status.any_false()
        || status.is_true(ConditionType::Built)
        || status.execution_state.is_terminal()
}

/// Set the finish label and, once, the end timestamp on a finished run.
pub fn mark_finished(run: &mut Run, now: DateTime<Utc>) {
    if !is_finished(&run.status) {
        return;
    }
    run.metadata
        .labels
        .insert(FINISHED_LABEL.to_string(), "true".to_string());
    if run.status.ended.as_deref().map_or(true, str::is_empty) {
        run.status.ended = Some(now.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
}

/// The pipeline with `last_run_state` updated, if it tracks this run and is stale.
pub fn mirrored_parent(pipeline: &Pipeline, run: &Run) -> Option<Pipeline> {
    let tracks_run = pipeline.status.last_execution_id.as_deref() == Some(run.id().as_str());
    if !tracks_run || pipeline.status.last_run_state == Some(run.status.execution_state) {
        return None;
    }
    let mut next = pipeline.clone();
    next.status.last_run_state = Some(run.status.execution_state);
    Some(next)
}

/// Writes performed by one commit.
#[derive(Debug, Default)]
pub struct Commit {
    pub run_written: bool,
    pub pipeline_written: bool,
    /// Set when the run was handled but its parent could not be brought in line.
    pub parent_error: Option<PipesyncError>,
}

/// The persistence step: finish marker, run write, parent mirroring.
///
/// Every write replaces the whole record keyed on the version the reconciler
/// read, so a concurrent writer turns into a `Conflict` that the next pass
/// resolves from fresh state. Unfinished runs have their parent checked on
/// every pass. Parent updates that failed after their run was written are
/// also remembered and retried at the start of the next pass, since the run
/// itself may already be out of the unfinished listing.
pub struct Persister {
    runs: Arc<dyn RunStore>,
    pipelines: Arc<dyn PipelineStore>,
    stale_parents: Mutex<HashMap<String, Run>>,
}

impl Persister {
    pub fn new(runs: Arc<dyn RunStore>, pipelines: Arc<dyn PipelineStore>) -> Self {
        Self {
            runs,
            pipelines,
            stale_parents: Mutex::new(HashMap::new()),
        }
    }

    /// Persist `next` as the successor of the stored `current` record.
    ///
    /// The run is only written when the finished record differs from
    /// `current`. A run write failure is returned as the error and the parent
    /// is not touched; a parent failure is reported in [`Commit::parent_error`].
    pub async fn commit(&self, current: &Run, mut next: Run) -> Result<Commit> {
        mark_finished(&mut next, Utc::now());

        let mut commit = Commit::default();
        let written = if next == *current {
            next
        } else {
            let written = self.runs.update(next).await?;
            commit.run_written = true;
            if written.is_labeled_finished() && !current.is_labeled_finished() {
                info!(
                    run = %written.id(),
                    state = %written.status.execution_state,
                    "Run finished"
                );
            }
            written
        };

        match self.mirror_parent(&written).await {
            Ok(pipeline_written) => {
                commit.pipeline_written = pipeline_written;
                self.stale_parents.lock().await.remove(&written.id());
            }
            Err(e) => {
                if commit.run_written && !e.is_invalid_reference() {
                    self.stale_parents.lock().await.insert(written.id(), written);
                }
                commit.parent_error = Some(e);
            }
        }
        Ok(commit)
    }

    /// Retry parent updates left over from earlier passes.
    ///
    /// Returns `(pipelines_written, errors)`.
    pub async fn retry_stale_parents(&self) -> (usize, usize) {
        let pending: Vec<Run> = {
            let mut stale = self.stale_parents.lock().await;
            stale.drain().map(|(_, run)| run).collect()
        };

        let mut written = 0;
        let mut errors = 0;
        for run in pending {
            match self.mirror_parent(&run).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(run = %run.id(), error = %e, "Parent pipeline still out of date");
                    errors += 1;
                    self.stale_parents.lock().await.insert(run.id(), run);
                }
            }
        }
        (written, errors)
    }

    pub async fn stale_parent_count(&self) -> usize {
        self.stale_parents.lock().await.len()
    }

    /// Bring the parent's `last_run_state` in line with `run`.
    async fn mirror_parent(&self, run: &Run) -> Result<bool> {
        let parent = ObjectRef::parse(&run.spec.pipeline_name)?;
        let pipeline = match self.pipelines.get(&parent.namespace, &parent.name).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => {
                warn!(run = %run.id(), pipeline = %parent, "Pipeline of run not found");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match mirrored_parent(&pipeline, run) {
            Some(next) => {
                self.pipelines.update(next).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
