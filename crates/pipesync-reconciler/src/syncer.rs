use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pipesync_core::config::ReconcilerConfig;
use pipesync_core::error::{PipesyncError, Result};
use pipesync_core::reference::ObjectRef;
use pipesync_core::traits::{
    ClusterMembership, ExecutionEngine, PipelineStore, ProjectLookup, ProjectMembership, RunStore,
};
use pipesync_core::types::{LabelSelector, Run};

use crate::persist::{Commit, Persister};
use crate::phase::{guard_monotonic, transition, Action, Outcome, RunPhase};
use crate::tags::normalized_config;

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Unfinished runs in this instance's cluster.
    pub scanned: usize,
    pub runs_written: usize,
    pub pipelines_written: usize,
    pub errors: usize,
}

impl PassReport {
    fn record(&mut self, commit: &Commit) {
        self.runs_written += usize::from(commit.run_written);
        self.pipelines_written += usize::from(commit.pipeline_written);
    }
}

/// Periodically drives every unfinished run of one cluster through its
/// lifecycle against the execution engine.
///
/// Passes never overlap: the next sleep starts only after a pass returns.
/// Runs are processed one at a time in listing order, and a failure on one
/// run is logged and does not stop the pass.
pub struct Reconciler {
    config: ReconcilerConfig,
    runs: Arc<dyn RunStore>,
    projects: Arc<dyn ProjectLookup>,
    engine: Arc<dyn ExecutionEngine>,
    membership: Arc<dyn ClusterMembership>,
    persister: Persister,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        runs: Arc<dyn RunStore>,
        pipelines: Arc<dyn PipelineStore>,
        projects: Arc<dyn ProjectLookup>,
        engine: Arc<dyn ExecutionEngine>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            persister: Persister::new(runs.clone(), pipelines),
            runs,
            projects,
            engine,
            membership: Arc::new(ProjectMembership),
            cancel,
        }
    }

    /// Replace the default project-reference membership test.
    pub fn with_membership(mut self, membership: Arc<dyn ClusterMembership>) -> Self {
        self.membership = membership;
        self
    }

    pub fn persister(&self) -> &Persister {
        &self.persister
    }

    /// Run the sync loop. Blocks until cancelled; an in-flight pass completes first.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.config.interval_secs);
        info!(
            cluster = %self.config.cluster_id,
            interval_secs = self.config.interval_secs,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => {
                    info!("Reconciler shutting down");
                    break;
                }
            }

            let report = self.sync_once().await;
            if report.errors > 0 {
                warn!(
                    scanned = report.scanned,
                    errors = report.errors,
                    "Reconcile pass finished with errors"
                );
            }
        }
    }

    /// One full pass over the cluster's unfinished runs.
    pub async fn sync_once(&self) -> PassReport {
        let mut report = PassReport::default();

        let (fixed, failed) = self.persister.retry_stale_parents().await;
        report.pipelines_written += fixed;
        report.errors += failed;

        let selector = LabelSelector::unfinished();
        let all = match self.runs.list(&selector).await {
            Ok(runs) => runs,
            Err(e) => {
                error!(error = %e, "Error listing pipeline runs");
                report.errors += 1;
                return report;
            }
        };

        let runs: Vec<Run> = all
            .into_iter()
            .filter(|r| self.membership.contains(r, &self.config.cluster_id))
            .collect();
        if runs.is_empty() {
            return report;
        }
        report.scanned = runs.len();

        for run in &runs {
            if let Err(e) = self.reconcile_run(run, &mut report).await {
                error!(run = %run.id(), error = %e, "Error reconciling pipeline run");
                report.errors += 1;
            }
        }

        debug!(
            scanned = report.scanned,
            runs_written = report.runs_written,
            pipelines_written = report.pipelines_written,
            "Sync pipeline run state complete"
        );
        report
    }

    async fn reconcile_run(&self, run: &Run, report: &mut PassReport) -> Result<()> {
        let phase = RunPhase::of(&run.status);
        let next = match phase.action() {
            Action::Launch => self.check_and_launch(run).await,
            Action::Sync => self.sync_progress(run).await,
            Action::Settle => None,
        };

        // An unchanged run is committed as-is: no run write, but its parent
        // is still checked against it.
        let next = next.unwrap_or_else(|| run.clone());
        let commit = self.persister.commit(run, next).await?;
        report.record(&commit);
        match commit.parent_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Precheck, then launch a normalized copy when the engine is ready.
    async fn check_and_launch(&self, run: &Run) -> Option<Run> {
        let ready = match self.call("precheck", self.engine.precheck(run)).await {
            Ok(ready) => ready,
            Err(e) => {
                error!(run = %run.id(), error = %e, "Precheck failed");
                return transition(run, Outcome::PrecheckFailed(&e.to_string()));
            }
        };

        if !ready {
            return transition(
                run,
                Outcome::NotReady {
                    message: &self.config.initializing_message,
                },
            );
        }

        let launch_copy = self.launch_copy(run).await;
        match self.call("launch", self.engine.launch(&launch_copy)).await {
            Ok(()) => {
                info!(run = %run.id(), "Run launched");
                transition(run, Outcome::Launched)
            }
            Err(e) => {
                error!(run = %run.id(), error = %e, "Launch failed");
                transition(run, Outcome::LaunchFailed(&e.to_string()))
            }
        }
    }

    async fn sync_progress(&self, run: &Run) -> Option<Run> {
        match self.call("sync", self.engine.sync_progress(run)).await {
            Ok(outcome) if outcome.changed => {
                let (status, refused) = guard_monotonic(&run.status, outcome.run.status);
                for kind in refused {
                    warn!(
                        run = %run.id(),
                        condition = ?kind,
                        "Engine tried to reset a resolved condition, keeping it"
                    );
                }
                transition(run, Outcome::Synced(status))
            }
            Ok(_) => None,
            Err(e) => {
                error!(run = %run.id(), error = %e, "Progress sync failed");
                transition(run, Outcome::SyncFailed(&e.to_string()))
            }
        }
    }

    /// The run as handed to the engine: publish tags for the default registry
    /// normalized, the stored record untouched.
    async fn launch_copy(&self, run: &Run) -> Run {
        let mut copy = run.clone();
        let Some(registry) = self.config.default_registry.as_deref() else {
            return copy;
        };

        let project = match ObjectRef::parse(&run.spec.project_name) {
            Ok(r) => self.projects.get(&r.namespace, &r.name).await,
            Err(e) => Err(e),
        };
        match project {
            Ok(project) => {
                copy.spec.pipeline_config = normalized_config(
                    &run.spec.pipeline_config,
                    registry,
                    &project.display_name,
                    &self.config.image_tag_var,
                );
            }
            Err(e) => {
                error!(
                    run = %run.id(),
                    error = %e,
                    "Project lookup failed, launching with original image tags"
                );
            }
        }
        copy
    }

    /// Await an engine call, bounded by `engine_timeout_secs` when configured.
    async fn call<T>(&self, op: &'static str, fut: BoxFuture<'_, Result<T>>) -> Result<T> {
        match self.config.engine_timeout_secs {
            Some(timeout_secs) => {
                tokio::time::timeout(Duration::from_secs(timeout_secs), fut)
                    .await
                    .map_err(|_| PipesyncError::EngineTimeout { op, timeout_secs })?
            }
            None => fut.await,
        }
    }
}
