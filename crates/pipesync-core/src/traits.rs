use futures::future::BoxFuture;

use crate::error::Result;
use crate::reference::ObjectRef;
use crate::types::*;

/// Run store — list, get, and optimistic full-record update.
pub trait RunStore: Send + Sync + 'static {
    /// List runs whose labels match the selector.
    fn list<'a>(&'a self, selector: &'a LabelSelector) -> BoxFuture<'a, Result<Vec<Run>>>;

    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, Result<Run>>;

    /// Replace the stored run. Fails with `Conflict` when `run.metadata.resource_version`
    /// is not the stored version; returns the record with its new version.
    fn update(&self, run: Run) -> BoxFuture<'_, Result<Run>>;
}

/// Pipeline store — parent records of runs.
pub trait PipelineStore: Send + Sync + 'static {
    /// Returns `NotFound` when the pipeline does not exist.
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, Result<Pipeline>>;

    fn update(&self, pipeline: Pipeline) -> BoxFuture<'_, Result<Pipeline>>;
}

/// Project lookup, used only for the display name during tag normalization.
pub trait ProjectLookup: Send + Sync + 'static {
    fn get<'a>(&'a self, cluster: &'a str, name: &'a str) -> BoxFuture<'a, Result<Project>>;
}

/// Result of asking the engine to reconcile its view of a run.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// The run carrying the engine's view of conditions and execution state.
    pub run: Run,
    /// Whether anything differs from the run that was passed in.
    pub changed: bool,
}

/// Execution engine — the external system that actually builds pipelines.
pub trait ExecutionEngine: Send + Sync + 'static {
    /// Whether the engine is ready to accept this run now.
    fn precheck<'a>(&'a self, run: &'a Run) -> BoxFuture<'a, Result<bool>>;

    /// Hand the run's configuration to the engine.
    fn launch<'a>(&'a self, run: &'a Run) -> BoxFuture<'a, Result<()>>;

    /// Pull engine-side progress into the run's conditions and state.
    fn sync_progress<'a>(&'a self, run: &'a Run) -> BoxFuture<'a, Result<SyncOutcome>>;
}

/// Decides whether a run belongs to the cluster a reconciler instance serves.
pub trait ClusterMembership: Send + Sync + 'static {
    fn contains(&self, run: &Run, cluster_id: &str) -> bool;
}

/// Membership by project reference: a run belongs to cluster `C` when its
/// `project_name` is `C:<project>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectMembership;

impl ClusterMembership for ProjectMembership {
    fn contains(&self, run: &Run, cluster_id: &str) -> bool {
        ObjectRef::parse(&run.spec.project_name)
            .map(|r| r.namespace == cluster_id)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_in(project: &str) -> Run {
        let mut run = Run::default();
        run.spec.project_name = project.to_string();
        run
    }

    #[test]
    fn test_project_membership() {
        let m = ProjectMembership;
        assert!(m.contains(&run_in("c-a:p-1"), "c-a"));
        assert!(!m.contains(&run_in("c-b:p-1"), "c-a"));
        assert!(!m.contains(&run_in("garbage"), "c-a"));
    }
}
