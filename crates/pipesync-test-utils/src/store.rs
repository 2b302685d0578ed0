use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use pipesync_core::error::{PipesyncError, Result};
use pipesync_core::traits::{PipelineStore, ProjectLookup, RunStore};
use pipesync_core::types::{LabelSelector, Pipeline, Project, Run};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// In-memory run, pipeline and project store with write counters and
/// injectable update failures.
#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<BTreeMap<Key, Run>>,
    pipelines: Mutex<BTreeMap<Key, Pipeline>>,
    projects: Mutex<BTreeMap<Key, Project>>,
    run_writes: AtomicUsize,
    pipeline_writes: AtomicUsize,
    failing_run_updates: AtomicUsize,
    failing_pipeline_updates: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_run(&self, run: Run) {
        let k = key(&run.metadata.namespace, &run.metadata.name);
        self.runs.lock().unwrap().insert(k, run);
    }

    pub fn insert_pipeline(&self, pipeline: Pipeline) {
        let k = key(&pipeline.metadata.namespace, &pipeline.metadata.name);
        self.pipelines.lock().unwrap().insert(k, pipeline);
    }

    pub fn insert_project(&self, project: Project) {
        let k = key(&project.cluster, &project.name);
        self.projects.lock().unwrap().insert(k, project);
    }

    pub fn run(&self, namespace: &str, name: &str) -> Option<Run> {
        self.runs.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    pub fn pipeline(&self, namespace: &str, name: &str) -> Option<Pipeline> {
        self.pipelines.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    /// Successful run updates so far.
    pub fn run_writes(&self) -> usize {
        self.run_writes.load(Ordering::SeqCst)
    }

    /// Successful pipeline updates so far.
    pub fn pipeline_writes(&self) -> usize {
        self.pipeline_writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` run updates fail with a database error.
    pub fn fail_run_updates(&self, n: usize) {
        self.failing_run_updates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` pipeline updates fail with a database error.
    pub fn fail_pipeline_updates(&self, n: usize) {
        self.failing_pipeline_updates.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RunStore for MemoryStore {
    fn list<'a>(&'a self, selector: &'a LabelSelector) -> BoxFuture<'a, Result<Vec<Run>>> {
        Box::pin(async move {
            Ok(self
                .runs
                .lock()
                .unwrap()
                .values()
                .filter(|r| selector.matches(&r.metadata.labels))
                .cloned()
                .collect())
        })
    }

    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, Result<Run>> {
        Box::pin(async move {
            self.run(namespace, name)
                .ok_or_else(|| PipesyncError::not_found("run", format!("{namespace}:{name}")))
        })
    }

    fn update(&self, mut run: Run) -> BoxFuture<'_, Result<Run>> {
        Box::pin(async move {
            if Self::take_failure(&self.failing_run_updates) {
                return Err(PipesyncError::Database("injected run update failure".into()));
            }
            let mut runs = self.runs.lock().unwrap();
            let k = key(&run.metadata.namespace, &run.metadata.name);
            let stored = runs
                .get(&k)
                .ok_or_else(|| PipesyncError::not_found("run", run.id()))?;
            if stored.metadata.resource_version != run.metadata.resource_version {
                return Err(PipesyncError::Conflict {
                    kind: "run",
                    id: run.id(),
                    expected: run.metadata.resource_version,
                });
            }
            run.metadata.resource_version += 1;
            runs.insert(k, run.clone());
            self.run_writes.fetch_add(1, Ordering::SeqCst);
            Ok(run)
        })
    }
}

impl PipelineStore for MemoryStore {
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, Result<Pipeline>> {
        Box::pin(async move {
            self.pipeline(namespace, name)
                .ok_or_else(|| PipesyncError::not_found("pipeline", format!("{namespace}:{name}")))
        })
    }

    fn update(&self, mut pipeline: Pipeline) -> BoxFuture<'_, Result<Pipeline>> {
        Box::pin(async move {
            if Self::take_failure(&self.failing_pipeline_updates) {
                return Err(PipesyncError::Database("injected pipeline update failure".into()));
            }
            let mut pipelines = self.pipelines.lock().unwrap();
            let k = key(&pipeline.metadata.namespace, &pipeline.metadata.name);
            let stored = pipelines
                .get(&k)
                .ok_or_else(|| PipesyncError::not_found("pipeline", pipeline.metadata.id()))?;
            if stored.metadata.resource_version != pipeline.metadata.resource_version {
                return Err(PipesyncError::Conflict {
                    kind: "pipeline",
                    id: pipeline.metadata.id(),
                    expected: pipeline.metadata.resource_version,
                });
            }
            pipeline.metadata.resource_version += 1;
            pipelines.insert(k, pipeline.clone());
            self.pipeline_writes.fetch_add(1, Ordering::SeqCst);
            Ok(pipeline)
        })
    }
}

impl ProjectLookup for MemoryStore {
    fn get<'a>(&'a self, cluster: &'a str, name: &'a str) -> BoxFuture<'a, Result<Project>> {
        Box::pin(async move {
            self.projects
                .lock()
                .unwrap()
                .get(&key(cluster, name))
                .cloned()
                .ok_or_else(|| PipesyncError::not_found("project", format!("{cluster}:{name}")))
        })
    }
}
