use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pipesync_core::config::ReconcilerConfig;
use pipesync_core::types::{ConditionStatus, ConditionType, ExecutionState, RunStatus, ERROR_REASON};
use pipesync_reconciler::phase::LAUNCHED_MESSAGE;
use pipesync_reconciler::{PassReport, Reconciler, RunPhase};
use pipesync_test_utils::engine::SyncStep;
use pipesync_test_utils::fixtures::{pipeline_tracking, project, publish_config, run};
use pipesync_test_utils::{MemoryStore, ScriptedEngine};

const CLUSTER: &str = "c-a";
const REGISTRY: &str = "registry.local:5000";

fn config() -> ReconcilerConfig {
    let mut config = ReconcilerConfig::new(CLUSTER);
    config.default_registry = Some(REGISTRY.to_string());
    config
}

fn reconciler(store: &Arc<MemoryStore>, engine: &Arc<ScriptedEngine>, config: ReconcilerConfig) -> Reconciler {
    Reconciler::new(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
        engine.clone(),
        CancellationToken::new(),
    )
}

/// Store with one unfinished run `p-1:run-1` and its tracking pipeline.
fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let r = run(CLUSTER, "p-1", "run-1");
    store.insert_pipeline(pipeline_tracking(&r));
    store.insert_run(r);
    store
}

fn running_status() -> RunStatus {
    let mut status = RunStatus::default();
    status.set_status(ConditionType::Initialized, ConditionStatus::True);
    status.set_status(ConditionType::Provisioned, ConditionStatus::True);
    status.execution_state = ExecutionState::Building;
    status
}

#[tokio::test]
async fn test_not_ready_message_is_written_once() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::not_ready());
    let rec = reconciler(&store, &engine, config());

    let first = rec.sync_once().await;
    assert_eq!(first.scanned, 1);
    assert_eq!(first.runs_written, 1);

    let stored = store.run("p-1", "run-1").unwrap();
    assert!(stored.status.is_unknown(ConditionType::Initialized));
    assert_eq!(
        stored.status.message(ConditionType::Initialized),
        ReconcilerConfig::new(CLUSTER).initializing_message
    );
    assert_eq!(RunPhase::of(&stored.status), RunPhase::Initializing);

    let second = rec.sync_once().await;
    assert_eq!(second.runs_written, 0);
    assert_eq!(store.run_writes(), 1);
    assert_eq!(engine.precheck_calls(), 2);
}

#[tokio::test]
async fn test_precheck_error_fails_and_finishes_run() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::failing_precheck("engine unreachable"));
    let rec = reconciler(&store, &engine, config());

    let report = rec.sync_once().await;
    assert_eq!(report.runs_written, 1);
    assert_eq!(report.errors, 0);

    let stored = store.run("p-1", "run-1").unwrap();
    let built = stored.status.condition(ConditionType::Built).unwrap();
    assert_eq!(built.status, ConditionStatus::False);
    assert_eq!(built.reason, ERROR_REASON);
    assert!(built.message.contains("engine unreachable"));
    assert_eq!(stored.status.execution_state, ExecutionState::Failed);
    assert!(stored.is_labeled_finished());
    assert!(stored.status.ended.as_deref().is_some_and(|e| !e.is_empty()));

    // Parent mirrors the failure.
    let pipeline = store.pipeline("p-1", "pipeline").unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Failed));

    // Finished runs drop out of the scan.
    let next = rec.sync_once().await;
    assert_eq!(next.scanned, 0);
    assert_eq!(engine.precheck_calls(), 1);
}

#[tokio::test]
async fn test_launch_normalizes_tags_on_a_copy() {
    let store = Arc::new(MemoryStore::new());
    let mut r = run(CLUSTER, "p-1", "run-1");
    r.spec.pipeline_config = publish_config(REGISTRY, "myimage");
    store.insert_pipeline(pipeline_tracking(&r));
    store.insert_run(r);
    store.insert_project(project(CLUSTER, "p-1", "Acme Corp"));

    let engine = Arc::new(ScriptedEngine::ready());
    let rec = reconciler(&store, &engine, config());
    rec.sync_once().await;

    let launched = engine.launched();
    assert_eq!(launched.len(), 1);
    let launched_tag = &launched[0].spec.pipeline_config.stages[0].steps[0]
        .publish_image
        .as_ref()
        .unwrap()
        .tag;
    assert_eq!(launched_tag, "acme corp/myimage:${CICD_IMAGE_TAG}");

    let stored = store.run("p-1", "run-1").unwrap();
    let stored_tag = &stored.spec.pipeline_config.stages[0].steps[0]
        .publish_image
        .as_ref()
        .unwrap()
        .tag;
    assert_eq!(stored_tag, "myimage");
    assert!(stored.status.is_true(ConditionType::Initialized));
    assert!(stored.status.is_unknown(ConditionType::Provisioned));
    assert_eq!(stored.status.message(ConditionType::Provisioned), LAUNCHED_MESSAGE);
    assert!(!stored.is_labeled_finished());
}

#[tokio::test]
async fn test_missing_project_launches_with_original_tag() {
    let store = Arc::new(MemoryStore::new());
    let mut r = run(CLUSTER, "p-1", "run-1");
    r.spec.pipeline_config = publish_config(REGISTRY, "myimage");
    store.insert_run(r);

    let engine = Arc::new(ScriptedEngine::ready());
    let rec = reconciler(&store, &engine, config());
    let report = rec.sync_once().await;
    assert_eq!(report.errors, 0);

    let launched = engine.launched();
    assert_eq!(launched.len(), 1);
    assert_eq!(
        launched[0].spec.pipeline_config.stages[0].steps[0]
            .publish_image
            .as_ref()
            .unwrap()
            .tag,
        "myimage"
    );
}

#[tokio::test]
async fn test_launch_failure_marks_provisioned_false() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::ready());
    engine.fail_launch("no executors");
    let rec = reconciler(&store, &engine, config());
    rec.sync_once().await;

    let stored = store.run("p-1", "run-1").unwrap();
    assert!(stored.status.is_false(ConditionType::Provisioned));
    assert!(stored.status.is_unknown(ConditionType::Initialized));
    assert_eq!(stored.status.execution_state, ExecutionState::Failed);
    assert!(stored.is_labeled_finished());
}

#[tokio::test]
async fn test_only_runs_of_own_cluster_are_processed() {
    let store = Arc::new(MemoryStore::new());
    store.insert_run(run("c-a", "p-1", "run-a"));
    store.insert_run(run("c-b", "p-2", "run-b"));

    let engine = Arc::new(ScriptedEngine::not_ready());
    let rec = reconciler(&store, &engine, config());
    let report = rec.sync_once().await;

    assert_eq!(report.scanned, 1);
    assert_eq!(engine.precheck_calls(), 1);
    assert!(!store
        .run("p-1", "run-a")
        .unwrap()
        .status
        .message(ConditionType::Initialized)
        .is_empty());
    assert_eq!(store.run("p-2", "run-b").unwrap().metadata.resource_version, 0);
}

#[tokio::test]
async fn test_empty_scan_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    store.insert_run(run("c-b", "p-2", "run-b"));
    let engine = Arc::new(ScriptedEngine::ready());
    let rec = reconciler(&store, &engine, config());

    let report = rec.sync_once().await;
    assert_eq!(report, PassReport::default());
    assert_eq!(engine.precheck_calls(), 0);
    assert_eq!(store.run_writes(), 0);
}

#[tokio::test]
async fn test_sync_success_finishes_run_and_mirrors_parent() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::ready());
    let rec = reconciler(&store, &engine, config());
    rec.sync_once().await;

    engine.push_sync(SyncStep::Status(running_status()));
    rec.sync_once().await;
    let pipeline = store.pipeline("p-1", "pipeline").unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Building));

    let mut done = running_status();
    done.set_status(ConditionType::Built, ConditionStatus::True);
    done.execution_state = ExecutionState::Success;
    engine.push_sync(SyncStep::Status(done));
    rec.sync_once().await;

    let stored = store.run("p-1", "run-1").unwrap();
    assert_eq!(stored.status.execution_state, ExecutionState::Success);
    assert!(stored.is_labeled_finished());
    assert!(stored.status.ended.is_some());
    let pipeline = store.pipeline("p-1", "pipeline").unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Success));
}

#[tokio::test]
async fn test_unchanged_sync_writes_nothing() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::ready());
    let rec = reconciler(&store, &engine, config());
    rec.sync_once().await;
    let writes = store.run_writes();

    let report = rec.sync_once().await;
    assert_eq!(engine.sync_calls(), 1);
    assert_eq!(report.runs_written, 0);
    assert_eq!(store.run_writes(), writes);
}

#[tokio::test]
async fn test_sync_error_fails_run() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::ready());
    let rec = reconciler(&store, &engine, config());
    rec.sync_once().await;

    engine.push_sync(SyncStep::Error("build vanished".into()));
    rec.sync_once().await;

    let stored = store.run("p-1", "run-1").unwrap();
    assert!(stored.status.is_false(ConditionType::Built));
    assert!(stored.status.is_true(ConditionType::Initialized));
    assert_eq!(stored.status.execution_state, ExecutionState::Failed);
    assert!(stored.is_labeled_finished());
}

#[tokio::test]
async fn test_resolved_conditions_never_return_to_unknown() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::ready());
    let rec = reconciler(&store, &engine, config());
    rec.sync_once().await;

    let mut regressed = RunStatus::default();
    regressed.execution_state = ExecutionState::Building;
    engine.push_sync(SyncStep::Status(regressed));
    rec.sync_once().await;

    let stored = store.run("p-1", "run-1").unwrap();
    assert!(stored.status.is_true(ConditionType::Initialized));
    assert_eq!(stored.status.execution_state, ExecutionState::Building);
}

#[tokio::test]
async fn test_parent_not_found_is_not_an_error() {
    let store = Arc::new(MemoryStore::new());
    store.insert_run(run(CLUSTER, "p-1", "run-1"));
    let engine = Arc::new(ScriptedEngine::failing_precheck("down"));
    let rec = reconciler(&store, &engine, config());

    let report = rec.sync_once().await;
    assert_eq!(report.errors, 0);
    assert_eq!(report.runs_written, 1);
    assert_eq!(report.pipelines_written, 0);
}

#[tokio::test]
async fn test_parent_of_other_run_is_not_touched() {
    let store = seeded_store();
    let mut pipeline = store.pipeline("p-1", "pipeline").unwrap();
    pipeline.status.last_execution_id = Some("p-1:run-2".into());
    store.insert_pipeline(pipeline);

    let engine = Arc::new(ScriptedEngine::failing_precheck("down"));
    let rec = reconciler(&store, &engine, config());
    rec.sync_once().await;

    assert_eq!(store.pipeline_writes(), 0);
    let pipeline = store.pipeline("p-1", "pipeline").unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Waiting));
}

#[tokio::test]
async fn test_run_write_failure_is_retried_next_pass() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::ready());
    let rec = reconciler(&store, &engine, config());

    store.fail_run_updates(1);
    let first = rec.sync_once().await;
    assert_eq!(first.errors, 1);
    assert_eq!(first.runs_written, 0);
    assert!(store
        .run("p-1", "run-1")
        .unwrap()
        .status
        .is_unknown(ConditionType::Initialized));

    let second = rec.sync_once().await;
    assert_eq!(second.errors, 0);
    assert_eq!(second.runs_written, 1);
    assert!(store
        .run("p-1", "run-1")
        .unwrap()
        .status
        .is_true(ConditionType::Initialized));
}

#[tokio::test]
async fn test_stale_parent_is_fixed_after_run_finished() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::failing_precheck("down"));
    let rec = reconciler(&store, &engine, config());

    store.fail_pipeline_updates(1);
    let first = rec.sync_once().await;
    assert_eq!(first.runs_written, 1);
    assert_eq!(first.errors, 1);
    assert!(store.run("p-1", "run-1").unwrap().is_labeled_finished());
    assert_eq!(rec.persister().stale_parent_count().await, 1);

    let second = rec.sync_once().await;
    assert_eq!(second.scanned, 0);
    assert_eq!(second.pipelines_written, 1);
    let pipeline = store.pipeline("p-1", "pipeline").unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Failed));
    assert_eq!(rec.persister().stale_parent_count().await, 0);
}

#[tokio::test]
async fn test_malformed_pipeline_reference_abandons_run() {
    let store = Arc::new(MemoryStore::new());
    let mut r = run(CLUSTER, "p-1", "run-1");
    r.spec.pipeline_name = "no-separator".into();
    store.insert_run(r);
    let engine = Arc::new(ScriptedEngine::not_ready());
    let rec = reconciler(&store, &engine, config());

    let report = rec.sync_once().await;
    assert_eq!(report.errors, 1);
    assert_eq!(rec.persister().stale_parent_count().await, 0);
}

#[tokio::test]
async fn test_commit_twice_is_a_no_op() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::failing_precheck("down"));
    let rec = reconciler(&store, &engine, config());
    rec.sync_once().await;

    let writes = (store.run_writes(), store.pipeline_writes());
    let stored = store.run("p-1", "run-1").unwrap();
    let commit = rec.persister().commit(&stored, stored.clone()).await.unwrap();
    assert!(!commit.run_written);
    assert!(!commit.pipeline_written);
    assert_eq!((store.run_writes(), store.pipeline_writes()), writes);
}

#[tokio::test]
async fn test_engine_timeout_is_an_engine_failure() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::ready());
    engine.hang_precheck();
    let mut cfg = config();
    cfg.engine_timeout_secs = Some(1);
    let rec = reconciler(&store, &engine, cfg);

    rec.sync_once().await;

    let stored = store.run("p-1", "run-1").unwrap();
    assert!(stored.status.is_false(ConditionType::Built));
    assert!(stored.status.message(ConditionType::Built).contains("timed out"));
    assert!(stored.is_labeled_finished());
}

#[tokio::test]
async fn test_loop_runs_passes_until_cancelled() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::not_ready());
    let cancel = CancellationToken::new();
    let mut cfg = config();
    cfg.interval_secs = 1;
    let rec = Arc::new(Reconciler::new(
        cfg,
        store.clone(),
        store.clone(),
        store.clone(),
        engine.clone(),
        cancel.clone(),
    ));

    let handle = {
        let rec = rec.clone();
        tokio::spawn(async move { rec.run().await })
    };

    tokio::time::sleep(Duration::from_millis(1500)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop stops after cancellation")
        .unwrap();

    assert!(engine.precheck_calls() >= 1);
    assert_eq!(store.run_writes(), 1);
}

#[tokio::test]
async fn test_engine_end_time_is_ignored_while_running() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::ready());
    let rec = reconciler(&store, &engine, config());
    rec.sync_once().await;

    let mut status = running_status();
    status.ended = Some("2026-01-01T00:00:00Z".into());
    engine.push_sync(SyncStep::Status(status));
    rec.sync_once().await;

    let stored = store.run("p-1", "run-1").unwrap();
    assert_eq!(stored.status.execution_state, ExecutionState::Building);
    assert!(!stored.is_labeled_finished());
    assert_eq!(stored.is_labeled_finished(), stored.status.ended.is_some());
}

#[tokio::test]
async fn test_stale_parent_is_fixed_while_run_waits() {
    let store = Arc::new(MemoryStore::new());
    let mut r = run(CLUSTER, "p-1", "run-1");
    r.status.set_message(
        ConditionType::Initialized,
        ReconcilerConfig::new(CLUSTER).initializing_message,
    );
    let mut pipeline = pipeline_tracking(&r);
    pipeline.status.last_run_state = Some(ExecutionState::Building);
    store.insert_pipeline(pipeline);
    store.insert_run(r);

    let engine = Arc::new(ScriptedEngine::not_ready());
    let rec = reconciler(&store, &engine, config());
    let report = rec.sync_once().await;

    assert_eq!(report.errors, 0);
    assert_eq!(report.runs_written, 0);
    assert_eq!(report.pipelines_written, 1);
    let pipeline = store.pipeline("p-1", "pipeline").unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Waiting));

    let again = rec.sync_once().await;
    assert_eq!(again.pipelines_written, 0);
    assert_eq!(store.pipeline_writes(), 1);
}

#[tokio::test]
async fn test_stale_parent_is_fixed_on_unchanged_sync() {
    let store = seeded_store();
    let engine = Arc::new(ScriptedEngine::ready());
    let rec = reconciler(&store, &engine, config());
    rec.sync_once().await;

    let mut pipeline = store.pipeline("p-1", "pipeline").unwrap();
    pipeline.status.last_run_state = Some(ExecutionState::Failed);
    store.insert_pipeline(pipeline);

    let report = rec.sync_once().await;
    assert_eq!(engine.sync_calls(), 1);
    assert_eq!(report.runs_written, 0);
    assert_eq!(report.pipelines_written, 1);
    let pipeline = store.pipeline("p-1", "pipeline").unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Waiting));
}
