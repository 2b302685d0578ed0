use pipesync_core::types::{
    ObjectMeta, Pipeline, PipelineConfig, Project, PublishImageConfig, Run, RunSpec, Stage, Step,
    FINISHED_LABEL,
};

/// An unfinished run of pipeline `<namespace>:pipeline` in project `<cluster>:<namespace>`.
pub fn run(cluster: &str, namespace: &str, name: &str) -> Run {
    let mut metadata = ObjectMeta::new(namespace, name);
    metadata
        .labels
        .insert(FINISHED_LABEL.to_string(), "false".to_string());
    Run {
        metadata,
        spec: RunSpec {
            pipeline_name: format!("{namespace}:pipeline"),
            project_name: format!("{cluster}:{namespace}"),
            run: 1,
            pipeline_config: PipelineConfig::default(),
        },
        status: Default::default(),
    }
}

/// The parent pipeline of `run`, with `run` recorded as its latest execution.
pub fn pipeline_tracking(run: &Run) -> Pipeline {
    let (namespace, name) = run
        .spec
        .pipeline_name
        .split_once(':')
        .unwrap_or(("", run.spec.pipeline_name.as_str()));
    let mut pipeline = Pipeline {
        metadata: ObjectMeta::new(namespace, name),
        ..Default::default()
    };
    pipeline.status.last_execution_id = Some(run.id());
    pipeline.status.last_run_state = Some(run.status.execution_state);
    pipeline
}

pub fn project(cluster: &str, name: &str, display_name: &str) -> Project {
    Project {
        cluster: cluster.to_string(),
        name: name.to_string(),
        display_name: display_name.to_string(),
    }
}

/// A single-stage config with one publish step.
pub fn publish_config(registry: &str, tag: &str) -> PipelineConfig {
    let mut step = Step {
        publish_image: Some(PublishImageConfig {
            registry: registry.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };
    step.extra.insert(
        "name".to_string(),
        serde_json::Value::String("publish".to_string()),
    );
    PipelineConfig {
        stages: vec![Stage {
            name: "build".to_string(),
            steps: vec![step],
        }],
    }
}
