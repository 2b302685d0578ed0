use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label carried by every run; `"false"` while the reconciler still watches it.
pub const FINISHED_LABEL: &str = "finished";

/// Reason recorded on a condition that was resolved to False by an error.
pub const ERROR_REASON: &str = "Error";

/// Record identity and bookkeeping shared by runs and pipelines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Bumped by the store on every successful update.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// `namespace:name`, the form used by `Pipeline::status.last_execution_id`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.namespace, self.name)
    }
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Selector for runs the reconciler still has to look at.
    pub fn unfinished() -> Self {
        Self::new().eq(FINISHED_LABEL, "false")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

// ── Conditions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConditionType {
    Initialized,
    Provisioned,
    Built,
}

impl ConditionType {
    pub const ALL: [ConditionType; 3] = [
        ConditionType::Initialized,
        ConditionType::Provisioned,
        ConditionType::Built,
    ];
}

#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConditionStatus {
    #[default]
    Unknown,
    True,
    False,
}

impl ConditionStatus {
    pub fn is_resolved(self) -> bool {
        self != ConditionStatus::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    #[serde(default)]
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn unknown(kind: ConditionType) -> Self {
        Self {
            kind,
            status: ConditionStatus::Unknown,
            reason: String::new(),
            message: String::new(),
        }
    }
}

// ── Execution state ─────────────────────────────────────────────

/// Overall outcome of a run as reported by the engine.
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ExecutionState {
    #[default]
    Waiting,
    Building,
    Success,
    Failed,
    Aborted,
    Denied,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Waiting => "Waiting",
            ExecutionState::Building => "Building",
            ExecutionState::Success => "Success",
            ExecutionState::Failed => "Failed",
            ExecutionState::Aborted => "Aborted",
            ExecutionState::Denied => "Denied",
        }
    }

    /// States the engine never moves a run out of.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Success
                | ExecutionState::Failed
                | ExecutionState::Aborted
                | ExecutionState::Denied
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Pipeline configuration ──────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_image: Option<PublishImageConfig>,
    /// Step kinds the reconciler does not inspect (scripts, manifests, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Build-and-push directive attached to a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishImageConfig {
    #[serde(default)]
    pub registry: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_context: Option<String>,
}

// ── Run ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Parent pipeline as `namespace:name`.
    pub pipeline_name: String,
    /// Owning project as `cluster:project`.
    pub project_name: String,
    /// Sequence number within the parent pipeline.
    #[serde(default)]
    pub run: u64,
    #[serde(default)]
    pub pipeline_config: PipelineConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub execution_state: ExecutionState,
    /// RFC3339 completion time; set once when the run finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<String>,
}

impl RunStatus {
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Status of a condition; an absent condition counts as Unknown.
    pub fn status_of(&self, kind: ConditionType) -> ConditionStatus {
        self.condition(kind).map(|c| c.status).unwrap_or_default()
    }

    pub fn is_unknown(&self, kind: ConditionType) -> bool {
        self.status_of(kind) == ConditionStatus::Unknown
    }

    pub fn is_true(&self, kind: ConditionType) -> bool {
        self.status_of(kind) == ConditionStatus::True
    }

    pub fn is_false(&self, kind: ConditionType) -> bool {
        self.status_of(kind) == ConditionStatus::False
    }

    pub fn any_false(&self) -> bool {
        ConditionType::ALL.iter().any(|k| self.is_false(*k))
    }

    pub fn message(&self, kind: ConditionType) -> &str {
        self.condition(kind).map(|c| c.message.as_str()).unwrap_or("")
    }

    fn condition_mut(&mut self, kind: ConditionType) -> &mut Condition {
        let idx = match self.conditions.iter().position(|c| c.kind == kind) {
            Some(idx) => idx,
            None => {
                self.conditions.push(Condition::unknown(kind));
                self.conditions.len() - 1
            }
        };
        &mut self.conditions[idx]
    }

    pub fn set_status(&mut self, kind: ConditionType, status: ConditionStatus) {
        self.condition_mut(kind).status = status;
    }

    pub fn set_message(&mut self, kind: ConditionType, message: impl Into<String>) {
        self.condition_mut(kind).message = message.into();
    }

    /// Resolve a condition to False, recording the error as reason and message.
    pub fn set_failed(&mut self, kind: ConditionType, error: &str) {
        let cond = self.condition_mut(kind);
        cond.status = ConditionStatus::False;
        cond.reason = ERROR_REASON.to_string();
        cond.message = error.to_string();
    }

    /// Add the condition as Unknown unless it is already present.
    pub fn ensure_condition(&mut self, kind: ConditionType) {
        self.condition_mut(kind);
    }
}

/// One execution attempt of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub metadata: ObjectMeta,
    pub spec: RunSpec,
    #[serde(default)]
    pub status: RunStatus,
}

impl Run {
    pub fn id(&self) -> String {
        self.metadata.id()
    }

    pub fn is_labeled_finished(&self) -> bool {
        self.metadata.labels.get(FINISHED_LABEL).map(String::as_str) == Some("true")
    }
}

// ── Pipeline / Project ──────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// `namespace:name` of the most recent run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_state: Option<ExecutionState>,
}

/// Parent definition a run was created from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: PipelineStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub cluster: String,
    pub name: String,
    pub display_name: String,
}
