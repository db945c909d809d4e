//! Domain types for training runs, model definitions and the run registry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::error::{CoreError, CoreResult};
use crate::data::domain::{DatasetVersion, VersionId};

/// Identifier of one training attempt.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a run.
///
/// `pending → running → succeeded | failed`, and `pending → cancelled`.
/// A pending run that cannot be started (no trainer) may also go straight
/// to `failed`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Statuses covered by the one-per-(model, version) rule.
    pub fn holds_key(&self) -> bool {
        matches!(
            self,
            RunStatus::Pending | RunStatus::Running | RunStatus::Succeeded
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Cancelled)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(CoreError::storage(format!("unknown run status {other:?}"))),
        }
    }
}

/// Externally supplied capability descriptor of a model.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    pub entry_point: String,
    pub config_ref: String,
}

impl ModelDefinition {
    pub fn new(
        name: impl Into<String>,
        entry_point: impl Into<String>,
        config_ref: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entry_point: entry_point.into(),
            config_ref: config_ref.into(),
        }
    }

    /// Names double as object-store path segments.
    pub fn validate(&self) -> CoreResult<()> {
        let ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !self.name.starts_with('.');
        if !ok {
            return Err(CoreError::invalid(format!(
                "model name {:?} must be [A-Za-z0-9_.-]+",
                self.name
            )));
        }
        Ok(())
    }
}

pub type Metrics = BTreeMap<String, f64>;

/// One execution attempt of a model against a dataset version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub run_id: RunId,
    pub model: String,
    pub version: VersionId,
    pub status: RunStatus,
    pub metrics: Metrics,
    pub artifact_ref: Option<String>,
    pub cause: Option<String>,
    pub created_ms: u64,
    pub started_ms: Option<u64>,
    pub ended_ms: Option<u64>,
}

impl TrainingRun {
    pub fn pending(model: &str, version: VersionId, now_ms: u64) -> Self {
        Self {
            run_id: RunId::generate(),
            model: model.to_string(),
            version,
            status: RunStatus::Pending,
            metrics: Metrics::new(),
            artifact_ref: None,
            cause: None,
            created_ms: now_ms,
            started_ms: None,
            ended_ms: None,
        }
    }
}

/// Fields written by a status change; `None` keeps the stored value.
#[derive(Clone, Debug, Default)]
pub struct RunTransition {
    pub metrics: Option<Metrics>,
    pub artifact_ref: Option<String>,
    pub cause: Option<String>,
    pub started_ms: Option<u64>,
    pub ended_ms: Option<u64>,
}

/// Successful result of a training execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainOutcome {
    pub metrics: Metrics,
    #[serde(alias = "artifact")]
    pub artifact_ref: String,
}

/// Anything that can train a model on a dataset version.
pub trait Trainer: Send + Sync {
    fn train(&self, dataset: &DatasetVersion, model: &ModelDefinition) -> CoreResult<TrainOutcome>;
}

impl<F> Trainer for F
where
    F: Fn(&DatasetVersion, &ModelDefinition) -> CoreResult<TrainOutcome> + Send + Sync,
{
    fn train(&self, dataset: &DatasetVersion, model: &ModelDefinition) -> CoreResult<TrainOutcome> {
        self(dataset, model)
    }
}

/// Run registry: the single shared store of training lineage.
pub trait RunRepo: Send + Sync {
    /// Insert or update by run id. A second run holding the same
    /// (model, version) key fails with `ConcurrencyConflict`.
    fn record(&self, run: &TrainingRun) -> CoreResult<()>;

    /// The pending/running/succeeded run for the key, if any.
    fn find(&self, model: &str, version: VersionId) -> CoreResult<Option<TrainingRun>>;

    fn get(&self, run_id: &RunId) -> CoreResult<Option<TrainingRun>>;

    /// Every attempt for the key, oldest first.
    fn attempts(&self, model: &str, version: VersionId) -> CoreResult<Vec<TrainingRun>>;

    /// Compare-and-set status change. `false` when the run was not in `from`.
    fn transition(
        &self,
        run_id: &RunId,
        from: RunStatus,
        to: RunStatus,
        change: &RunTransition,
    ) -> CoreResult<bool>;

    fn list_succeeded(&self, model: Option<&str>) -> CoreResult<Vec<TrainingRun>>;

    /// All runs, ordered by version then creation.
    fn history(&self, model: Option<&str>) -> CoreResult<Vec<TrainingRun>>;

    fn with_status(&self, status: RunStatus) -> CoreResult<Vec<TrainingRun>>;

    /// Fail running runs started before `started_before_ms`; returns them.
    fn expire_running(&self, started_before_ms: u64, now_ms: u64) -> CoreResult<Vec<TrainingRun>>;

    fn upsert_model(&self, model: &ModelDefinition, now_ms: u64) -> CoreResult<()>;

    fn models(&self) -> CoreResult<Vec<ModelDefinition>>;
}
