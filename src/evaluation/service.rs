//! Model selector: derives the best-model pointer from succeeded runs.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::common::error::{CoreError, CoreResult};
use crate::common::metrics::Telemetry;
use crate::training::domain::{RunRepo, TrainingRun};

use super::domain::{MetricDirection, ModelFilter, Selection};

pub struct ModelSelector {
    runs: Arc<dyn RunRepo>,
    metric_key: String,
    direction: MetricDirection,
    telemetry: Arc<Telemetry>,
}

impl ModelSelector {
    pub fn new(
        runs: Arc<dyn RunRepo>,
        metric_key: impl Into<String>,
        direction: MetricDirection,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            runs,
            metric_key: metric_key.into(),
            direction,
            telemetry,
        }
    }

    pub fn metric_key(&self) -> &str {
        &self.metric_key
    }

    pub fn direction(&self) -> MetricDirection {
        self.direction
    }

    /// Best succeeded run for `filter`. Ties go to the latest end time, then
    /// the higher version, then the greater run id.
    pub fn best_for(&self, filter: &ModelFilter) -> CoreResult<Selection> {
        Telemetry::incr(&self.telemetry.selection_queries);
        let candidates = self.runs.list_succeeded(filter.model())?;

        let mut best: Option<(&TrainingRun, f64)> = None;
        for run in &candidates {
            let Some(value) = run.metrics.get(&self.metric_key).copied() else {
                continue;
            };
            if !value.is_finite() {
                continue;
            }
            let wins = match best {
                None => true,
                Some((incumbent, incumbent_value)) => {
                    self.direction.better(value, incumbent_value)
                        || (value == incumbent_value
                            && tie_break(run, incumbent) == Ordering::Greater)
                }
            };
            if wins {
                best = Some((run, value));
            }
        }

        let (run, metric) = best.ok_or_else(|| CoreError::NoCandidate {
            filter: filter.to_string(),
        })?;
        tracing::debug!(
            run_id = %run.run_id,
            model = %run.model,
            version = run.version.raw(),
            metric,
            "best model selected"
        );
        Ok(Selection {
            run_id: run.run_id.clone(),
            model: run.model.clone(),
            version: run.version,
            metric_key: self.metric_key.clone(),
            metric,
            artifact_ref: run.artifact_ref.clone(),
            ended_ms: run.ended_ms,
        })
    }
}

fn tie_break(a: &TrainingRun, b: &TrainingRun) -> Ordering {
    a.ended_ms
        .cmp(&b.ended_ms)
        .then(a.version.cmp(&b.version))
        .then(a.run_id.cmp(&b.run_id))
}
