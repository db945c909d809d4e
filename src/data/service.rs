//! Correction buffer: durable append-only staging for corrections that are
//! not yet part of any dataset version.

use std::sync::Arc;

use serde_json::Value;

use crate::common::error::CoreResult;
use crate::common::metrics::Telemetry;
use crate::common::time;

use super::domain::{CorrectedLabel, CorrectionRecord, DataRepo, FeaturePayload, FeatureSchema, RecordId};

pub struct CorrectionBuffer {
    repo: Arc<dyn DataRepo>,
    schema: FeatureSchema,
    telemetry: Arc<Telemetry>,
}

impl CorrectionBuffer {
    pub fn new(repo: Arc<dyn DataRepo>, schema: FeatureSchema, telemetry: Arc<Telemetry>) -> Self {
        Self {
            repo,
            schema,
            telemetry,
        }
    }

    /// Validate and persist a correction. The record is committed before the
    /// id is returned.
    pub fn submit(&self, features: Value, label: Value) -> CoreResult<RecordId> {
        let parsed = FeaturePayload::from_value(features)
            .and_then(|f| CorrectedLabel::from_value(label).map(|l| (f, l)))
            .and_then(|(f, l)| self.schema.check(&f).map(|_| (f, l)));
        let (features, label) = match parsed {
            Ok(pair) => pair,
            Err(err) => {
                Telemetry::incr(&self.telemetry.submissions_rejected);
                tracing::info!(error = %err, "correction rejected");
                return Err(err);
            }
        };

        let id = self.repo.insert_correction(&features, &label, time::now_ms())?;
        Telemetry::incr(&self.telemetry.submissions_accepted);
        tracing::debug!(record = id.raw(), "correction stored");
        Ok(id)
    }

    /// Records not yet folded into any version.
    pub fn pending_count(&self) -> CoreResult<u64> {
        self.repo.pending_count()
    }

    /// Oldest `n` unconsumed records. Does not mark them consumed.
    pub fn drain(&self, n: usize) -> CoreResult<Vec<CorrectionRecord>> {
        self.repo.oldest_pending(n)
    }
}
