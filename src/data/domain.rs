//! Core correction and dataset version definitions and contracts.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::error::{CoreError, CoreResult};

/// Identifier of a correction record; monotonic in arrival order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RecordId(pub i64);

impl RecordId {
    pub fn raw(&self) -> i64 {
        self.0
    }
}

/// Dataset version number; `previous max + 1` on every promotion.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct VersionId(pub u64);

impl VersionId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for VersionId {
    fn from(value: u64) -> Self {
        VersionId(value)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Feature map of one correction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeaturePayload(pub Map<String, Value>);

impl FeaturePayload {
    /// Accept any JSON value; non-objects are rejected by [`FeatureSchema::check`].
    pub fn from_value(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CoreError::invalid(format!(
                "feature payload must be an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// User-supplied corrected target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrectedLabel {
    Numeric(f64),
    Class(String),
}

impl CorrectedLabel {
    pub fn from_value(value: Value) -> CoreResult<Self> {
        let label = match value {
            Value::Number(n) => CorrectedLabel::Numeric(
                n.as_f64()
                    .ok_or_else(|| CoreError::invalid("label is not representable as f64"))?,
            ),
            Value::String(s) => CorrectedLabel::Class(s),
            other => {
                return Err(CoreError::invalid(format!(
                    "label must be a number or string, got {}",
                    json_kind(&other)
                )))
            }
        };
        label.check()?;
        Ok(label)
    }

    fn check(&self) -> CoreResult<()> {
        match self {
            CorrectedLabel::Numeric(v) if !v.is_finite() => {
                Err(CoreError::invalid("numeric label must be finite"))
            }
            CorrectedLabel::Class(s) if s.trim().is_empty() => {
                Err(CoreError::invalid("class label must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Declared feature columns. Undeclared columns are accepted unless
/// `allow_extra` is false.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSchema {
    pub numeric: Vec<String>,
    pub categorical: Vec<String>,
    pub allow_extra: bool,
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self {
            numeric: Vec::new(),
            categorical: Vec::new(),
            allow_extra: true,
        }
    }
}

impl FeatureSchema {
    /// Reject schemas that declare the same column twice.
    pub fn validate(&self) -> CoreResult<()> {
        let mut seen = std::collections::BTreeSet::new();
        for name in self.numeric.iter().chain(&self.categorical) {
            if name.trim().is_empty() {
                return Err(CoreError::config("schema column names must not be empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(CoreError::config(format!("schema column {name} declared twice")));
            }
        }
        Ok(())
    }

    /// Validate a payload against the declared columns.
    pub fn check(&self, payload: &FeaturePayload) -> CoreResult<()> {
        if payload.0.is_empty() {
            return Err(CoreError::invalid("feature payload is empty"));
        }
        for (key, value) in &payload.0 {
            if !matches!(value, Value::Number(_) | Value::String(_) | Value::Bool(_)) {
                return Err(CoreError::invalid(format!(
                    "feature {key} must be a scalar, got {}",
                    json_kind(value)
                )));
            }
        }
        for name in &self.numeric {
            match payload.get(name) {
                Some(Value::Number(n)) if n.as_f64().map_or(false, f64::is_finite) => {}
                Some(other) => {
                    return Err(CoreError::invalid(format!(
                        "feature {name} must be numeric, got {}",
                        json_kind(other)
                    )))
                }
                None => return Err(CoreError::invalid(format!("missing feature {name}"))),
            }
        }
        for name in &self.categorical {
            match payload.get(name) {
                Some(Value::String(_)) => {}
                Some(other) => {
                    return Err(CoreError::invalid(format!(
                        "feature {name} must be a string, got {}",
                        json_kind(other)
                    )))
                }
                None => return Err(CoreError::invalid(format!("missing feature {name}"))),
            }
        }
        if !self.allow_extra {
            if let Some(extra) = payload
                .0
                .keys()
                .find(|k| !self.numeric.contains(k) && !self.categorical.contains(k))
            {
                return Err(CoreError::invalid(format!("undeclared feature {extra}")));
            }
        }
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One staged correction. Only `consumed`/`version` change after insert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub id: RecordId,
    pub features: FeaturePayload,
    pub label: CorrectedLabel,
    pub received_ms: u64,
    pub consumed: bool,
    pub version: Option<VersionId>,
}

/// Write-ahead marker of a claimed but not yet materialized version.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionClaim {
    pub id: VersionId,
    pub record_ids: Vec<RecordId>,
    pub created_ms: u64,
    pub split_ratio: f64,
    pub split_seed: u64,
    pub fingerprint: String,
}

/// Object-store locations of a materialized split.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Partitions {
    pub train_path: String,
    pub valid_path: String,
    pub manifest_path: String,
    pub train_count: u64,
    pub valid_count: u64,
}

/// Immutable numbered snapshot of corrections plus its split.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetVersion {
    pub id: VersionId,
    pub record_ids: Vec<RecordId>,
    pub created_ms: u64,
    pub split_ratio: f64,
    pub split_seed: u64,
    pub record_count: u64,
    pub fingerprint: String,
    pub partitions: Partitions,
}

/// History row without the member list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: VersionId,
    pub created_ms: u64,
    pub record_count: u64,
    pub split_ratio: f64,
    pub train_count: u64,
    pub valid_count: u64,
}

impl From<&DatasetVersion> for VersionSummary {
    fn from(v: &DatasetVersion) -> Self {
        Self {
            id: v.id,
            created_ms: v.created_ms,
            record_count: v.record_count,
            split_ratio: v.split_ratio,
            train_count: v.partitions.train_count,
            valid_count: v.partitions.valid_count,
        }
    }
}

/// Repository contract for corrections and dataset versions.
pub trait DataRepo: Send + Sync {
    /// Persist a correction; returns after commit.
    fn insert_correction(
        &self,
        features: &FeaturePayload,
        label: &CorrectedLabel,
        received_ms: u64,
    ) -> CoreResult<RecordId>;

    fn pending_count(&self) -> CoreResult<u64>;

    /// Oldest unconsumed records, ascending by id, without touching them.
    fn oldest_pending(&self, limit: usize) -> CoreResult<Vec<CorrectionRecord>>;

    /// Records by id, in the order given.
    fn records(&self, ids: &[RecordId]) -> CoreResult<Vec<CorrectionRecord>>;

    /// Atomically claim the oldest `batch_size` pending records into a new
    /// version marker. `None` when fewer are pending.
    fn claim_batch(
        &self,
        batch_size: usize,
        split_ratio: f64,
        split_seed: u64,
        now_ms: u64,
    ) -> CoreResult<Option<VersionClaim>>;

    /// Markers still waiting for materialization, oldest first.
    fn unmaterialized(&self) -> CoreResult<Vec<VersionClaim>>;

    /// Flip a marker to ready; `false` if it was already ready.
    fn mark_ready(&self, id: VersionId, partitions: &Partitions) -> CoreResult<bool>;

    fn version(&self, id: VersionId) -> CoreResult<Option<DatasetVersion>>;

    /// Ready versions, ascending.
    fn versions(&self) -> CoreResult<Vec<DatasetVersion>>;
}

/// Object-store-like interface for partitions and artifacts.
pub trait ObjectStore: Send + Sync {
    fn put(&self, path: &str, bytes: &[u8]) -> CoreResult<()>;
    fn get(&self, path: &str) -> CoreResult<Vec<u8>>;
    fn exists(&self, path: &str) -> CoreResult<bool>;
    /// Filesystem location for backends that have one.
    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> FeaturePayload {
        FeaturePayload::from_value(v).unwrap()
    }

    #[test]
    fn permissive_schema_accepts_scalars_only() {
        let schema = FeatureSchema::default();
        schema
            .check(&payload(json!({"bedrooms": 3, "city": "Seattle", "waterfront": false})))
            .unwrap();
        assert!(schema.check(&payload(json!({}))).is_err());
        assert!(schema.check(&payload(json!({"nested": {"a": 1}}))).is_err());
        assert!(schema.check(&payload(json!({"missing": null}))).is_err());
    }

    #[test]
    fn declared_columns_are_type_checked() {
        let schema = FeatureSchema {
            numeric: vec!["sqft_living".into()],
            categorical: vec!["city".into()],
            allow_extra: false,
        };
        schema
            .check(&payload(json!({"sqft_living": 1200.5, "city": "Kent"})))
            .unwrap();

        let err = schema.check(&payload(json!({"city": "Kent"}))).unwrap_err();
        assert_eq!(err.to_string(), "invalid input: missing feature sqft_living");

        let err = schema
            .check(&payload(json!({"sqft_living": "big", "city": "Kent"})))
            .unwrap_err();
        assert!(err.to_string().contains("must be numeric"));

        let err = schema
            .check(&payload(json!({"sqft_living": 1, "city": 3})))
            .unwrap_err();
        assert!(err.to_string().contains("must be a string"));

        let err = schema
            .check(&payload(json!({"sqft_living": 1, "city": "Kent", "pool": true})))
            .unwrap_err();
        assert!(err.to_string().contains("undeclared feature pool"));
    }

    #[test]
    fn labels_must_be_finite_or_non_empty() {
        assert_eq!(
            CorrectedLabel::from_value(json!(350000)).unwrap(),
            CorrectedLabel::Numeric(350000.0)
        );
        assert!(CorrectedLabel::from_value(json!("  ")).is_err());
        assert!(CorrectedLabel::from_value(json!(null)).is_err());
        assert!(FeaturePayload::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn duplicate_schema_columns_rejected() {
        let schema = FeatureSchema {
            numeric: vec!["a".into()],
            categorical: vec!["a".into()],
            allow_extra: true,
        };
        assert!(schema.validate().is_err());
    }
}
