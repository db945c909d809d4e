//! Selection primitives: metric direction, model filter and the derived
//! best-model pointer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::data::domain::VersionId;
use crate::training::domain::RunId;

/// Whether a larger or smaller metric value wins.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricDirection {
    #[default]
    Max,
    Min,
}

impl MetricDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricDirection::Max => "max",
            MetricDirection::Min => "min",
        }
    }

    /// True when `candidate` strictly beats `incumbent`.
    pub fn better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            MetricDirection::Max => candidate > incumbent,
            MetricDirection::Min => candidate < incumbent,
        }
    }
}

impl FromStr for MetricDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" | "maximize" => Ok(MetricDirection::Max),
            "min" | "minimize" => Ok(MetricDirection::Min),
            other => Err(format!("unknown metric direction {other:?}")),
        }
    }
}

/// Which runs a selection considers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ModelFilter {
    #[default]
    Any,
    Named(String),
}

impl ModelFilter {
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(name) => ModelFilter::Named(name.to_string()),
            None => ModelFilter::Any,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            ModelFilter::Any => None,
            ModelFilter::Named(name) => Some(name),
        }
    }
}

impl fmt::Display for ModelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFilter::Any => f.write_str("any model"),
            ModelFilter::Named(name) => write!(f, "model {name}"),
        }
    }
}

/// Best succeeded run under the configured metric.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub run_id: RunId,
    pub model: String,
    pub version: VersionId,
    pub metric_key: String,
    pub metric: f64,
    pub artifact_ref: Option<String>,
    pub ended_ms: Option<u64>,
}
