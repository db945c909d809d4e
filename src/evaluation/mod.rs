//! Evaluation domain: best-model selection over recorded training runs.

pub mod domain;
pub mod service;

pub use domain::{MetricDirection, ModelFilter, Selection};
pub use service::ModelSelector;
