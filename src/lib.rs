//! Feedback-driven dataset versioning and exactly-once retraining.
//!
//! Corrections flow into [`data::CorrectionBuffer`]; every full batch becomes
//! an immutable [`data::DatasetVersion`]; [`training::TrainingDispatcher`]
//! trains each registered model on each version once; and
//! [`evaluation::ModelSelector`] derives the best model on demand.
//! [`api::RetrainCore`] ties them together over one SQLite store.
pub mod common;
pub mod data;
pub mod training;
pub mod evaluation;
pub mod api;

pub use api::{RetrainCore, SubmitReceipt, TickReport};
pub use common::{config::AppCfg, CoreCode, CoreError, CoreResult};
