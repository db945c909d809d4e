//! Training domain: run registry, dispatch and trainer execution.

pub mod catalog;
pub mod domain;
pub mod exec;
pub mod repo_sqlite;
pub mod service;
pub mod workers;

pub use catalog::{DiscoveredModel, ModelCatalog};
pub use domain::{
    Metrics, ModelDefinition, RunId, RunRepo, RunStatus, TrainOutcome, Trainer, TrainingRun,
};
pub use exec::ProcessTrainer;
pub use service::{DispatcherCfg, TrainingDispatcher};
