//! Data domain: correction intake, dataset version promotion and persistence.

pub mod domain;
pub mod promoter;
pub mod repo_fs;
pub mod repo_sqlite;
pub mod service;

pub use domain::{
    CorrectedLabel, CorrectionRecord, DatasetVersion, FeaturePayload, FeatureSchema, ObjectStore,
    RecordId, VersionId, VersionSummary,
};
pub use promoter::{PromoterCfg, VersionPromoter};
pub use service::CorrectionBuffer;
