//! Runtime configuration loaded from defaults, an optional TOML file and the
//! process environment, in that order of precedence (later layers win).
//!
//! Configuration is read once per process. Values captured into a dataset
//! version (split ratio, seed) are stored with the version, so changing them
//! later never alters existing versions.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::error::{CoreError, CoreResult};
use crate::data::domain::FeatureSchema;
use crate::evaluation::domain::MetricDirection;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_FILE_ENV: &str = "RETRAIN_CONFIG";

/// Snapshot of configuration values consumed by the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppCfg {
    pub data_root: PathBuf,
    pub db_path: Option<PathBuf>,
    pub objects_root: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
    pub batch_size: usize,
    pub train_test_split: f64,
    pub split_seed: u64,
    pub training_timeout_secs: u64,
    pub metric_key: String,
    pub metric_direction: MetricDirection,
    pub workers: usize,
    pub max_attempts: u32,
    pub log_level: u8,
    pub schema: FeatureSchema,
}

impl Default for AppCfg {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            db_path: None,
            objects_root: None,
            models_dir: None,
            batch_size: 1000,
            train_test_split: 0.8,
            split_seed: 42,
            training_timeout_secs: 3600,
            metric_key: "accuracy".to_string(),
            metric_direction: MetricDirection::Max,
            workers: 2,
            max_attempts: 3,
            log_level: 1,
            schema: FeatureSchema::default(),
        }
    }
}

impl AppCfg {
    /// Create a configuration snapshot from the optional file and the process environment.
    pub fn load() -> CoreResult<Self> {
        let mut cfg = match env::var(CONFIG_FILE_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        cfg.apply_env(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from a TOML file without consulting the environment.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> CoreResult<Self> {
        toml::from_str(content).map_err(|e| CoreError::config(format!("failed to parse TOML: {e}")))
    }

    /// Overlay `RETRAIN_*` variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RETRAIN_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("RETRAIN_DB_PATH") {
            self.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("RETRAIN_OBJECTS_ROOT") {
            self.objects_root = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("RETRAIN_MODELS_DIR") {
            self.models_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("RETRAIN_METRIC_KEY") {
            self.metric_key = v;
        }
        set_parsed(&lookup, "RETRAIN_BATCH_SIZE", &mut self.batch_size)?;
        set_parsed(&lookup, "RETRAIN_TRAIN_TEST_SPLIT", &mut self.train_test_split)?;
        set_parsed(&lookup, "RETRAIN_SPLIT_SEED", &mut self.split_seed)?;
        set_parsed(&lookup, "RETRAIN_TRAINING_TIMEOUT_SECS", &mut self.training_timeout_secs)?;
        set_parsed(&lookup, "RETRAIN_METRIC_DIRECTION", &mut self.metric_direction)?;
        set_parsed(&lookup, "RETRAIN_WORKERS", &mut self.workers)?;
        set_parsed(&lookup, "RETRAIN_MAX_ATTEMPTS", &mut self.max_attempts)?;
        set_parsed(&lookup, "RETRAIN_LOG_LEVEL", &mut self.log_level)?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> CoreResult<()> {
        if self.batch_size == 0 {
            return Err(CoreError::config("batch_size must be > 0"));
        }
        if !(self.train_test_split > 0.0 && self.train_test_split < 1.0) {
            return Err(CoreError::config("train_test_split must be in (0, 1)"));
        }
        if self.training_timeout_secs == 0 {
            return Err(CoreError::config("training_timeout_secs must be > 0"));
        }
        if self.metric_key.trim().is_empty() {
            return Err(CoreError::config("metric_key must not be empty"));
        }
        if self.workers == 0 {
            return Err(CoreError::config("workers must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(CoreError::config("max_attempts must be > 0"));
        }
        self.schema.validate()
    }

    /// SQLite database holding corrections, versions and runs.
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_root.join("retrain.sqlite3"))
    }

    /// Root directory of the filesystem object store.
    pub fn objects_root(&self) -> PathBuf {
        self.objects_root
            .clone()
            .unwrap_or_else(|| self.data_root.join("objects"))
    }

    /// Directory scanned for model folders.
    pub fn models_dir(&self) -> PathBuf {
        self.models_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("models"))
    }

    /// Wall-clock bound for a running training run.
    pub fn training_timeout(&self) -> Duration {
        Duration::from_secs(self.training_timeout_secs)
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> CoreResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| CoreError::config(format!("{key}={raw}: {e}")))?;
    }
    Ok(())
}
