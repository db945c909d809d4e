//! Trainer that runs a model's entry point as a child process.
//!
//! The child gets the dataset location through `RETRAIN_*` environment
//! variables and reports back on stdout: the last non-empty line must be a
//! JSON object `{"metrics": {...}, "artifact": "..."}`.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::common::error::{CoreError, CoreResult};
use crate::data::domain::{DatasetVersion, ObjectStore};

use super::domain::{ModelDefinition, TrainOutcome, Trainer};

/// Lines of stderr kept in a failure cause.
const STDERR_TAIL_LINES: usize = 10;

pub struct ProcessTrainer {
    program: PathBuf,
    args: Vec<String>,
    working_dir: PathBuf,
    objects: Arc<dyn ObjectStore>,
    work_root: PathBuf,
}

impl ProcessTrainer {
    /// `program` is resolved against `working_dir` when such a file exists
    /// there, otherwise looked up on `PATH`.
    pub fn new(
        program: &str,
        args: Vec<String>,
        working_dir: impl Into<PathBuf>,
        objects: Arc<dyn ObjectStore>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        let working_dir = working_dir.into();
        let local = working_dir.join(program);
        let program = if local.is_file() {
            local
        } else {
            PathBuf::from(program)
        };
        Self {
            program,
            args,
            working_dir,
            objects,
            work_root: work_root.into(),
        }
    }

    /// Filesystem path of a partition, staging a copy for stores without one.
    fn partition_file(&self, key: &str, staging: &Path) -> CoreResult<PathBuf> {
        if let Some(path) = self.objects.local_path(key).filter(|p| p.is_file()) {
            return Ok(path);
        }
        let name = Path::new(key)
            .file_name()
            .ok_or_else(|| CoreError::storage(format!("partition key {key:?} has no file name")))?;
        let target = staging.join(name);
        std::fs::write(&target, self.objects.get(key)?)?;
        Ok(target)
    }
}

impl Trainer for ProcessTrainer {
    fn train(&self, dataset: &DatasetVersion, model: &ModelDefinition) -> CoreResult<TrainOutcome> {
        let output_dir = self
            .work_root
            .join(&model.name)
            .join(dataset.id.to_string());
        std::fs::create_dir_all(&output_dir)?;
        let train_path = self.partition_file(&dataset.partitions.train_path, &output_dir)?;
        let valid_path = self.partition_file(&dataset.partitions.valid_path, &output_dir)?;

        tracing::debug!(
            model = %model.name,
            version = dataset.id.raw(),
            program = %self.program.display(),
            "spawning trainer process"
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .env("RETRAIN_MODEL", &model.name)
            .env("RETRAIN_DATASET_VERSION", dataset.id.raw().to_string())
            .env("RETRAIN_TRAIN_PATH", &train_path)
            .env("RETRAIN_VALID_PATH", &valid_path)
            .env("RETRAIN_CONFIG_REF", &model.config_ref)
            .env("RETRAIN_OUTPUT_DIR", &output_dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                CoreError::execution(format!("spawn {}: {e}", self.program.display()))
            })?;

        if !output.status.success() {
            return Err(CoreError::execution(format!(
                "{} exited with {}: {}",
                model.name,
                output.status,
                stderr_tail(&output.stderr)
            )));
        }
        parse_outcome(&output.stdout)
    }
}

fn parse_outcome(stdout: &[u8]) -> CoreResult<TrainOutcome> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| CoreError::execution("trainer printed no result line"))?;
    serde_json::from_str(line)
        .map_err(|e| CoreError::execution(format!("unparseable result line {line:?}: {e}")))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
