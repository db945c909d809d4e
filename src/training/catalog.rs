//! Model folder discovery.
//!
//! Each subdirectory of the models directory that holds a `model.toml` is a
//! model named after the folder:
//!
//! ```toml
//! entry_point = "train.sh"
//! args = ["--epochs", "5"]
//! config = "params.yaml"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::common::error::{CoreError, CoreResult};
use crate::data::domain::ObjectStore;

use super::domain::ModelDefinition;
use super::exec::ProcessTrainer;

pub const MANIFEST_FILE: &str = "model.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelManifest {
    entry_point: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    config: Option<String>,
}

/// A model found on disk together with the trainer that runs it.
pub struct DiscoveredModel {
    pub def: ModelDefinition,
    pub trainer: ProcessTrainer,
}

pub struct ModelCatalog {
    root: PathBuf,
}

impl ModelCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the models directory, sorted by name. A missing directory yields
    /// nothing; a folder with a broken manifest is skipped with a warning.
    pub fn discover(
        &self,
        objects: Arc<dyn ObjectStore>,
        work_root: &Path,
    ) -> CoreResult<Vec<DiscoveredModel>> {
        if !self.root.is_dir() {
            tracing::debug!(root = %self.root.display(), "models directory absent");
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();

        let mut found = Vec::new();
        for dir in dirs {
            match load_model(&dir, objects.clone(), work_root) {
                Ok(Some(model)) => found.push(model),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), error = %err, "skipping model folder")
                }
            }
        }
        Ok(found)
    }
}

fn load_model(
    dir: &Path,
    objects: Arc<dyn ObjectStore>,
    work_root: &Path,
) -> CoreResult<Option<DiscoveredModel>> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Ok(None);
    }
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CoreError::config(format!("{} is not a UTF-8 name", dir.display())))?;
    let manifest: ModelManifest = toml::from_str(&std::fs::read_to_string(&manifest_path)?)
        .map_err(|e| CoreError::config(format!("{}: {e}", manifest_path.display())))?;
    if manifest.entry_point.trim().is_empty() {
        return Err(CoreError::config(format!(
            "{}: entry_point is empty",
            manifest_path.display()
        )));
    }

    let config_ref = manifest
        .config
        .as_deref()
        .map(|c| dir.join(c))
        .unwrap_or_else(|| manifest_path.clone());
    let def = ModelDefinition::new(
        name,
        manifest.entry_point.clone(),
        config_ref.display().to_string(),
    );
    def.validate()?;
    let trainer = ProcessTrainer::new(&manifest.entry_point, manifest.args, dir, objects, work_root);
    Ok(Some(DiscoveredModel { def, trainer }))
}
