//! Object stores for materialized partitions and trained artifacts.
//!
//! Keys are slash-separated relative paths such as `versioned/v3/train.jsonl`.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};

use super::domain::ObjectStore;

fn check_key(path: &str) -> CoreResult<()> {
    let rel = Path::new(path);
    if path.is_empty()
        || rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(CoreError::invalid(format!("object key {path:?} is not a plain relative path")));
    }
    Ok(())
}

/// Filesystem object store rooted at `cfg.objects_root()`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> CoreResult<PathBuf> {
        check_key(path)?;
        Ok(self.root.join(path))
    }
}

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.partial", Uuid::new_v4().simple()))
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

impl ObjectStore for FsObjectStore {
    /// Writes go to a sibling temp file and are renamed into place, so a
    /// reader never observes a half-written object. Each writer gets its own
    /// temp name; concurrent puts of one key end with one complete body.
    fn put(&self, path: &str, bytes: &[u8]) -> CoreResult<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = temp_sibling(&target);
        let written = write_synced(&tmp, bytes).and_then(|()| fs::rename(&tmp, &target));
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn get(&self, path: &str) -> CoreResult<Vec<u8>> {
        let target = self.resolve(path)?;
        match fs::read(&target) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::not_found("object", path))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, path: &str) -> CoreResult<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        self.resolve(path).ok()
    }
}

/// In-process object store.
#[derive(Default)]
pub struct MemObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys in lexical order.
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl ObjectStore for MemObjectStore {
    fn put(&self, path: &str, bytes: &[u8]) -> CoreResult<()> {
        check_key(path)?;
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| CoreError::storage("object map lock poisoned"))?;
        objects.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, path: &str) -> CoreResult<Vec<u8>> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| CoreError::storage("object map lock poisoned"))?;
        objects
            .get(path)
            .cloned()
            .ok_or_else(|| CoreError::not_found("object", path))
    }

    fn exists(&self, path: &str) -> CoreResult<bool> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| CoreError::storage("object map lock poisoned"))?;
        Ok(objects.contains_key(path))
    }
}
