//! Version promoter: turns buffered corrections into immutable dataset versions.
//!
//! Promotion is split in two phases. The claim (select oldest batch, advance
//! the version counter, write the marker, flip `consumed`) is one storage
//! transaction. Materialization (seeded split, partition upload, flip to
//! ready) happens afterwards and is deterministic, so an interrupted
//! promotion is completed by replaying it from the marker on restart.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::common::error::{CoreError, CoreResult};
use crate::common::ids::Fingerprint;
use crate::common::metrics::Telemetry;
use crate::common::time;

use super::domain::{
    CorrectedLabel, DataRepo, DatasetVersion, FeaturePayload, ObjectStore, Partitions, RecordId,
    VersionClaim, VersionId,
};

/// Promotion settings captured from [`crate::common::config::AppCfg`].
#[derive(Clone, Debug)]
pub struct PromoterCfg {
    pub batch_size: usize,
    pub split_ratio: f64,
    pub split_seed: u64,
}

#[derive(Serialize)]
struct MaterializedRow<'a> {
    record_id: i64,
    features: &'a FeaturePayload,
    label: &'a CorrectedLabel,
}

#[derive(Serialize)]
struct Manifest<'a> {
    version: u64,
    created_ms: u64,
    fingerprint: &'a str,
    split_ratio: f64,
    split_seed: u64,
    record_ids: Vec<i64>,
    train_count: u64,
    valid_count: u64,
}

pub struct VersionPromoter {
    repo: Arc<dyn DataRepo>,
    objects: Arc<dyn ObjectStore>,
    cfg: PromoterCfg,
    telemetry: Arc<Telemetry>,
}

impl VersionPromoter {
    pub fn new(
        repo: Arc<dyn DataRepo>,
        objects: Arc<dyn ObjectStore>,
        cfg: PromoterCfg,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            repo,
            objects,
            cfg,
            telemetry,
        }
    }

    /// Promote as many full batches as are pending. Returns the versions this
    /// call made ready, oldest first.
    pub fn promote_ready(&self) -> CoreResult<Vec<DatasetVersion>> {
        let mut created = Vec::new();
        self.promote_ready_with(|version| created.push(version.clone()))?;
        Ok(created)
    }

    /// Like [`Self::promote_ready`], but hands each version to `on_ready` the
    /// moment it is ready. Unfinished markers are completed before anything
    /// new is claimed, so versions turn ready in id order. When a later
    /// version fails, the ones already handed over stay ready.
    pub fn promote_ready_with<F>(&self, mut on_ready: F) -> CoreResult<()>
    where
        F: FnMut(&DatasetVersion),
    {
        for claim in self.repo.unmaterialized()? {
            tracing::warn!(version = claim.id.raw(), "finishing earlier promotion");
            if let Some(version) = self.materialize(&claim)? {
                on_ready(&version);
            }
        }
        loop {
            let start = Instant::now();
            let claim = self.repo.claim_batch(
                self.cfg.batch_size,
                self.cfg.split_ratio,
                self.cfg.split_seed,
                time::now_ms(),
            )?;
            let Some(claim) = claim else {
                return Ok(());
            };
            tracing::info!(
                version = claim.id.raw(),
                records = claim.record_ids.len(),
                "dataset version claimed"
            );
            if let Some(version) = self.materialize(&claim)? {
                self.telemetry.promotion_ms.observe(time::elapsed_ms(start));
                on_ready(&version);
            }
        }
    }

    /// Replay every claimed-but-unmaterialized version.
    pub fn recover(&self) -> CoreResult<Vec<DatasetVersion>> {
        let mut replayed = Vec::new();
        for claim in self.repo.unmaterialized()? {
            tracing::warn!(version = claim.id.raw(), "replaying interrupted promotion");
            if let Some(version) = self.materialize(&claim)? {
                replayed.push(version);
            }
        }
        Ok(replayed)
    }

    /// Write partitions for `claim` and flip it to ready. `None` when another
    /// handle finished the same claim first.
    fn materialize(&self, claim: &VersionClaim) -> CoreResult<Option<DatasetVersion>> {
        let expected = Fingerprint::of_ids(claim.record_ids.iter().map(RecordId::raw));
        if expected != claim.fingerprint {
            return Err(CoreError::storage(format!(
                "{} member set does not match its marker ({} != {})",
                claim.id, expected, claim.fingerprint
            )));
        }

        let records = self.repo.records(&claim.record_ids)?;
        let (train_idx, valid_idx) = split_indices(
            records.len(),
            claim.split_ratio,
            claim.split_seed.wrapping_add(claim.id.raw()),
        );

        let encode = |indices: &[usize]| -> CoreResult<Vec<u8>> {
            let mut out = Vec::new();
            for &i in indices {
                let record = &records[i];
                serde_json::to_writer(
                    &mut out,
                    &MaterializedRow {
                        record_id: record.id.raw(),
                        features: &record.features,
                        label: &record.label,
                    },
                )?;
                out.push(b'\n');
            }
            Ok(out)
        };

        let partitions = partition_paths(claim.id, train_idx.len() as u64, valid_idx.len() as u64);
        self.objects.put(&partitions.train_path, &encode(&train_idx)?)?;
        self.objects.put(&partitions.valid_path, &encode(&valid_idx)?)?;
        let manifest = Manifest {
            version: claim.id.raw(),
            created_ms: claim.created_ms,
            fingerprint: &claim.fingerprint,
            split_ratio: claim.split_ratio,
            split_seed: claim.split_seed,
            record_ids: claim.record_ids.iter().map(RecordId::raw).collect(),
            train_count: partitions.train_count,
            valid_count: partitions.valid_count,
        };
        self.objects
            .put(&partitions.manifest_path, &serde_json::to_vec_pretty(&manifest)?)?;

        if !self.repo.mark_ready(claim.id, &partitions)? {
            tracing::debug!(version = claim.id.raw(), "version already ready");
            return Ok(None);
        }
        Telemetry::incr(&self.telemetry.versions_created);
        tracing::info!(
            version = claim.id.raw(),
            train = partitions.train_count,
            valid = partitions.valid_count,
            "dataset version ready"
        );
        self.repo
            .version(claim.id)?
            .map(Some)
            .ok_or_else(|| CoreError::not_found("dataset version", claim.id))
    }
}

/// Object keys for a version's materialized data.
pub fn partition_paths(id: VersionId, train_count: u64, valid_count: u64) -> Partitions {
    let base = format!("versioned/v{}", id.raw());
    Partitions {
        train_path: format!("{base}/train.jsonl"),
        valid_path: format!("{base}/valid.jsonl"),
        manifest_path: format!("{base}/manifest.json"),
        train_count,
        valid_count,
    }
}

/// Seeded shuffle then cut at `floor(n * ratio)`.
fn split_indices(n: usize, ratio: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let train = ((n as f64) * ratio).floor() as usize;
    let valid = order.split_off(train.min(n));
    (order, valid)
}
