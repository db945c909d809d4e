//! `RetrainCore`: the in-process facade wiring buffer, promoter, dispatcher
//! and selector over one store.
//!
//! Submission never waits on training. A submit that crosses the batch
//! threshold promotes synchronously (one short transaction plus the
//! partition upload) and hands the new version to the worker pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::common::config::AppCfg;
use crate::common::db::SqliteStore;
use crate::common::error::{CoreError, CoreResult};
use crate::common::metrics::{Telemetry, TelemetrySnapshot};
use crate::data::domain::{
    CorrectionRecord, DataRepo, ObjectStore, RecordId, VersionId, VersionSummary,
};
use crate::data::promoter::{PromoterCfg, VersionPromoter};
use crate::data::repo_fs::FsObjectStore;
use crate::data::service::CorrectionBuffer;
use crate::evaluation::domain::{ModelFilter, Selection};
use crate::evaluation::service::ModelSelector;
use crate::training::catalog::ModelCatalog;
use crate::training::domain::{ModelDefinition, RunId, RunRepo, Trainer, TrainingRun};
use crate::training::service::{DispatcherCfg, TrainingDispatcher};

/// Answer to a correction submission.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub accepted: bool,
    pub record_id: RecordId,
    /// Versions this submission caused to be promoted.
    pub promoted: Vec<VersionId>,
}

/// What one maintenance pass did.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub replayed: Vec<VersionId>,
    pub promoted: Vec<VersionId>,
    pub reaped: Vec<RunId>,
    pub resumed: Vec<RunId>,
    pub dispatched: Vec<RunId>,
    pub retried: Vec<RunId>,
}

pub struct RetrainCore {
    cfg: AppCfg,
    store: Arc<SqliteStore>,
    objects: Arc<dyn ObjectStore>,
    buffer: CorrectionBuffer,
    promoter: VersionPromoter,
    dispatcher: TrainingDispatcher,
    selector: ModelSelector,
    telemetry: Arc<Telemetry>,
}

impl RetrainCore {
    /// Open the store and object root named by `cfg`, register every model
    /// folder found under `models_dir`, and finish interrupted work. Models
    /// are installed first so their pending runs resume in this call.
    pub fn open(cfg: AppCfg) -> CoreResult<Self> {
        cfg.validate()?;
        let store = Arc::new(SqliteStore::open(&cfg.db_path())?);
        let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(cfg.objects_root()));
        let core = Self::assemble(cfg, store, objects)?;
        let models = core.discover_models()?;
        core.startup()?;
        tracing::info!(
            db = %core.cfg.db_path().display(),
            models = models.len(),
            "retrain core opened"
        );
        Ok(core)
    }

    /// Assemble the core over existing backends and run startup recovery.
    pub fn with_parts(
        cfg: AppCfg,
        store: Arc<SqliteStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> CoreResult<Self> {
        let core = Self::assemble(cfg, store, objects)?;
        core.startup()?;
        Ok(core)
    }

    fn assemble(
        cfg: AppCfg,
        store: Arc<SqliteStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> CoreResult<Self> {
        cfg.validate()?;
        let telemetry = Arc::new(Telemetry::new());
        let data: Arc<dyn DataRepo> = store.clone();
        let runs: Arc<dyn RunRepo> = store.clone();

        let buffer = CorrectionBuffer::new(data.clone(), cfg.schema.clone(), telemetry.clone());
        let promoter = VersionPromoter::new(
            data.clone(),
            objects.clone(),
            PromoterCfg {
                batch_size: cfg.batch_size,
                split_ratio: cfg.train_test_split,
                split_seed: cfg.split_seed,
            },
            telemetry.clone(),
        );
        let dispatcher = TrainingDispatcher::new(
            runs.clone(),
            data,
            DispatcherCfg {
                workers: cfg.workers,
                timeout: cfg.training_timeout(),
                max_attempts: cfg.max_attempts,
            },
            telemetry.clone(),
        );
        let selector = ModelSelector::new(
            runs,
            cfg.metric_key.clone(),
            cfg.metric_direction,
            telemetry.clone(),
        );

        Ok(Self {
            cfg,
            store,
            objects,
            buffer,
            promoter,
            dispatcher,
            selector,
            telemetry,
        })
    }

    fn startup(&self) -> CoreResult<()> {
        let replayed = self.promoter.recover()?;
        if !replayed.is_empty() {
            tracing::warn!(versions = replayed.len(), "completed interrupted promotions");
        }
        self.promote_and_dispatch()?;
        let resumed = self.dispatcher.resume()?;
        if !resumed.is_empty() {
            tracing::info!(runs = resumed.len(), "resumed pending runs");
        }
        self.dispatcher.reconcile()?;
        Ok(())
    }

    pub fn config(&self) -> &AppCfg {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Validate and store a correction, then promote if the batch threshold
    /// was crossed. A failed promotion does not fail the submission; the
    /// record is durable and the next submit or tick picks it up. Versions
    /// made ready before the failure are still reported and dispatched.
    pub fn submit_correction(&self, features: Value, label: Value) -> CoreResult<SubmitReceipt> {
        let record_id = self.buffer.submit(features, label)?;
        let mut promoted = Vec::new();
        if let Err(err) = self.promote_into(&mut promoted) {
            tracing::warn!(record = record_id.raw(), error = %err, "promotion deferred");
        }
        Ok(SubmitReceipt {
            accepted: true,
            record_id,
            promoted,
        })
    }

    pub fn pending_count(&self) -> CoreResult<u64> {
        self.buffer.pending_count()
    }

    /// Oldest unconsumed corrections, untouched.
    pub fn drain(&self, n: usize) -> CoreResult<Vec<CorrectionRecord>> {
        self.buffer.drain(n)
    }

    fn promote_and_dispatch(&self) -> CoreResult<Vec<VersionId>> {
        let mut promoted = Vec::new();
        self.promote_into(&mut promoted)?;
        Ok(promoted)
    }

    /// Promote and dispatch version by version, appending each ready id to
    /// `promoted` so a later failure does not hide earlier work.
    fn promote_into(&self, promoted: &mut Vec<VersionId>) -> CoreResult<()> {
        self.promoter.promote_ready_with(|version| {
            if let Err(err) = self.dispatcher.dispatch_version(version) {
                tracing::warn!(version = version.id.raw(), error = %err, "dispatch deferred to reconcile");
            }
            promoted.push(version.id);
        })
    }

    /// Register a model with its trainer; back-fills retained versions.
    pub fn register_model(
        &self,
        def: ModelDefinition,
        trainer: Arc<dyn Trainer>,
    ) -> CoreResult<Vec<RunId>> {
        self.dispatcher.register_model(def, trainer)
    }

    /// Register every model folder under `models_dir`. Returns their names.
    pub fn discover_models(&self) -> CoreResult<Vec<String>> {
        let catalog = ModelCatalog::new(self.cfg.models_dir());
        let mut names = Vec::new();
        for found in catalog.discover(self.objects.clone(), &self.work_root())? {
            let name = found.def.name.clone();
            self.dispatcher
                .register_model(found.def, Arc::new(found.trainer))?;
            names.push(name);
        }
        Ok(names)
    }

    fn work_root(&self) -> PathBuf {
        self.cfg.data_root.join("work")
    }

    /// Models with a trainer installed in this process.
    pub fn models(&self) -> Vec<ModelDefinition> {
        self.dispatcher.models()
    }

    pub fn best_model(&self, model: Option<&str>) -> CoreResult<Selection> {
        self.selector.best_for(&ModelFilter::from_name(model))
    }

    pub fn version_history(&self) -> CoreResult<Vec<VersionSummary>> {
        Ok(self
            .store
            .versions()?
            .iter()
            .map(VersionSummary::from)
            .collect())
    }

    /// Member records of a ready version, in version order.
    pub fn version_records(&self, version: VersionId) -> CoreResult<Vec<CorrectionRecord>> {
        let dataset = self
            .store
            .version(version)?
            .ok_or_else(|| CoreError::not_found("dataset version", version))?;
        self.store.records(&dataset.record_ids)
    }

    pub fn run_history(&self, model: Option<&str>) -> CoreResult<Vec<TrainingRun>> {
        self.store.history(model)
    }

    pub fn retry_run(&self, model: &str, version: VersionId) -> CoreResult<RunId> {
        self.dispatcher.retry(model, version)
    }

    pub fn cancel_run(&self, run_id: &RunId) -> CoreResult<bool> {
        self.dispatcher.cancel(run_id)
    }

    /// Periodic maintenance: replay markers, promote, reap timeouts, queue
    /// stranded pending runs, dispatch unattempted keys and retry failures
    /// within budget.
    pub fn tick(&self) -> CoreResult<TickReport> {
        let mut replayed = Vec::new();
        for version in self.promoter.recover()? {
            if let Err(err) = self.dispatcher.dispatch_version(&version) {
                tracing::warn!(version = version.id.raw(), error = %err, "dispatch deferred to reconcile");
            }
            replayed.push(version.id);
        }
        let promoted = self.promote_and_dispatch()?;
        let reaped = self
            .dispatcher
            .reap_expired()?
            .into_iter()
            .map(|run| run.run_id)
            .collect();
        let resumed = self.dispatcher.resume()?;
        let dispatched = self.dispatcher.reconcile()?;
        let retried = self.dispatcher.retry_failed()?;
        let report = TickReport {
            replayed,
            promoted,
            reaped,
            resumed,
            dispatched,
            retried,
        };
        tracing::debug!(
            promoted = report.promoted.len(),
            reaped = report.reaped.len(),
            resumed = report.resumed.len(),
            dispatched = report.dispatched.len(),
            retried = report.retried.len(),
            "tick finished"
        );
        Ok(report)
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Prometheus text exposition of the telemetry.
    pub fn metrics_text(&self) -> String {
        self.telemetry.render_prometheus()
    }

    /// Block until queued training work has drained. `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.dispatcher.wait_idle(timeout)
    }
}
