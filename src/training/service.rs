//! Training dispatcher: turns ready dataset versions into exactly one
//! training run per registered model and drives those runs to a terminal
//! state on the worker pool.
//!
//! Run creation goes through [`RunRepo::record`], whose live-key index is the
//! only guard that matters across handles. Every status change afterwards is
//! a compare-and-set, so a run reaped for timeout cannot later be overwritten
//! by its own late completion.

use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::common::error::{CoreError, CoreResult};
use crate::common::metrics::Telemetry;
use crate::common::time;
use crate::data::domain::{DataRepo, DatasetVersion, VersionId};

use super::domain::{
    ModelDefinition, RunId, RunRepo, RunStatus, RunTransition, Trainer, TrainingRun,
};
use super::workers::Pool;

/// Dispatcher settings captured from [`crate::common::config::AppCfg`].
#[derive(Clone, Debug)]
pub struct DispatcherCfg {
    pub workers: usize,
    pub timeout: Duration,
    pub max_attempts: u32,
}

#[derive(Clone)]
struct Registered {
    def: ModelDefinition,
    trainer: Arc<dyn Trainer>,
}

/// State shared between the dispatcher and its workers.
struct Shared {
    runs: Arc<dyn RunRepo>,
    data: Arc<dyn DataRepo>,
    trainers: RwLock<BTreeMap<String, Registered>>,
    /// Runs sitting in this process's queue or executing on it.
    queued: Mutex<HashSet<RunId>>,
    telemetry: Arc<Telemetry>,
}

pub struct TrainingDispatcher {
    shared: Arc<Shared>,
    pool: Pool,
    timeout: Duration,
    max_attempts: u32,
}

impl TrainingDispatcher {
    pub fn new(
        runs: Arc<dyn RunRepo>,
        data: Arc<dyn DataRepo>,
        cfg: DispatcherCfg,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                runs,
                data,
                trainers: RwLock::new(BTreeMap::new()),
                queued: Mutex::new(HashSet::new()),
                telemetry,
            }),
            pool: Pool::new(cfg.workers),
            timeout: cfg.timeout,
            max_attempts: cfg.max_attempts.max(1),
        }
    }

    /// Models with a trainer installed in this process, by name.
    pub fn models(&self) -> Vec<ModelDefinition> {
        self.shared
            .registered()
            .into_iter()
            .map(|entry| entry.def)
            .collect()
    }

    /// Install a trainer for `def` and back-fill one run per ready version
    /// the model has never attempted. Keys with failed attempts are left to
    /// [`Self::retry_failed`] so the attempt budget holds across
    /// re-registration. Returns the enqueued run ids, oldest version first.
    pub fn register_model(
        &self,
        def: ModelDefinition,
        trainer: Arc<dyn Trainer>,
    ) -> CoreResult<Vec<RunId>> {
        def.validate()?;
        self.shared.runs.upsert_model(&def, time::now_ms())?;
        let name = def.name.clone();
        self.shared
            .trainers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.clone(), Registered { def, trainer });
        tracing::info!(model = %name, "model registered");

        let attempted = self.attempts_by_version(&name)?;
        let mut enqueued = Vec::new();
        for version in self.shared.data.versions()? {
            if attempted.contains_key(&version.id) {
                continue;
            }
            if let Some(run_id) = self.create_run(&name, version.id)? {
                enqueued.push(run_id);
            }
        }
        if !enqueued.is_empty() {
            tracing::info!(model = %name, runs = enqueued.len(), "back-filled retained versions");
        }
        Ok(enqueued)
    }

    /// One pending run per registered model that has no live run on `version`.
    pub fn dispatch_version(&self, version: &DatasetVersion) -> CoreResult<Vec<RunId>> {
        let mut enqueued = Vec::new();
        for entry in self.shared.registered() {
            if let Some(run_id) = self.create_run(&entry.def.name, version.id)? {
                enqueued.push(run_id);
            }
        }
        Ok(enqueued)
    }

    /// Fresh attempt for a key whose previous runs all ended without success.
    pub fn retry(&self, model: &str, version: VersionId) -> CoreResult<RunId> {
        if self.shared.trainer(model).is_none() {
            return Err(CoreError::not_found("model", model));
        }
        if self.shared.data.version(version)?.is_none() {
            return Err(CoreError::not_found("dataset version", version));
        }
        if let Some(live) = self.shared.runs.find(model, version)? {
            return Err(CoreError::conflict(format!(
                "{model}@{version} already has run {} ({})",
                live.run_id,
                live.status.as_str()
            )));
        }
        self.create_run(model, version)?.ok_or_else(|| {
            CoreError::conflict(format!("{model}@{version} was claimed by another dispatcher"))
        })
    }

    /// Retry every key whose latest attempt failed and that is still under
    /// the attempt budget. Cancelled keys stay cancelled.
    pub fn retry_failed(&self) -> CoreResult<Vec<RunId>> {
        let mut enqueued = Vec::new();
        for entry in self.shared.registered() {
            let name = &entry.def.name;
            for (version, attempts) in self.attempts_by_version(name)? {
                let exhausted = attempts.len() as u32 >= self.max_attempts;
                let latest_failed = attempts
                    .last()
                    .map_or(false, |run| run.status == RunStatus::Failed);
                let live = attempts.iter().any(|run| run.status.holds_key());
                if exhausted || !latest_failed || live {
                    continue;
                }
                if let Some(run_id) = self.create_run(name, version)? {
                    tracing::info!(model = %name, version = version.raw(), attempt = attempts.len() + 1, "retrying failed run");
                    enqueued.push(run_id);
                }
            }
        }
        Ok(enqueued)
    }

    /// `pending → cancelled`. `false` when the run had already started or ended.
    pub fn cancel(&self, run_id: &RunId) -> CoreResult<bool> {
        let cancelled = self.shared.runs.transition(
            run_id,
            RunStatus::Pending,
            RunStatus::Cancelled,
            &RunTransition {
                cause: Some("cancelled".to_string()),
                ended_ms: Some(time::now_ms()),
                ..RunTransition::default()
            },
        )?;
        if cancelled {
            Telemetry::incr(&self.shared.telemetry.runs_cancelled);
            tracing::info!(run_id = %run_id, "run cancelled");
        }
        Ok(cancelled)
    }

    /// Cancel `model`'s pending runs on versions older than the newest one.
    pub fn cancel_superseded(&self, model: &str) -> CoreResult<Vec<RunId>> {
        let Some(latest) = self.shared.data.versions()?.last().map(|v| v.id) else {
            return Ok(Vec::new());
        };
        let mut cancelled = Vec::new();
        for run in self.shared.runs.history(Some(model))? {
            if run.status == RunStatus::Pending && run.version < latest && self.cancel(&run.run_id)? {
                cancelled.push(run.run_id);
            }
        }
        Ok(cancelled)
    }

    pub fn reap_expired(&self) -> CoreResult<Vec<TrainingRun>> {
        self.reap_expired_at(time::now_ms())
    }

    /// Fail running runs whose start is older than the training timeout at `now_ms`.
    pub fn reap_expired_at(&self, now_ms: u64) -> CoreResult<Vec<TrainingRun>> {
        let cutoff = now_ms.saturating_sub(self.timeout.as_millis() as u64);
        let expired = self.shared.runs.expire_running(cutoff, now_ms)?;
        for run in &expired {
            Telemetry::incr(&self.shared.telemetry.runs_failed);
            tracing::warn!(
                run_id = %run.run_id,
                model = %run.model,
                version = run.version.raw(),
                "training run timed out"
            );
        }
        Ok(expired)
    }

    /// Queue pending runs that no worker here holds: leftovers of a previous
    /// process, or runs recorded for a model before its trainer was installed.
    pub fn resume(&self) -> CoreResult<Vec<RunId>> {
        let mut resumed = Vec::new();
        for run in self.shared.runs.with_status(RunStatus::Pending)? {
            if self.shared.trainer(&run.model).is_none() {
                tracing::debug!(run_id = %run.run_id, model = %run.model, "no local trainer for pending run");
                continue;
            }
            if self.enqueue(run.run_id.clone()) {
                tracing::info!(run_id = %run.run_id, model = %run.model, "pending run resumed");
                resumed.push(run.run_id);
            }
        }
        Ok(resumed)
    }

    /// Dispatch every ready version × registered model that has never been
    /// attempted. Picks up versions promoted by another handle.
    pub fn reconcile(&self) -> CoreResult<Vec<RunId>> {
        let versions = self.shared.data.versions()?;
        let mut enqueued = Vec::new();
        for entry in self.shared.registered() {
            let name = &entry.def.name;
            let attempted = self.attempts_by_version(name)?;
            for version in &versions {
                if attempted.contains_key(&version.id) {
                    continue;
                }
                if let Some(run_id) = self.create_run(name, version.id)? {
                    enqueued.push(run_id);
                }
            }
        }
        Ok(enqueued)
    }

    /// Block until the worker pool is drained. `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout)
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    fn attempts_by_version(&self, model: &str) -> CoreResult<BTreeMap<VersionId, Vec<TrainingRun>>> {
        let mut grouped: BTreeMap<VersionId, Vec<TrainingRun>> = BTreeMap::new();
        for run in self.shared.runs.history(Some(model))? {
            grouped.entry(run.version).or_default().push(run);
        }
        Ok(grouped)
    }

    /// Insert a pending run unless the key is taken, then enqueue it.
    fn create_run(&self, model: &str, version: VersionId) -> CoreResult<Option<RunId>> {
        if self.shared.runs.find(model, version)?.is_some() {
            return Ok(None);
        }
        let run = TrainingRun::pending(model, version, time::now_ms());
        match self.shared.runs.record(&run) {
            Ok(()) => {}
            Err(CoreError::ConcurrencyConflict(msg)) => {
                if self.shared.runs.find(model, version)?.is_some() {
                    tracing::debug!(model, version = version.raw(), "run already claimed elsewhere");
                    return Ok(None);
                }
                return Err(CoreError::ConcurrencyConflict(msg));
            }
            Err(err) => return Err(err),
        }
        tracing::info!(run_id = %run.run_id, model, version = version.raw(), "training run queued");
        self.enqueue(run.run_id.clone());
        Ok(Some(run.run_id))
    }

    /// `false` when the run is already queued here.
    fn enqueue(&self, run_id: RunId) -> bool {
        if !self.shared.mark_queued(&run_id) {
            return false;
        }
        let shared = self.shared.clone();
        self.pool.submit(move || {
            shared.execute(&run_id);
            shared.unmark_queued(&run_id);
        });
        true
    }
}

impl Shared {
    fn registered(&self) -> Vec<Registered> {
        self.trainers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn trainer(&self, model: &str) -> Option<Registered> {
        self.trainers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(model)
            .cloned()
    }

    fn mark_queued(&self, run_id: &RunId) -> bool {
        self.queued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(run_id.clone())
    }

    fn unmark_queued(&self, run_id: &RunId) {
        self.queued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(run_id);
    }

    fn execute(&self, run_id: &RunId) {
        if let Err(err) = self.try_execute(run_id) {
            tracing::error!(run_id = %run_id, error = %err, "training run bookkeeping failed");
        }
    }

    fn try_execute(&self, run_id: &RunId) -> CoreResult<()> {
        let run = self
            .runs
            .get(run_id)?
            .ok_or_else(|| CoreError::not_found("training run", run_id))?;
        if run.status != RunStatus::Pending {
            tracing::debug!(run_id = %run_id, status = run.status.as_str(), "run no longer pending");
            return Ok(());
        }
        let Some(entry) = self.trainer(&run.model) else {
            return self.fail_pending(&run, "no trainer registered");
        };
        let Some(dataset) = self.data.version(run.version)? else {
            return self.fail_pending(&run, "dataset version not ready");
        };

        let started = RunTransition {
            started_ms: Some(time::now_ms()),
            ..RunTransition::default()
        };
        if !self
            .runs
            .transition(run_id, RunStatus::Pending, RunStatus::Running, &started)?
        {
            return Ok(());
        }
        Telemetry::incr(&self.telemetry.runs_started);
        tracing::info!(run_id = %run_id, model = %run.model, version = run.version.raw(), "training run started");

        let clock = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            entry.trainer.train(&dataset, &entry.def)
        }))
        .unwrap_or_else(|payload| {
            Err(CoreError::execution(format!(
                "trainer panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
        let dur_ms = time::elapsed_ms(clock);
        self.telemetry.run_duration_ms.observe(dur_ms);

        let (to, change) = match result {
            Ok(outcome) => (
                RunStatus::Succeeded,
                RunTransition {
                    metrics: Some(outcome.metrics),
                    artifact_ref: Some(outcome.artifact_ref),
                    ended_ms: Some(time::now_ms()),
                    ..RunTransition::default()
                },
            ),
            Err(err) => (
                RunStatus::Failed,
                RunTransition {
                    cause: Some(err.to_string()),
                    ended_ms: Some(time::now_ms()),
                    ..RunTransition::default()
                },
            ),
        };
        if !self.runs.transition(run_id, RunStatus::Running, to, &change)? {
            tracing::warn!(run_id = %run_id, dur_ms, "late completion ignored");
            return Ok(());
        }
        match to {
            RunStatus::Succeeded => {
                Telemetry::incr(&self.telemetry.runs_succeeded);
                tracing::info!(run_id = %run_id, model = %run.model, dur_ms, "training run succeeded");
            }
            _ => {
                Telemetry::incr(&self.telemetry.runs_failed);
                tracing::warn!(
                    run_id = %run_id,
                    model = %run.model,
                    dur_ms,
                    cause = change.cause.as_deref().unwrap_or_default(),
                    "training run failed"
                );
            }
        }
        Ok(())
    }

    fn fail_pending(&self, run: &TrainingRun, cause: &str) -> CoreResult<()> {
        let failed = self.runs.transition(
            &run.run_id,
            RunStatus::Pending,
            RunStatus::Failed,
            &RunTransition {
                cause: Some(cause.to_string()),
                ended_ms: Some(time::now_ms()),
                ..RunTransition::default()
            },
        )?;
        if failed {
            Telemetry::incr(&self.telemetry.runs_failed);
            tracing::warn!(run_id = %run.run_id, model = %run.model, cause, "training run failed before start");
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::db::SqliteStore;
    use crate::data::domain::{CorrectedLabel, FeaturePayload};
    use crate::data::promoter::{PromoterCfg, VersionPromoter};
    use crate::data::repo_fs::MemObjectStore;
    use crate::training::domain::{Metrics, TrainOutcome};
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(10);

    struct Fixture {
        store: Arc<SqliteStore>,
        promoter: VersionPromoter,
        dispatcher: TrainingDispatcher,
        telemetry: Arc<Telemetry>,
    }

    fn fixture() -> Fixture {
        fixture_with_attempts(2)
    }

    fn fixture_with_attempts(max_attempts: u32) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let telemetry = Arc::new(Telemetry::new());
        let promoter = VersionPromoter::new(
            store.clone(),
            Arc::new(MemObjectStore::new()),
            PromoterCfg {
                batch_size: 2,
                split_ratio: 0.5,
                split_seed: 42,
            },
            telemetry.clone(),
        );
        let dispatcher = TrainingDispatcher::new(
            store.clone(),
            store.clone(),
            DispatcherCfg {
                workers: 2,
                timeout: Duration::from_secs(60),
                max_attempts,
            },
            telemetry.clone(),
        );
        Fixture {
            store,
            promoter,
            dispatcher,
            telemetry,
        }
    }

    impl Fixture {
        fn promote(&self, versions: usize) -> Vec<DatasetVersion> {
            for i in 0..versions * 2 {
                let features = FeaturePayload::from_value(serde_json::json!({"x": i})).unwrap();
                self.store
                    .insert_correction(&features, &CorrectedLabel::Numeric(i as f64), 0)
                    .unwrap();
            }
            self.promoter.promote_ready().unwrap()
        }

        fn runs(&self, model: &str) -> Vec<TrainingRun> {
            self.store.history(Some(model)).unwrap()
        }
    }

    fn scoring(score: f64) -> Arc<dyn Trainer> {
        Arc::new(
            move |v: &DatasetVersion, m: &ModelDefinition| -> CoreResult<TrainOutcome> {
                let mut metrics = Metrics::new();
                metrics.insert("accuracy".into(), score);
                Ok(TrainOutcome {
                    metrics,
                    artifact_ref: format!("models/{}/{}", m.name, v.id),
                })
            },
        )
    }

    fn failing(msg: &'static str) -> Arc<dyn Trainer> {
        Arc::new(
            move |_: &DatasetVersion, _: &ModelDefinition| -> CoreResult<TrainOutcome> {
                Err(CoreError::execution(msg))
            },
        )
    }

    #[test]
    fn dispatch_creates_one_run_per_model_and_version() {
        let fx = fixture();
        fx.dispatcher
            .register_model(ModelDefinition::new("lr", "train", "cfg"), scoring(0.8))
            .unwrap();
        let versions = fx.promote(1);
        let first = fx.dispatcher.dispatch_version(&versions[0]).unwrap();
        let second = fx.dispatcher.dispatch_version(&versions[0]).unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert!(fx.dispatcher.wait_idle(WAIT));

        let runs = fx.runs("lr");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);
        assert_eq!(runs[0].artifact_ref.as_deref(), Some("models/lr/v1"));
        assert!(fx.dispatcher.reconcile().unwrap().is_empty());
        assert_eq!(fx.telemetry.runs_succeeded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn registration_backfills_oldest_first() {
        let fx = fixture();
        fx.promote(3);
        let enqueued = fx
            .dispatcher
            .register_model(ModelDefinition::new("rf", "train", "cfg"), scoring(0.7))
            .unwrap();
        assert_eq!(enqueued.len(), 3);
        assert!(fx.dispatcher.wait_idle(WAIT));
        let versions: Vec<u64> = enqueued
            .iter()
            .map(|id| fx.store.get(id).unwrap().unwrap().version.raw())
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn failed_run_is_retried_once_per_budget() {
        let fx = fixture();
        fx.dispatcher
            .register_model(ModelDefinition::new("lr", "train", "cfg"), failing("diverged"))
            .unwrap();
        let versions = fx.promote(1);
        fx.dispatcher.dispatch_version(&versions[0]).unwrap();
        assert!(fx.dispatcher.wait_idle(WAIT));
        let runs = fx.runs("lr");
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(
            runs[0].cause.as_deref(),
            Some("training execution failed: diverged")
        );

        // Re-registration leaves the failed key to the retry path.
        let backfilled = fx
            .dispatcher
            .register_model(ModelDefinition::new("lr", "train", "cfg"), scoring(0.9))
            .unwrap();
        assert!(backfilled.is_empty());
        assert_eq!(fx.runs("lr").len(), 1);

        assert_eq!(fx.dispatcher.retry_failed().unwrap().len(), 1);
        assert!(fx.dispatcher.wait_idle(WAIT));
        let runs = fx.runs("lr");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].status, RunStatus::Succeeded);
        assert!(fx.dispatcher.retry_failed().unwrap().is_empty());
        assert!(matches!(
            fx.dispatcher.retry("lr", VersionId(1)),
            Err(CoreError::ConcurrencyConflict(_))
        ));
    }

    #[test]
    fn reregistration_does_not_reset_attempt_budget() {
        let fx = fixture_with_attempts(1);
        let versions = fx.promote(1);
        for _ in 0..4 {
            fx.dispatcher
                .register_model(ModelDefinition::new("lr", "train", "cfg"), failing("oom"))
                .unwrap();
            assert!(fx.dispatcher.wait_idle(WAIT));
            fx.dispatcher.reconcile().unwrap();
            fx.dispatcher.retry_failed().unwrap();
            assert!(fx.dispatcher.wait_idle(WAIT));
        }
        let attempts = fx.store.attempts("lr", versions[0].id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, RunStatus::Failed);
    }

    #[test]
    fn retry_failed_honours_attempt_budget() {
        let fx = fixture();
        fx.dispatcher
            .register_model(ModelDefinition::new("lr", "train", "cfg"), failing("oom"))
            .unwrap();
        let versions = fx.promote(1);
        fx.dispatcher.dispatch_version(&versions[0]).unwrap();
        assert!(fx.dispatcher.wait_idle(WAIT));
        assert_eq!(fx.dispatcher.retry_failed().unwrap().len(), 1);
        assert!(fx.dispatcher.wait_idle(WAIT));
        assert!(fx.dispatcher.retry_failed().unwrap().is_empty());
        assert_eq!(fx.runs("lr").len(), 2);
        assert_eq!(fx.telemetry.runs_failed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn panicking_trainer_records_failure() {
        let fx = fixture();
        let trainer: Arc<dyn Trainer> = Arc::new(
            |_: &DatasetVersion, _: &ModelDefinition| -> CoreResult<TrainOutcome> {
                panic!("segfault in native lib")
            },
        );
        fx.dispatcher
            .register_model(ModelDefinition::new("gb", "train", "cfg"), trainer)
            .unwrap();
        let versions = fx.promote(1);
        fx.dispatcher.dispatch_version(&versions[0]).unwrap();
        assert!(fx.dispatcher.wait_idle(WAIT));
        let run = &fx.runs("gb")[0];
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.cause.as_deref().unwrap().contains("segfault in native lib"));
    }

    #[test]
    fn cancel_only_touches_pending_runs() {
        let fx = fixture();
        let versions = fx.promote(2);
        // Runs recorded by another handle that has the trainer.
        let old = TrainingRun::pending("lr", versions[0].id, 1);
        let new = TrainingRun::pending("lr", versions[1].id, 2);
        fx.store.record(&old).unwrap();
        fx.store.record(&new).unwrap();

        let cancelled = fx.dispatcher.cancel_superseded("lr").unwrap();
        assert_eq!(cancelled, vec![old.run_id.clone()]);
        assert!(!fx.dispatcher.cancel(&old.run_id).unwrap());
        assert_eq!(
            fx.store.get(&new.run_id).unwrap().unwrap().status,
            RunStatus::Pending
        );
        assert!(fx.store.find("lr", versions[0].id).unwrap().is_none());
    }

    #[test]
    fn timed_out_run_ignores_late_completion() {
        let fx = fixture();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let trainer: Arc<dyn Trainer> = Arc::new(
            move |_: &DatasetVersion, _: &ModelDefinition| -> CoreResult<TrainOutcome> {
                let _ = release_rx.lock().unwrap().recv();
                Ok(TrainOutcome {
                    metrics: Metrics::new(),
                    artifact_ref: "late".into(),
                })
            },
        );
        fx.dispatcher
            .register_model(ModelDefinition::new("slow", "train", "cfg"), trainer)
            .unwrap();
        let versions = fx.promote(1);
        let run_id = fx.dispatcher.dispatch_version(&versions[0]).unwrap().remove(0);

        let deadline = Instant::now() + WAIT;
        while fx.store.get(&run_id).unwrap().unwrap().status != RunStatus::Running {
            assert!(Instant::now() < deadline, "run never started");
            std::thread::sleep(Duration::from_millis(5));
        }
        let reaped = fx
            .dispatcher
            .reap_expired_at(time::now_ms() + 3_600_000)
            .unwrap();
        assert_eq!(reaped.len(), 1);
        release_tx.send(()).unwrap();
        assert!(fx.dispatcher.wait_idle(WAIT));

        let run = fx.store.get(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.cause.as_deref(), Some("timeout"));
        assert_eq!(run.artifact_ref, None);
        assert_eq!(fx.telemetry.runs_succeeded.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn resume_skips_models_without_local_trainer() {
        let fx = fixture();
        let versions = fx.promote(1);
        let orphan = TrainingRun::pending("remote", versions[0].id, 1);
        fx.store.record(&orphan).unwrap();
        assert!(fx.dispatcher.resume().unwrap().is_empty());

        fx.dispatcher
            .register_model(ModelDefinition::new("remote", "train", "cfg"), scoring(0.5))
            .unwrap();
        assert!(fx.dispatcher.wait_idle(WAIT));
        // The key was live, so registration did not add a second run; resume
        // picks the existing one up.
        assert_eq!(fx.dispatcher.resume().unwrap(), vec![orphan.run_id.clone()]);
        assert!(fx.dispatcher.wait_idle(WAIT));
        let runs = fx.runs("remote");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);
    }

    #[test]
    fn resume_leaves_locally_queued_runs_alone() {
        let fx = fixture();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let trainer: Arc<dyn Trainer> = Arc::new(
            move |_: &DatasetVersion, _: &ModelDefinition| -> CoreResult<TrainOutcome> {
                let _ = release_rx.lock().unwrap().recv();
                Ok(TrainOutcome {
                    metrics: Metrics::new(),
                    artifact_ref: "held".into(),
                })
            },
        );
        fx.dispatcher
            .register_model(ModelDefinition::new("held", "train", "cfg"), trainer)
            .unwrap();
        let versions = fx.promote(1);
        assert_eq!(fx.dispatcher.dispatch_version(&versions[0]).unwrap().len(), 1);
        assert!(fx.dispatcher.resume().unwrap().is_empty());
        release_tx.send(()).unwrap();
        assert!(fx.dispatcher.wait_idle(WAIT));
        assert_eq!(fx.runs("held")[0].status, RunStatus::Succeeded);
        assert_eq!(fx.telemetry.runs_started.load(Ordering::Relaxed), 1);
    }
}
