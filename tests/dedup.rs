//! Exactly-once training under interleaved dispatch from separate store
//! handles sharing one database file.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use retrain_core::common::db::SqliteStore;
use retrain_core::common::metrics::Telemetry;
use retrain_core::data::domain::{DataRepo, DatasetVersion, ObjectStore, VersionId};
use retrain_core::data::repo_fs::FsObjectStore;
use retrain_core::data::{CorrectedLabel, FeaturePayload, PromoterCfg, VersionPromoter};
use retrain_core::training::domain::{
    Metrics, ModelDefinition, RunRepo, RunStatus, TrainOutcome, Trainer,
};
use retrain_core::training::{DispatcherCfg, TrainingDispatcher};
use retrain_core::{CoreError, CoreResult};

const MODELS: [&str; 2] = ["linear_regression", "random_forest"];
const WAIT: Duration = Duration::from_secs(20);

struct Handle {
    store: Arc<SqliteStore>,
    dispatcher: TrainingDispatcher,
}

/// Counts every invocation; when `fail_every > 0`, every `fail_every`-th call
/// (counting from the first) fails.
fn counting_trainer(calls: Arc<AtomicUsize>, fail_every: usize) -> Arc<dyn Trainer> {
    Arc::new(
        move |v: &DatasetVersion, _: &ModelDefinition| -> CoreResult<TrainOutcome> {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if fail_every > 0 && n % fail_every == 0 {
                return Err(CoreError::execution(format!("call {n} failed")));
            }
            let mut metrics = Metrics::new();
            metrics.insert("accuracy".into(), 0.5);
            Ok(TrainOutcome {
                metrics,
                artifact_ref: format!("artifact-{}", v.id),
            })
        },
    )
}

fn handle(path: &std::path::Path, calls: &Arc<AtomicUsize>, fail_every: usize) -> Handle {
    let store = Arc::new(SqliteStore::open(path).unwrap());
    let dispatcher = TrainingDispatcher::new(
        store.clone(),
        store.clone(),
        DispatcherCfg {
            workers: 2,
            timeout: Duration::from_secs(600),
            max_attempts: 3,
        },
        Arc::new(Telemetry::new()),
    );
    for name in MODELS {
        dispatcher
            .register_model(ModelDefinition::new(name, "train", "cfg"), counting_trainer(calls.clone(), fail_every))
            .unwrap();
    }
    Handle { store, dispatcher }
}

/// Promote `count` versions of two records each through `store`.
fn promote(store: &Arc<SqliteStore>, objects_root: &std::path::Path, count: usize) -> Vec<DatasetVersion> {
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(objects_root));
    let promoter = VersionPromoter::new(
        store.clone(),
        objects,
        PromoterCfg {
            batch_size: 2,
            split_ratio: 0.5,
            split_seed: 42,
        },
        Arc::new(Telemetry::new()),
    );
    for i in 0..count * 2 {
        let features = FeaturePayload::from_value(json!({"x": i})).unwrap();
        store
            .insert_correction(&features, &CorrectedLabel::Numeric(i as f64), 0)
            .unwrap();
    }
    promoter.promote_ready().unwrap()
}

fn assert_exactly_once(store: &SqliteStore, versions: &[DatasetVersion]) {
    for name in MODELS {
        for version in versions {
            let attempts = store.attempts(name, version.id).unwrap();
            assert!(
                attempts.len() <= 1,
                "{name}@{} has {} runs",
                version.id,
                attempts.len()
            );
            assert!(attempts.iter().all(|r| r.status == RunStatus::Succeeded));
        }
    }
}

/// At most one pending, running or succeeded row per key, whatever the
/// moment the history is read.
fn assert_one_live_per_key(store: &SqliteStore) {
    let mut live: BTreeMap<(String, VersionId), usize> = BTreeMap::new();
    for run in store.history(None).unwrap() {
        if run.status.holds_key() {
            *live.entry((run.model, run.version)).or_default() += 1;
        }
    }
    for ((model, version), count) in live {
        assert_eq!(count, 1, "{model}@{version} has {count} live runs");
    }
}

/// Every attempt ended, at most one success per key, and the trainer ran
/// exactly once per recorded attempt.
fn assert_settled(store: &SqliteStore, calls: usize) {
    let runs = store.history(None).unwrap();
    assert_eq!(calls, runs.len());
    let mut succeeded: BTreeMap<(String, VersionId), usize> = BTreeMap::new();
    for run in &runs {
        assert!(
            matches!(run.status, RunStatus::Succeeded | RunStatus::Failed),
            "run {} left {}",
            run.run_id,
            run.status.as_str()
        );
        if run.status == RunStatus::Succeeded {
            *succeeded.entry((run.model.clone(), run.version)).or_default() += 1;
        }
    }
    assert!(succeeded.values().all(|n| *n == 1));
}

fn accept_retry(result: CoreResult<impl std::fmt::Debug>) {
    match result {
        Ok(_) | Err(CoreError::ConcurrencyConflict(_)) => {}
        Err(err) => panic!("retry failed unexpectedly: {err}"),
    }
}

#[derive(Clone, Debug)]
enum Op {
    Dispatch { handle: usize, version: usize },
    Reconcile { handle: usize },
    Retry { handle: usize, model: usize, version: usize },
    RetryFailed { handle: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..2, 0usize..3).prop_map(|(handle, version)| Op::Dispatch { handle, version }),
        (0usize..2).prop_map(|handle| Op::Reconcile { handle }),
        (0usize..2, 0usize..2, 0usize..3)
            .prop_map(|(handle, model, version)| Op::Retry { handle, model, version }),
        (0usize..2).prop_map(|handle| Op::RetryFailed { handle }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn interleaved_dispatch_trains_each_key_once(ops in prop::collection::vec(op(), 1..24)) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("retrain.sqlite3");
        let calls = Arc::new(AtomicUsize::new(0));
        let handles = [handle(&db, &calls, 0), handle(&db, &calls, 0)];
        let versions = promote(&handles[0].store, &dir.path().join("objects"), 3);
        prop_assert_eq!(versions.len(), 3);

        for op in &ops {
            match op {
                Op::Dispatch { handle, version } => {
                    handles[*handle].dispatcher.dispatch_version(&versions[*version]).unwrap();
                }
                Op::Reconcile { handle } => {
                    handles[*handle].dispatcher.reconcile().unwrap();
                }
                Op::Retry { handle, model, version } => {
                    accept_retry(handles[*handle].dispatcher.retry(MODELS[*model], versions[*version].id));
                }
                Op::RetryFailed { handle } => {
                    handles[*handle].dispatcher.retry_failed().unwrap();
                }
            }
        }
        for h in &handles {
            prop_assert!(h.dispatcher.wait_idle(WAIT));
        }

        assert_exactly_once(&handles[1].store, &versions);
        let runs = handles[0].store.history(None).unwrap();
        prop_assert_eq!(calls.load(Ordering::SeqCst), runs.len());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn failures_and_retries_keep_one_live_run_per_key(
        fail_every in 1usize..4,
        ops in prop::collection::vec(op(), 1..32),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("retrain.sqlite3");
        let calls = Arc::new(AtomicUsize::new(0));
        let handles = [handle(&db, &calls, fail_every), handle(&db, &calls, fail_every)];
        let versions = promote(&handles[0].store, &dir.path().join("objects"), 3);

        for op in &ops {
            match op {
                Op::Dispatch { handle, version } => {
                    handles[*handle].dispatcher.dispatch_version(&versions[*version]).unwrap();
                }
                Op::Reconcile { handle } => {
                    handles[*handle].dispatcher.reconcile().unwrap();
                }
                Op::Retry { handle, model, version } => {
                    accept_retry(handles[*handle].dispatcher.retry(MODELS[*model], versions[*version].id));
                }
                Op::RetryFailed { handle } => {
                    handles[*handle].dispatcher.retry_failed().unwrap();
                }
            }
            assert_one_live_per_key(&handles[*op_handle(op)].store);
        }
        for h in &handles {
            prop_assert!(h.dispatcher.wait_idle(WAIT));
        }
        assert_one_live_per_key(&handles[0].store);
        assert_settled(&handles[1].store, calls.load(Ordering::SeqCst));
    }
}

fn op_handle(op: &Op) -> &usize {
    match op {
        Op::Dispatch { handle, .. }
        | Op::Reconcile { handle }
        | Op::Retry { handle, .. }
        | Op::RetryFailed { handle } => handle,
    }
}

#[test]
fn racing_dispatchers_never_duplicate_a_key() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("retrain.sqlite3");
    let calls = Arc::new(AtomicUsize::new(0));
    let a = Arc::new(handle(&db, &calls, 0));
    let b = Arc::new(handle(&db, &calls, 0));
    let versions = Arc::new(promote(&a.store, &dir.path().join("objects"), 4));

    let barrier = Arc::new(Barrier::new(4));
    let workers: Vec<_> = [a.clone(), b.clone(), a.clone(), b.clone()]
        .into_iter()
        .map(|h| {
            let barrier = barrier.clone();
            let versions = versions.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..10 {
                    for version in versions.iter() {
                        h.dispatcher.dispatch_version(version).unwrap();
                    }
                    h.dispatcher.reconcile().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(a.dispatcher.wait_idle(WAIT));
    assert!(b.dispatcher.wait_idle(WAIT));

    assert_exactly_once(&a.store, &versions);
    assert_eq!(calls.load(Ordering::SeqCst), MODELS.len() * versions.len());
    assert_eq!(
        b.store.list_succeeded(None).unwrap().len(),
        MODELS.len() * versions.len()
    );
    let latest = a.store.versions().unwrap().last().map(|v| v.id);
    assert_eq!(latest, Some(VersionId(4)));
}

#[test]
fn racing_retries_after_failures_never_duplicate_a_key() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("retrain.sqlite3");
    let calls = Arc::new(AtomicUsize::new(0));
    let a = Arc::new(handle(&db, &calls, 2));
    let b = Arc::new(handle(&db, &calls, 2));
    let versions = Arc::new(promote(&a.store, &dir.path().join("objects"), 3));

    let barrier = Arc::new(Barrier::new(4));
    let workers: Vec<_> = [a.clone(), b.clone(), a.clone(), b.clone()]
        .into_iter()
        .map(|h| {
            let barrier = barrier.clone();
            let versions = versions.clone();
            thread::spawn(move || {
                barrier.wait();
                for round in 0..10 {
                    for version in versions.iter() {
                        h.dispatcher.dispatch_version(version).unwrap();
                        accept_retry(h.dispatcher.retry(MODELS[round % 2], version.id));
                    }
                    h.dispatcher.retry_failed().unwrap();
                    assert_one_live_per_key(&h.store);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(a.dispatcher.wait_idle(WAIT));
    assert!(b.dispatcher.wait_idle(WAIT));

    assert_one_live_per_key(&a.store);
    assert_settled(&b.store, calls.load(Ordering::SeqCst));
    assert!(calls.load(Ordering::SeqCst) >= MODELS.len() * versions.len());
}
