//! SQLite-backed run registry. The `training_runs_live_key` partial unique
//! index is the enforcement point for the one-run-per-key rule; `find` is
//! only a shortcut in front of it.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::common::db::SqliteStore;
use crate::common::error::{CoreError, CoreResult};
use crate::data::domain::VersionId;

use super::domain::{ModelDefinition, RunId, RunRepo, RunStatus, RunTransition, TrainingRun};

const RUN_COLUMNS: &str = "run_id, model_name, version_id, status, metrics_json, artifact_ref, \
     cause, created_ms, started_ms, ended_ms";

struct RunRow {
    run_id: String,
    model: String,
    version: i64,
    status: String,
    metrics_json: String,
    artifact_ref: Option<String>,
    cause: Option<String>,
    created_ms: i64,
    started_ms: Option<i64>,
    ended_ms: Option<i64>,
}

fn parse_run(row: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        model: row.get(1)?,
        version: row.get(2)?,
        status: row.get(3)?,
        metrics_json: row.get(4)?,
        artifact_ref: row.get(5)?,
        cause: row.get(6)?,
        created_ms: row.get(7)?,
        started_ms: row.get(8)?,
        ended_ms: row.get(9)?,
    })
}

impl RunRow {
    fn decode(self) -> CoreResult<TrainingRun> {
        Ok(TrainingRun {
            run_id: RunId::new(self.run_id),
            model: self.model,
            version: VersionId(self.version as u64),
            status: self.status.parse()?,
            metrics: serde_json::from_str(&self.metrics_json)?,
            artifact_ref: self.artifact_ref,
            cause: self.cause,
            created_ms: self.created_ms as u64,
            started_ms: self.started_ms.map(|v| v as u64),
            ended_ms: self.ended_ms.map(|v| v as u64),
        })
    }
}

fn query_runs(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> CoreResult<Vec<TrainingRun>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(args, parse_run)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(RunRow::decode).collect()
}

fn opt_i64(v: Option<u64>) -> Option<i64> {
    v.map(|v| v as i64)
}

impl RunRepo for SqliteStore {
    fn record(&self, run: &TrainingRun) -> CoreResult<()> {
        let metrics = serde_json::to_string(&run.metrics)?;
        // Unique violations are real answers here, so no retry loop.
        self.write_once(&mut |tx: &rusqlite::Transaction<'_>| {
            tx.execute(
                "INSERT INTO training_runs(
                    run_id, model_name, version_id, status, metrics_json, artifact_ref,
                    cause, created_ms, started_ms, ended_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(run_id) DO UPDATE SET
                    status = excluded.status,
                    metrics_json = excluded.metrics_json,
                    artifact_ref = excluded.artifact_ref,
                    cause = excluded.cause,
                    started_ms = excluded.started_ms,
                    ended_ms = excluded.ended_ms",
                params![
                    run.run_id.as_str(),
                    run.model,
                    run.version.raw() as i64,
                    run.status.as_str(),
                    metrics,
                    run.artifact_ref,
                    run.cause,
                    run.created_ms as i64,
                    opt_i64(run.started_ms),
                    opt_i64(run.ended_ms)
                ],
            )?;
            Ok(())
        })
    }

    fn find(&self, model: &str, version: VersionId) -> CoreResult<Option<TrainingRun>> {
        self.read(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {RUN_COLUMNS} FROM training_runs
                         WHERE model_name = ?1 AND version_id = ?2
                           AND status IN ('pending', 'running', 'succeeded')"
                    ),
                    params![model, version.raw() as i64],
                    parse_run,
                )
                .optional()?;
            row.map(RunRow::decode).transpose()
        })
    }

    fn get(&self, run_id: &RunId) -> CoreResult<Option<TrainingRun>> {
        self.read(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM training_runs WHERE run_id = ?1"),
                    params![run_id.as_str()],
                    parse_run,
                )
                .optional()?;
            row.map(RunRow::decode).transpose()
        })
    }

    fn attempts(&self, model: &str, version: VersionId) -> CoreResult<Vec<TrainingRun>> {
        self.read(|conn| {
            query_runs(
                conn,
                &format!(
                    "SELECT {RUN_COLUMNS} FROM training_runs
                     WHERE model_name = ?1 AND version_id = ?2 ORDER BY created_ms, rowid"
                ),
                params![model, version.raw() as i64],
            )
        })
    }

    fn transition(
        &self,
        run_id: &RunId,
        from: RunStatus,
        to: RunStatus,
        change: &RunTransition,
    ) -> CoreResult<bool> {
        if !from.can_transition_to(to) {
            return Err(CoreError::invalid(format!(
                "run {run_id} cannot move from {} to {}",
                from.as_str(),
                to.as_str()
            )));
        }
        let metrics = change
            .metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.write(|tx| {
            let changed = tx.execute(
                "UPDATE training_runs SET
                    status = ?3,
                    metrics_json = COALESCE(?4, metrics_json),
                    artifact_ref = COALESCE(?5, artifact_ref),
                    cause = COALESCE(?6, cause),
                    started_ms = COALESCE(?7, started_ms),
                    ended_ms = COALESCE(?8, ended_ms)
                 WHERE run_id = ?1 AND status = ?2",
                params![
                    run_id.as_str(),
                    from.as_str(),
                    to.as_str(),
                    metrics,
                    change.artifact_ref,
                    change.cause,
                    opt_i64(change.started_ms),
                    opt_i64(change.ended_ms)
                ],
            )?;
            Ok(changed == 1)
        })
    }

    fn list_succeeded(&self, model: Option<&str>) -> CoreResult<Vec<TrainingRun>> {
        self.read(|conn| {
            query_runs(
                conn,
                &format!(
                    "SELECT {RUN_COLUMNS} FROM training_runs
                     WHERE status = 'succeeded' AND (?1 IS NULL OR model_name = ?1)
                     ORDER BY version_id, created_ms, rowid"
                ),
                params![model],
            )
        })
    }

    fn history(&self, model: Option<&str>) -> CoreResult<Vec<TrainingRun>> {
        self.read(|conn| {
            query_runs(
                conn,
                &format!(
                    "SELECT {RUN_COLUMNS} FROM training_runs
                     WHERE ?1 IS NULL OR model_name = ?1
                     ORDER BY version_id, model_name, created_ms, rowid"
                ),
                params![model],
            )
        })
    }

    fn with_status(&self, status: RunStatus) -> CoreResult<Vec<TrainingRun>> {
        self.read(|conn| {
            query_runs(
                conn,
                &format!(
                    "SELECT {RUN_COLUMNS} FROM training_runs WHERE status = ?1
                     ORDER BY version_id, created_ms, rowid"
                ),
                params![status.as_str()],
            )
        })
    }

    fn expire_running(&self, started_before_ms: u64, now_ms: u64) -> CoreResult<Vec<TrainingRun>> {
        self.write(|tx| {
            let expired = query_runs(
                tx,
                &format!(
                    "SELECT {RUN_COLUMNS} FROM training_runs
                     WHERE status = 'running' AND started_ms < ?1 ORDER BY started_ms"
                ),
                params![started_before_ms as i64],
            )?;
            tx.execute(
                "UPDATE training_runs SET status = 'failed', cause = 'timeout', ended_ms = ?2
                 WHERE status = 'running' AND started_ms < ?1",
                params![started_before_ms as i64, now_ms as i64],
            )?;
            Ok(expired
                .into_iter()
                .map(|mut run| {
                    run.status = RunStatus::Failed;
                    run.cause = Some("timeout".to_string());
                    run.ended_ms = Some(now_ms);
                    run
                })
                .collect())
        })
    }

    fn upsert_model(&self, model: &ModelDefinition, now_ms: u64) -> CoreResult<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO models(name, entry_point, config_ref, registered_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    entry_point = excluded.entry_point,
                    config_ref = excluded.config_ref",
                params![model.name, model.entry_point, model.config_ref, now_ms as i64],
            )?;
            Ok(())
        })
    }

    fn models(&self) -> CoreResult<Vec<ModelDefinition>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT name, entry_point, config_ref FROM models ORDER BY name")?;
            let rows = stmt
                .query_map([], |r| {
                    Ok(ModelDefinition {
                        name: r.get(0)?,
                        entry_point: r.get(1)?,
                        config_ref: r.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::domain::{CorrectedLabel, DataRepo, FeaturePayload};

    /// Store with one claimed version so run foreign keys resolve.
    fn store_with_version() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        let features = FeaturePayload::from_value(serde_json::json!({"x": 1})).unwrap();
        store
            .insert_correction(&features, &CorrectedLabel::Numeric(1.0), 0)
            .unwrap();
        store.claim_batch(1, 0.5, 1, 0).unwrap().unwrap();
        store
    }

    #[test]
    fn second_live_run_for_key_is_rejected() {
        let store = store_with_version();
        let first = TrainingRun::pending("lr", VersionId(1), 1);
        store.record(&first).unwrap();
        let second = TrainingRun::pending("lr", VersionId(1), 2);
        assert!(matches!(
            store.record(&second),
            Err(CoreError::ConcurrencyConflict(_))
        ));
        assert_eq!(store.find("lr", VersionId(1)).unwrap().unwrap().run_id, first.run_id);

        // A different model holds its own key.
        store
            .record(&TrainingRun::pending("rf", VersionId(1), 3))
            .unwrap();
    }

    #[test]
    fn failed_run_frees_the_key() {
        let store = store_with_version();
        let first = TrainingRun::pending("lr", VersionId(1), 1);
        store.record(&first).unwrap();
        assert!(store
            .transition(
                &first.run_id,
                RunStatus::Pending,
                RunStatus::Failed,
                &RunTransition {
                    cause: Some("no trainer".into()),
                    ..RunTransition::default()
                },
            )
            .unwrap());
        assert!(store.find("lr", VersionId(1)).unwrap().is_none());

        let retry = TrainingRun::pending("lr", VersionId(1), 2);
        store.record(&retry).unwrap();
        let attempts = store.attempts("lr", VersionId(1)).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, RunStatus::Failed);
        assert_eq!(attempts[0].cause.as_deref(), Some("no trainer"));
        assert_eq!(attempts[1].status, RunStatus::Pending);
    }

    #[test]
    fn transition_is_compare_and_set() {
        let store = store_with_version();
        let run = TrainingRun::pending("lr", VersionId(1), 1);
        store.record(&run).unwrap();
        let start = RunTransition {
            started_ms: Some(5),
            ..RunTransition::default()
        };
        assert!(store
            .transition(&run.run_id, RunStatus::Pending, RunStatus::Running, &start)
            .unwrap());
        assert!(!store
            .transition(&run.run_id, RunStatus::Pending, RunStatus::Running, &start)
            .unwrap());

        let mut metrics = crate::training::domain::Metrics::new();
        metrics.insert("accuracy".into(), 0.75);
        let done = RunTransition {
            metrics: Some(metrics),
            artifact_ref: Some("runs/lr/1".into()),
            ended_ms: Some(9),
            ..RunTransition::default()
        };
        assert!(store
            .transition(&run.run_id, RunStatus::Running, RunStatus::Succeeded, &done)
            .unwrap());
        let stored = store.get(&run.run_id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_eq!(stored.started_ms, Some(5));
        assert_eq!(stored.metrics["accuracy"], 0.75);
        assert_eq!(store.list_succeeded(Some("lr")).unwrap().len(), 1);
        assert!(store.list_succeeded(Some("rf")).unwrap().is_empty());
        assert_eq!(store.list_succeeded(None).unwrap().len(), 1);
    }

    #[test]
    fn transition_rejects_edges_outside_the_lifecycle() {
        let store = store_with_version();
        let mut run = TrainingRun::pending("lr", VersionId(1), 1);
        run.status = RunStatus::Succeeded;
        run.artifact_ref = Some("runs/lr/1".into());
        store.record(&run).unwrap();

        let overwrite = RunTransition {
            cause: Some("late failure".into()),
            ..RunTransition::default()
        };
        for (from, to) in [
            (RunStatus::Succeeded, RunStatus::Failed),
            (RunStatus::Succeeded, RunStatus::Pending),
            (RunStatus::Failed, RunStatus::Running),
            (RunStatus::Running, RunStatus::Cancelled),
        ] {
            assert!(matches!(
                store.transition(&run.run_id, from, to, &overwrite),
                Err(CoreError::Validation(_))
            ));
        }
        let stored = store.get(&run.run_id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_eq!(stored.cause, None);
        assert_eq!(store.find("lr", VersionId(1)).unwrap().map(|r| r.run_id), Some(run.run_id));
    }

    #[test]
    fn expire_running_marks_timeout() {
        let store = store_with_version();
        let mut run = TrainingRun::pending("lr", VersionId(1), 1);
        run.status = RunStatus::Running;
        run.started_ms = Some(100);
        store.record(&run).unwrap();

        assert!(store.expire_running(100, 500).unwrap().is_empty());
        let expired = store.expire_running(101, 500).unwrap();
        assert_eq!(expired.len(), 1);
        let stored = store.get(&run.run_id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.cause.as_deref(), Some("timeout"));
        assert_eq!(stored.ended_ms, Some(500));
    }

    #[test]
    fn models_upsert_by_name() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_model(&ModelDefinition::new("lr", "a", "c1"), 1)
            .unwrap();
        store
            .upsert_model(&ModelDefinition::new("lr", "b", "c2"), 2)
            .unwrap();
        let models = store.models().unwrap();
        assert_eq!(models, vec![ModelDefinition::new("lr", "b", "c2")]);
    }
}
