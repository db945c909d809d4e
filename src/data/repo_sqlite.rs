//! SQLite repository for corrections and dataset versions.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::common::db::SqliteStore;
use crate::common::error::{CoreError, CoreResult};
use crate::common::ids::Fingerprint;

use super::domain::{
    CorrectedLabel, CorrectionRecord, DataRepo, DatasetVersion, FeaturePayload, Partitions,
    RecordId, VersionClaim, VersionId,
};

const VERSION_COUNTER: &str = "dataset_version";

const RECORD_COLUMNS: &str = "id, features_json, label_json, received_ms, consumed, version_id";

fn parse_record(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, i64, bool, Option<i64>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_record(
    (id, features, label, received_ms, consumed, version): (
        i64,
        String,
        String,
        i64,
        bool,
        Option<i64>,
    ),
) -> CoreResult<CorrectionRecord> {
    Ok(CorrectionRecord {
        id: RecordId(id),
        features: serde_json::from_str(&features)?,
        label: serde_json::from_str(&label)?,
        received_ms: received_ms as u64,
        consumed,
        version: version.map(|v| VersionId(v as u64)),
    })
}

fn member_ids(conn: &Connection, version: i64) -> CoreResult<Vec<RecordId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT record_id FROM version_members WHERE version_id = ?1 ORDER BY position",
    )?;
    let ids = stmt
        .query_map(params![version], |r| r.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids.into_iter().map(RecordId).collect())
}

struct VersionRow {
    id: i64,
    created_ms: i64,
    split_ratio: f64,
    split_seed: i64,
    record_count: i64,
    fingerprint: String,
    train_path: Option<String>,
    valid_path: Option<String>,
    manifest_path: Option<String>,
    train_count: Option<i64>,
    valid_count: Option<i64>,
}

const VERSION_COLUMNS: &str = "id, created_ms, split_ratio, split_seed, record_count, fingerprint, \
     train_path, valid_path, manifest_path, train_count, valid_count";

fn parse_version(row: &Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        id: row.get(0)?,
        created_ms: row.get(1)?,
        split_ratio: row.get(2)?,
        split_seed: row.get(3)?,
        record_count: row.get(4)?,
        fingerprint: row.get(5)?,
        train_path: row.get(6)?,
        valid_path: row.get(7)?,
        manifest_path: row.get(8)?,
        train_count: row.get(9)?,
        valid_count: row.get(10)?,
    })
}

fn ready_version(conn: &Connection, row: VersionRow) -> CoreResult<DatasetVersion> {
    let missing = || CoreError::storage(format!("ready version {} lacks partitions", row.id));
    let partitions = Partitions {
        train_path: row.train_path.clone().ok_or_else(missing)?,
        valid_path: row.valid_path.clone().ok_or_else(missing)?,
        manifest_path: row.manifest_path.clone().ok_or_else(missing)?,
        train_count: row.train_count.ok_or_else(missing)? as u64,
        valid_count: row.valid_count.ok_or_else(missing)? as u64,
    };
    Ok(DatasetVersion {
        id: VersionId(row.id as u64),
        record_ids: member_ids(conn, row.id)?,
        created_ms: row.created_ms as u64,
        split_ratio: row.split_ratio,
        split_seed: row.split_seed as u64,
        record_count: row.record_count as u64,
        fingerprint: row.fingerprint,
        partitions,
    })
}

impl DataRepo for SqliteStore {
    fn insert_correction(
        &self,
        features: &FeaturePayload,
        label: &CorrectedLabel,
        received_ms: u64,
    ) -> CoreResult<RecordId> {
        let features_json = serde_json::to_string(features)?;
        let label_json = serde_json::to_string(label)?;
        self.write(|tx| {
            tx.execute(
                "INSERT INTO corrections(features_json, label_json, received_ms) VALUES (?1, ?2, ?3)",
                params![features_json, label_json, received_ms as i64],
            )?;
            Ok(RecordId(tx.last_insert_rowid()))
        })
    }

    fn pending_count(&self) -> CoreResult<u64> {
        self.read(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM corrections WHERE consumed = 0",
                [],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }

    fn oldest_pending(&self, limit: usize) -> CoreResult<Vec<CorrectionRecord>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {RECORD_COLUMNS} FROM corrections WHERE consumed = 0 ORDER BY id LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], parse_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(decode_record).collect()
        })
    }

    fn records(&self, ids: &[RecordId]) -> CoreResult<Vec<CorrectionRecord>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {RECORD_COLUMNS} FROM corrections WHERE id = ?1"
            ))?;
            ids.iter()
                .map(|id| {
                    let row = stmt
                        .query_row(params![id.raw()], parse_record)
                        .optional()?
                        .ok_or_else(|| CoreError::not_found("correction", id.raw()))?;
                    decode_record(row)
                })
                .collect()
        })
    }

    fn claim_batch(
        &self,
        batch_size: usize,
        split_ratio: f64,
        split_seed: u64,
        now_ms: u64,
    ) -> CoreResult<Option<VersionClaim>> {
        self.write(|tx| {
            let ids: Vec<i64> = {
                let mut stmt = tx.prepare_cached(
                    "SELECT id FROM corrections WHERE consumed = 0 ORDER BY id LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![batch_size as i64], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                rows
            };
            if ids.len() < batch_size {
                return Ok(None);
            }

            let current: i64 = tx.query_row(
                "SELECT value FROM counters WHERE name = ?1",
                params![VERSION_COUNTER],
                |r| r.get(0),
            )?;
            let next = current + 1;
            let swapped = tx.execute(
                "UPDATE counters SET value = ?1 WHERE name = ?2 AND value = ?3",
                params![next, VERSION_COUNTER, current],
            )?;
            if swapped != 1 {
                return Err(CoreError::conflict(format!(
                    "version counter moved past {current}"
                )));
            }

            let fingerprint = Fingerprint::of_ids(ids.iter().copied());
            tx.execute(
                "INSERT INTO dataset_versions(
                    id, created_ms, split_ratio, split_seed, record_count, fingerprint, state
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'materializing')",
                params![
                    next,
                    now_ms as i64,
                    split_ratio,
                    split_seed as i64,
                    ids.len() as i64,
                    fingerprint
                ],
            )?;
            {
                let mut member = tx.prepare_cached(
                    "INSERT INTO version_members(record_id, version_id, position) VALUES (?1, ?2, ?3)",
                )?;
                let mut consume = tx.prepare_cached(
                    "UPDATE corrections SET consumed = 1, version_id = ?2 WHERE id = ?1 AND consumed = 0",
                )?;
                for (position, id) in ids.iter().enumerate() {
                    member.execute(params![id, next, position as i64])?;
                    if consume.execute(params![id, next])? != 1 {
                        return Err(CoreError::conflict(format!("record {id} already consumed")));
                    }
                }
            }

            Ok(Some(VersionClaim {
                id: VersionId(next as u64),
                record_ids: ids.into_iter().map(RecordId).collect(),
                created_ms: now_ms,
                split_ratio,
                split_seed,
                fingerprint,
            }))
        })
    }

    fn unmaterialized(&self) -> CoreResult<Vec<VersionClaim>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {VERSION_COLUMNS} FROM dataset_versions
                 WHERE state = 'materializing' ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([], parse_version)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|row| {
                    Ok(VersionClaim {
                        id: VersionId(row.id as u64),
                        record_ids: member_ids(conn, row.id)?,
                        created_ms: row.created_ms as u64,
                        split_ratio: row.split_ratio,
                        split_seed: row.split_seed as u64,
                        fingerprint: row.fingerprint,
                    })
                })
                .collect()
        })
    }

    fn mark_ready(&self, id: VersionId, partitions: &Partitions) -> CoreResult<bool> {
        self.write(|tx| {
            let changed = tx.execute(
                "UPDATE dataset_versions
                 SET state = 'ready', train_path = ?2, valid_path = ?3, manifest_path = ?4,
                     train_count = ?5, valid_count = ?6
                 WHERE id = ?1 AND state = 'materializing'",
                params![
                    id.raw() as i64,
                    partitions.train_path,
                    partitions.valid_path,
                    partitions.manifest_path,
                    partitions.train_count as i64,
                    partitions.valid_count as i64
                ],
            )?;
            Ok(changed == 1)
        })
    }

    fn version(&self, id: VersionId) -> CoreResult<Option<DatasetVersion>> {
        self.read(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {VERSION_COLUMNS} FROM dataset_versions
                         WHERE id = ?1 AND state = 'ready'"
                    ),
                    params![id.raw() as i64],
                    parse_version,
                )
                .optional()?;
            row.map(|row| ready_version(conn, row)).transpose()
        })
    }

    fn versions(&self) -> CoreResult<Vec<DatasetVersion>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {VERSION_COLUMNS} FROM dataset_versions WHERE state = 'ready' ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([], parse_version)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(|row| ready_version(conn, row)).collect()
        })
    }
}
