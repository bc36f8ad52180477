use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use koukoku_core::ids::RecordId;
use koukoku_core::items::Record;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Append-only record log the engine writes parsed records to before
/// publishing them. Calls are synchronous and happen on the engine task.
pub trait ItemLog: Send + Sync {
    /// Append a record and return its newly assigned id.
    fn append(&self, record: &Record) -> Result<RecordId, StoreError>;

    /// File an appended record under `timestamp` for range queries.
    fn index_by_timestamp(&self, id: RecordId, timestamp: DateTime<Utc>) -> Result<(), StoreError>;
}

/// A record read back from the log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: RecordId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub record: Record,
}

/// Range query over the timestamp index. Bounds are inclusive.
#[derive(Clone, Debug, Default)]
pub struct RangeQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

pub struct SqliteItemLog {
    db: Database,
}

impl SqliteItemLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Read one record by id.
    #[instrument(skip(self), fields(id = %id))]
    pub fn get(&self, id: RecordId) -> Result<Record, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT payload FROM records WHERE id = ?1")?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => {
                    let payload: String = row_helpers::get(row, 0, "records", "payload")?;
                    row_helpers::parse_json(&payload, "records", "payload")
                }
                None => Err(StoreError::NotFound(format!("record {id}"))),
            }
        })
    }

    /// Records filed in `[since, until]`, oldest first.
    #[instrument(skip(self))]
    pub fn range(&self, query: &RangeQuery) -> Result<Vec<StoredRecord>, StoreError> {
        let since = query.since.map_or(i64::MIN, |t| t.timestamp_millis());
        let until = query.until.map_or(i64::MAX, |t| t.timestamp_millis());
        let limit = query.limit.unwrap_or(1000);

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, t.timestamp_ms, r.payload
                 FROM record_timestamps t JOIN records r ON r.id = t.record_id
                 WHERE t.timestamp_ms BETWEEN ?1 AND ?2
                 ORDER BY t.timestamp_ms ASC, r.id ASC
                 LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![since, until, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_stored(row)?);
            }
            Ok(results)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?))
    }
}

impl ItemLog for SqliteItemLog {
    #[instrument(skip(self, record), fields(kind = record.kind()))]
    fn append(&self, record: &Record) -> Result<RecordId, StoreError> {
        let payload = serde_json::to_string(record)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (kind, payload, appended_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![record.kind(), payload, Utc::now().to_rfc3339()],
            )?;
            Ok(RecordId::from_raw(conn.last_insert_rowid()))
        })
    }

    #[instrument(skip(self), fields(id = %id))]
    fn index_by_timestamp(&self, id: RecordId, timestamp: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR REPLACE INTO record_timestamps (record_id, timestamp_ms) VALUES (?1, ?2)",
                rusqlite::params![id.get(), timestamp.timestamp_millis()],
            );
            match changed {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::NotFound(format!("record {id}")))
                }
                Err(e) => Err(e.into()),
            }
        })
    }
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> Result<StoredRecord, StoreError> {
    let id: i64 = row_helpers::get(row, 0, "records", "id")?;
    let millis: i64 = row_helpers::get(row, 1, "record_timestamps", "timestamp_ms")?;
    let payload: String = row_helpers::get(row, 2, "records", "payload")?;
    let timestamp = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::CorruptRow {
            table: "record_timestamps",
            column: "timestamp_ms",
            detail: format!("out of range: {millis}"),
        })?;

    Ok(StoredRecord {
        id: RecordId::from_raw(id),
        timestamp,
        record: row_helpers::parse_json(&payload, "records", "payload")?,
    })
}
