/// SQL DDL for the record log.
/// `records` is append-only; `record_timestamps` is the range index.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    appended_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS record_timestamps (
    record_id INTEGER PRIMARY KEY REFERENCES records(id),
    timestamp_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_record_timestamps_ts ON record_timestamps(timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
