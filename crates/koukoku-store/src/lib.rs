pub mod database;
pub mod error;
pub mod records;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use records::{ItemLog, RangeQuery, SqliteItemLog, StoredRecord};
