use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Sqlite;

use crate::error::StoreError;

use super::DataAccess;

/// Pool tuning knobs for the SQLite dialect — the embedded stand-in for the
/// source's H2 backend (no Rust crate embeds H2 itself; see SPEC_FULL.md §2).
#[derive(Clone, Debug)]
pub struct SqliteConfig {
    pub max_connections: u32,
    /// Enables `PRAGMA foreign_keys = ON` on every acquired connection.
    pub foreign_keys: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self { max_connections: 1, foreign_keys: true }
    }
}

pub(crate) async fn connect(url: &str, config: &SqliteConfig) -> Result<sqlx::SqlitePool, StoreError> {
    let options: SqliteConnectOptions = url
        .parse::<SqliteConnectOptions>()
        .map_err(|e| StoreError::load_failure(format!("{e}")))?
        .create_if_missing(true)
        .foreign_keys(config.foreign_keys);
    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(StoreError::QueryFailure)
}

pub(crate) fn data_access(conn: PoolConnection<Sqlite>, prefix: String) -> DataAccess {
    DataAccess::from_sqlite(conn, prefix)
}
