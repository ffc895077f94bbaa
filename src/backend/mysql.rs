use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::MySql;

use crate::error::StoreError;

use super::DataAccess;

/// Pool tuning knobs for the MySQL dialect. Kept minimal — the source
/// exposes a handful of pool-size/timeout settings and nothing else.
#[derive(Clone, Debug)]
pub struct MySqlConfig {
    pub max_connections: u32,
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self { max_connections: 10 }
    }
}

pub(crate) async fn connect(url: &str, config: &MySqlConfig) -> Result<sqlx::MySqlPool, StoreError> {
    let options: MySqlConnectOptions = url.parse().map_err(|e| StoreError::load_failure(format!("{e}")))?;
    MySqlPoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(StoreError::QueryFailure)
}

pub(crate) fn data_access(conn: PoolConnection<MySql>, prefix: String) -> DataAccess {
    DataAccess::from_mysql(conn, prefix)
}
