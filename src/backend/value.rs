use sqlx::mysql::MySqlRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{mysql::MySqlArguments, sqlite::SqliteArguments, Arguments, Row};

use crate::error::StoreError;

/// A dialect-agnostic bind parameter. `DataAccess` methods build a `Vec<Param>`
/// once and let the MySQL/SQLite arms translate it into the driver's own
/// argument type — `sqlx`'s `Encode` machinery is per-concrete-type, so a
/// shared enum is the simplest way to keep one query-building call site per
/// CRUD operation instead of two.
#[derive(Clone, Debug)]
pub(crate) enum Param {
    Text(String),
    Int(i64),
    OptInt(Option<i64>),
    OptText(Option<String>),
}

impl Param {
    pub(crate) fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub(crate) fn int(value: i64) -> Self {
        Self::Int(value)
    }
}

pub(crate) fn mysql_args(params: &[Param]) -> MySqlArguments {
    let mut args = MySqlArguments::default();
    for param in params {
        match param {
            Param::Text(value) => args.add(value).expect("bind text"),
            Param::Int(value) => args.add(value).expect("bind int"),
            Param::OptInt(value) => args.add(value).expect("bind opt int"),
            Param::OptText(value) => args.add(value).expect("bind opt text"),
        }
    }
    args
}

pub(crate) fn sqlite_args(params: &[Param]) -> SqliteArguments<'static> {
    let mut args = SqliteArguments::default();
    for param in params {
        match param {
            Param::Text(value) => args.add(value.clone()).expect("bind text"),
            Param::Int(value) => args.add(*value).expect("bind int"),
            Param::OptInt(value) => args.add(*value).expect("bind opt int"),
            Param::OptText(value) => args.add(value.clone()).expect("bind opt text"),
        }
    }
    args
}

/// A row yielded by either driver, with typed accessors that hide which one.
pub(crate) enum Row2 {
    MySql(MySqlRow),
    Sqlite(SqliteRow),
}

impl Row2 {
    pub(crate) fn text(&self, idx: usize) -> Result<String, StoreError> {
        match self {
            Row2::MySql(row) => row.try_get(idx).map_err(StoreError::QueryFailure),
            Row2::Sqlite(row) => row.try_get(idx).map_err(StoreError::QueryFailure),
        }
    }

    pub(crate) fn opt_text(&self, idx: usize) -> Result<Option<String>, StoreError> {
        match self {
            Row2::MySql(row) => row.try_get(idx).map_err(StoreError::QueryFailure),
            Row2::Sqlite(row) => row.try_get(idx).map_err(StoreError::QueryFailure),
        }
    }

    pub(crate) fn int(&self, idx: usize) -> Result<i64, StoreError> {
        match self {
            Row2::MySql(row) => row.try_get(idx).map_err(StoreError::QueryFailure),
            Row2::Sqlite(row) => row.try_get(idx).map_err(StoreError::QueryFailure),
        }
    }

    pub(crate) fn opt_int(&self, idx: usize) -> Result<Option<i64>, StoreError> {
        match self {
            Row2::MySql(row) => row.try_get(idx).map_err(StoreError::QueryFailure),
            Row2::Sqlite(row) => row.try_get(idx).map_err(StoreError::QueryFailure),
        }
    }
}
