use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{mysql, schema, sqlite, DataAccess, Dialect, MySqlConfig, SqliteConfig};
use crate::config::StoreConfig;
use crate::context_inheritance::ContextInheritance;
use crate::convert::{copy_snapshot_into, SubjectSnapshotView};
use crate::error::StoreError;
use crate::rank_ladder::RankLadder;
use crate::subject::SubjectRef;
use crate::subject_data::SubjectData;
use crate::worker::{WriteHandle, WriteWorker};

enum AnyPool {
    MySql(sqlx::MySqlPool),
    Sqlite(sqlx::SqlitePool),
}

tokio::task_local! {
    static PINNED_DAO: Arc<DataAccess>;
}

/// Entry point for one configured database. Construct once via
/// [`Store::open`] and share; reads and writes are safe to call concurrently
/// from any task.
pub struct Store {
    pool: AnyPool,
    dialect: Dialect,
    prefix: String,
    worker: WriteWorker,
    bootstrapped: AsyncMutex<bool>,
}

impl Store {
    /// Connects, selects the dialect from `config.url`'s scheme, and runs
    /// schema deployment exactly once (guarded so concurrent `open` callers
    /// racing the same fresh database don't double-deploy).
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let prefix = config.normalized_prefix();
        let dialect = detect_dialect(&config.url)?;
        let pool = match dialect {
            Dialect::MySql => AnyPool::MySql(mysql::connect(&config.url, &MySqlConfig::default()).await?),
            Dialect::Sqlite => AnyPool::Sqlite(sqlite::connect(&config.url, &SqliteConfig::default()).await?),
        };
        let concurrency = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let store = Self {
            pool,
            dialect,
            prefix,
            worker: WriteWorker::new(concurrency),
            bootstrapped: AsyncMutex::new(false),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut deployed = self.bootstrapped.lock().await;
        if *deployed {
            return Ok(());
        }
        let dao = self.checkout().await?;
        schema::ensure_deployed(&dao).await?;
        *deployed = true;
        Ok(())
    }

    async fn checkout(&self) -> Result<DataAccess, StoreError> {
        match &self.pool {
            AnyPool::MySql(pool) => {
                let conn = pool.acquire().await.map_err(StoreError::QueryFailure)?;
                Ok(mysql::data_access(conn, self.prefix.clone()))
            }
            AnyPool::Sqlite(pool) => {
                let conn = pool.acquire().await.map_err(StoreError::QueryFailure)?;
                Ok(sqlite::data_access(conn, self.prefix.clone()))
            }
        }
    }

    /// Returns the task-pinned `DataAccess` if this task is inside a
    /// [`Store::bulk_operation`] scope, otherwise checks out a fresh one.
    async fn dao(&self) -> Result<Arc<DataAccess>, StoreError> {
        if let Ok(pinned) = PINNED_DAO.try_with(Arc::clone) {
            return Ok(pinned);
        }
        Ok(Arc::new(self.checkout().await?))
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Degrades to an empty list on any failure to acquire a connection or
    /// run the query — this is a non-essential listing path (SPEC_FULL.md §7).
    pub async fn list_identifiers(&self, kind: &str) -> Vec<String> {
        match self.dao().await {
            Ok(dao) => dao.list_identifiers(kind).await,
            Err(_) => Vec::new(),
        }
    }

    pub async fn list_types(&self) -> Vec<String> {
        match self.dao().await {
            Ok(dao) => dao.list_types().await,
            Err(_) => Vec::new(),
        }
    }

    pub async fn resolve_subject(&self, id: i64) -> Result<Option<SubjectRef>, StoreError> {
        self.dao().await?.resolve_subject_by_id(id).await
    }

    pub async fn get_data(&self, kind: &str, identifier: &str) -> Result<SubjectData, StoreError> {
        self.dao().await?.load_subject_data(kind, identifier).await
    }

    /// Enumerates every subject ref and assembles a snapshot for each within
    /// the same `DataAccess`.
    pub async fn get_all(&self) -> Result<Vec<SubjectData>, StoreError> {
        self.dao().await?.load_all_subject_data().await
    }

    pub async fn get_context_inheritance(&self) -> Result<ContextInheritance, StoreError> {
        self.dao().await?.load_context_inheritance().await
    }

    pub async fn set_context_inheritance(
        &self,
        inheritance: &ContextInheritance,
    ) -> Result<WriteHandle, StoreError> {
        let dao = self.dao().await?;
        let inheritance = inheritance.clone();
        Ok(self.worker.spawn(async move {
            dao.flush_context_inheritance(&inheritance).await?;
            Ok(())
        }))
    }

    pub async fn get_rank_ladder(&self, name: &str) -> Result<Option<RankLadder>, StoreError> {
        let dao = self.dao().await?;
        if !dao.rank_ladder_exists(name).await? {
            return Ok(None);
        }
        Ok(Some(RankLadder::new(name, dao.select_rank_ladder(name).await?)))
    }

    pub async fn set_rank_ladder(&self, name: &str, members: Vec<SubjectRef>) -> Result<WriteHandle, StoreError> {
        let dao = self.dao().await?;
        let name = name.to_string();
        Ok(self.worker.spawn(async move {
            dao.replace_rank_ladder(&name, &members).await?;
            Ok(())
        }))
    }

    /// Schedules `snapshot`'s pending mutations to be flushed on the bounded
    /// write worker, returning a joinable [`WriteHandle`].
    ///
    /// If `snapshot`'s concrete type is our own [`SubjectData`], its queue is
    /// flushed directly. Otherwise a fresh native snapshot for
    /// `(kind, identifier)` is loaded, the foreign snapshot's semantic
    /// content is copied into it via [`copy_snapshot_into`], and that is
    /// flushed instead — this is the cross-backend migration path.
    pub async fn set_data(
        &self,
        kind: &str,
        identifier: &str,
        snapshot: &dyn SubjectSnapshotView,
    ) -> Result<WriteHandle, StoreError> {
        let dao = self.dao().await?;

        if let Some(native) = snapshot.as_any().downcast_ref::<SubjectData>() {
            let native = native.clone();
            return Ok(self.worker.spawn(async move {
                dao.flush_subject_data(&native).await?;
                Ok(())
            }));
        }

        let target = dao.load_subject_data(kind, identifier).await?;
        let merged = copy_snapshot_into(&target, snapshot);
        Ok(self.worker.spawn(async move {
            dao.flush_subject_data(&merged).await?;
            Ok(())
        }))
    }

    /// Pins one `DataAccess` to a task-local slot for the duration of
    /// `scope`, so every call the closure makes through the [`BulkScope`]
    /// handle it's given (and any task spawned with the same task-local
    /// context propagated) shares the same connection.
    pub async fn bulk_operation<F, Fut, T>(&self, scope: F) -> Result<T, StoreError>
    where
        F: FnOnce(BulkScope<'_>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let dao = Arc::new(self.checkout().await?);
        dao.retain();
        let result = PINNED_DAO.scope(dao.clone(), scope(BulkScope { store: self })).await;
        dao.release();
        result
    }
}

/// Capability handle passed into a [`Store::bulk_operation`] closure. Every
/// method just forwards to the enclosing `Store`, but routes through the
/// task-local pinned `DataAccess` rather than checking out a new connection.
pub struct BulkScope<'a> {
    store: &'a Store,
}

impl BulkScope<'_> {
    pub async fn get_data(&self, kind: &str, identifier: &str) -> Result<SubjectData, StoreError> {
        self.store.get_data(kind, identifier).await
    }

    pub async fn set_data(
        &self,
        kind: &str,
        identifier: &str,
        snapshot: &dyn SubjectSnapshotView,
    ) -> Result<WriteHandle, StoreError> {
        self.store.set_data(kind, identifier, snapshot).await
    }
}

fn detect_dialect(url: &str) -> Result<Dialect, StoreError> {
    if url.starts_with("mysql://") || url.starts_with("mysql2://") {
        Ok(Dialect::MySql)
    } else if url.starts_with("sqlite:") || url == ":memory:" || !url.contains("://") {
        Ok(Dialect::Sqlite)
    } else {
        Err(StoreError::unsupported_dialect(url))
    }
}
