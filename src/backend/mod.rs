pub(crate) mod mysql;
pub(crate) mod schema;
pub(crate) mod sqlite;
mod value;

pub use mysql::MySqlConfig;
pub use schema::SCHEMA_VERSION;
pub use sqlite::SqliteConfig;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use sqlx::pool::PoolConnection;
use sqlx::{MySql, Sqlite};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::context::{Context, ContextSet};
use crate::context_inheritance::ContextInheritance;
use crate::error::StoreError;
use crate::rank_ladder::RankLadder;
use crate::segment::{Segment, SegmentOp};
use crate::subject::SubjectRef;
use crate::subject_data::{SubjectData, SubjectDataOp};
use value::{Param, Row2};

/// The target RDBMS flavor, selected from the connection URL at `Store::open`
/// time. `Sqlite` stands in for the source's H2 dialect (see SPEC_FULL.md §2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

enum RawConn {
    MySql(PoolConnection<MySql>),
    Sqlite(PoolConnection<Sqlite>),
}

/// Dialect-abstract SQL facade. Wraps one DB connection and is not safe to
/// share across concurrently-executing callers — a per-invocation instance is
/// normal; `Store::bulk_operation` pins one instance to a task-local slot for
/// the duration of a multi-call scope.
///
/// Modeled as one struct carrying a tagged `RawConn` rather than a trait
/// object per dialect (see SPEC_FULL.md §9, "Dialect polymorphism") — the SQL
/// text itself differs only at a handful of call sites (upsert statements,
/// catalog probes, schema scripts), so a single set of CRUD methods matching
/// internally on `RawConn` avoids duplicating the rest of the surface twice.
pub struct DataAccess {
    conn: AsyncMutex<RawConn>,
    dialect: Dialect,
    prefix: String,
    memo: Arc<RwLock<HashMap<String, String>>>,
    depth: AtomicU32,
    hold_open: AtomicU32,
}

pub(crate) type TxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a>>;

impl DataAccess {
    fn from_mysql(conn: PoolConnection<MySql>, prefix: String) -> Self {
        Self {
            conn: AsyncMutex::new(RawConn::MySql(conn)),
            dialect: Dialect::MySql,
            prefix,
            memo: Arc::new(RwLock::new(HashMap::new())),
            depth: AtomicU32::new(0),
            hold_open: AtomicU32::new(1),
        }
    }

    fn from_sqlite(conn: PoolConnection<Sqlite>, prefix: String) -> Self {
        Self {
            conn: AsyncMutex::new(RawConn::Sqlite(conn)),
            dialect: Dialect::Sqlite,
            prefix,
            memo: Arc::new(RwLock::new(HashMap::new())),
            depth: AtomicU32::new(0),
            hold_open: AtomicU32::new(1),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Increments the hold-open counter; paired with [`DataAccess::release`].
    pub(crate) fn retain(&self) {
        self.hold_open.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the hold-open counter. Returns `true` once it reaches zero,
    /// at which point the caller may let the connection return to the pool.
    pub(crate) fn release(&self) -> bool {
        self.hold_open.fetch_sub(1, Ordering::SeqCst) == 1
    }

    fn rewrite_prefix(&self, template: &str) -> String {
        if let Some(cached) = self.memo.read().unwrap().get(template) {
            return cached.clone();
        }
        let rewritten = rewrite(template, &self.prefix);
        self.memo.write().unwrap().insert(template.to_string(), rewritten.clone());
        rewritten
    }

    pub(crate) async fn raw_execute(&self, template: &str, params: &[Param]) -> Result<u64, StoreError> {
        let sql = self.rewrite_prefix(template);
        let mut conn = self.conn.lock().await;
        match &mut *conn {
            RawConn::MySql(c) => {
                let query = sqlx::query_with(&sql, value::mysql_args(params));
                Ok(query.execute(&mut **c).await?.rows_affected())
            }
            RawConn::Sqlite(c) => {
                let query = sqlx::query_with(&sql, value::sqlite_args(params));
                Ok(query.execute(&mut **c).await?.rows_affected())
            }
        }
    }

    pub(crate) async fn raw_insert_returning_id(
        &self,
        template: &str,
        params: &[Param],
    ) -> Result<i64, StoreError> {
        let sql = self.rewrite_prefix(template);
        let mut conn = self.conn.lock().await;
        match &mut *conn {
            RawConn::MySql(c) => {
                let result = sqlx::query_with(&sql, value::mysql_args(params)).execute(&mut **c).await?;
                Ok(result.last_insert_id() as i64)
            }
            RawConn::Sqlite(c) => {
                let result = sqlx::query_with(&sql, value::sqlite_args(params)).execute(&mut **c).await?;
                Ok(result.last_insert_rowid())
            }
        }
    }

    pub(crate) async fn raw_fetch_all(&self, template: &str, params: &[Param]) -> Result<Vec<Row2>, StoreError> {
        let sql = self.rewrite_prefix(template);
        let mut conn = self.conn.lock().await;
        match &mut *conn {
            RawConn::MySql(c) => {
                let rows = sqlx::query_with(&sql, value::mysql_args(params)).fetch_all(&mut **c).await?;
                Ok(rows.into_iter().map(Row2::MySql).collect())
            }
            RawConn::Sqlite(c) => {
                let rows = sqlx::query_with(&sql, value::sqlite_args(params)).fetch_all(&mut **c).await?;
                Ok(rows.into_iter().map(Row2::Sqlite).collect())
            }
        }
    }

    pub(crate) async fn raw_fetch_optional(
        &self,
        template: &str,
        params: &[Param],
    ) -> Result<Option<Row2>, StoreError> {
        Ok(self.raw_fetch_all(template, params).await?.into_iter().next())
    }

    /// Supports nesting by a depth counter: the outermost call issues
    /// `BEGIN`/`COMMIT`/`ROLLBACK`; nested calls issue/release a `SAVEPOINT`.
    /// The depth counter is decremented on every exit path, mirroring the
    /// source's "finally path restores autocommit regardless of error".
    pub async fn execute_in_transaction<T>(
        &self,
        body: impl for<'a> FnOnce(&'a DataAccess) -> TxFuture<'a, T>,
    ) -> Result<T, StoreError> {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst);
        if depth == 0 {
            self.raw_execute("BEGIN", &[]).await?;
        } else {
            self.raw_execute(&format!("SAVEPOINT sp_{depth}"), &[]).await?;
        }

        let result = body(self).await;

        let outcome = match &result {
            Ok(_) => {
                if depth == 0 {
                    self.raw_execute("COMMIT", &[]).await
                } else {
                    self.raw_execute(&format!("RELEASE SAVEPOINT sp_{depth}"), &[]).await
                }
            }
            Err(_) => {
                if depth == 0 {
                    let _ = self.raw_execute("ROLLBACK", &[]).await;
                } else {
                    let _ = self.raw_execute(&format!("ROLLBACK TO SAVEPOINT sp_{depth}"), &[]).await;
                }
                Ok(0)
            }
        };
        self.depth.fetch_sub(1, Ordering::SeqCst);
        outcome?;
        result
    }

    // ---- global parameters ----------------------------------------------

    pub async fn get_global(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = self
            .raw_fetch_optional("SELECT value FROM {}global WHERE `key` = ?", &[Param::text(key)])
            .await?;
        row.map(|r| r.text(0)).transpose()
    }

    /// `None` deletes the row; `Some(value)` upserts it (delete-on-null is
    /// the canonical resolution of the source's two divergent variants).
    pub async fn set_global(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        match value {
            None => self.delete_global(key).await,
            Some(value) => {
                let sql = self.upsert_global_sql();
                self.raw_execute(&sql, &[Param::text(key), Param::text(value)]).await?;
                Ok(())
            }
        }
    }

    pub async fn delete_global(&self, key: &str) -> Result<(), StoreError> {
        self.raw_execute("DELETE FROM {}global WHERE `key` = ?", &[Param::text(key)]).await?;
        Ok(())
    }

    // ---- subjects ---------------------------------------------------------

    pub async fn resolve_subject_by_id(&self, id: i64) -> Result<Option<SubjectRef>, StoreError> {
        let row = self
            .raw_fetch_optional("SELECT type, identifier FROM {}subjects WHERE id = ?", &[Param::int(id)])
            .await?;
        row.map(|r| Ok(SubjectRef::resolved(r.text(0)?, r.text(1)?, id))).transpose()
    }

    pub async fn resolve_subject(&self, kind: &str, identifier: &str) -> Result<Option<SubjectRef>, StoreError> {
        let row = self
            .raw_fetch_optional(
                "SELECT id FROM {}subjects WHERE type = ? AND identifier = ?",
                &[Param::text(kind), Param::text(identifier)],
            )
            .await?;
        row.map(|r| Ok(SubjectRef::resolved(kind, identifier, r.int(0)?))).transpose()
    }

    async fn insert_subject(&self, kind: &str, identifier: &str) -> Result<i64, StoreError> {
        self.raw_insert_returning_id(
            "INSERT INTO {}subjects (type, identifier) VALUES (?, ?)",
            &[Param::text(kind), Param::text(identifier)],
        )
        .await
    }

    pub async fn delete_subject_by_id(&self, id: i64) -> Result<(), StoreError> {
        self.raw_execute("DELETE FROM {}subjects WHERE id = ?", &[Param::int(id)]).await?;
        Ok(())
    }

    pub async fn delete_subject(&self, kind: &str, identifier: &str) -> Result<(), StoreError> {
        self.raw_execute(
            "DELETE FROM {}subjects WHERE type = ? AND identifier = ?",
            &[Param::text(kind), Param::text(identifier)],
        )
        .await?;
        Ok(())
    }

    /// Degrades to an empty list on query failure — this is a non-essential
    /// listing path per SPEC_FULL.md §7.
    pub async fn list_identifiers(&self, kind: &str) -> Vec<String> {
        let rows = self
            .raw_fetch_all("SELECT identifier FROM {}subjects WHERE type = ?", &[Param::text(kind)])
            .await;
        rows.map(|rows| rows.iter().filter_map(|r| r.text(0).ok()).collect()).unwrap_or_default()
    }

    pub async fn list_types(&self) -> Vec<String> {
        let rows = self.raw_fetch_all("SELECT DISTINCT type FROM {}subjects", &[]).await;
        rows.map(|rows| rows.iter().filter_map(|r| r.text(0).ok()).collect()).unwrap_or_default()
    }

    pub async fn list_all_subjects(&self) -> Result<Vec<SubjectRef>, StoreError> {
        let rows = self.raw_fetch_all("SELECT id, type, identifier FROM {}subjects", &[]).await?;
        rows.iter().map(|r| Ok(SubjectRef::resolved(r.text(1)?, r.text(2)?, r.int(0)?))).collect()
    }

    /// Select-then-insert inside a transaction; writes the allocated id back
    /// into `ref_` via `set_id` so every clone observes it.
    pub async fn get_or_create_subject_ref(&self, ref_: &SubjectRef) -> Result<(), StoreError> {
        if !ref_.is_unallocated() {
            return Ok(());
        }
        let kind = ref_.kind().to_string();
        let identifier = ref_.identifier().to_string();
        let id = self
            .execute_in_transaction(move |dao| {
                Box::pin(async move {
                    if let Some(existing) = dao.resolve_subject(&kind, &identifier).await? {
                        return existing.id();
                    }
                    dao.insert_subject(&kind, &identifier).await
                })
            })
            .await?;
        ref_.set_id(id);
        Ok(())
    }

    /// Lazily allocates `ref_` if it is still unresolved, returning its id.
    pub async fn id_allocating(&self, ref_: &SubjectRef) -> Result<i64, StoreError> {
        self.get_or_create_subject_ref(ref_).await?;
        ref_.id()
    }

    // ---- segments -----------------------------------------------------

    pub async fn list_segments(&self, subject_id: i64) -> Result<Vec<Segment>, StoreError> {
        let rows = self
            .raw_fetch_all(
                "SELECT id, perm_default FROM {}segments WHERE subject = ?",
                &[Param::int(subject_id)],
            )
            .await?;
        let mut segments = Vec::with_capacity(rows.len());
        for row in &rows {
            let segment_id = row.int(0)?;
            let default_value = row.opt_int(1)?.map(|v| v as i32);
            let context_set = self.select_contexts(segment_id).await?;
            let permissions = self.select_permissions(segment_id).await?;
            let options = self.select_options(segment_id).await?;
            let parents = self.select_parents(segment_id).await?;
            segments.push(Segment::from_row(segment_id, context_set, permissions, options, parents, default_value));
        }
        Ok(segments)
    }

    async fn select_contexts(&self, segment_id: i64) -> Result<ContextSet, StoreError> {
        let rows = self
            .raw_fetch_all("SELECT `key`, value FROM {}contexts WHERE segment = ?", &[Param::int(segment_id)])
            .await?;
        rows.iter().map(|r| Ok(Context::new(r.text(0)?, r.text(1)?))).collect()
    }

    async fn select_permissions(&self, segment_id: i64) -> Result<BTreeMap<String, i32>, StoreError> {
        let rows = self
            .raw_fetch_all(
                "SELECT `key`, value FROM {}permissions WHERE segment = ?",
                &[Param::int(segment_id)],
            )
            .await?;
        rows.iter().map(|r| Ok((r.text(0)?, r.int(1)? as i32))).collect()
    }

    async fn select_options(&self, segment_id: i64) -> Result<BTreeMap<String, String>, StoreError> {
        let rows = self
            .raw_fetch_all("SELECT `key`, value FROM {}options WHERE segment = ?", &[Param::int(segment_id)])
            .await?;
        rows.iter().map(|r| Ok((r.text(0)?, r.text(1)?))).collect()
    }

    async fn select_parents(&self, segment_id: i64) -> Result<Vec<SubjectRef>, StoreError> {
        let rows = self
            .raw_fetch_all(
                "SELECT s.id, s.type, s.identifier \
                 FROM {}inheritance i JOIN {}subjects s ON s.id = i.parent \
                 WHERE i.segment = ? ORDER BY i.parent",
                &[Param::int(segment_id)],
            )
            .await?;
        rows.iter().map(|r| Ok(SubjectRef::resolved(r.text(1)?, r.text(2)?, r.int(0)?))).collect()
    }

    /// Inserts the segment row (capturing subject + default value), writes
    /// the generated id back into `segment`, and materializes its context
    /// rows.
    async fn allocate_segment(&self, subject_id: i64, segment: &Segment) -> Result<i64, StoreError> {
        let default_param = Param::OptInt(segment.default_value().map(i64::from));
        let segment_id = self
            .raw_insert_returning_id(
                "INSERT INTO {}segments (subject, perm_default) VALUES (?, ?)",
                &[Param::int(subject_id), default_param],
            )
            .await?;
        segment.set_id(segment_id);
        for context in segment.context_set().iter() {
            self.raw_execute(
                "INSERT INTO {}contexts (segment, `key`, value) VALUES (?, ?, ?)",
                &[Param::int(segment_id), Param::text(context.key.clone()), Param::text(context.value.clone())],
            )
            .await?;
        }
        Ok(segment_id)
    }

    async fn delete_segment(&self, segment_id: i64) -> Result<(), StoreError> {
        self.raw_execute("DELETE FROM {}segments WHERE id = ?", &[Param::int(segment_id)]).await?;
        Ok(())
    }

    async fn update_segment_default(&self, segment_id: i64, default: Option<i32>) -> Result<(), StoreError> {
        self.raw_execute(
            "UPDATE {}segments SET perm_default = ? WHERE id = ?",
            &[Param::OptInt(default.map(i64::from)), Param::int(segment_id)],
        )
        .await?;
        Ok(())
    }

    /// Interprets one [`SegmentOp`] against an already-allocated segment row.
    async fn apply_segment_op(&self, segment_id: i64, op: &SegmentOp) -> Result<(), StoreError> {
        match op {
            SegmentOp::UpsertPermission { key, value } => {
                let sql = self.upsert_permission_sql();
                self.raw_execute(&sql, &[Param::int(segment_id), Param::text(key.clone()), Param::int(*value as i64)])
                    .await?;
            }
            SegmentOp::DeletePermission { key } => {
                self.raw_execute(
                    "DELETE FROM {}permissions WHERE segment = ? AND `key` = ?",
                    &[Param::int(segment_id), Param::text(key.clone())],
                )
                .await?;
            }
            SegmentOp::ReplacePermissions(permissions) => {
                self.raw_execute("DELETE FROM {}permissions WHERE segment = ?", &[Param::int(segment_id)]).await?;
                let sql = self.upsert_permission_sql();
                for (key, value) in permissions {
                    self.raw_execute(&sql, &[Param::int(segment_id), Param::text(key.clone()), Param::int(*value as i64)])
                        .await?;
                }
            }
            SegmentOp::UpsertOption { key, value } => {
                let sql = self.upsert_option_sql();
                self.raw_execute(&sql, &[Param::int(segment_id), Param::text(key.clone()), Param::text(value.clone())])
                    .await?;
            }
            SegmentOp::DeleteOption { key } => {
                self.raw_execute(
                    "DELETE FROM {}options WHERE segment = ? AND `key` = ?",
                    &[Param::int(segment_id), Param::text(key.clone())],
                )
                .await?;
            }
            SegmentOp::ReplaceOptions(options) => {
                self.raw_execute("DELETE FROM {}options WHERE segment = ?", &[Param::int(segment_id)]).await?;
                let sql = self.upsert_option_sql();
                for (key, value) in options {
                    self.raw_execute(&sql, &[Param::int(segment_id), Param::text(key.clone()), Param::text(value.clone())])
                        .await?;
                }
            }
            SegmentOp::AddParent(parent) => {
                let parent_id = self.id_allocating(parent).await?;
                self.raw_execute(
                    "INSERT INTO {}inheritance (segment, parent) VALUES (?, ?)",
                    &[Param::int(segment_id), Param::int(parent_id)],
                )
                .await?;
            }
            SegmentOp::RemoveParent(parent) => {
                let parent_id = self.id_allocating(parent).await?;
                self.raw_execute(
                    "DELETE FROM {}inheritance WHERE segment = ? AND parent = ?",
                    &[Param::int(segment_id), Param::int(parent_id)],
                )
                .await?;
            }
            SegmentOp::ReplaceParents(parents) => {
                self.raw_execute("DELETE FROM {}inheritance WHERE segment = ?", &[Param::int(segment_id)]).await?;
                for parent in parents {
                    let parent_id = self.id_allocating(parent).await?;
                    self.raw_execute(
                        "INSERT INTO {}inheritance (segment, parent) VALUES (?, ?)",
                        &[Param::int(segment_id), Param::int(parent_id)],
                    )
                    .await?;
                }
            }
            SegmentOp::SetDefaultValue(value) => {
                self.update_segment_default(segment_id, *value).await?;
            }
        }
        Ok(())
    }

    // ---- context inheritance ----------------------------------------------

    pub async fn select_all_context_inheritance(&self) -> Result<HashMap<Context, Vec<Context>>, StoreError> {
        let rows = self
            .raw_fetch_all(
                "SELECT child_key, child_value, parent_key, parent_value \
                 FROM {}context_inheritance ORDER BY id",
                &[],
            )
            .await?;
        let mut map: HashMap<Context, Vec<Context>> = HashMap::new();
        for row in &rows {
            let child = Context::new(row.text(0)?, row.text(1)?);
            let parent = Context::new(row.text(2)?, row.text(3)?);
            map.entry(child).or_default().push(parent);
        }
        Ok(map)
    }

    async fn delete_inheritance_by_child(&self, child: &Context) -> Result<(), StoreError> {
        self.raw_execute(
            "DELETE FROM {}context_inheritance WHERE child_key = ? AND child_value = ?",
            &[Param::text(child.key.clone()), Param::text(child.value.clone())],
        )
        .await?;
        Ok(())
    }

    async fn insert_context_inheritance(&self, child: &Context, parent: &Context) -> Result<(), StoreError> {
        self.raw_execute(
            "INSERT INTO {}context_inheritance (child_key, child_value, parent_key, parent_value) \
             VALUES (?, ?, ?, ?)",
            &[
                Param::text(child.key.clone()),
                Param::text(child.value.clone()),
                Param::text(parent.key.clone()),
                Param::text(parent.value.clone()),
            ],
        )
        .await?;
        Ok(())
    }

    // ---- rank ladders -------------------------------------------------

    pub async fn select_rank_ladder(&self, name: &str) -> Result<Vec<SubjectRef>, StoreError> {
        let rows = self
            .raw_fetch_all(
                "SELECT s.id, s.type, s.identifier \
                 FROM {}rank_ladders r JOIN {}subjects s ON s.id = r.subject \
                 WHERE r.name = ? ORDER BY r.id",
                &[Param::text(name)],
            )
            .await?;
        rows.iter().map(|r| Ok(SubjectRef::resolved(r.text(1)?, r.text(2)?, r.int(0)?))).collect()
    }

    pub async fn rank_ladder_exists(&self, name: &str) -> Result<bool, StoreError> {
        let row = self
            .raw_fetch_optional("SELECT 1 FROM {}rank_ladders WHERE name = ? LIMIT 1", &[Param::text(name)])
            .await?;
        Ok(row.is_some())
    }

    pub async fn delete_rank_ladder(&self, name: &str) -> Result<(), StoreError> {
        self.raw_execute("DELETE FROM {}rank_ladders WHERE name = ?", &[Param::text(name)]).await?;
        Ok(())
    }

    async fn insert_rank_ladder_entry(&self, name: &str, subject_id: i64) -> Result<(), StoreError> {
        self.raw_execute(
            "INSERT INTO {}rank_ladders (name, subject) VALUES (?, ?)",
            &[Param::text(name), Param::int(subject_id)],
        )
        .await?;
        Ok(())
    }

    pub async fn replace_rank_ladder(&self, name: &str, members: &[SubjectRef]) -> Result<RankLadder, StoreError> {
        let name_owned = name.to_string();
        let members_owned = members.to_vec();
        self.execute_in_transaction(move |dao| {
            Box::pin(async move {
                dao.delete_rank_ladder(&name_owned).await?;
                for member in &members_owned {
                    let id = dao.id_allocating(member).await?;
                    dao.insert_rank_ladder_entry(&name_owned, id).await?;
                }
                Ok(RankLadder::new(name_owned, members_owned))
            })
        })
        .await
    }

    // ---- snapshot orchestration -----------------------------------------

    pub async fn load_subject_data(&self, kind: &str, identifier: &str) -> Result<SubjectData, StoreError> {
        let subject = SubjectRef::unresolved(kind, identifier);
        self.get_or_create_subject_ref(&subject).await?;
        let segments = self.list_segments(subject.id()?).await?;
        let map = segments.into_iter().map(|s| (s.context_set().clone(), s)).collect();
        Ok(SubjectData::new(subject, map))
    }

    pub async fn load_all_subject_data(&self) -> Result<Vec<SubjectData>, StoreError> {
        let mut out = Vec::new();
        for subject in self.list_all_subjects().await? {
            let segments = self.list_segments(subject.id()?).await?;
            let map = segments.into_iter().map(|s| (s.context_set().clone(), s)).collect();
            out.push(SubjectData::new(subject, map));
        }
        Ok(out)
    }

    pub async fn load_context_inheritance(&self) -> Result<ContextInheritance, StoreError> {
        Ok(ContextInheritance::new(self.select_all_context_inheritance().await?))
    }

    /// Drains the snapshot's pending queue and replays it inside a single
    /// transaction, in append order. Returns a reconciled snapshot with the
    /// queue empty and flushed segments' queues cleared.
    pub async fn flush_subject_data(&self, data: &SubjectData) -> Result<SubjectData, StoreError> {
        let queue = data.take_queue();
        if queue.is_empty() {
            return Ok(data.clone());
        }
        let subject_id = self.id_allocating(data.subject()).await?;
        let op_count = queue.len();

        let mut segments = data.segments().clone();
        let result = self
            .execute_in_transaction(move |dao| {
                Box::pin(async move {
                    for (ctx, op) in &queue {
                        match op {
                            SubjectDataOp::DeleteSegment { segment_id } => {
                                dao.delete_segment(*segment_id).await?;
                                segments.remove(ctx);
                            }
                            SubjectDataOp::InsertSegment { segment } => {
                                dao.allocate_segment(subject_id, segment).await?;
                                for pending in segment.pending_ops() {
                                    dao.apply_segment_op(segment.id().ok_or_else(|| {
                                        StoreError::consistency("segment id missing right after allocation")
                                    })?, pending)
                                    .await?;
                                }
                                segments.insert(ctx.clone(), segment.with_cleared_queue());
                            }
                            SubjectDataOp::ReplaySegment { segment } => {
                                let segment_id = segment.id().ok_or_else(|| {
                                    StoreError::consistency("replaying ops against a segment with no id")
                                })?;
                                for pending in segment.pending_ops() {
                                    dao.apply_segment_op(segment_id, pending).await?;
                                }
                                segments.insert(ctx.clone(), segment.with_cleared_queue());
                            }
                        }
                    }
                    Ok(segments)
                })
            })
            .await;

        match result {
            Ok(segments) => {
                debug!(subject = subject_id, ops = op_count, "flushed subject data");
                Ok(data.after_flush(segments))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn flush_context_inheritance(
        &self,
        inheritance: &ContextInheritance,
    ) -> Result<ContextInheritance, StoreError> {
        let queue = inheritance.take_queue();
        if queue.is_empty() {
            return Ok(inheritance.clone());
        }
        let children = queue.len();
        self.execute_in_transaction(move |dao| {
            Box::pin(async move {
                for op in &queue {
                    dao.delete_inheritance_by_child(&op.child).await?;
                    for parent in &op.parents {
                        dao.insert_context_inheritance(&op.child, parent).await?;
                    }
                }
                Ok(())
            })
        })
        .await?;
        info!(children, "flushed context inheritance");
        Ok(inheritance.after_flush())
    }

    // ---- dialect-specific SQL -------------------------------------------

    fn upsert_global_sql(&self) -> String {
        match self.dialect {
            Dialect::MySql => {
                "INSERT INTO {}global (`key`, value) VALUES (?, ?) \
                 ON DUPLICATE KEY UPDATE value = VALUES(value)"
                    .to_string()
            }
            Dialect::Sqlite => {
                "INSERT INTO {}global (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value"
                    .to_string()
            }
        }
    }

    fn upsert_permission_sql(&self) -> String {
        match self.dialect {
            Dialect::MySql => {
                "INSERT INTO {}permissions (segment, `key`, value) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE value = VALUES(value)"
                    .to_string()
            }
            Dialect::Sqlite => {
                "INSERT INTO {}permissions (segment, key, value) VALUES (?, ?, ?) \
                 ON CONFLICT(segment, key) DO UPDATE SET value = excluded.value"
                    .to_string()
            }
        }
    }

    fn upsert_option_sql(&self) -> String {
        match self.dialect {
            Dialect::MySql => {
                "INSERT INTO {}options (segment, `key`, value) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE value = VALUES(value)"
                    .to_string()
            }
            Dialect::Sqlite => {
                "INSERT INTO {}options (segment, key, value) VALUES (?, ?, ?) \
                 ON CONFLICT(segment, key) DO UPDATE SET value = excluded.value"
                    .to_string()
            }
        }
    }

    pub(crate) async fn schema_present(&self) -> Result<bool, StoreError> {
        match self.dialect {
            Dialect::MySql => {
                let row = self
                    .raw_fetch_optional(
                        "SELECT 1 FROM information_schema.tables \
                         WHERE table_schema = DATABASE() AND table_name = '{}permissions'",
                        &[],
                    )
                    .await?;
                Ok(row.is_some())
            }
            Dialect::Sqlite => {
                let row = self
                    .raw_fetch_optional(
                        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = '{}permissions'",
                        &[],
                    )
                    .await?;
                Ok(row.is_some())
            }
        }
    }

    pub(crate) fn deploy_script(&self) -> &'static str {
        match self.dialect {
            Dialect::MySql => include_str!("deploy/mysql.sql"),
            Dialect::Sqlite => include_str!("deploy/sqlite.sql"),
        }
    }
}

/// Replaces every `{}` placeholder in `template` with `prefix`. Pulled out
/// of `DataAccess::rewrite_prefix` as a free function so it's testable
/// without a live connection.
fn rewrite(template: &str, prefix: &str) -> String {
    template.replace("{}", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn prefix_rewrite_replaces_every_occurrence() {
        let template = "SELECT * FROM {}segments s JOIN {}subjects j ON j.id = s.subject";
        let rewritten = rewrite(template, "pex_");
        assert_eq!(rewritten.matches("{}").count(), 0);
        assert_eq!(rewritten.matches("pex_").count(), 2);
    }

    #[test]
    fn empty_prefix_leaves_table_names_bare() {
        assert_eq!(rewrite("{}global", ""), "global");
    }

    async fn sqlite_dao() -> DataAccess {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
        let conn = pool.acquire().await.unwrap();
        DataAccess::from_sqlite(conn, String::new())
    }

    /// Invariant 7: a successful inner body commits via its savepoint being
    /// released, and the outer transaction's single `COMMIT` makes the
    /// combined effect durable; a failing inner body rolls back to the
    /// savepoint without poisoning the outer transaction.
    #[tokio::test]
    async fn nested_transaction_savepoint_semantics() {
        let dao = sqlite_dao().await;
        dao.raw_execute("CREATE TABLE probe (id INTEGER PRIMARY KEY, value TEXT)", &[]).await.unwrap();

        dao.execute_in_transaction(|outer| {
            Box::pin(async move {
                outer.raw_execute("INSERT INTO probe (value) VALUES (?)", &[Param::text("outer")]).await?;

                let inner_failed = outer
                    .execute_in_transaction(|inner| {
                        Box::pin(async move {
                            inner.raw_execute("INSERT INTO probe (value) VALUES (?)", &[Param::text("doomed")]).await?;
                            Err::<(), StoreError>(StoreError::consistency("forced rollback"))
                        })
                    })
                    .await;
                assert!(inner_failed.is_err());

                outer.raw_execute("INSERT INTO probe (value) VALUES (?)", &[Param::text("outer-again")]).await?;
                Ok::<(), StoreError>(())
            })
        })
        .await
        .unwrap();

        let rows = dao.raw_fetch_all("SELECT value FROM probe", &[]).await.unwrap();
        let values: Vec<String> = rows.iter().map(|r| r.text(0).unwrap()).collect();
        assert_eq!(values, vec!["outer", "outer-again"], "the doomed row must not survive the savepoint rollback");
    }
}
