mod support;

use std::any::Any;
use std::collections::BTreeMap;

use permissionsex_store::{Context, ContextSet, Store, StoreConfig, SubjectRef, SubjectSnapshotView};
use support::open_store;

fn ctx(pairs: &[(&str, &str)]) -> ContextSet {
    pairs.iter().map(|(k, v)| Context::new(*k, *v)).collect()
}

/// A. Create and fetch: absent before, allocated after, idempotent on
/// re-creation, retrievable by id.
#[tokio::test]
async fn create_and_fetch_subject() {
    let store = open_store().await;
    assert!(!store.list_identifiers("group").await.contains(&"admin".to_string()));

    let data = store.get_data("group", "admin").await.expect("load should allocate a ref");
    let id = data.subject().id().expect("loading a subject allocates its ref");
    assert!(store.list_identifiers("group").await.contains(&"admin".to_string()));

    let again = store.get_data("group", "admin").await.expect("re-load");
    assert_eq!(again.subject().id().unwrap(), id, "re-creation is idempotent");

    let resolved = store.resolve_subject(id).await.unwrap().expect("retrievable by id");
    assert_eq!(resolved.identifier(), "admin");
}

/// B. Permission round trip through a flush and reload.
#[tokio::test]
async fn permission_round_trip() {
    let store = open_store().await;
    let data = store.get_data("user", "alice").await.unwrap();

    let nether = ctx(&[("world", "nether")]);
    let updated = data.set_permission(&nether, "build", 1);
    store.set_data("user", "alice", &updated).await.unwrap().await.unwrap();

    let reloaded = store.get_data("user", "alice").await.unwrap();
    assert_eq!(reloaded.permissions(&nether).get("build"), Some(&1));
    assert!(reloaded.permissions(&ContextSet::global()).is_empty());
}

/// C. Clearing permissions in one context deletes that segment but leaves
/// the global one alone.
#[tokio::test]
async fn context_scoped_clear_drops_empty_segment() {
    let store = open_store().await;
    let data = store.get_data("user", "bob").await.unwrap();

    let end = ctx(&[("world", "end")]);
    let seeded = data
        .set_permission(&ContextSet::global(), "fly", 1)
        .set_permission(&end, "build", 1);
    store.set_data("user", "bob", &seeded).await.unwrap().await.unwrap();

    let loaded = store.get_data("user", "bob").await.unwrap();
    let cleared = loaded.clear_permissions_at(&end);
    store.set_data("user", "bob", &cleared).await.unwrap().await.unwrap();

    let reloaded = store.get_data("user", "bob").await.unwrap();
    assert_eq!(reloaded.permissions(&ContextSet::global()).get("fly"), Some(&1));
    assert!(!reloaded.active_contexts().contains(&end));
}

/// A segment that is cleared back to empty (queuing a delete of its existing
/// row) and then given new content in the *same* unflushed batch must not
/// leave the old row orphaned: the delete and the fresh insert both have to
/// run. A `HashMap`-backed reload can't by itself distinguish "one row" from
/// "two rows that collided on the same context-set key", so this opens a
/// second raw connection against the same shared-cache database and counts
/// `segments` rows directly.
#[tokio::test]
async fn clearing_then_refilling_a_segment_before_flush_does_not_orphan_the_old_row() {
    let url = "sqlite:file:no_orphan_rows?mode=memory&cache=shared";
    let config = StoreConfig { url: url.to_string(), prefix: String::new(), aliases: Default::default() };
    let store = Store::open(&config).await.unwrap();
    let nether = ctx(&[("world", "nether")]);

    let seeded = store.get_data("user", "carol").await.unwrap().set_permission(&nether, "build", 1);
    store.set_data("user", "carol", &seeded).await.unwrap().await.unwrap();

    let loaded = store.get_data("user", "carol").await.unwrap();
    let refilled = loaded.clear_permissions_at(&nether).set_option(&nether, "prefix", "[vip]");
    store.set_data("user", "carol", &refilled).await.unwrap().await.unwrap();

    let reloaded = store.get_data("user", "carol").await.unwrap();
    assert!(reloaded.permissions(&nether).is_empty(), "the cleared permission must not survive");
    assert_eq!(reloaded.options(&nether).get("prefix").map(String::as_str), Some("[vip]"));

    let pool = sqlx::SqlitePool::connect(url).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM segments").fetch_one(&pool).await.unwrap();
    assert_eq!(count, 1, "the stale row must be deleted, not left behind as an orphan alongside the new one");
}

/// D. Parent order is preserved through a flush and reload.
#[tokio::test]
async fn parent_order_is_preserved() {
    let store = open_store().await;
    let data = store.get_data("group", "member").await.unwrap();
    let global = ContextSet::global();

    let parents = vec![
        SubjectRef::unresolved("group", "a"),
        SubjectRef::unresolved("group", "b"),
        SubjectRef::unresolved("group", "c"),
    ];
    let updated = data.set_parents(&global, parents);
    store.set_data("group", "member", &updated).await.unwrap().await.unwrap();

    let reloaded = store.get_data("group", "member").await.unwrap();
    let names: Vec<String> = reloaded.parents(&global).iter().map(|p| p.identifier().to_string()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

struct ForeignSnapshot {
    permissions: BTreeMap<String, i32>,
    options: BTreeMap<String, String>,
}

impl SubjectSnapshotView for ForeignSnapshot {
    fn active_contexts(&self) -> Vec<ContextSet> {
        vec![ContextSet::global()]
    }

    fn permissions(&self, ctx: &ContextSet) -> BTreeMap<String, i32> {
        if ctx.is_global() { self.permissions.clone() } else { BTreeMap::new() }
    }

    fn options(&self, ctx: &ContextSet) -> BTreeMap<String, String> {
        if ctx.is_global() { self.options.clone() } else { BTreeMap::new() }
    }

    fn parents(&self, _ctx: &ContextSet) -> Vec<SubjectRef> {
        Vec::new()
    }

    fn default_value(&self, _ctx: &ContextSet) -> Option<i32> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// E. A foreign (non-native) snapshot implementor is persisted and reads
/// back semantically identical through the native snapshot type.
#[tokio::test]
async fn foreign_snapshot_import() {
    let store = open_store().await;

    let mut permissions = BTreeMap::new();
    permissions.insert("teleport".to_string(), 1);
    let mut options = BTreeMap::new();
    options.insert("prefix".to_string(), "[vip]".to_string());
    let foreign = ForeignSnapshot { permissions, options };

    store.set_data("user", "imported", &foreign).await.unwrap().await.unwrap();

    let reloaded = store.get_data("user", "imported").await.unwrap();
    let global = ContextSet::global();
    assert_eq!(reloaded.permissions(&global).get("teleport"), Some(&1));
    assert_eq!(reloaded.options(&global).get("prefix").map(String::as_str), Some("[vip]"));
}

/// F. Schema bootstrap against an empty database creates every table, and a
/// second `Store::open` against that same database is a no-op that doesn't
/// disturb the data the first one wrote.
#[tokio::test]
async fn schema_bootstrap_is_idempotent() {
    let config = StoreConfig {
        url: "sqlite:file:scenario_f?mode=memory&cache=shared".to_string(),
        prefix: String::new(),
        aliases: Default::default(),
    };

    let first = Store::open(&config).await.expect("first open deploys the schema");
    let data = first.get_data("user", "first").await.unwrap();
    let id = data.subject().id().unwrap();

    let second = Store::open(&config).await.expect("second open over an existing schema is a no-op");
    let reloaded = second.get_data("user", "first").await.unwrap();
    assert_eq!(reloaded.subject().id().unwrap(), id);
}
