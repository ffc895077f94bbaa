use permissionsex_store::{Store, StoreConfig};

/// Opens a fresh in-memory SQLite-backed store. Each call gets its own
/// isolated database — scenarios never see each other's state.
pub async fn open_store() -> Store {
    let config = StoreConfig { url: "sqlite::memory:".to_string(), prefix: String::new(), aliases: Default::default() };
    Store::open(&config).await.expect("in-memory store should open")
}
