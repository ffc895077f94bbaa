use thiserror::Error;

/// Errors surfaced by the persistence engine.
///
/// Read paths that are allowed to degrade (listing identifiers, types, rank
/// ladders) swallow [`StoreError::QueryFailure`] into an empty collection at
/// the call site rather than here; this type only describes what went wrong.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to load store: {0}")]
    LoadFailure(String),

    #[error("query failed: {0}")]
    QueryFailure(#[from] sqlx::Error),

    #[error("reference to ({type_}, {identifier}) has no allocated id yet")]
    UnallocatedReference { type_: String, identifier: String },

    #[error("consistency violation: {0}")]
    Consistency(String),
}

impl StoreError {
    pub fn load_failure(message: impl Into<String>) -> Self {
        Self::LoadFailure(message.into())
    }

    pub fn unsupported_dialect(scheme: &str) -> Self {
        Self::LoadFailure(format!("no bundled schema script for dialect '{scheme}'"))
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency(message.into())
    }
}
