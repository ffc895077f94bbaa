use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use crate::error::StoreError;

/// Identity record for a (type, identifier) pair, with a lazily-assigned
/// integer primary key.
///
/// Two refs with the same (type, identifier) denote the same subject
/// regardless of whether either has an allocated id yet — equality and
/// hashing deliberately ignore `id`, which is purely a storage-layer
/// optimization over the logical (type, identifier) identity.
#[derive(Clone, Debug)]
pub struct SubjectRef(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    kind: String,
    identifier: String,
    id: OnceLock<i64>,
}

impl SubjectRef {
    /// Constructs a ref with no allocated id yet.
    pub fn unresolved(kind: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self(Arc::new(Inner {
            kind: kind.into(),
            identifier: identifier.into(),
            id: OnceLock::new(),
        }))
    }

    /// Constructs a ref that is already known to have the given row id.
    pub fn resolved(kind: impl Into<String>, identifier: impl Into<String>, id: i64) -> Self {
        let ref_ = Self::unresolved(kind, identifier);
        let _ = ref_.0.id.set(id);
        ref_
    }

    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    pub fn identifier(&self) -> &str {
        &self.0.identifier
    }

    pub fn is_unallocated(&self) -> bool {
        self.0.id.get().is_none()
    }

    /// Returns the allocated id, or `UnallocatedReference` if none has been
    /// assigned yet.
    pub fn id(&self) -> Result<i64, StoreError> {
        self.0.id.get().copied().ok_or_else(|| StoreError::UnallocatedReference {
            type_: self.0.kind.clone(),
            identifier: self.0.identifier.clone(),
        })
    }

    /// Single-assignment write-back performed by the DataAccess allocator.
    /// Every clone of this ref observes the id once this call returns,
    /// since they all share the same `Inner`.
    ///
    /// Calling this twice with a differing id is a programmer error.
    pub(crate) fn set_id(&self, id: i64) {
        match self.0.id.set(id) {
            Ok(()) => {}
            Err(_) => debug_assert_eq!(
                self.0.id.get().copied(),
                Some(id),
                "SubjectRef id reassigned to a different value"
            ),
        }
    }
}

impl PartialEq for SubjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind == other.0.kind && self.0.identifier == other.0.identifier
    }
}

impl Eq for SubjectRef {}

impl Hash for SubjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.kind.hash(state);
        self.0.identifier.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_id() {
        let a = SubjectRef::unresolved("group", "admin");
        let b = SubjectRef::resolved("group", "admin", 42);
        assert_eq!(a, b);
    }

    #[test]
    fn unallocated_id_is_an_error() {
        let a = SubjectRef::unresolved("group", "admin");
        assert!(matches!(a.id(), Err(StoreError::UnallocatedReference { .. })));
    }

    #[test]
    fn set_id_is_observed_by_clones() {
        let a = SubjectRef::unresolved("user", "alice");
        let clone = a.clone();
        a.set_id(7);
        assert_eq!(clone.id().unwrap(), 7);
    }
}
