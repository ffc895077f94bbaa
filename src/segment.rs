use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::context::ContextSet;
use crate::subject::SubjectRef;

/// A tagged description of one field-level change to replay against the
/// data-access layer. Modeled as variants rather than closures (the source's
/// queue holds write closures) since a `Send`-able, inspectable queue is both
/// the natural Rust shape and easier to assert on in tests.
#[derive(Clone, Debug, PartialEq)]
pub enum SegmentOp {
    UpsertPermission { key: String, value: i32 },
    DeletePermission { key: String },
    ReplacePermissions(BTreeMap<String, i32>),
    UpsertOption { key: String, value: String },
    DeleteOption { key: String },
    ReplaceOptions(BTreeMap<String, String>),
    AddParent(SubjectRef),
    RemoveParent(SubjectRef),
    ReplaceParents(Vec<SubjectRef>),
    SetDefaultValue(Option<i32>),
}

/// An immutable, context-scoped block of permissions/options/parents/default,
/// carrying a queue of pending per-field updates appended since it was last
/// read from or flushed to the database.
#[derive(Clone, Debug)]
pub struct Segment(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    id: OnceLock<i64>,
    context_set: ContextSet,
    permissions: BTreeMap<String, i32>,
    options: BTreeMap<String, String>,
    parents: Vec<SubjectRef>,
    default_value: Option<i32>,
    queue: Vec<SegmentOp>,
}

impl Segment {
    /// A brand-new, unallocated, empty segment for `context_set`.
    pub fn new(context_set: ContextSet) -> Self {
        Self(Arc::new(Inner {
            id: OnceLock::new(),
            context_set,
            permissions: BTreeMap::new(),
            options: BTreeMap::new(),
            parents: Vec::new(),
            default_value: None,
            queue: Vec::new(),
        }))
    }

    /// Reconstructs a segment as loaded from the database: allocated, with
    /// an empty (already-flushed) queue.
    pub fn from_row(
        id: i64,
        context_set: ContextSet,
        permissions: BTreeMap<String, i32>,
        options: BTreeMap<String, String>,
        parents: Vec<SubjectRef>,
        default_value: Option<i32>,
    ) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(id);
        Self(Arc::new(Inner {
            id: cell,
            context_set,
            permissions,
            options,
            parents,
            default_value,
            queue: Vec::new(),
        }))
    }

    pub fn context_set(&self) -> &ContextSet {
        &self.0.context_set
    }

    pub fn permissions(&self) -> &BTreeMap<String, i32> {
        &self.0.permissions
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.0.options
    }

    pub fn parents(&self) -> &[SubjectRef] {
        &self.0.parents
    }

    pub fn default_value(&self) -> Option<i32> {
        self.0.default_value
    }

    pub fn id(&self) -> Option<i64> {
        self.0.id.get().copied()
    }

    pub fn is_unallocated(&self) -> bool {
        self.0.id.get().is_none()
    }

    /// Ignores `id`: a segment with no permissions, options, parents and no
    /// default is empty regardless of whether its row already exists.
    pub fn is_empty(&self) -> bool {
        self.0.permissions.is_empty()
            && self.0.options.is_empty()
            && self.0.parents.is_empty()
            && self.0.default_value.is_none()
    }

    /// The ops appended since this segment was last read from or flushed to
    /// the database. Interpreted by the flusher (`crate::backend`).
    pub(crate) fn pending_ops(&self) -> &[SegmentOp] {
        &self.0.queue
    }

    /// Single-assignment id write-back performed at allocation time; every
    /// clone observes it thereafter.
    pub(crate) fn set_id(&self, id: i64) {
        let _ = self.0.id.set(id);
    }

    /// Returns a copy of this segment with its queue drained — used once a
    /// flush has durably applied every pending op.
    pub(crate) fn with_cleared_queue(&self) -> Segment {
        let cell = OnceLock::new();
        if let Some(id) = self.0.id.get() {
            let _ = cell.set(*id);
        }
        Segment(Arc::new(Inner {
            id: cell,
            context_set: self.0.context_set.clone(),
            permissions: self.0.permissions.clone(),
            options: self.0.options.clone(),
            parents: self.0.parents.clone(),
            default_value: self.0.default_value,
            queue: Vec::new(),
        }))
    }

    fn derive(&self, f: impl FnOnce(&Inner, &mut Inner)) -> Segment {
        let cell = OnceLock::new();
        if let Some(id) = self.0.id.get() {
            let _ = cell.set(*id);
        }
        let mut next = Inner {
            id: cell,
            context_set: self.0.context_set.clone(),
            permissions: self.0.permissions.clone(),
            options: self.0.options.clone(),
            parents: self.0.parents.clone(),
            default_value: self.0.default_value,
            queue: self.0.queue.clone(),
        };
        f(&self.0, &mut next);
        Segment(Arc::new(next))
    }

    /// Setting a permission to 0 is equivalent to clearing it.
    pub fn with_permission(&self, key: impl Into<String>, value: i32) -> Segment {
        let key = key.into();
        if value == 0 {
            return self.without_permission(&key);
        }
        self.derive(|_old, next| {
            next.permissions.insert(key.clone(), value);
            next.queue.push(SegmentOp::UpsertPermission { key, value });
        })
    }

    pub fn without_permission(&self, key: &str) -> Segment {
        if !self.0.permissions.contains_key(key) {
            return self.clone();
        }
        let key = key.to_string();
        self.derive(|_old, next| {
            next.permissions.remove(&key);
            next.queue.push(SegmentOp::DeletePermission { key });
        })
    }

    pub fn without_permissions(&self) -> Segment {
        if self.0.permissions.is_empty() {
            return self.clone();
        }
        self.derive(|_old, next| {
            next.permissions.clear();
            next.queue.push(SegmentOp::ReplacePermissions(BTreeMap::new()));
        })
    }

    pub fn set_permissions(&self, permissions: BTreeMap<String, i32>) -> Segment {
        let permissions: BTreeMap<String, i32> =
            permissions.into_iter().filter(|(_, v)| *v != 0).collect();
        self.derive(|_old, next| {
            next.queue.push(SegmentOp::ReplacePermissions(permissions.clone()));
            next.permissions = permissions;
        })
    }

    pub fn with_option(&self, key: impl Into<String>, value: impl Into<String>) -> Segment {
        let key = key.into();
        let value = value.into();
        self.derive(|_old, next| {
            next.options.insert(key.clone(), value.clone());
            next.queue.push(SegmentOp::UpsertOption { key, value });
        })
    }

    pub fn without_option(&self, key: &str) -> Segment {
        if !self.0.options.contains_key(key) {
            return self.clone();
        }
        let key = key.to_string();
        self.derive(|_old, next| {
            next.options.remove(&key);
            next.queue.push(SegmentOp::DeleteOption { key });
        })
    }

    pub fn without_options(&self) -> Segment {
        if self.0.options.is_empty() {
            return self.clone();
        }
        self.derive(|_old, next| {
            next.options.clear();
            next.queue.push(SegmentOp::ReplaceOptions(BTreeMap::new()));
        })
    }

    pub fn set_options(&self, options: BTreeMap<String, String>) -> Segment {
        self.derive(|_old, next| {
            next.queue.push(SegmentOp::ReplaceOptions(options.clone()));
            next.options = options;
        })
    }

    /// No-op (returns `self` unchanged) if `parent` is already present.
    pub fn with_added_parent(&self, parent: SubjectRef) -> Segment {
        if self.0.parents.contains(&parent) {
            return self.clone();
        }
        self.derive(|_old, next| {
            next.parents.push(parent.clone());
            next.queue.push(SegmentOp::AddParent(parent));
        })
    }

    /// No-op (returns `self` unchanged) if `parent` is not present.
    pub fn with_removed_parent(&self, parent: &SubjectRef) -> Segment {
        if !self.0.parents.contains(parent) {
            return self.clone();
        }
        let parent = parent.clone();
        self.derive(|_old, next| {
            next.parents.retain(|p| p != &parent);
            next.queue.push(SegmentOp::RemoveParent(parent));
        })
    }

    pub fn without_parents(&self) -> Segment {
        if self.0.parents.is_empty() {
            return self.clone();
        }
        self.derive(|_old, next| {
            next.parents.clear();
            next.queue.push(SegmentOp::ReplaceParents(Vec::new()));
        })
    }

    /// Replacing the full parent list is modeled as delete-all-then-insert-all
    /// in list order (order is significant — see `rank_ladder`-style ordering
    /// concerns in the data-access layer).
    pub fn with_parents(&self, parents: Vec<SubjectRef>) -> Segment {
        self.derive(|_old, next| {
            next.queue.push(SegmentOp::ReplaceParents(parents.clone()));
            next.parents = parents;
        })
    }

    pub fn with_default_value(&self, value: Option<i32>) -> Segment {
        self.derive(|_old, next| {
            next.default_value = value;
            next.queue.push(SegmentOp::SetDefaultValue(value));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_permission_clears() {
        let seg = Segment::new(ContextSet::global()).with_permission("build", 1);
        assert_eq!(seg.permissions().get("build"), Some(&1));
        let cleared = seg.with_permission("build", 0);
        assert!(cleared.permissions().is_empty());
        assert!(cleared.is_empty());
    }

    #[test]
    fn removing_absent_parent_is_noop() {
        let seg = Segment::new(ContextSet::global());
        let ghost = SubjectRef::unresolved("group", "ghost");
        let same = seg.with_removed_parent(&ghost);
        assert!(same.pending_ops().is_empty());
    }

    #[test]
    fn adding_duplicate_parent_is_noop() {
        let parent = SubjectRef::unresolved("group", "admin");
        let seg = Segment::new(ContextSet::global()).with_added_parent(parent.clone());
        let unchanged = seg.with_added_parent(parent);
        assert_eq!(unchanged.pending_ops().len(), 1);
    }

    #[test]
    fn empty_ignores_id() {
        let seg = Segment::from_row(
            5,
            ContextSet::global(),
            BTreeMap::new(),
            BTreeMap::new(),
            Vec::new(),
            None,
        );
        assert!(seg.is_empty());
        assert!(!seg.is_unallocated());
    }
}
