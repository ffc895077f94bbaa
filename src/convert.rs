use std::any::Any;
use std::collections::BTreeMap;

use crate::context::ContextSet;
use crate::subject::SubjectRef;
use crate::subject_data::SubjectData;

/// Implemented by any snapshot — ours or a foreign backend's — whose
/// semantic content (permissions/options/parents/default per context) can be
/// read off and copied elsewhere. `Store::set_data` accepts this trait
/// object directly; when the concrete type is our own `SubjectData` it takes
/// a fast path, otherwise it falls back to [`copy_snapshot_into`].
pub trait SubjectSnapshotView: Any {
    fn active_contexts(&self) -> Vec<ContextSet>;
    fn permissions(&self, ctx: &ContextSet) -> BTreeMap<String, i32>;
    fn options(&self, ctx: &ContextSet) -> BTreeMap<String, String>;
    fn parents(&self, ctx: &ContextSet) -> Vec<SubjectRef>;
    fn default_value(&self, ctx: &ContextSet) -> Option<i32>;

    fn as_any(&self) -> &dyn Any;
}

impl SubjectSnapshotView for SubjectData {
    fn active_contexts(&self) -> Vec<ContextSet> {
        SubjectData::active_contexts(self)
    }

    fn permissions(&self, ctx: &ContextSet) -> BTreeMap<String, i32> {
        SubjectData::permissions(self, ctx)
    }

    fn options(&self, ctx: &ContextSet) -> BTreeMap<String, String> {
        SubjectData::options(self, ctx)
    }

    fn parents(&self, ctx: &ContextSet) -> Vec<SubjectRef> {
        SubjectData::parents(self, ctx)
    }

    fn default_value(&self, ctx: &ContextSet) -> Option<i32> {
        SubjectData::default_value(self, ctx)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Copies every context-scoped field from `source` into `target`, one
/// context at a time. Used when a caller hands `Store::set_data` a snapshot
/// that didn't come from this crate (cross-backend migration, SPEC_FULL.md
/// §8 scenario E).
pub fn copy_snapshot_into(target: &SubjectData, source: &dyn SubjectSnapshotView) -> SubjectData {
    let mut result = target.clone();
    for ctx in source.active_contexts() {
        result = result.set_permissions(&ctx, source.permissions(&ctx));
        result = result.set_options(&ctx, source.options(&ctx));
        result = result.set_parents(&ctx, source.parents(&ctx));
        result = result.set_default_value(&ctx, source.default_value(&ctx));
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::context::Context;

    struct FakeSnapshot {
        ctx: ContextSet,
        permissions: BTreeMap<String, i32>,
    }

    impl SubjectSnapshotView for FakeSnapshot {
        fn active_contexts(&self) -> Vec<ContextSet> {
            vec![self.ctx.clone()]
        }

        fn permissions(&self, ctx: &ContextSet) -> BTreeMap<String, i32> {
            if ctx == &self.ctx { self.permissions.clone() } else { BTreeMap::new() }
        }

        fn options(&self, _ctx: &ContextSet) -> BTreeMap<String, String> {
            BTreeMap::new()
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

    #[test]
    fn foreign_snapshot_copies_permissions_into_native() {
        let ctx: ContextSet = [Context::new("world", "nether")].into_iter().collect();
        let mut permissions = BTreeMap::new();
        permissions.insert("build".to_string(), 1);
        let foreign = FakeSnapshot { ctx: ctx.clone(), permissions };

        let native = SubjectData::new(SubjectRef::unresolved("user", "alice"), HashMap::new());
        let merged = copy_snapshot_into(&native, &foreign);

        assert_eq!(merged.permissions(&ctx).get("build"), Some(&1));
    }
}
