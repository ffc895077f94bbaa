use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::context::ContextSet;
use crate::segment::Segment;
use crate::subject::SubjectRef;

/// One decided flush action against the data-access layer, chosen at
/// mutation time by the Segment state-transition table in the spec (empty
/// vs non-empty, allocated vs unallocated).
#[derive(Clone, Debug)]
pub(crate) enum SubjectDataOp {
    DeleteSegment { segment_id: i64 },
    InsertSegment { segment: Segment },
    ReplaySegment { segment: Segment },
}

/// An immutable mapping from context-set to [`Segment`] for one subject,
/// plus a queue of pending operations against the data-access layer.
///
/// Cloning a `SubjectData` is cheap (an `Arc` clone) and all clones share the
/// same pending-queue cell, so whichever caller calls `flush` first drains it
/// — a second concurrent `flush` on another clone sees an empty queue and is
/// a no-op.
#[derive(Clone, Debug)]
pub struct SubjectData(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    subject: SubjectRef,
    segments: HashMap<ContextSet, Segment>,
    // Keyed by position-of-first-touch; replacing rather than appending an
    // entry for an already-queued context avoids replaying an earlier,
    // strictly-smaller delta once the later, superseding one is queued too.
    queue: Mutex<Option<Vec<(ContextSet, SubjectDataOp)>>>,
}

impl SubjectData {
    pub fn new(subject: SubjectRef, segments: HashMap<ContextSet, Segment>) -> Self {
        Self(Arc::new(Inner { subject, segments, queue: Mutex::new(Some(Vec::new())) }))
    }

    pub fn subject(&self) -> &SubjectRef {
        &self.0.subject
    }

    pub fn active_contexts(&self) -> Vec<ContextSet> {
        self.0.segments.keys().cloned().collect()
    }

    fn segment(&self, ctx: &ContextSet) -> Segment {
        self.0.segments.get(ctx).cloned().unwrap_or_else(|| Segment::new(ctx.clone()))
    }

    pub fn permissions(&self, ctx: &ContextSet) -> BTreeMap<String, i32> {
        self.0.segments.get(ctx).map(|s| s.permissions().clone()).unwrap_or_default()
    }

    pub fn all_permissions(&self) -> HashMap<ContextSet, BTreeMap<String, i32>> {
        self.0
            .segments
            .iter()
            .map(|(ctx, seg)| (ctx.clone(), seg.permissions().clone()))
            .collect()
    }

    pub fn options(&self, ctx: &ContextSet) -> BTreeMap<String, String> {
        self.0.segments.get(ctx).map(|s| s.options().clone()).unwrap_or_default()
    }

    pub fn all_options(&self) -> HashMap<ContextSet, BTreeMap<String, String>> {
        self.0.segments.iter().map(|(ctx, seg)| (ctx.clone(), seg.options().clone())).collect()
    }

    pub fn parents(&self, ctx: &ContextSet) -> Vec<SubjectRef> {
        self.0.segments.get(ctx).map(|s| s.parents().to_vec()).unwrap_or_default()
    }

    pub fn all_parents(&self) -> HashMap<ContextSet, Vec<SubjectRef>> {
        self.0.segments.iter().map(|(ctx, seg)| (ctx.clone(), seg.parents().to_vec())).collect()
    }

    pub fn default_value(&self, ctx: &ContextSet) -> Option<i32> {
        self.0.segments.get(ctx).and_then(|s| s.default_value())
    }

    pub fn all_default_values(&self) -> HashMap<ContextSet, i32> {
        self.0
            .segments
            .iter()
            .filter_map(|(ctx, seg)| seg.default_value().map(|v| (ctx.clone(), v)))
            .collect()
    }

    /// Builds the successor snapshot for a new segment state at `ctx`,
    /// queuing the flush action dictated by the state-transition table.
    /// Returns `self` unchanged (no queued work, same `Arc`) when the
    /// transition is a genuine no-op.
    fn with_updated(&self, ctx: ContextSet, old: &Segment, new: Segment) -> SubjectData {
        let action = if new.is_empty() {
            old.id().map(|segment_id| SubjectDataOp::DeleteSegment { segment_id })
        } else if old.is_unallocated() {
            // No row exists yet: the insert must carry every op queued on
            // `new` since creation, not just this call's delta.
            Some(SubjectDataOp::InsertSegment { segment: new.clone() })
        } else {
            Some(SubjectDataOp::ReplaySegment { segment: new.clone() })
        };

        let Some(action) = action else {
            return self.clone();
        };

        let mut segments = self.0.segments.clone();
        if new.is_empty() {
            segments.remove(&ctx);
        } else {
            segments.insert(ctx.clone(), new);
        }

        let mut queue = {
            let guard = self.0.queue.lock().unwrap();
            guard.clone().unwrap_or_default()
        };
        push_or_replace(&mut queue, ctx, action);

        SubjectData(Arc::new(Inner {
            subject: self.0.subject.clone(),
            segments,
            queue: Mutex::new(Some(queue)),
        }))
    }

    pub fn set_permission(&self, ctx: &ContextSet, key: impl Into<String>, value: i32) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.with_permission(key, value);
        self.with_updated(ctx.clone(), &old, new)
    }

    pub fn set_permissions(&self, ctx: &ContextSet, permissions: BTreeMap<String, i32>) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.set_permissions(permissions);
        self.with_updated(ctx.clone(), &old, new)
    }

    pub fn clear_permission(&self, ctx: &ContextSet, key: &str) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.without_permission(key);
        self.with_updated(ctx.clone(), &old, new)
    }

    pub fn clear_permissions_at(&self, ctx: &ContextSet) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.without_permissions();
        self.with_updated(ctx.clone(), &old, new)
    }

    /// Bulk clear across every stored context-set: one snapshot queues a
    /// delete-or-replay action for every context that currently has a
    /// segment.
    pub fn clear_permissions(&self) -> SubjectData {
        self.bulk(|seg| seg.without_permissions())
    }

    pub fn set_option(&self, ctx: &ContextSet, key: impl Into<String>, value: impl Into<String>) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.with_option(key, value);
        self.with_updated(ctx.clone(), &old, new)
    }

    pub fn set_options(&self, ctx: &ContextSet, options: BTreeMap<String, String>) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.set_options(options);
        self.with_updated(ctx.clone(), &old, new)
    }

    pub fn clear_option(&self, ctx: &ContextSet, key: &str) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.without_option(key);
        self.with_updated(ctx.clone(), &old, new)
    }

    pub fn clear_options_at(&self, ctx: &ContextSet) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.without_options();
        self.with_updated(ctx.clone(), &old, new)
    }

    pub fn clear_options(&self) -> SubjectData {
        self.bulk(|seg| seg.without_options())
    }

    pub fn add_parent(&self, ctx: &ContextSet, parent: SubjectRef) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.with_added_parent(parent);
        self.with_updated(ctx.clone(), &old, new)
    }

    pub fn remove_parent(&self, ctx: &ContextSet, parent: &SubjectRef) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.with_removed_parent(parent);
        self.with_updated(ctx.clone(), &old, new)
    }

    pub fn set_parents(&self, ctx: &ContextSet, parents: Vec<SubjectRef>) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.with_parents(parents);
        self.with_updated(ctx.clone(), &old, new)
    }

    pub fn clear_parents_at(&self, ctx: &ContextSet) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.without_parents();
        self.with_updated(ctx.clone(), &old, new)
    }

    pub fn clear_parents(&self) -> SubjectData {
        self.bulk(|seg| seg.without_parents())
    }

    pub fn set_default_value(&self, ctx: &ContextSet, value: Option<i32>) -> SubjectData {
        let old = self.segment(ctx);
        let new = old.with_default_value(value);
        self.with_updated(ctx.clone(), &old, new)
    }

    fn bulk(&self, f: impl Fn(&Segment) -> Segment) -> SubjectData {
        let mut result = self.clone();
        for ctx in self.active_contexts() {
            let old = result.segment(&ctx);
            let new = f(&old);
            result = result.with_updated(ctx, &old, new);
        }
        result
    }

    /// Drains the pending queue. A second concurrent call (on another clone
    /// of this same snapshot) observes `None` and does nothing.
    pub(crate) fn take_queue(&self) -> Vec<(ContextSet, SubjectDataOp)> {
        self.0.queue.lock().unwrap().take().unwrap_or_default()
    }

    /// Reconstructs a post-flush snapshot: flushed segments get their queues
    /// cleared, deleted segments are dropped, and the pending queue is fresh.
    pub(crate) fn after_flush(&self, flushed: HashMap<ContextSet, Segment>) -> SubjectData {
        SubjectData(Arc::new(Inner {
            subject: self.0.subject.clone(),
            segments: flushed,
            queue: Mutex::new(Some(Vec::new())),
        }))
    }

    /// Current segments, keyed by context-set — used by the flusher to
    /// compute the post-flush map from a drained queue.
    pub(crate) fn segments(&self) -> &HashMap<ContextSet, Segment> {
        &self.0.segments
    }
}

/// Collapses a newly-computed action into the queue slot for `ctx`, *except*
/// when the most recent queued action for `ctx` is a `DeleteSegment` and the
/// new one is not: a delete targets an already-allocated row, and a later
/// insert/replay for the same context-set is a *different*, not-yet-existing
/// row (the old one is already gone) — collapsing them would silently drop
/// the delete and leave the old row orphaned in the database. Both actions
/// are kept and replay in order: delete first, then (re)insert.
fn push_or_replace(queue: &mut Vec<(ContextSet, SubjectDataOp)>, ctx: ContextSet, action: SubjectDataOp) {
    let slot = queue.iter_mut().rev().find(|(existing, _)| existing == &ctx);
    match slot {
        Some(slot)
            if matches!(slot.1, SubjectDataOp::DeleteSegment { .. })
                && !matches!(action, SubjectDataOp::DeleteSegment { .. }) =>
        {
            queue.push((ctx, action));
        }
        Some(slot) => slot.1 = action,
        None => queue.push((ctx, action)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    fn subject() -> SubjectRef {
        SubjectRef::unresolved("user", "alice")
    }

    #[test]
    fn clearing_unknown_context_is_noop() {
        let data = SubjectData::new(subject(), HashMap::new());
        let ctx: ContextSet = [Context::new("world", "end")].into_iter().collect();
        let cleared = data.clear_parents_at(&ctx);
        assert!(Arc::ptr_eq(&data.0, &cleared.0));
    }

    #[test]
    fn set_permission_zero_is_equivalent_to_clear() {
        let data = SubjectData::new(subject(), HashMap::new());
        let ctx = ContextSet::global();
        let with_perm = data.set_permission(&ctx, "build", 1);
        let cleared_via_zero = with_perm.set_permission(&ctx, "build", 0);
        let cleared_directly = with_perm.clear_permission(&ctx, "build");
        assert_eq!(cleared_via_zero.permissions(&ctx), cleared_directly.permissions(&ctx));
    }

    #[test]
    fn repeated_mutation_before_flush_dedupes_queue_entry() {
        let data = SubjectData::new(subject(), HashMap::new());
        let ctx = ContextSet::global();
        let step1 = data.set_permission(&ctx, "build", 1);
        let step2 = step1.set_option(&ctx, "prefix", "[admin]");
        let queue = step2.take_queue();
        assert_eq!(queue.len(), 1, "both edits touch the same context and should collapse to one action");
    }

    /// A segment that is emptied (queuing a `DeleteSegment` for its existing
    /// row) and then made non-empty again in the same unflushed batch must
    /// keep *both* actions queued, in order: the old row still needs to be
    /// deleted even though the context-set ends up with a fresh row of its
    /// own. Collapsing the two into just the later insert would orphan the
    /// old row forever.
    #[test]
    fn delete_then_reinsert_in_same_batch_keeps_both_actions() {
        let ctx = ContextSet::global();
        let mut permissions = BTreeMap::new();
        permissions.insert("build".to_string(), 1);
        let existing = Segment::from_row(10, ctx.clone(), permissions, BTreeMap::new(), Vec::new(), None);
        let mut segments = HashMap::new();
        segments.insert(ctx.clone(), existing);
        let data = SubjectData::new(subject(), segments);

        let cleared = data.clear_permissions_at(&ctx);
        let reinserted = cleared.set_option(&ctx, "prefix", "[admin]");

        let queue = reinserted.take_queue();
        assert_eq!(queue.len(), 2, "the delete of row 10 must survive alongside the later re-insert");
        assert!(
            matches!(queue[0].1, SubjectDataOp::DeleteSegment { segment_id: 10 }),
            "expected the first queued action to delete the original row, got {:?}",
            queue[0].1
        );
        assert!(
            matches!(queue[1].1, SubjectDataOp::InsertSegment { .. }),
            "expected the second queued action to insert a fresh row, got {:?}",
            queue[1].1
        );

        assert_eq!(reinserted.options(&ctx).get("prefix").map(String::as_str), Some("[admin]"));
        assert!(reinserted.permissions(&ctx).is_empty());
    }
}
