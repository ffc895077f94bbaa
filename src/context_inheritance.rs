use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::context::Context;

/// `set_all_parents(child, parents)` queues a delete-by-child followed by
/// inserts in list order once flushed.
#[derive(Clone, Debug)]
pub(crate) struct SetAllParents {
    pub child: Context,
    pub parents: Vec<Context>,
}

/// An immutable mapping from a child context pair to its ordered list of
/// parent context pairs, with the same deferred-update discipline as
/// [`crate::subject_data::SubjectData`].
#[derive(Clone, Debug)]
pub struct ContextInheritance(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    parents_by_child: HashMap<Context, Vec<Context>>,
    queue: Mutex<Option<Vec<SetAllParents>>>,
}

impl ContextInheritance {
    pub fn new(parents_by_child: HashMap<Context, Vec<Context>>) -> Self {
        Self(Arc::new(Inner { parents_by_child, queue: Mutex::new(Some(Vec::new())) }))
    }

    pub fn parents(&self, child: &Context) -> Vec<Context> {
        self.0.parents_by_child.get(child).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> &HashMap<Context, Vec<Context>> {
        &self.0.parents_by_child
    }

    /// Returns `self` unchanged when `parents` already matches the current
    /// mapping for `child`.
    pub fn set_all_parents(&self, child: Context, parents: Vec<Context>) -> ContextInheritance {
        if self.0.parents_by_child.get(&child) == Some(&parents) {
            return self.clone();
        }

        let mut parents_by_child = self.0.parents_by_child.clone();
        if parents.is_empty() {
            parents_by_child.remove(&child);
        } else {
            parents_by_child.insert(child.clone(), parents.clone());
        }

        let mut queue = {
            let guard = self.0.queue.lock().unwrap();
            guard.clone().unwrap_or_default()
        };
        if let Some(slot) = queue.iter_mut().find(|op| op.child == child) {
            slot.parents = parents;
        } else {
            queue.push(SetAllParents { child, parents });
        }

        ContextInheritance(Arc::new(Inner { parents_by_child, queue: Mutex::new(Some(queue)) }))
    }

    pub(crate) fn take_queue(&self) -> Vec<SetAllParents> {
        self.0.queue.lock().unwrap().take().unwrap_or_default()
    }

    pub(crate) fn after_flush(&self) -> ContextInheritance {
        ContextInheritance(Arc::new(Inner {
            parents_by_child: self.0.parents_by_child.clone(),
            queue: Mutex::new(Some(Vec::new())),
        }))
    }
}
