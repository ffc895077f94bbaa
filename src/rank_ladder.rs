use crate::subject::SubjectRef;

/// An ordered list of subjects under a name. List order follows insertion
/// order in the database (the `rank_ladders.id` auto-increment column), so
/// re-ordering a ladder is always a delete-all-then-insert-in-order at the
/// data-access layer rather than an in-place reorder.
///
/// Unlike `Segment`/`SubjectData`, rank ladders carry no deferred-update
/// queue — mutation is plain CRUD against [`crate::backend::DataAccess`]
/// (ladder semantics beyond that are out of scope for this crate).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankLadder {
    name: String,
    members: Vec<SubjectRef>,
}

impl RankLadder {
    pub fn new(name: impl Into<String>, members: Vec<SubjectRef>) -> Self {
        Self { name: name.into(), members }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[SubjectRef] {
        &self.members
    }
}
