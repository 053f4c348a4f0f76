//! The merge policy: the single most load-bearing rule in the task
//! queue. Without it a flood of duplicate wants would balloon the
//! per-peer queue; without the upgrade case, a late want-block behind
//! an earlier want-have would be served as Have only.

use crate::message::WantType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// No task exists yet for this (peer, cid): insert the incoming one.
    Insert,
    /// A pending Have task for this cid should become a Block task,
    /// inheriting the incoming (or, for priority, the larger of the two)
    /// fields.
    Upgrade,
    /// Drop the incoming want; the existing task already covers it, or
    /// it arrived while a task for the same cid is mid-flight and will
    /// be reconsidered (via a fresh `push_tasks` call) if still wanted
    /// once that task completes.
    Ignore,
}

/// Resolves what should happen when a want for `cid` arrives while
/// `existing_pending` (if any) is queued and/or `existing_active` is
/// being processed right now.
pub fn resolve(
    existing_pending: Option<WantType>,
    existing_active: bool,
    incoming: WantType,
) -> MergeDecision {
    if existing_active {
        return MergeDecision::Ignore;
    }

    match (existing_pending, incoming) {
        (None, _) => MergeDecision::Insert,
        (Some(WantType::Have), WantType::Have) => MergeDecision::Ignore,
        (Some(WantType::Have), WantType::Block) => MergeDecision::Upgrade,
        (Some(WantType::Block), WantType::Have) => MergeDecision::Ignore,
        (Some(WantType::Block), WantType::Block) => MergeDecision::Ignore,
    }
}
