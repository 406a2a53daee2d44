//! Duplicate-hostname policy.
//!
//! A worker that leaves the swarm behind the manager's back (for example
//! `docker swarm leave` run on the worker itself) and then rejoins gets a
//! fresh node id. Its old node lingers until the orchestrator reports it
//! down. The policy decides which node id, if any, the reconciler should
//! remove when that happens.
//!
//! The hostname is a weak identity. Swapping in a stronger scheme only
//! requires a new [`DuplicatePolicy`] implementation.

use swarmgrid_state::{WorkerIdentity, WorkerRecord, WorkerStatus};

/// What the policy gets to look at for a single `down` transition.
#[derive(Debug)]
pub struct DuplicateContext<'a> {
    /// The node the orchestrator reported down.
    pub down: &'a WorkerIdentity,
    /// Registry count of `active` records for the hostname.
    pub hostname_count: usize,
    /// Non-removed records of the hostname.
    pub members: &'a [WorkerRecord],
}

pub trait DuplicatePolicy: Send + Sync {
    /// Node to remove, or `None` to just mark the node down.
    fn select_for_removal(&self, ctx: &DuplicateContext<'_>) -> Option<WorkerIdentity>;
}

/// Remove the node that went down when its hostname has more than one
/// active record and another node id of the hostname is still active.
/// That other node is the live replica and is never touched.
///
/// A hostname whose only other records are `down` or `stale` has no live
/// replica, so the node that went down is just marked down.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostnameCountPolicy;

impl DuplicatePolicy for HostnameCountPolicy {
    fn select_for_removal(&self, ctx: &DuplicateContext<'_>) -> Option<WorkerIdentity> {
        if ctx.hostname_count <= 1 {
            return None;
        }
        let survivor = ctx
            .members
            .iter()
            .any(|r| r.identity != *ctx.down && r.status == WorkerStatus::Active);
        if !survivor {
            return None;
        }
        ctx.members
            .iter()
            .find(|r| r.identity == *ctx.down)
            .map(|r| r.identity.clone())
    }
}
