//! Membership event reconciler.
//!
//! Consumes node lifecycle events one at a time, in arrival order, and
//! corrects the worker registry: nodes the orchestrator reports down are
//! marked down, recovered nodes are marked active again, and a stale
//! duplicate of a rejoined hostname is removed.
//!
//! Every event is handled on its own. When the registry cannot answer
//! (storage failure, unknown node) the event is logged and dropped; the
//! orchestrator emits a fresh event on the next state change, so the
//! registry converges without retries or backfill.

use std::collections::HashMap;

use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use swarmgrid_state::*;

use crate::event::{EventKind, EventSubscription, LifecycleEvent, NodeState};
use crate::policy::{DuplicateContext, DuplicatePolicy, HostnameCountPolicy};

/// Reconciler view of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Unknown,
    Active,
    Down,
}

/// Last known state of each live node, as seen through applied events.
///
/// Only used to log transitions. Decisions always come from the registry,
/// so an empty tracker after a restart is harmless. Removed nodes are
/// forgotten, which keeps the map bounded by the live swarm.
#[derive(Debug, Default)]
pub struct MemberTracker {
    nodes: HashMap<NodeId, MemberState>,
}

impl MemberTracker {
    pub fn state(&self, node_id: &str) -> MemberState {
        self.nodes.get(node_id).copied().unwrap_or(MemberState::Unknown)
    }

    /// First sighting of a node makes it active.
    fn observe(&mut self, node_id: &str) -> MemberState {
        *self
            .nodes
            .entry(node_id.to_string())
            .or_insert(MemberState::Active)
    }

    fn set(&mut self, node_id: &str, state: MemberState) {
        self.nodes.insert(node_id.to_string(), state);
    }

    fn forget(&mut self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Follow the registry change an event produced.
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::MarkedDown(id) => self.set(&id.node_id, MemberState::Down),
            Outcome::MarkedReady(id) => self.set(&id.node_id, MemberState::Active),
            Outcome::Removed(id) => self.forget(&id.node_id),
            Outcome::Resolved(dup) => self.forget(&dup.removed_node_id),
            Outcome::Unchanged | Outcome::Skipped(_) => {}
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A duplicate hostname that was detected and resolved.
///
/// Informational: reported when the reconciler did its job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("hostname {hostname} has {count} live nodes; removed stale node {removed_node_id}")]
pub struct DuplicateNode {
    pub hostname: String,
    pub removed_node_id: NodeId,
    pub count: usize,
}

/// Why an event was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingHostname,
    UnknownNode,
    Storage(String),
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The event changed nothing in the registry.
    Unchanged,
    MarkedDown(WorkerIdentity),
    MarkedReady(WorkerIdentity),
    /// The orchestrator deleted the node.
    Removed(WorkerIdentity),
    Resolved(DuplicateNode),
    Skipped(SkipReason),
}

/// Why [`Reconciler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Shutdown,
    StreamEnded,
}

/// Applies lifecycle events to the registry.
pub struct Reconciler<P: DuplicatePolicy = HostnameCountPolicy> {
    registry: WorkerRegistry,
    policy: P,
    tracker: MemberTracker,
}

impl Reconciler<HostnameCountPolicy> {
    pub fn new(registry: WorkerRegistry) -> Self {
        Self::with_policy(registry, HostnameCountPolicy)
    }
}

impl<P: DuplicatePolicy> Reconciler<P> {
    pub fn with_policy(registry: WorkerRegistry, policy: P) -> Self {
        Self {
            registry,
            policy,
            tracker: MemberTracker::default(),
        }
    }

    pub fn tracker(&self) -> &MemberTracker {
        &self.tracker
    }

    /// Consume `events` until shutdown is signalled or the stream ends.
    ///
    /// Registry transactions commit synchronously, so on a multi-threaded
    /// runtime each event is applied under `block_in_place`. The
    /// subscription is closed before returning.
    pub async fn run(
        &mut self,
        mut events: EventSubscription,
        mut shutdown: watch::Receiver<bool>,
    ) -> RunExit {
        info!("reconciler started");
        let exit = loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => {
                        blocking(|| self.apply(&event));
                    }
                    None => {
                        warn!("node event stream ended");
                        break RunExit::StreamEnded;
                    }
                },
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break RunExit::Shutdown;
                }
            }
        };
        events.close();
        debug!(tracked = self.tracker.len(), "reconciler stopped");
        exit
    }

    /// Apply a single event. Never fails; problems are logged and reported
    /// as [`Outcome::Skipped`].
    pub fn apply(&mut self, event: &LifecycleEvent) -> Outcome {
        let Some(hostname) = event.hostname.as_deref().filter(|h| !h.is_empty()) else {
            warn!(node_id = %event.node_id, kind = ?event.kind, "node event without hostname, skipping");
            return Outcome::Skipped(SkipReason::MissingHostname);
        };
        let identity = WorkerIdentity::new(hostname, event.node_id.as_str());
        let previous = self.tracker.state(&identity.node_id);

        let outcome = if event.kind == EventKind::Remove {
            self.on_remove(&identity)
        } else {
            match event.state_new {
                Some(NodeState::Down) => self.on_down(&identity),
                Some(NodeState::Ready) => self.on_ready(&identity),
                _ => {
                    let state = self.tracker.observe(&identity.node_id);
                    debug!(worker = %identity, ?state, kind = ?event.kind, "node event observed");
                    Outcome::Unchanged
                }
            }
        };

        if let Outcome::Skipped(SkipReason::Storage(e)) = &outcome {
            warn!(worker = %identity, error = %e, "registry unavailable, skipping node event");
        }
        self.tracker.record(&outcome);
        debug!(worker = %identity, ?previous, now = ?self.tracker.state(&identity.node_id), ?outcome, "node event applied");
        outcome
    }

    fn on_down(&mut self, identity: &WorkerIdentity) -> Outcome {
        let record = match self.registry.get(identity) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(worker = %identity, "down event for node that never joined");
                return Outcome::Skipped(SkipReason::UnknownNode);
            }
            Err(e) => return Outcome::Skipped(SkipReason::Storage(e.to_string())),
        };
        if record.status == WorkerStatus::Removed {
            self.tracker.forget(&identity.node_id);
            return Outcome::Unchanged;
        }

        let count = match self.registry.count_by_hostname() {
            Ok(counts) => counts.get(&identity.hostname).copied().unwrap_or(0),
            Err(e) => return Outcome::Skipped(SkipReason::Storage(e.to_string())),
        };
        let members: Vec<WorkerRecord> = match self.registry.records_for_hostname(&identity.hostname) {
            Ok(records) => records.into_iter().filter(|r| r.status.is_member()).collect(),
            Err(e) => return Outcome::Skipped(SkipReason::Storage(e.to_string())),
        };

        let victim = self.policy.select_for_removal(&DuplicateContext {
            down: identity,
            hostname_count: count,
            members: &members,
        });

        match victim {
            Some(victim) => match self.registry.remove_node(&victim) {
                Ok(_) => {
                    let resolved = DuplicateNode {
                        hostname: victim.hostname.clone(),
                        removed_node_id: victim.node_id.clone(),
                        count,
                    };
                    info!(%resolved, "duplicate node resolved");
                    Outcome::Resolved(resolved)
                }
                Err(e) => Outcome::Skipped(SkipReason::Storage(e.to_string())),
            },
            None => match self.registry.mark_down(identity) {
                Ok(true) => Outcome::MarkedDown(identity.clone()),
                Ok(false) => Outcome::Unchanged,
                Err(e) if e.is_not_found() => Outcome::Skipped(SkipReason::UnknownNode),
                Err(e) => Outcome::Skipped(SkipReason::Storage(e.to_string())),
            },
        }
    }

    fn on_ready(&mut self, identity: &WorkerIdentity) -> Outcome {
        match self.registry.mark_ready(identity) {
            Ok(true) => Outcome::MarkedReady(identity.clone()),
            Ok(false) => Outcome::Unchanged,
            Err(e) if e.is_not_found() => {
                debug!(worker = %identity, "ready event for node that never joined");
                Outcome::Skipped(SkipReason::UnknownNode)
            }
            Err(e) => Outcome::Skipped(SkipReason::Storage(e.to_string())),
        }
    }

    fn on_remove(&mut self, identity: &WorkerIdentity) -> Outcome {
        match self.registry.remove_node(identity) {
            Ok(true) => Outcome::Removed(identity.clone()),
            Ok(false) => {
                self.tracker.forget(&identity.node_id);
                Outcome::Unchanged
            }
            Err(e) => Outcome::Skipped(SkipReason::Storage(e.to_string())),
        }
    }
}

/// Run synchronous registry work without stalling other tasks on a
/// multi-threaded runtime. Elsewhere (current-thread runtime, no runtime)
/// `f` runs inline.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn inventory() -> ResourceInventory {
        ResourceInventory {
            cpu_count: 8,
            ram_bytes: 34_359_738_368,
            gpus: vec![GpuDescriptor::new("GPU-abc123")],
            nfs_root: None,
            host: None,
        }
    }

    fn setup(nodes: &[(&str, &str)]) -> (Reconciler, WorkerRegistry) {
        let registry = WorkerRegistry::open_in_memory().unwrap();
        for (host, node) in nodes {
            registry
                .upsert(&WorkerIdentity::new(*host, *node), &inventory())
                .unwrap();
        }
        (Reconciler::new(registry.clone()), registry)
    }

    fn down(node: &str, host: &str) -> LifecycleEvent {
        LifecycleEvent::transition(node, host, NodeState::Ready, NodeState::Down)
    }

    fn ready(node: &str, host: &str) -> LifecycleEvent {
        LifecycleEvent::transition(node, host, NodeState::Down, NodeState::Ready)
    }

    fn status(registry: &WorkerRegistry, host: &str, node: &str) -> WorkerStatus {
        registry
            .get(&WorkerIdentity::new(host, node))
            .unwrap()
            .unwrap()
            .status
    }

    #[test]
    fn single_record_goes_down_not_removed() {
        let (mut rec, registry) = setup(&[("w1", "n1")]);
        let outcome = rec.apply(&down("n1", "w1"));
        assert_eq!(outcome, Outcome::MarkedDown(WorkerIdentity::new("w1", "n1")));
        assert_eq!(status(&registry, "w1", "n1"), WorkerStatus::Down);
        assert_eq!(rec.tracker().state("n1"), MemberState::Down);
    }

    #[test]
    fn down_duplicate_n2_removed_n1_untouched() {
        let (mut rec, registry) = setup(&[("w1", "n1"), ("w1", "n2")]);
        let outcome = rec.apply(&down("n2", "w1"));
        assert!(matches!(outcome, Outcome::Resolved(ref d) if d.removed_node_id == "n2"));
        assert_eq!(status(&registry, "w1", "n2"), WorkerStatus::Removed);
        assert_eq!(status(&registry, "w1", "n1"), WorkerStatus::Active);
    }

    #[test]
    fn down_duplicate_n1_removed_n2_untouched() {
        let (mut rec, registry) = setup(&[("w1", "n1"), ("w1", "n2")]);
        rec.apply(&down("n1", "w1"));
        assert_eq!(status(&registry, "w1", "n1"), WorkerStatus::Removed);
        assert_eq!(status(&registry, "w1", "n2"), WorkerStatus::Active);
    }

    #[test]
    fn repeated_down_event_is_idempotent() {
        let (mut rec, registry) = setup(&[("w1", "n1"), ("w1", "n2")]);
        rec.apply(&down("n1", "w1"));
        let again = rec.apply(&down("n1", "w1"));
        assert_eq!(again, Outcome::Unchanged);
        assert_eq!(status(&registry, "w1", "n2"), WorkerStatus::Active);
        assert_eq!(registry.count_by_hostname().unwrap().get("w1"), Some(&1));
    }

    #[test]
    fn ready_after_down_reactivates() {
        let (mut rec, registry) = setup(&[("w1", "n1")]);
        rec.apply(&down("n1", "w1"));
        let outcome = rec.apply(&ready("n1", "w1"));
        assert_eq!(outcome, Outcome::MarkedReady(WorkerIdentity::new("w1", "n1")));
        assert_eq!(status(&registry, "w1", "n1"), WorkerStatus::Active);
    }

    #[test]
    fn ready_does_not_resurrect_removed_duplicate() {
        let (mut rec, registry) = setup(&[("w1", "n1"), ("w1", "n2")]);
        rec.apply(&down("n1", "w1"));
        assert_eq!(rec.apply(&ready("n1", "w1")), Outcome::Unchanged);
        assert_eq!(status(&registry, "w1", "n1"), WorkerStatus::Removed);
        assert_eq!(rec.tracker().state("n1"), MemberState::Unknown);
    }

    #[test]
    fn rejoined_node_survives_its_own_outage_after_lone_down() {
        let (mut rec, registry) = setup(&[("w1", "n1")]);
        let n1 = WorkerIdentity::new("w1", "n1");
        let n2 = WorkerIdentity::new("w1", "n2");

        assert_eq!(rec.apply(&down("n1", "w1")), Outcome::MarkedDown(n1));
        registry.upsert(&n2, &inventory()).unwrap();

        // n1 is down, so n2 has no live duplicate and must not be removed.
        assert_eq!(rec.apply(&down("n2", "w1")), Outcome::MarkedDown(n2.clone()));
        assert_eq!(rec.apply(&ready("n2", "w1")), Outcome::MarkedReady(n2));

        assert_eq!(status(&registry, "w1", "n1"), WorkerStatus::Down);
        assert_eq!(status(&registry, "w1", "n2"), WorkerStatus::Active);
        let active = registry.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].node_id(), "n2");
    }

    #[test]
    fn tracker_forgets_removed_nodes() {
        let (mut rec, _) = setup(&[("w1", "n1"), ("w1", "n2"), ("w2", "n3")]);
        rec.apply(&down("n3", "w2"));
        rec.apply(&down("n1", "w1"));
        assert_eq!(rec.tracker().state("n3"), MemberState::Down);
        assert_eq!(rec.tracker().state("n1"), MemberState::Unknown);
        assert_eq!(rec.tracker().len(), 1);

        let mut gone = down("n3", "w2");
        gone.kind = EventKind::Remove;
        gone.state_new = None;
        rec.apply(&gone);
        assert!(rec.tracker().is_empty());
    }

    #[test]
    fn event_without_hostname_is_skipped() {
        let (mut rec, _) = setup(&[]);
        let mut event = down("n1", "w1");
        event.hostname = None;
        assert_eq!(rec.apply(&event), Outcome::Skipped(SkipReason::MissingHostname));
    }

    #[test]
    fn unknown_node_is_skipped_and_untracked() {
        let (mut rec, registry) = setup(&[]);
        assert_eq!(rec.apply(&down("n7", "w7")), Outcome::Skipped(SkipReason::UnknownNode));
        assert!(registry.list_all().unwrap().is_empty());
        assert_eq!(rec.tracker().state("n7"), MemberState::Unknown);

        let mut create = ready("n8", "w8");
        create.kind = EventKind::Create;
        create.state_new = None;
        assert_eq!(rec.apply(&create), Outcome::Unchanged);
        assert_eq!(rec.tracker().state("n8"), MemberState::Active);
    }

    #[test]
    fn orchestrator_remove_event_removes_node() {
        let (mut rec, registry) = setup(&[("w1", "n1")]);
        let mut event = down("n1", "w1");
        event.kind = EventKind::Remove;
        event.state_new = None;
        assert_eq!(rec.apply(&event), Outcome::Removed(WorkerIdentity::new("w1", "n1")));
        assert_eq!(status(&registry, "w1", "n1"), WorkerStatus::Removed);
    }

    #[test]
    fn custom_policy_is_honored() {
        struct NeverRemove;
        impl DuplicatePolicy for NeverRemove {
            fn select_for_removal(&self, _: &DuplicateContext<'_>) -> Option<WorkerIdentity> {
                None
            }
        }

        let registry = WorkerRegistry::open_in_memory().unwrap();
        for node in ["n1", "n2"] {
            registry.upsert(&WorkerIdentity::new("w1", node), &inventory()).unwrap();
        }
        let mut rec = Reconciler::with_policy(registry.clone(), NeverRemove);
        rec.apply(&down("n1", "w1"));
        assert_eq!(status(&registry, "w1", "n1"), WorkerStatus::Down);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_processes_in_order_until_stream_ends() {
        let (mut rec, registry) = setup(&[("w1", "n1")]);
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // Rejoin under n2, then the old node goes down.
        registry
            .upsert(&WorkerIdentity::new("w1", "n2"), &inventory())
            .unwrap();
        tx.send(down("n1", "w1")).await.unwrap();
        tx.send(down("n1", "w1")).await.unwrap();
        drop(tx);

        let exit = rec.run(EventSubscription::from_channel(rx), shutdown_rx).await;
        assert_eq!(exit, RunExit::StreamEnded);
        assert_eq!(status(&registry, "w1", "n1"), WorkerStatus::Removed);
        assert_eq!(status(&registry, "w1", "n2"), WorkerStatus::Active);
    }

    #[tokio::test]
    async fn run_inline_on_current_thread_runtime() {
        let (mut rec, registry) = setup(&[("w1", "n1")]);
        let (tx, rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tx.send(down("n1", "w1")).await.unwrap();
        drop(tx);

        let exit = rec.run(EventSubscription::from_channel(rx), shutdown_rx).await;
        assert_eq!(exit, RunExit::StreamEnded);
        assert_eq!(status(&registry, "w1", "n1"), WorkerStatus::Down);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_stops_on_shutdown() {
        let (mut rec, _) = setup(&[]);
        let (_tx, rx) = mpsc::channel::<LifecycleEvent>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            rec.run(EventSubscription::from_channel(rx), shutdown_rx).await
        });
        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), RunExit::Shutdown);
    }
}
