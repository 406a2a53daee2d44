//! Node lifecycle events and the subscription that delivers them.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use swarmgrid_state::NodeId;

/// What happened to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Remove,
    Other(String),
}

impl EventKind {
    fn parse(action: &str) -> Self {
        match action {
            "create" => EventKind::Create,
            "update" => EventKind::Update,
            "remove" => EventKind::Remove,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// Health state of a swarm node as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unknown,
    Down,
    Ready,
    Disconnected,
}

impl NodeState {
    pub fn parse(s: &str) -> Self {
        match s {
            "down" => NodeState::Down,
            "ready" => NodeState::Ready,
            "disconnected" => NodeState::Disconnected,
            _ => NodeState::Unknown,
        }
    }
}

/// A node lifecycle event, consumed once and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub node_id: NodeId,
    pub hostname: Option<String>,
    pub state_old: Option<NodeState>,
    pub state_new: Option<NodeState>,
    /// Unix timestamp (seconds) the orchestrator stamped on the event.
    pub timestamp: u64,
}

impl LifecycleEvent {
    /// A `node_update` health transition, mostly for tests and replays.
    pub fn transition(node_id: &str, hostname: &str, old: NodeState, new: NodeState) -> Self {
        Self {
            kind: EventKind::Update,
            node_id: node_id.to_string(),
            hostname: Some(hostname.to_string()),
            state_old: Some(old),
            state_new: Some(new),
            timestamp: 0,
        }
    }

    /// Convert a Docker Engine event. Non-node events yield `None`.
    pub fn from_docker(event: DockerEvent) -> Option<Self> {
        if event.kind != "node" {
            return None;
        }
        let mut attrs = event.actor.attributes;
        let hostname = attrs.remove("name").or_else(|| attrs.remove("hostname"));
        Some(Self {
            kind: EventKind::parse(&event.action),
            node_id: event.actor.id,
            hostname,
            state_old: attrs.get("state.old").map(|s| NodeState::parse(s)),
            state_new: attrs.get("state.new").map(|s| NodeState::parse(s)),
            timestamp: event.time,
        })
    }

    /// Parse one line of the Docker `/events` stream.
    pub fn from_docker_line(line: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        let event: DockerEvent = serde_json::from_slice(line)?;
        Ok(Self::from_docker(event))
    }
}

/// Raw event as emitted by the Docker Engine API.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerEvent {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Actor")]
    pub actor: DockerActor,
    #[serde(default)]
    pub time: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerActor {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

// ── Subscription ──────────────────────────────────────────────────

/// A live, cancellable stream of lifecycle events.
///
/// `next()` waits for the next event; it returns `None` once the producer
/// has stopped. Closing (or dropping) the subscription stops the producer
/// and releases its connection.
pub struct EventSubscription {
    rx: mpsc::Receiver<LifecycleEvent>,
    producer: Option<JoinHandle<()>>,
}

impl EventSubscription {
    pub fn new(rx: mpsc::Receiver<LifecycleEvent>, producer: JoinHandle<()>) -> Self {
        Self {
            rx,
            producer: Some(producer),
        }
    }

    /// A subscription fed directly through a channel.
    pub fn from_channel(rx: mpsc::Receiver<LifecycleEvent>) -> Self {
        Self { rx, producer: None }
    }

    /// Wait for the next event.
    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        self.rx.recv().await
    }

    /// Stop the producer. Safe to call more than once.
    pub fn close(&mut self) {
        self.rx.close();
        if let Some(producer) = self.producer.take() {
            producer.abort();
            debug!("event subscription closed");
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.close();
    }
}
