//! Domain types for the worker registry.
//!
//! These types describe who a worker is, what hardware it contributes and
//! where it stands in its lifecycle. All of them serialize to/from JSON,
//! both for storage in redb and for the join wire format.

use serde::{Deserialize, Serialize};

use crate::tables::KEY_SEPARATOR;

/// Orchestrator-assigned identifier of a swarm node.
pub type NodeId = String;

// ── Identity ──────────────────────────────────────────────────────

/// Stable identity of a worker.
///
/// The hostname is the deduplication key. The node id is assigned by the
/// orchestrator and changes when a host rejoins after an unclean leave.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub hostname: String,
    pub node_id: NodeId,
}

impl WorkerIdentity {
    pub fn new(hostname: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            node_id: node_id.into(),
        }
    }

    /// Build the composite key for the workers table.
    pub fn table_key(&self) -> String {
        format!("{}{KEY_SEPARATOR}{}", self.hostname, self.node_id)
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.hostname, self.node_id)
    }
}

/// Key prefix matching every record of a hostname.
pub fn hostname_prefix(hostname: &str) -> String {
    format!("{hostname}{KEY_SEPARATOR}")
}

// ── Inventory ─────────────────────────────────────────────────────

/// A single GPU.
///
/// The canonical id (e.g. `GPU-3b5e8a8c`) is the identity; the remaining
/// fields are descriptive and absent when the worker did not report them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GpuDescriptor {
    pub id: String,
    /// Device index as numbered by the driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Product name, e.g. `Tesla T4`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_total_mib: Option<u64>,
}

impl GpuDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            index: None,
            name: None,
            memory_total_mib: None,
        }
    }
}

/// Facts about a worker's host, reported with its inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    /// Operating system family, e.g. `linux`.
    pub os: String,
    /// OS release or kernel version, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    pub architecture: String,
}

/// Hardware a worker contributes to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInventory {
    /// Logical CPU count (at least 1 for a valid inventory).
    pub cpu_count: u32,
    /// Total RAM in bytes.
    pub ram_bytes: u64,
    /// GPUs in canonical, sorted order. Empty for CPU-only workers.
    #[serde(default)]
    pub gpus: Vec<GpuDescriptor>,
    /// Root of the worker's NFS export, if it shares storage.
    #[serde(default)]
    pub nfs_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostInfo>,
}

impl ResourceInventory {
    /// GPU ids in stored order.
    pub fn gpu_ids(&self) -> Vec<&str> {
        self.gpus.iter().map(|g| g.id.as_str()).collect()
    }
}

// ── Record ────────────────────────────────────────────────────────

/// Lifecycle status of a worker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Known to the orchestrator but not yet joined through the registry.
    Pending,
    /// Joined and reachable.
    Active,
    /// Not refreshed recently; still counted as a member.
    Stale,
    /// The orchestrator reports the node down.
    Down,
    /// Logically deleted.
    Removed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Active => "active",
            WorkerStatus::Stale => "stale",
            WorkerStatus::Down => "down",
            WorkerStatus::Removed => "removed",
        }
    }

    /// Whether the record still counts as a cluster member.
    pub fn is_member(&self) -> bool {
        !matches!(self, WorkerStatus::Removed)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The registry's unit of storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub identity: WorkerIdentity,
    pub inventory: ResourceInventory,
    pub status: WorkerStatus,
    /// Unix timestamp (seconds) of the most recent join.
    pub last_seen: u64,
    /// Address the worker joined from, as seen by the manager.
    #[serde(default)]
    pub external_addr: Option<String>,
}

impl WorkerRecord {
    pub fn table_key(&self) -> String {
        self.identity.table_key()
    }

    pub fn hostname(&self) -> &str {
        &self.identity.hostname
    }

    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }
}
