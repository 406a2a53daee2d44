//! Join service. Validates a worker's self-reported inventory and
//! records it in the registry.
//!
//! The service holds no state of its own beyond the registry handle, so it
//! is safe to restart at any time. It never retries: a worker whose join
//! fails with a storage error is expected to back off and call again.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use swarmgrid_state::*;

/// Identity a worker claims for itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaim {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub node_id: String,
}

/// Body of `POST /join`.
///
/// `cpu_count` is signed so that zero and negative counts reach validation
/// and are reported by field name. A negative `ram_bytes` already fails
/// deserialization.
///
/// `gpu_ids` lists the canonical GPU ids. `gpus` optionally carries the
/// driver details of those same ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(alias = "identity")]
    pub identity_claim: IdentityClaim,
    pub cpu_count: i64,
    pub ram_bytes: u64,
    #[serde(default)]
    pub gpu_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<GpuDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostInfo>,
}

impl JoinRequest {
    /// Build a request from an identity and an inventory.
    pub fn new(identity: &WorkerIdentity, inventory: &ResourceInventory) -> Self {
        Self {
            identity_claim: IdentityClaim {
                hostname: identity.hostname.clone(),
                node_id: identity.node_id.clone(),
            },
            cpu_count: i64::from(inventory.cpu_count),
            ram_bytes: inventory.ram_bytes,
            gpu_ids: inventory.gpus.iter().map(|g| g.id.clone()).collect(),
            gpus: inventory.gpus.clone(),
            nfs_root: inventory.nfs_root.clone(),
            host: inventory.host.clone(),
        }
    }
}

/// Successful join acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAck {
    pub status: WorkerStatus,
}

/// A single rejected field of a join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors returned by [`JoinService::join`].
#[derive(Debug, Error)]
pub enum JoinError {
    /// The request was malformed. Nothing was written.
    #[error("invalid join request: {}", describe_fields(.0))]
    Validation(Vec<FieldError>),

    /// The registry failed. Passed through from the store unchanged.
    #[error(transparent)]
    Registry(#[from] StateError),
}

impl JoinError {
    /// Names of the offending fields, for validation errors.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            JoinError::Validation(errors) => errors.iter().map(|e| e.field.as_str()).collect(),
            JoinError::Registry(_) => Vec::new(),
        }
    }
}

fn describe_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{} {}", e.field, e.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Accepts worker joins and upserts them into the registry.
#[derive(Clone)]
pub struct JoinService {
    registry: WorkerRegistry,
}

impl JoinService {
    pub fn new(registry: WorkerRegistry) -> Self {
        Self { registry }
    }

    /// Validate `request` and record it.
    ///
    /// `external_addr` is the address the request arrived from, if known.
    pub async fn join(
        &self,
        request: JoinRequest,
        external_addr: Option<String>,
    ) -> Result<JoinAck, JoinError> {
        let (identity, inventory) = validate(&request).map_err(|errors| {
            warn!(
                hostname = %request.identity_claim.hostname,
                fields = %describe_fields(&errors),
                "join rejected"
            );
            JoinError::Validation(errors)
        })?;

        debug!(worker = %identity, "join accepted, writing registry");

        let registry = self.registry.clone();
        let worker = identity.clone();
        let record = tokio::task::spawn_blocking(move || {
            registry.upsert_at(&worker, &inventory, epoch_secs(), external_addr)
        })
        .await
        .map_err(|e| StateError::Storage(format!("registry task failed: {e}")))??;

        info!(worker = %identity, status = %record.status, "worker joined");
        Ok(JoinAck {
            status: record.status,
        })
    }
}

/// Check a join request and convert it to registry types.
///
/// Every offending field is reported, not just the first.
pub fn validate(
    request: &JoinRequest,
) -> Result<(WorkerIdentity, ResourceInventory), Vec<FieldError>> {
    let mut errors = Vec::new();
    let claim = &request.identity_claim;

    let hostname = claim.hostname.trim();
    if hostname.is_empty() {
        errors.push(FieldError::new("identity_claim.hostname", "must not be empty"));
    } else if hostname.contains('/') {
        errors.push(FieldError::new("identity_claim.hostname", "must not contain '/'"));
    }
    if claim.node_id.trim().is_empty() {
        errors.push(FieldError::new("identity_claim.node_id", "must not be empty"));
    }

    let cpu_count = match u32::try_from(request.cpu_count) {
        Ok(n) if n >= 1 => n,
        _ => {
            errors.push(FieldError::new(
                "cpu_count",
                format!("must be at least 1, got {}", request.cpu_count),
            ));
            0
        }
    };

    let mut seen = std::collections::HashSet::new();
    for gpu in &request.gpu_ids {
        if gpu.trim().is_empty() {
            errors.push(FieldError::new("gpu_ids", "contains an empty identifier"));
        } else if !seen.insert(gpu.as_str()) {
            errors.push(FieldError::new("gpu_ids", format!("duplicate identifier {gpu}")));
        }
    }
    for detail in &request.gpus {
        if !seen.contains(detail.id.as_str()) {
            errors.push(FieldError::new(
                "gpus",
                format!("details for unlisted identifier {}", detail.id),
            ));
        }
    }

    if matches!(&request.nfs_root, Some(root) if root.trim().is_empty()) {
        errors.push(FieldError::new("nfs_root", "must not be empty when present"));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let identity = WorkerIdentity::new(hostname, claim.node_id.trim());
    let gpus = request
        .gpu_ids
        .iter()
        .map(|id| {
            request
                .gpus
                .iter()
                .find(|detail| detail.id == *id)
                .cloned()
                .unwrap_or_else(|| GpuDescriptor::new(id))
        })
        .collect();
    let inventory = ResourceInventory {
        cpu_count,
        ram_bytes: request.ram_bytes,
        gpus,
        nfs_root: request.nfs_root.clone(),
        host: request.host.clone(),
    };
    Ok((identity, inventory))
}
