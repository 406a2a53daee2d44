//! Assemble a [`ResourceInventory`] for the local host.

use std::collections::BTreeMap;
use std::path::Path;

use swarmgrid_state::{GpuDescriptor, ResourceInventory};
use tracing::{debug, info, warn};

use crate::gpu::{canonical_gpu_id, GpuSource, NvidiaSmi};
use crate::host;

/// Build the inventory of the local host using `nvidia-smi` for GPUs.
pub fn build(nfs_root: Option<&Path>) -> ResourceInventory {
    build_with(&NvidiaSmi::default(), nfs_root)
}

/// Build the inventory of the local host with a custom GPU source.
pub fn build_with(source: &dyn GpuSource, nfs_root: Option<&Path>) -> ResourceInventory {
    let inventory = ResourceInventory {
        cpu_count: host::cpu_count(),
        ram_bytes: host::total_memory_bytes(),
        gpus: collect_gpus(source),
        nfs_root: nfs_root.and_then(checked_nfs_root),
        host: Some(host::host_info()),
    };
    info!(
        cpus = inventory.cpu_count,
        ram_bytes = inventory.ram_bytes,
        gpus = inventory.gpus.len(),
        nfs_root = ?inventory.nfs_root,
        "resource inventory built"
    );
    inventory
}

/// Canonical, deduplicated, sorted GPU descriptors.
///
/// When two devices canonicalize to the same id the first one reported
/// keeps its details.
fn collect_gpus(source: &dyn GpuSource) -> Vec<GpuDescriptor> {
    let mut gpus = BTreeMap::new();
    for gpu in source.list_gpus() {
        let Some(id) = canonical_gpu_id(&gpu.uuid) else {
            warn!(uuid = %gpu.uuid, index = gpu.index, "ignoring GPU with unrecognized uuid");
            continue;
        };
        gpus.entry(id.clone()).or_insert_with(|| GpuDescriptor {
            index: Some(gpu.index),
            name: Some(gpu.name).filter(|n| !n.is_empty()),
            memory_total_mib: Some(gpu.memory_total_mib),
            ..GpuDescriptor::new(id)
        });
    }
    gpus.into_values().collect()
}

fn checked_nfs_root(path: &Path) -> Option<String> {
    if path.is_dir() {
        Some(path.to_string_lossy().to_string())
    } else {
        debug!(?path, "nfs root is not a directory, omitting it");
        None
    }
}
