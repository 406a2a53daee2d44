//! swarmgrid-inventory: describe the hardware of a worker host.
//!
//! Runs on the worker before it joins, without touching the network.
//! The result is a [`ResourceInventory`](swarmgrid_state::ResourceInventory)
//! that the worker sends to the manager's join endpoint.
//!
//! Discovery never fails as a whole. A missing `nvidia-smi` degrades to an
//! empty GPU list and a non-existent NFS root is left out. RAM and platform
//! facts come from `sysinfo`.
//!
//! GPU ids are canonicalized (see [`canonical_gpu_id`]), deduplicated and
//! sorted, so two builds on unchanged hardware are sequence-equal. Each GPU
//! keeps the index, name and memory size reported by the driver.

pub mod builder;
pub mod gpu;
pub mod host;

pub use builder::{build, build_with};
pub use gpu::{canonical_gpu_id, parse_nvidia_smi, GpuSource, NvidiaGpu, NvidiaSmi};
pub use host::host_info;
