//! GPU discovery through `nvidia-smi`.

use std::process::Command;

use tracing::{debug, warn};

/// Fields requested from `nvidia-smi`, in column order.
const QUERY_FIELDS: &str = "index,uuid,name,memory.total";

/// Prefix of every canonical GPU id.
pub const GPU_ID_PREFIX: &str = "GPU-";

/// Hex digits of the device UUID kept in a canonical id.
pub const GPU_ID_HEX_DIGITS: usize = 8;

/// One row of `nvidia-smi` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvidiaGpu {
    pub index: u32,
    pub uuid: String,
    pub name: String,
    /// Total memory in MiB.
    pub memory_total_mib: u64,
}

/// Source of the GPUs attached to the local host.
pub trait GpuSource {
    /// List the GPUs. Implementations absorb their own failures and return
    /// an empty list instead.
    fn list_gpus(&self) -> Vec<NvidiaGpu>;
}

/// Source backed by the `nvidia-smi` binary.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    binary: String,
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmi {
    /// Use a specific `nvidia-smi` binary path.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl GpuSource for NvidiaSmi {
    fn list_gpus(&self) -> Vec<NvidiaGpu> {
        let output = Command::new(&self.binary)
            .arg(format!("--query-gpu={QUERY_FIELDS}"))
            .arg("--format=csv,noheader,nounits")
            .output();

        match output {
            Ok(out) if out.status.success() => {
                parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                warn!(
                    binary = %self.binary,
                    status = %out.status,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "nvidia-smi failed, reporting no GPUs"
                );
                Vec::new()
            }
            Err(e) => {
                debug!(binary = %self.binary, error = %e, "nvidia-smi unavailable, reporting no GPUs");
                Vec::new()
            }
        }
    }
}

/// Parse `--format=csv,noheader,nounits` output of the query in [`QUERY_FIELDS`].
///
/// Malformed rows are skipped.
pub fn parse_nvidia_smi(output: &str) -> Vec<NvidiaGpu> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            let [index, uuid, name, memory] = cols.as_slice() else {
                debug!(%line, "skipping malformed nvidia-smi row");
                return None;
            };
            Some(NvidiaGpu {
                index: index.parse().ok()?,
                uuid: uuid.to_string(),
                name: name.to_string(),
                memory_total_mib: memory.parse().unwrap_or(0),
            })
        })
        .collect()
}

/// Normalize a device UUID to its fixed-width canonical id.
///
/// `GPU-3B5E8A8C-1d2f-4c6e-9a0b-112233445566` becomes `GPU-3b5e8a8c`. The
/// `GPU-` prefix is optional on input. Returns `None` when fewer than
/// [`GPU_ID_HEX_DIGITS`] hex digits are present or a non-hex character
/// appears before them.
pub fn canonical_gpu_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let body = match raw.get(..GPU_ID_PREFIX.len()) {
        Some(p) if p.eq_ignore_ascii_case(GPU_ID_PREFIX) => &raw[GPU_ID_PREFIX.len()..],
        _ => raw,
    };

    let mut digits = String::with_capacity(GPU_ID_HEX_DIGITS);
    for c in body.chars().filter(|c| *c != '-') {
        if digits.len() == GPU_ID_HEX_DIGITS {
            break;
        }
        if !c.is_ascii_hexdigit() {
            return None;
        }
        digits.push(c.to_ascii_lowercase());
    }

    (digits.len() == GPU_ID_HEX_DIGITS).then(|| format!("{GPU_ID_PREFIX}{digits}"))
}
