//! Host facts: hostname, CPU count, memory and platform.

use sysinfo::System;
use tracing::debug;

use swarmgrid_state::HostInfo;

/// Collect platform facts about the local host.
pub fn host_info() -> HostInfo {
    HostInfo {
        hostname: local_hostname(),
        os: std::env::consts::OS.to_string(),
        release: System::long_os_version().or_else(System::kernel_version),
        architecture: std::env::consts::ARCH.to_string(),
    }
}

/// The host's configured hostname.
pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

/// Logical CPUs available to this process, at least 1.
pub fn cpu_count() -> u32 {
    u32::try_from(num_cpus::get()).unwrap_or(u32::MAX).max(1)
}

/// Total physical RAM in bytes, or 0 when the platform does not report it.
pub fn total_memory_bytes() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        debug!("memory size unavailable");
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_info_describes_this_machine() {
        let info = host_info();
        assert_eq!(info.hostname, local_hostname());
        assert_eq!(info.os, std::env::consts::OS);
        assert!(!info.architecture.is_empty());
    }

    #[test]
    fn memory_and_cpus_are_reported() {
        assert!(total_memory_bytes() > 0);
        assert!(cpu_count() >= 1);
    }
}
