//! Read-only host introspection: architecture, CPU, memory, disk, bridge
//! presence, and uptime. Nothing here mutates host state.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, System};

/// A snapshot of host state, as seen at the moment `inspect()` was called.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    /// Raw architecture string, e.g. `"x86_64"`; not yet catalog-normalized.
    pub arch: String,
    /// Logical CPU count.
    pub cpu_count: usize,
    /// Total RAM, in megabytes.
    pub memory_total_mb: u64,
    /// Available RAM, in megabytes.
    pub memory_available_mb: u64,
    /// Total space on the filesystem backing the machines directory, in
    /// megabytes.
    pub disk_total_mb: u64,
    /// Available space on the filesystem backing the machines directory, in
    /// megabytes.
    pub disk_available_mb: u64,
    /// Whether the configured bridge interface exists on the host.
    pub bridge_present: bool,
    /// Host uptime, in seconds.
    pub uptime_seconds: u64,
}

/// Queries host state for the Provisioning Pipeline's `detect_arch` stage
/// and for any external caller wanting a capacity snapshot.
#[derive(Debug)]
pub struct HostInspector {
    bridge: String,
}

impl HostInspector {
    /// Build an inspector that checks for the presence of `bridge`.
    pub fn new(bridge: impl Into<String>) -> Self {
        Self { bridge: bridge.into() }
    }

    /// The host's raw architecture string, before catalog normalization.
    pub fn arch(&self) -> &'static str {
        std::env::consts::ARCH
    }

    /// Take a full snapshot of host state.
    pub fn inspect(&self, machines_dir: &Utf8Path) -> HostInfo {
        let mut sys = System::new_all();
        sys.refresh_all();

        let disks = Disks::new_with_refreshed_list();
        let (disk_total_mb, disk_available_mb) = disks
            .iter()
            .filter(|d| machines_dir.as_str().starts_with(&*d.mount_point().to_string_lossy()))
            .max_by_key(|d| d.mount_point().to_string_lossy().len())
            .map(|d| (d.total_space() / 1024 / 1024, d.available_space() / 1024 / 1024))
            .unwrap_or((0, 0));

        let networks = Networks::new_with_refreshed_list();
        let bridge_present = networks.iter().any(|(name, _)| name == &self.bridge);

        HostInfo {
            arch: self.arch().to_string(),
            cpu_count: sys.cpus().len(),
            memory_total_mb: sys.total_memory() / 1024 / 1024,
            memory_available_mb: sys.available_memory() / 1024 / 1024,
            disk_total_mb,
            disk_available_mb,
            bridge_present,
            uptime_seconds: System::uptime(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_matches_env_consts() {
        let inspector = HostInspector::new("br0");
        assert_eq!(inspector.arch(), std::env::consts::ARCH);
    }

    #[test]
    fn test_inspect_returns_nonzero_cpu_and_memory() {
        let inspector = HostInspector::new("br0");
        let info = inspector.inspect(Utf8Path::new("/"));
        assert!(info.cpu_count >= 1);
        assert!(info.memory_total_mb > 0);
    }
}
