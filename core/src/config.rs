//! Process configuration, built once from the environment at startup and
//! threaded explicitly through constructors — never stored in a global.

use std::time::Duration;

use camino::Utf8PathBuf;

/// Per-call timeouts for the Host Invoker, overridable via environment for
/// testing and unusually slow hosts. Defaults match spec §4.1/§11.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Timeout for `bootstrap_rootfs`.
    pub bootstrap: Duration,
    /// Timeout for package-install stages (`install_ssh`, `configure_wireguard`).
    pub package_install: Duration,
    /// Timeout for machine-manager operations (start/stop/restart/list).
    pub machine_manager: Duration,
    /// Timeout for firewall operations.
    pub firewall: Duration,
    /// Timeout for generic file operations (`detect_arch`, `prepare_dir`,
    /// `set_root_password`, `configure_network`, `write_host_unit`).
    pub file_op: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            bootstrap: Duration::from_secs(1800),
            package_install: Duration::from_secs(300),
            machine_manager: Duration::from_secs(60),
            firewall: Duration::from_secs(10),
            file_op: Duration::from_secs(5),
        }
    }
}

/// Process-wide configuration, constructed once at startup from the
/// environment and passed explicitly to every component that needs it.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bind address for the (out-of-scope) HTTP surface; carried here only
    /// because it is read from the same environment at the same time.
    pub host: String,
    /// Bind port for the (out-of-scope) HTTP surface.
    pub port: u16,
    /// Root directory under which each container's root filesystem lives,
    /// e.g. `/var/lib/machines/<name>`.
    pub machines_dir: Utf8PathBuf,
    /// Directory holding per-container host unit files.
    pub units_dir: Utf8PathBuf,
    /// Directory holding the core's own persisted state (port-forward store).
    pub state_dir: Utf8PathBuf,
    /// The host bridge interface new containers attach to.
    pub bridge: String,
    /// Per-call Host Invoker timeouts.
    pub timeouts: Timeouts,
}

impl OrchestratorConfig {
    /// Build configuration from environment variables, falling back to the
    /// documented defaults (spec §6, §9 Open Questions: bridge fixed at
    /// `br0`, HTTP port fixed at `8080`).
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            machines_dir: std::env::var("MACHINES_DIR")
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|_| Utf8PathBuf::from("/var/lib/machines")),
            units_dir: std::env::var("UNITS_DIR")
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|_| Utf8PathBuf::from("/etc/systemd/nspawn")),
            state_dir: std::env::var("STATE_DIR")
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|_| Utf8PathBuf::from("/var/lib/orchestrator")),
            bridge: std::env::var("ORCHESTRATOR_BRIDGE").unwrap_or_else(|_| "br0".to_string()),
            timeouts: Timeouts::default(),
        }
    }

    /// The container's root filesystem directory.
    pub fn container_dir(&self, name: &str) -> Utf8PathBuf {
        self.machines_dir.join(name)
    }

    /// The container's host unit file path.
    pub fn unit_path(&self, name: &str) -> Utf8PathBuf {
        self.units_dir.join(format!("{name}.nspawn"))
    }

    /// The port-forward store's persisted file path.
    pub fn port_forward_store_path(&self) -> Utf8PathBuf {
        self.state_dir.join("port_forwards.json")
    }
}
