//! Orchestrates the Filesystem Mutator operations (spec §4.2): everything
//! that reshapes a freshly bootstrapped root filesystem, plus writing the
//! host-side unit file that declares a container's resource caps. Delegates
//! the pure file-editing work to `orchestrator_rootfs` and only reaches for
//! the Host Invoker when a package actually needs installing inside the
//! guest (SSH, WireGuard).

use std::collections::HashMap;
use std::time::Duration;

use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;

use crate::error::{OrchestratorError, Result};
use crate::invoker::HostInvoker;
use crate::spec::Ipv6Policy;

/// Set the root account's password by writing `etc/shadow` directly inside
/// `root`. Never boots the guest.
pub fn set_root_password(root: &Dir, password: &str) -> Result<()> {
    orchestrator_rootfs::set_root_password(root, password)
        .map_err(|e| OrchestratorError::PasswordFailed(e.to_string()))
}

/// Configure DNS and write the network unit inside `root`.
pub fn configure_network(root: &Dir, bridge: &str, ipv6: Ipv6Policy) -> Result<()> {
    orchestrator_rootfs::configure_dns(root).map_err(|e| OrchestratorError::NetworkFailed(e.to_string()))?;
    orchestrator_rootfs::write_network_unit(root, bridge, ipv6.network_mode())
        .map_err(|e| OrchestratorError::NetworkFailed(e.to_string()))
}

/// Run a staged install script inside the guest, non-interactively and
/// unregistered, with the host's `/etc/resolv.conf` bound in read-only so
/// package-manager DNS resolution works.
async fn run_staged_script(
    invoker: &dyn HostInvoker,
    root_path: &Utf8Path,
    script_path: &str,
    timeout: Duration,
) -> Result<crate::invoker::CommandOutcome> {
    let directive = format!("--directory={root_path}");
    let script_arg = format!("/{script_path}");
    invoker
        .run(
            &[
                "systemd-nspawn",
                directive.as_str(),
                "--register=no",
                "--resolv-conf=bind-host",
                "--pipe",
                "/bin/sh",
                script_arg.as_str(),
            ],
            None,
            timeout,
            None::<&HashMap<String, String>>,
        )
        .await
}

/// Stage and run the SSH install script inside `root`.
pub async fn install_ssh(
    invoker: &dyn HostInvoker,
    root_path: &Utf8Path,
    root: &Dir,
    timeout: Duration,
) -> Result<()> {
    orchestrator_rootfs::install_ssh_script(root)
        .map_err(|e| OrchestratorError::SshFailed(e.to_string()))?;
    let outcome = run_staged_script(invoker, root_path, orchestrator_rootfs::SSH_INSTALL_SCRIPT_PATH, timeout)
        .await
        .map_err(|e| match e {
            OrchestratorError::Timeout(d) => OrchestratorError::SshFailed(format!("timed out after {d:?}")),
            other => OrchestratorError::SshFailed(other.to_string()),
        })?;
    if !outcome.success() {
        return Err(OrchestratorError::SshFailed(outcome.stderr_tail(20)));
    }
    Ok(())
}

/// Write the WireGuard config into `root` and run its install script.
pub async fn configure_wireguard(
    invoker: &dyn HostInvoker,
    root_path: &Utf8Path,
    root: &Dir,
    config: &str,
    timeout: Duration,
) -> Result<()> {
    orchestrator_rootfs::write_wireguard_config(root, config)
        .map_err(|e| OrchestratorError::WireGuardFailed(e.to_string()))?;
    let outcome = run_staged_script(
        invoker,
        root_path,
        orchestrator_rootfs::WIREGUARD_INSTALL_SCRIPT_PATH,
        timeout,
    )
    .await
    .map_err(|e| match e {
        OrchestratorError::Timeout(d) => OrchestratorError::WireGuardFailed(format!("timed out after {d:?}")),
        other => OrchestratorError::WireGuardFailed(other.to_string()),
    })?;
    if !outcome.success() {
        return Err(OrchestratorError::WireGuardFailed(outcome.stderr_tail(20)));
    }
    Ok(())
}

/// Render and write the host-side container unit file declaring the bridge
/// attachment, capability set, and resource caps.
///
/// The capability set is the minimum needed to run as a guest: `CAP_NET_ADMIN`
/// so the guest can configure its own network interface (DHCP, and the
/// in-guest WireGuard tunnel when enabled), with `CAP_SYS_MODULE` and
/// `CAP_SYS_TIME` explicitly dropped since a guest never needs to load
/// kernel modules or change the host clock.
///
/// Disk quota enforcement is filesystem-feature-dependent best effort (spec
/// §9 Open Questions): the cap is always recorded in the unit file as a
/// comment, never silently dropped, but is not wired to an enforcement
/// mechanism here.
pub fn write_host_unit(
    unit_path: &Utf8Path,
    bridge: &str,
    cpu_quota_percent: u32,
    memory_mb: u32,
    disk_gb: u32,
) -> Result<()> {
    let contents = indoc::formatdoc! {"
        [Exec]
        Boot=yes
        Capability=CAP_NET_ADMIN
        DropCapability=CAP_SYS_MODULE CAP_SYS_TIME

        [Network]
        Bridge={bridge}

        [Files]
        Bind=/etc/resolv.conf:/etc/resolv.conf

        # Resource caps, applied to the systemd-nspawn@<name>.service slice.
        CPUQuota={cpu_quota_percent}%
        MemoryMax={memory_mb}M
        # DiskQuota={disk_gb}G (best-effort; requires filesystem quota support)
    "};

    let tmp_path = unit_path.with_extension("nspawn.tmp");
    std::fs::write(&tmp_path, contents).map_err(|e| OrchestratorError::UnitFailed(e.to_string()))?;
    std::fs::rename(&tmp_path, unit_path).map_err(|e| OrchestratorError::UnitFailed(e.to_string()))?;
    Ok(())
}
