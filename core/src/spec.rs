//! The data model an external caller hands to, and receives back from, the
//! core: the provisioning input (`ContainerSpec`) and the observable
//! resting state of an existing container (`ContainerRecord`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// How a container's IPv6 connectivity is provided.
///
/// `Wireguard` requires a non-empty `ContainerSpec::wireguard_config`; the
/// other three variants never touch that field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ipv6Policy {
    /// No IPv6 configuration on the bridge interface.
    Disabled,
    /// Accept router advertisements on the bridge interface.
    Native,
    /// 6in4 tunneling; treated like `Native` at the network-unit level.
    Sixin4,
    /// A WireGuard tunnel inside the guest carries IPv6; the bridge
    /// interface itself is left without router-advertisement acceptance.
    Wireguard,
}

impl Ipv6Policy {
    /// The `orchestrator_rootfs::Ipv6Mode` the Filesystem Mutator's network
    /// unit should be written with. `Wireguard` maps to `Disabled` because
    /// the tunnel lives entirely inside the guest (spec §6).
    pub fn network_mode(self) -> orchestrator_rootfs::Ipv6Mode {
        match self {
            Ipv6Policy::Disabled | Ipv6Policy::Wireguard => orchestrator_rootfs::Ipv6Mode::Disabled,
            Ipv6Policy::Native | Ipv6Policy::Sixin4 => orchestrator_rootfs::Ipv6Mode::AcceptRa,
        }
    }
}

/// Input to provisioning. Immutable once submitted to the Provisioning
/// Pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Lowercase identifier; also the `container_id` used everywhere else.
    pub name: String,
    /// `"<distro>:<release>"`, e.g. `"debian:bookworm"` or `"ubuntu:22.04"`.
    pub distro: String,
    /// Plaintext root password. Used exactly once to derive a shadow hash,
    /// then discarded; never persisted, logged, or echoed back.
    pub root_password: String,
    /// 25–400; 100 means one full core.
    pub cpu_quota_percent: u32,
    /// 256–8192.
    pub memory_mb: u32,
    /// 5–100.
    pub disk_gb: u32,
    /// Whether the `install_ssh` stage runs.
    pub enable_ssh: bool,
    /// IPv6 connectivity policy.
    pub ipv6: Ipv6Policy,
    /// Required, non-empty after trimming, when `ipv6 == Wireguard`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireguard_config: Option<String>,
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }
    let rest: Vec<char> = chars.collect();
    rest.len() <= 62 && rest.iter().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
}

impl ContainerSpec {
    /// Validate every §3 constraint. Returns the first violation found.
    pub fn validate(&self) -> Result<()> {
        if !valid_name(&self.name) {
            return Err(OrchestratorError::ValidationError(format!(
                "name {:?} must match ^[a-z][a-z0-9-]{{0,62}}$",
                self.name
            )));
        }
        if self.root_password.len() < 8 {
            return Err(OrchestratorError::ValidationError(
                "root_password must be at least 8 characters".to_string(),
            ));
        }
        if !(25..=400).contains(&self.cpu_quota_percent) {
            return Err(OrchestratorError::ValidationError(format!(
                "cpu_quota_percent {} out of range 25..=400",
                self.cpu_quota_percent
            )));
        }
        if !(256..=8192).contains(&self.memory_mb) {
            return Err(OrchestratorError::ValidationError(format!(
                "memory_mb {} out of range 256..=8192",
                self.memory_mb
            )));
        }
        if !(5..=100).contains(&self.disk_gb) {
            return Err(OrchestratorError::ValidationError(format!(
                "disk_gb {} out of range 5..=100",
                self.disk_gb
            )));
        }
        if matches!(self.ipv6, Ipv6Policy::Wireguard) {
            let empty = self
                .wireguard_config
                .as_deref()
                .map(|c| c.trim().is_empty())
                .unwrap_or(true);
            if empty {
                return Err(OrchestratorError::ValidationError(
                    "wireguard_config is required and must be non-empty when ipv6=wireguard"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Observed run state of a container, queried from the machine manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// The machine manager reports the container running.
    Running,
    /// The machine manager reports the container stopped.
    Stopped,
    /// The container exists but the machine manager reports an error state.
    Failed,
    /// Status could not be determined.
    Unknown,
}

/// Observable state of an existing container: the authored part (echoed
/// from the spec that created it) plus the always-re-queried live part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Equal to `ContainerSpec.name`.
    pub name: String,
    /// Live status, re-queried from the machine manager on every read.
    pub status: ContainerStatus,
    /// Echoed from the spec that created this container.
    pub distro: String,
    /// Echoed from the spec that created this container.
    pub cpu_quota_percent: u32,
    /// Echoed from the spec that created this container.
    pub memory_mb: u32,
    /// Echoed from the spec that created this container.
    pub disk_gb: u32,
    /// Live network addresses, re-queried from the machine manager.
    pub addresses: Vec<String>,
    /// When the container was created, persisted alongside the spec echo.
    pub created_at: DateTime<Utc>,
    /// Live uptime, `None` if not currently running.
    pub uptime_seconds: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> ContainerSpec {
        ContainerSpec {
            name: "alpha".to_string(),
            distro: "debian:bookworm".to_string(),
            root_password: "hunter2!".to_string(),
            cpu_quota_percent: 100,
            memory_mb: 512,
            disk_gb: 10,
            enable_ssh: true,
            ipv6: Ipv6Policy::Disabled,
            wireguard_config: None,
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        base_spec().validate().unwrap();
    }

    #[test]
    fn test_name_must_start_lowercase_letter() {
        let mut s = base_spec();
        s.name = "1alpha".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_name_rejects_uppercase_and_overlength() {
        let mut s = base_spec();
        s.name = "Alpha".to_string();
        assert!(s.validate().is_err());
        s.name = "a".repeat(64);
        assert!(s.validate().is_err());
        s.name = "a".repeat(63);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_password_length() {
        let mut s = base_spec();
        s.root_password = "short".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_resource_ranges() {
        let mut s = base_spec();
        s.cpu_quota_percent = 24;
        assert!(s.validate().is_err());
        s.cpu_quota_percent = 401;
        assert!(s.validate().is_err());
        s.cpu_quota_percent = 100;
        s.memory_mb = 255;
        assert!(s.validate().is_err());
        s.memory_mb = 512;
        s.disk_gb = 4;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_wireguard_requires_config() {
        let mut s = base_spec();
        s.ipv6 = Ipv6Policy::Wireguard;
        assert!(s.validate().is_err());
        s.wireguard_config = Some("   ".to_string());
        assert!(s.validate().is_err());
        s.wireguard_config = Some("[Interface]\nPrivateKey=abc\n".to_string());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_ipv6_network_mode_mapping() {
        assert_eq!(Ipv6Policy::Disabled.network_mode(), orchestrator_rootfs::Ipv6Mode::Disabled);
        assert_eq!(Ipv6Policy::Native.network_mode(), orchestrator_rootfs::Ipv6Mode::AcceptRa);
        assert_eq!(Ipv6Policy::Sixin4.network_mode(), orchestrator_rootfs::Ipv6Mode::AcceptRa);
        assert_eq!(Ipv6Policy::Wireguard.network_mode(), orchestrator_rootfs::Ipv6Mode::Disabled);
    }

    #[test]
    fn test_ipv6_serde_vocabulary() {
        assert_eq!(serde_json::to_string(&Ipv6Policy::Sixin4).unwrap(), "\"sixin4\"");
        assert_eq!(serde_json::to_string(&Ipv6Policy::Wireguard).unwrap(), "\"wireguard\"");
    }
}
