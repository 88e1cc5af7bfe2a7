//! A persistent set of `(host_port, protocol)` -> container port-forward
//! rules, each backed by a firewall DNAT entry installed through the Host
//! Invoker.
//!
//! The Data Model (spec §3) defines a rule by `host_port`, `container_id`,
//! `container_port`, and `protocol` alone; it does not say how the store
//! learns the container's IP address to build the DNAT target. Per
//! `DESIGN.md`, `container_ip` is accepted as an optional extra at `add()`
//! time: when present, a DNAT rule is installed; when absent, the rule is
//! still recorded (satisfying the literal seed scenario, which omits an IP
//! entirely) but no firewall entry is installed until a caller later knows
//! the address.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::invoker::HostInvoker;

/// Transport protocol a port-forward rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    fn as_iptables_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A persisted host-port -> container-port forwarding rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortForwardRule {
    /// Surrogate identifier.
    pub id: Uuid,
    /// 1..65535, unique together with `protocol`.
    pub host_port: u16,
    /// The container this rule forwards to.
    pub container_id: String,
    /// 1..65535.
    pub container_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// The container's bridge-assigned address, if known at `add()` time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_ip: Option<String>,
}

/// Input to [`PortForwardStore::add`].
#[derive(Debug, Clone)]
pub struct NewPortForwardRule {
    /// 1..65535, unique together with `protocol`.
    pub host_port: u16,
    /// The container this rule forwards to.
    pub container_id: String,
    /// 1..65535.
    pub container_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// The container's bridge-assigned address, if already known.
    pub container_ip: Option<String>,
}

fn load(path: &Utf8PathBuf) -> Result<Vec<PortForwardRule>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn persist(path: &Utf8PathBuf, rules: &[PortForwardRule]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(rules)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// A disk-backed set of port-forward rules, each mirrored into the host
/// firewall's NAT table as a DNAT entry.
pub struct PortForwardStore {
    invoker: Arc<dyn HostInvoker>,
    path: Utf8PathBuf,
    firewall_timeout: Duration,
    rules: AsyncMutex<Vec<PortForwardRule>>,
}

impl std::fmt::Debug for PortForwardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForwardStore").field("path", &self.path).finish_non_exhaustive()
    }
}

impl PortForwardStore {
    /// Load the store's persisted rules from `config.state_dir`, without
    /// reconciling firewall state yet; call [`Self::reconcile`] for that.
    pub fn load(invoker: Arc<dyn HostInvoker>, config: &OrchestratorConfig) -> Result<Self> {
        let path = config.port_forward_store_path();
        let rules = load(&path)?;
        Ok(Self {
            invoker,
            path,
            firewall_timeout: config.timeouts.firewall,
            rules: AsyncMutex::new(rules),
        })
    }

    /// Ensure every persisted rule with a known `container_ip` has a
    /// matching DNAT entry installed (add-if-missing).
    pub async fn reconcile(&self) -> Result<()> {
        let rules = self.rules.lock().await.clone();
        for rule in rules {
            if let Some(ip) = &rule.container_ip {
                self.install_dnat(rule.host_port, rule.protocol, ip, rule.container_port).await?;
            }
        }
        Ok(())
    }

    /// Add a rule: validates `(host_port, protocol)` uniqueness, installs a
    /// DNAT entry if `container_ip` is known, then persists.
    ///
    /// The store mutex is held across the whole check-install-insert-persist
    /// sequence (spec §5: "port-forward mutations serialize under a single
    /// store mutex"), so two concurrent `add()` calls for the same
    /// `(host_port, protocol)` can never both pass the uniqueness check.
    pub async fn add(&self, new_rule: NewPortForwardRule) -> Result<PortForwardRule> {
        let mut rules = self.rules.lock().await;
        if rules
            .iter()
            .any(|r| r.host_port == new_rule.host_port && r.protocol == new_rule.protocol)
        {
            return Err(OrchestratorError::RuleConflict(format!(
                "{}/{}",
                new_rule.host_port,
                new_rule.protocol.as_iptables_str()
            )));
        }

        if let Some(ip) = &new_rule.container_ip {
            self.install_dnat(new_rule.host_port, new_rule.protocol, ip, new_rule.container_port)
                .await?;
        }

        let rule = PortForwardRule {
            id: Uuid::new_v4(),
            host_port: new_rule.host_port,
            container_id: new_rule.container_id,
            container_port: new_rule.container_port,
            protocol: new_rule.protocol,
            container_ip: new_rule.container_ip,
        };

        rules.push(rule.clone());
        persist(&self.path, &rules)?;
        Ok(rule)
    }

    /// Remove the rule for `(host_port, protocol)`, reversing both the
    /// persisted record and its DNAT entry.
    ///
    /// Holds the store mutex across the whole find-uninstall-remove-persist
    /// sequence, for the same reason as [`Self::add`].
    pub async fn remove(&self, host_port: u16, protocol: Protocol) -> Result<()> {
        let mut rules = self.rules.lock().await;
        let idx = rules
            .iter()
            .position(|r| r.host_port == host_port && r.protocol == protocol)
            .ok_or_else(|| OrchestratorError::NotFound(format!("{host_port}/{}", protocol.as_iptables_str())))?;
        let removed = rules[idx].clone();
        if let Some(ip) = &removed.container_ip {
            self.remove_dnat(host_port, protocol, ip, removed.container_port).await?;
        }
        rules.remove(idx);
        persist(&self.path, &rules)?;
        Ok(())
    }

    /// A snapshot of every persisted rule.
    pub async fn list(&self) -> Vec<PortForwardRule> {
        self.rules.lock().await.clone()
    }

    fn dnat_rule_args(host_port: u16, protocol: Protocol, ip: &str, container_port: u16) -> Vec<String> {
        vec![
            "-p".to_string(),
            protocol.as_iptables_str().to_string(),
            "--dport".to_string(),
            host_port.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{ip}:{container_port}"),
        ]
    }

    async fn install_dnat(&self, host_port: u16, protocol: Protocol, ip: &str, container_port: u16) -> Result<()> {
        let rule_args = Self::dnat_rule_args(host_port, protocol, ip, container_port);

        let mut check: Vec<String> = vec!["iptables".to_string(), "-t".to_string(), "nat".to_string(), "-C".to_string(), "PREROUTING".to_string()];
        check.extend(rule_args.clone());
        let check_argv: Vec<&str> = check.iter().map(String::as_str).collect();
        let exists = self
            .invoker
            .run(&check_argv, None, self.firewall_timeout, None::<&HashMap<String, String>>)
            .await
            .map_err(|e| OrchestratorError::HostError(e.to_string()))?;
        if exists.success() {
            return Ok(());
        }

        let mut add: Vec<String> = vec!["iptables".to_string(), "-t".to_string(), "nat".to_string(), "-A".to_string(), "PREROUTING".to_string()];
        add.extend(rule_args);
        let add_argv: Vec<&str> = add.iter().map(String::as_str).collect();
        let outcome = self
            .invoker
            .run(&add_argv, None, self.firewall_timeout, None::<&HashMap<String, String>>)
            .await
            .map_err(|e| OrchestratorError::HostError(e.to_string()))?;
        if !outcome.success() {
            return Err(OrchestratorError::HostError(outcome.stderr_tail(20)));
        }
        Ok(())
    }

    async fn remove_dnat(&self, host_port: u16, protocol: Protocol, ip: &str, container_port: u16) -> Result<()> {
        let rule_args = Self::dnat_rule_args(host_port, protocol, ip, container_port);
        let mut del: Vec<String> = vec!["iptables".to_string(), "-t".to_string(), "nat".to_string(), "-D".to_string(), "PREROUTING".to_string()];
        del.extend(rule_args);
        let del_argv: Vec<&str> = del.iter().map(String::as_str).collect();
        let outcome = self
            .invoker
            .run(&del_argv, None, self.firewall_timeout, None::<&HashMap<String, String>>)
            .await
            .map_err(|e| OrchestratorError::HostError(e.to_string()))?;
        if !outcome.success() {
            return Err(OrchestratorError::HostError(outcome.stderr_tail(20)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{CommandOutcome, RecordingInvoker};

    fn test_config(dir: &camino::Utf8Path) -> OrchestratorConfig {
        OrchestratorConfig {
            host: "0.0.0.0".into(),
            port: 8080,
            machines_dir: dir.join("machines"),
            units_dir: dir.join("units"),
            state_dir: dir.join("state"),
            bridge: "br0".into(),
            timeouts: crate::config::Timeouts::default(),
        }
    }

    fn rule(host_port: u16, container_id: &str) -> NewPortForwardRule {
        NewPortForwardRule {
            host_port,
            container_id: container_id.to_string(),
            container_port: 80,
            protocol: Protocol::Tcp,
            container_ip: None,
        }
    }

    #[tokio::test]
    async fn test_add_persists_without_ip_and_skips_firewall() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(camino::Utf8Path::from_path(tmp.path()).unwrap());
        let invoker = Arc::new(RecordingInvoker::new());
        let store = PortForwardStore::load(invoker.clone(), &config).unwrap();
        store.add(rule(8080, "alpha")).await.unwrap();
        assert_eq!(invoker.calls().len(), 0);
        assert_eq!(store.list().await.len(), 1);

        let reloaded = PortForwardStore::load(invoker, &config).unwrap();
        assert_eq!(reloaded.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_conflict_on_same_host_port_and_protocol() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(camino::Utf8Path::from_path(tmp.path()).unwrap());
        let invoker = Arc::new(RecordingInvoker::new());
        let store = PortForwardStore::load(invoker, &config).unwrap();
        store.add(rule(8080, "alpha")).await.unwrap();
        let err = store.add(rule(8080, "beta")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RuleConflict(_)));
    }

    #[tokio::test]
    async fn test_add_with_ip_installs_dnat_then_remove_reverses_it() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(camino::Utf8Path::from_path(tmp.path()).unwrap());
        let invoker = Arc::new(RecordingInvoker::new());
        invoker.push_outcome(CommandOutcome::failed(1, "no match")); // -C check: not present
        invoker.push_outcome(CommandOutcome::ok("")); // -A add

        let store = PortForwardStore::load(invoker.clone(), &config).unwrap();
        let mut r = rule(8080, "alpha");
        r.container_ip = Some("10.0.0.5".to_string());
        let added = store.add(r).await.unwrap();

        let calls = invoker.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].argv.contains(&"-C".to_string()));
        assert!(calls[1].argv.contains(&"-A".to_string()));

        invoker.push_outcome(CommandOutcome::ok("")); // -D remove
        store.remove(added.host_port, added.protocol).await.unwrap();
        let calls = invoker.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].argv.contains(&"-D".to_string()));
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_rule_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(camino::Utf8Path::from_path(tmp.path()).unwrap());
        let invoker = Arc::new(RecordingInvoker::new());
        let store = PortForwardStore::load(invoker, &config).unwrap();
        let err = store.remove(9999, Protocol::Tcp).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }
}
