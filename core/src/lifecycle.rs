//! Wraps the machine manager (`machinectl`) for every post-creation
//! operation: start, stop, restart, delete, list, inspect. All operations
//! are idempotent where the target state permits, and operations against
//! the same container name serialize behind a per-name lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::invoker::HostInvoker;
use crate::spec::{ContainerRecord, ContainerSpec, ContainerStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthoredRecord {
    distro: String,
    cpu_quota_percent: u32,
    memory_mb: u32,
    disk_gb: u32,
    created_at: chrono::DateTime<Utc>,
}

fn read_records(path: &Utf8PathBuf) -> Result<HashMap<String, AuthoredRecord>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_records(path: &Utf8PathBuf, records: &HashMap<String, AuthoredRecord>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Drives `machinectl` to start, stop, restart, delete, list, and inspect
/// containers.
pub struct LifecycleController {
    invoker: Arc<dyn HostInvoker>,
    machines_dir: Utf8PathBuf,
    units_dir: Utf8PathBuf,
    records_path: Utf8PathBuf,
    machine_manager_timeout: Duration,
    stop_timeout: Duration,
    force_stop_timeout: Duration,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("machines_dir", &self.machines_dir)
            .field("units_dir", &self.units_dir)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Build a controller from process configuration.
    pub fn new(invoker: Arc<dyn HostInvoker>, config: &OrchestratorConfig) -> Self {
        Self {
            invoker,
            machines_dir: config.machines_dir.clone(),
            units_dir: config.units_dir.clone(),
            records_path: config.state_dir.join("container_records.json"),
            machine_manager_timeout: config.timeouts.machine_manager,
            stop_timeout: Duration::from_secs(30),
            force_stop_timeout: Duration::from_secs(10),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Persist the authored half of a `ContainerRecord` once provisioning
    /// completes. The observed half (status, addresses, uptime) is always
    /// re-queried.
    pub fn record_authored(&self, spec: &ContainerSpec) -> Result<()> {
        let mut records = read_records(&self.records_path)?;
        records.insert(
            spec.name.clone(),
            AuthoredRecord {
                distro: spec.distro.clone(),
                cpu_quota_percent: spec.cpu_quota_percent,
                memory_mb: spec.memory_mb,
                disk_gb: spec.disk_gb,
                created_at: Utc::now(),
            },
        );
        write_records(&self.records_path, &records)
    }

    async fn query_status(&self, name: &str) -> ContainerStatus {
        let outcome = self
            .invoker
            .run(
                &["machinectl", "show", name, "--property=State", "--value"],
                None,
                self.machine_manager_timeout,
                None,
            )
            .await;
        match outcome {
            Ok(o) if o.success() => match o.stdout.trim() {
                "running" => ContainerStatus::Running,
                "stopped" | "off" | "closing" | "closed" => ContainerStatus::Stopped,
                "failed" => ContainerStatus::Failed,
                _ => ContainerStatus::Unknown,
            },
            Ok(_) => ContainerStatus::Stopped,
            Err(_) => ContainerStatus::Unknown,
        }
    }

    /// Start the machine if it is not already running.
    pub async fn start(&self, name: &str) -> Result<()> {
        let _guard = self.lock_for(name).lock_owned().await;
        let outcome = self
            .invoker
            .run(&["machinectl", "start", name], None, self.machine_manager_timeout, None)
            .await
            .map_err(|e| OrchestratorError::StartFailed(e.to_string()))?;
        if !outcome.success() {
            return Err(OrchestratorError::StartFailed(outcome.stderr_tail(20)));
        }
        Ok(())
    }

    /// Gracefully stop the machine, waiting up to 30s. A no-op, successful
    /// call if the machine is already stopped.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.stop_with(name, "poweroff", self.stop_timeout).await
    }

    /// Signal-based stop, waiting up to 10s.
    pub async fn force_stop(&self, name: &str) -> Result<()> {
        self.stop_with(name, "terminate", self.force_stop_timeout).await
    }

    async fn stop_with(&self, name: &str, verb: &str, timeout: Duration) -> Result<()> {
        let _guard = self.lock_for(name).lock_owned().await;
        if self.query_status(name).await == ContainerStatus::Stopped {
            return Ok(());
        }
        let outcome = self
            .invoker
            .run(&["machinectl", verb, name], None, timeout, None)
            .await
            .map_err(|e| OrchestratorError::StopFailed(e.to_string()))?;
        if !outcome.success() && self.query_status(name).await != ContainerStatus::Stopped {
            return Err(OrchestratorError::StopFailed(outcome.stderr_tail(20)));
        }
        Ok(())
    }

    /// Stop then start.
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Stop (ignoring failure if already stopped), remove the host unit
    /// file, and remove the root filesystem directory. Fails only if the
    /// directory cannot be removed.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _ = self.stop(name).await;

        let unit_path = self.units_dir.join(format!("{name}.nspawn"));
        match std::fs::remove_file(&unit_path) {
            Ok(()) | Err(_) => {}
        }

        let container_dir = self.machines_dir.join(name);
        if container_dir.exists() {
            std::fs::remove_dir_all(&container_dir)
                .map_err(|e| OrchestratorError::DeleteFailed(e.to_string()))?;
        }

        if let Ok(mut records) = read_records(&self.records_path) {
            records.remove(name);
            let _ = write_records(&self.records_path, &records);
        }
        Ok(())
    }

    /// A single container's observable record.
    pub async fn inspect(&self, name: &str) -> Result<ContainerRecord> {
        let container_dir = self.machines_dir.join(name);
        if !container_dir.exists() {
            return Err(OrchestratorError::NotFound(name.to_string()));
        }
        let records = read_records(&self.records_path)?;
        let authored = records.get(name);
        let status = self.query_status(name).await;
        Ok(ContainerRecord {
            name: name.to_string(),
            status,
            distro: authored.map(|a| a.distro.clone()).unwrap_or_default(),
            cpu_quota_percent: authored.map(|a| a.cpu_quota_percent).unwrap_or(0),
            memory_mb: authored.map(|a| a.memory_mb).unwrap_or(0),
            disk_gb: authored.map(|a| a.disk_gb).unwrap_or(0),
            addresses: Vec::new(),
            created_at: authored.map(|a| a.created_at).unwrap_or_else(Utc::now),
            uptime_seconds: None,
        })
    }

    /// All containers, reconciling the on-disk machines directory with the
    /// machine manager's live state.
    pub async fn list(&self) -> Result<Vec<ContainerRecord>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.machines_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            out.push(self.inspect(&name).await?);
        }
        Ok(out)
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

    #[tokio::test]
    async fn test_start_success() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(camino::Utf8Path::from_path(tmp.path()).unwrap());
        let invoker = Arc::new(RecordingInvoker::new());
        invoker.push_outcome(CommandOutcome::ok(""));
        let lc = LifecycleController::new(invoker, &config);
        lc.start("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_failure_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(camino::Utf8Path::from_path(tmp.path()).unwrap());
        let invoker = Arc::new(RecordingInvoker::new());
        invoker.push_outcome(CommandOutcome::failed(1, "Unit not found."));
        let lc = LifecycleController::new(invoker, &config);
        let err = lc.start("alpha").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StartFailed(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_dir_and_unit_and_record() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(camino::Utf8Path::from_path(tmp.path()).unwrap());
        std::fs::create_dir_all(config.container_dir("alpha")).unwrap();
        std::fs::create_dir_all(&config.units_dir).unwrap();
        std::fs::write(config.unit_path("alpha"), "[Exec]\n").unwrap();

        let invoker = Arc::new(RecordingInvoker::new());
        invoker.push_outcome(CommandOutcome::failed(1, "not active")); // query_status
        let lc = LifecycleController::new(invoker, &config);
        lc.record_authored(&ContainerSpec {
            name: "alpha".into(),
            distro: "debian:bookworm".into(),
            root_password: "hunter2!".into(),
            cpu_quota_percent: 100,
            memory_mb: 512,
            disk_gb: 10,
            enable_ssh: false,
            ipv6: crate::spec::Ipv6Policy::Disabled,
            wireguard_config: None,
        })
        .unwrap();

        lc.delete("alpha").await.unwrap();
        assert!(!config.container_dir("alpha").exists());
        assert!(!config.unit_path("alpha").exists());
        let records = read_records(&config.state_dir.join("container_records.json")).unwrap();
        assert!(!records.contains_key("alpha"));
    }

    #[tokio::test]
    async fn test_list_reconciles_directory_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(camino::Utf8Path::from_path(tmp.path()).unwrap());
        std::fs::create_dir_all(config.container_dir("alpha")).unwrap();

        let invoker = Arc::new(RecordingInvoker::new());
        invoker.push_outcome(CommandOutcome::ok("running"));
        let lc = LifecycleController::new(invoker, &config);
        let records = lc.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "alpha");
        assert_eq!(records[0].status, ContainerStatus::Running);
    }
}
