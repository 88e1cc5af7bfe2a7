//! In-process, keyed store of background provisioning jobs. Ephemeral by
//! design (spec §4.5): it does not survive a process restart, and neither
//! does an in-flight bootstrap, so nothing is lost by keeping this purely
//! in memory behind a single mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// The Provisioning Pipeline's strictly-ordered stages (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Query host arch via the Host Inspector; normalize via the catalog.
    DetectArch,
    /// Create `<machines_dir>/<name>`.
    PrepareDir,
    /// Invoke the bootstrap tool.
    BootstrapRootfs,
    /// Filesystem Mutator, direct-shadow method.
    SetRootPassword,
    /// Filesystem Mutator: DNS + network unit.
    ConfigureNetwork,
    /// Only reached if `enable_ssh`.
    InstallSsh,
    /// Only reached if `ipv6 == wireguard`.
    ConfigureWireguard,
    /// Write the host-side container unit file.
    WriteHostUnit,
    /// Lifecycle Controller start.
    Start,
    /// Terminal success.
    Completed,
}

impl Stage {
    /// The percent published to the registry on entry to this stage.
    pub fn entry_percent(self) -> u8 {
        match self {
            Stage::DetectArch => 10,
            Stage::PrepareDir => 20,
            Stage::BootstrapRootfs => 30,
            Stage::SetRootPassword => 60,
            Stage::ConfigureNetwork => 70,
            Stage::InstallSsh => 80,
            Stage::ConfigureWireguard => 85,
            Stage::WriteHostUnit => 90,
            Stage::Start => 95,
            Stage::Completed => 100,
        }
    }

    /// The name used in error strings and log fields, matching spec §4.4's
    /// enum column exactly so `error contains the stage name` holds.
    pub fn name(self) -> &'static str {
        match self {
            Stage::DetectArch => "detect_arch",
            Stage::PrepareDir => "prepare_dir",
            Stage::BootstrapRootfs => "bootstrap_rootfs",
            Stage::SetRootPassword => "set_root_password",
            Stage::ConfigureNetwork => "configure_network",
            Stage::InstallSsh => "install_ssh",
            Stage::ConfigureWireguard => "configure_wireguard",
            Stage::WriteHostUnit => "write_host_unit",
            Stage::Start => "start",
            Stage::Completed => "completed",
        }
    }
}

/// Whether a job has reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// Still running.
    None,
    /// Finished successfully.
    Completed,
    /// Finished with an error (including cancellation).
    Failed,
}

/// A snapshot of one container's background provisioning job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreationJob {
    /// Primary key; equals `ContainerSpec.name`.
    pub container_id: String,
    /// Current (or, once terminal, last-attempted) stage.
    pub stage: Stage,
    /// Monotone non-decreasing while `terminal_status == None`.
    pub percent: u8,
    /// Terminal state, if any.
    pub terminal_status: TerminalStatus,
    /// Human-readable error, set only when `terminal_status == Failed`.
    /// Always names the failing stage.
    pub error: Option<String>,
    /// When the job was registered.
    pub started_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl CreationJob {
    fn new(container_id: String) -> Self {
        Self {
            container_id,
            stage: Stage::DetectArch,
            percent: 0,
            terminal_status: TerminalStatus::None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

struct Entry {
    job: CreationJob,
    cancel: Arc<AtomicBool>,
}

/// Process-wide map of `container_id -> CreationJob`, guarded by a single
/// mutex. Job churn is low enough that serializing every mutation under one
/// lock (rather than one lock per job) is the simpler, equally correct
/// choice (spec §4.5).
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry").field("job", &self.job).finish()
    }
}

impl JobRegistry {
    /// Construct an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job for `container_id`. Fails if a non-terminal job
    /// already exists for this id (invariant 2: at most one in-flight job
    /// per container). Overwrites any existing terminal job.
    pub fn register(&self, container_id: &str) -> Result<Arc<AtomicBool>> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(existing) = jobs.get(container_id) {
            if existing.job.terminal_status == TerminalStatus::None {
                return Err(OrchestratorError::NameConflict(format!(
                    "a provisioning job for {container_id:?} is already running"
                )));
            }
        }
        let cancel = Arc::new(AtomicBool::new(false));
        jobs.insert(
            container_id.to_string(),
            Entry {
                job: CreationJob::new(container_id.to_string()),
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    /// Advance a job to `stage`, publishing that stage's entry percent.
    pub fn set_stage(&self, container_id: &str, stage: Stage) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(entry) = jobs.get_mut(container_id) {
            entry.job.stage = stage;
            entry.job.percent = entry.job.percent.max(stage.entry_percent());
        }
    }

    /// Mark a job terminal. `Ok(())` transitions to `Completed` at 100%;
    /// `Err(message)` transitions to `Failed` with that message.
    pub fn finish(&self, container_id: &str, outcome: std::result::Result<(), String>) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(entry) = jobs.get_mut(container_id) {
            entry.job.finished_at = Some(Utc::now());
            match outcome {
                Ok(()) => {
                    entry.job.stage = Stage::Completed;
                    entry.job.percent = 100;
                    entry.job.terminal_status = TerminalStatus::Completed;
                }
                Err(message) => {
                    entry.job.terminal_status = TerminalStatus::Failed;
                    entry.job.error = Some(message);
                }
            }
        }
    }

    /// Request cooperative cancellation of a non-terminal job. Returns
    /// `true` if a non-terminal job was found and flagged.
    pub fn request_cancel(&self, container_id: &str) -> bool {
        let jobs = self.jobs.lock().unwrap();
        match jobs.get(container_id) {
            Some(entry) if entry.job.terminal_status == TerminalStatus::None => {
                entry.cancel.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// A snapshot of a job's current state.
    pub fn get(&self, container_id: &str) -> Option<CreationJob> {
        self.jobs.lock().unwrap().get(container_id).map(|e| e.job.clone())
    }
}
