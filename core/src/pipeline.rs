//! The Container Provisioning Pipeline (spec §4.4): the ten strictly
//! ordered stages that turn an empty name and a `ContainerSpec` into a
//! running container, publishing progress to the Creation Job Registry as
//! they go.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cap_std_ext::cap_std::ambient_authority;
use cap_std_ext::cap_std::fs::Dir;

use crate::catalog;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::fsmutate;
use crate::inspector::HostInspector;
use crate::invoker::HostInvoker;
use crate::lifecycle::LifecycleController;
use crate::registry::{JobRegistry, Stage};
use crate::spec::ContainerSpec;

/// Tracks what has actually been created on disk so failure cleanup touches
/// only what this run produced.
#[derive(Debug, Default, Clone, Copy)]
struct ProgressMarks {
    dir_created: bool,
    unit_written: bool,
}

/// Ensures a job is always finalized in the registry, even if a stage
/// panics, by updating the registry from `Drop` unless `finish()` was
/// already called.
struct JobGuard<'a> {
    registry: &'a JobRegistry,
    container_id: String,
    done: bool,
}

impl<'a> JobGuard<'a> {
    fn new(registry: &'a JobRegistry, container_id: &str) -> Self {
        Self {
            registry,
            container_id: container_id.to_string(),
            done: false,
        }
    }

    fn finish(mut self, outcome: std::result::Result<(), String>) {
        self.registry.finish(&self.container_id, outcome);
        self.done = true;
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.registry.finish(&self.container_id, Err("worker panicked".to_string()));
        }
    }
}

/// Runs the Provisioning Pipeline for one `ContainerSpec` at a time, given
/// an already-registered job.
pub struct ProvisioningPipeline {
    config: OrchestratorConfig,
    invoker: Arc<dyn HostInvoker>,
    inspector: HostInspector,
    registry: Arc<JobRegistry>,
    lifecycle: Arc<LifecycleController>,
}

impl std::fmt::Debug for ProvisioningPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

type StageResult<T> = std::result::Result<T, (Option<Stage>, OrchestratorError, ProgressMarks)>;

impl ProvisioningPipeline {
    /// Build a pipeline from process configuration and its collaborators.
    pub fn new(
        config: OrchestratorConfig,
        invoker: Arc<dyn HostInvoker>,
        registry: Arc<JobRegistry>,
        lifecycle: Arc<LifecycleController>,
    ) -> Self {
        let inspector = HostInspector::new(config.bridge.clone());
        Self {
            config,
            invoker,
            inspector,
            registry,
            lifecycle,
        }
    }

    /// Validate and register `spec`, then run the pipeline to completion in
    /// the background. Returns once the job is registered; provisioning
    /// itself continues asynchronously and is observed through the
    /// `JobRegistry`.
    pub fn submit(self: &Arc<Self>, spec: ContainerSpec) -> Result<()> {
        spec.validate()?;
        let cancel = self.registry.register(&spec.name)?;
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.run(&spec, &cancel).await;
        });
        Ok(())
    }

    /// Run every stage for an already-registered job to completion,
    /// finalizing the registry entry on return (success, failure, or
    /// cancellation) even if a stage panics.
    pub async fn run(&self, spec: &ContainerSpec, cancel: &AtomicBool) {
        let guard = JobGuard::new(&self.registry, &spec.name);
        match self.run_stages(spec, cancel).await {
            Ok(()) => guard.finish(Ok(())),
            Err((stage, err, marks)) => {
                self.cleanup(&spec.name, &marks).await;
                let message = match (&err, stage) {
                    (OrchestratorError::ValidationError(m), _) if m == "cancelled" => "cancelled".to_string(),
                    (_, Some(stage)) => format!("{}: {err}", stage.name()),
                    (_, None) => err.to_string(),
                };
                guard.finish(Err(message));
            }
        }
    }

    fn check_cancel(cancel: &AtomicBool, marks: ProgressMarks) -> StageResult<()> {
        if cancel.load(Ordering::SeqCst) {
            Err((None, OrchestratorError::ValidationError("cancelled".to_string()), marks))
        } else {
            Ok(())
        }
    }

    // `ProgressMarks` is `Copy`, so every `check_cancel(cancel, marks)` call
    // below passes a snapshot without disturbing the caller's copy.

    async fn run_stages(&self, spec: &ContainerSpec, cancel: &AtomicBool) -> StageResult<()> {
        let mut marks = ProgressMarks::default();
        let container_dir = self.config.container_dir(&spec.name);

        // Stage 1: detect_arch
        Self::check_cancel(cancel, marks)?;
        self.registry.set_stage(&spec.name, Stage::DetectArch);
        let host_arch = self.inspector.arch();
        let resolved = catalog::resolve(&spec.distro, host_arch)
            .map_err(|e| (Some(Stage::DetectArch), e, marks))?;

        // Stage 2: prepare_dir
        Self::check_cancel(cancel, marks)?;
        self.registry.set_stage(&spec.name, Stage::PrepareDir);
        std::fs::create_dir(&container_dir).map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::AlreadyExists {
                OrchestratorError::NameConflict(spec.name.clone())
            } else {
                OrchestratorError::NameConflict(e.to_string())
            };
            (Some(Stage::PrepareDir), kind, marks)
        })?;
        marks.dir_created = true;

        // Stage 3: bootstrap_rootfs
        Self::check_cancel(cancel, marks)?;
        self.registry.set_stage(&spec.name, Stage::BootstrapRootfs);
        let arch_flag = format!("--arch={}", resolved.arch);
        let outcome = self
            .invoker
            .run(
                &[
                    resolved.bootstrap_tool,
                    arch_flag.as_str(),
                    resolved.suite.as_str(),
                    container_dir.as_str(),
                    resolved.mirror.as_str(),
                ],
                None,
                self.config.timeouts.bootstrap,
                None,
            )
            .await
            .map_err(|e| (Some(Stage::BootstrapRootfs), OrchestratorError::BootstrapFailed(e.to_string()), marks))?;
        if !outcome.success() {
            return Err((
                Some(Stage::BootstrapRootfs),
                OrchestratorError::BootstrapFailed(outcome.stderr_tail(20)),
                marks,
            ));
        }

        let root = Dir::open_ambient_dir(&container_dir, ambient_authority())
            .map_err(|e| (Some(Stage::BootstrapRootfs), OrchestratorError::BootstrapFailed(e.to_string()), marks))?;

        // Stage 4: set_root_password
        Self::check_cancel(cancel, marks)?;
        self.registry.set_stage(&spec.name, Stage::SetRootPassword);
        fsmutate::set_root_password(&root, &spec.root_password)
            .map_err(|e| (Some(Stage::SetRootPassword), e, marks))?;

        // Stage 5: configure_network
        Self::check_cancel(cancel, marks)?;
        self.registry.set_stage(&spec.name, Stage::ConfigureNetwork);
        fsmutate::configure_network(&root, &self.config.bridge, spec.ipv6)
            .map_err(|e| (Some(Stage::ConfigureNetwork), e, marks))?;

        // Stage 6: install_ssh
        if spec.enable_ssh {
            Self::check_cancel(cancel, marks)?;
            self.registry.set_stage(&spec.name, Stage::InstallSsh);
            fsmutate::install_ssh(self.invoker.as_ref(), &container_dir, &root, self.config.timeouts.package_install)
                .await
                .map_err(|e| (Some(Stage::InstallSsh), e, marks))?;
        }

        // Stage 7: configure_wireguard
        if matches!(spec.ipv6, crate::spec::Ipv6Policy::Wireguard) {
            Self::check_cancel(cancel, marks)?;
            self.registry.set_stage(&spec.name, Stage::ConfigureWireguard);
            let wg_config = spec.wireguard_config.as_deref().unwrap_or_default();
            fsmutate::configure_wireguard(self.invoker.as_ref(), &container_dir, &root, wg_config, self.config.timeouts.package_install)
                .await
                .map_err(|e| (Some(Stage::ConfigureWireguard), e, marks))?;
        }

        // Stage 8: write_host_unit
        Self::check_cancel(cancel, marks)?;
        self.registry.set_stage(&spec.name, Stage::WriteHostUnit);
        let unit_path = self.config.unit_path(&spec.name);
        fsmutate::write_host_unit(&unit_path, &self.config.bridge, spec.cpu_quota_percent, spec.memory_mb, spec.disk_gb)
            .map_err(|e| (Some(Stage::WriteHostUnit), e, marks))?;
        marks.unit_written = true;

        // Stage 9: start
        Self::check_cancel(cancel, marks)?;
        self.registry.set_stage(&spec.name, Stage::Start);
        self.lifecycle
            .start(&spec.name)
            .await
            .map_err(|e| (Some(Stage::Start), e, marks))?;

        // Stage 10: completed
        self.registry.set_stage(&spec.name, Stage::Completed);
        if let Err(e) = self.lifecycle.record_authored(spec) {
            tracing::warn!(container = %spec.name, error = %e, "failed to persist authored container record");
        }
        Ok(())
    }

    async fn cleanup(&self, name: &str, marks: &ProgressMarks) {
        if marks.unit_written {
            let unit_path = self.config.unit_path(name);
            let _ = std::fs::remove_file(&unit_path);
        }
        if marks.dir_created {
            let container_dir = self.config.container_dir(name);
            let _ = std::fs::remove_dir_all(&container_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{CommandOutcome, RecordingInvoker};
    use crate::registry::TerminalStatus;
    use crate::spec::Ipv6Policy;

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

    fn base_spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
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

    fn make_pipeline(dir: &camino::Utf8Path, invoker: Arc<RecordingInvoker>) -> (ProvisioningPipeline, Arc<JobRegistry>) {
        let config = test_config(dir);
        std::fs::create_dir_all(&config.machines_dir).unwrap();
        std::fs::create_dir_all(&config.units_dir).unwrap();
        std::fs::create_dir_all(&config.state_dir).unwrap();
        let registry = Arc::new(JobRegistry::new());
        let lifecycle = Arc::new(LifecycleController::new(invoker.clone(), &config));
        let pipeline = ProvisioningPipeline::new(config, invoker, registry.clone(), lifecycle);
        (pipeline, registry)
    }

    // bootstrap_rootfs only creates a directory structure with a passwd/shadow
    // file good enough for the later stages to operate on, mimicking what a
    // real debootstrap run leaves behind.
    fn fake_bootstrap_outcome(container_dir: &camino::Utf8Path) -> CommandOutcome {
        std::fs::create_dir_all(container_dir.join("etc")).unwrap();
        std::fs::write(container_dir.join("etc/passwd"), b"root:x:0:0:root:/root:/bin/bash\n").unwrap();
        CommandOutcome::ok("")
    }

    #[tokio::test]
    async fn test_happy_path_debian_amd64() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let invoker = Arc::new(RecordingInvoker::new());
        let (pipeline, registry) = make_pipeline(dir, invoker.clone());
        let spec = base_spec("alpha");
        let container_dir = pipeline.config.container_dir("alpha");

        invoker.push_outcome(fake_bootstrap_outcome(&container_dir)); // bootstrap
        invoker.push_outcome(CommandOutcome::ok("")); // install_ssh
        invoker.push_outcome(CommandOutcome::failed(1, "not active")); // start's internal query_status
        invoker.push_outcome(CommandOutcome::ok("")); // start

        let cancel = AtomicBool::new(false);
        pipeline.run(&spec, &cancel).await;

        let job = registry.get("alpha").unwrap();
        assert_eq!(job.terminal_status, TerminalStatus::Completed);
        assert_eq!(job.percent, 100);
        assert!(container_dir.exists());

        let unit_contents = std::fs::read_to_string(pipeline.config.unit_path("alpha")).unwrap();
        assert!(unit_contents.contains("CPUQuota=100%"));
        assert!(unit_contents.contains("MemoryMax=512M"));
    }

    #[tokio::test]
    async fn test_name_conflict_at_prepare_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let invoker = Arc::new(RecordingInvoker::new());
        let (pipeline, registry) = make_pipeline(dir, invoker.clone());
        let spec = base_spec("gamma");
        std::fs::create_dir_all(pipeline.config.container_dir("gamma")).unwrap();

        let cancel = AtomicBool::new(false);
        pipeline.run(&spec, &cancel).await;

        let job = registry.get("gamma").unwrap();
        assert_eq!(job.terminal_status, TerminalStatus::Failed);
        assert!(job.error.unwrap().contains("prepare_dir"));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_cleans_up_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let invoker = Arc::new(RecordingInvoker::new());
        let (pipeline, registry) = make_pipeline(dir, invoker.clone());
        let spec = base_spec("alpha");
        invoker.push_outcome(CommandOutcome::failed(1, "mirror unreachable"));

        let cancel = AtomicBool::new(false);
        pipeline.run(&spec, &cancel).await;

        let job = registry.get("alpha").unwrap();
        assert_eq!(job.terminal_status, TerminalStatus::Failed);
        assert!(job.error.unwrap().contains("bootstrap_rootfs"));
        assert!(!pipeline.config.container_dir("alpha").exists());
        assert!(!pipeline.config.unit_path("alpha").exists());
    }

    #[tokio::test]
    async fn test_cancellation_before_bootstrap_cleans_up_and_reports_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let invoker = Arc::new(RecordingInvoker::new());
        let (pipeline, registry) = make_pipeline(dir, invoker.clone());
        let spec = base_spec("alpha");

        let cancel = AtomicBool::new(true);
        pipeline.run(&spec, &cancel).await;

        let job = registry.get("alpha").unwrap();
        assert_eq!(job.terminal_status, TerminalStatus::Failed);
        assert_eq!(job.error.unwrap(), "cancelled");
    }

    #[tokio::test]
    async fn test_percent_trace_is_monotone() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let invoker = Arc::new(RecordingInvoker::new());
        let (pipeline, registry) = make_pipeline(dir, invoker.clone());
        let mut spec = base_spec("beta");
        spec.ipv6 = Ipv6Policy::Native;
        let container_dir = pipeline.config.container_dir("beta");

        invoker.push_outcome(fake_bootstrap_outcome(&container_dir));
        invoker.push_outcome(CommandOutcome::ok("")); // install_ssh
        invoker.push_outcome(CommandOutcome::failed(1, "not active"));
        invoker.push_outcome(CommandOutcome::ok("")); // start

        let cancel = AtomicBool::new(false);
        pipeline.run(&spec, &cancel).await;
        let job = registry.get("beta").unwrap();
        assert_eq!(job.terminal_status, TerminalStatus::Completed);
        assert_eq!(job.percent, 100);
    }
}
