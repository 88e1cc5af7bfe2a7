//! # Container orchestrator core
//!
//! Drives lightweight Linux containers on top of `systemd-nspawn` and
//! `machinectl`: bootstrapping root filesystems, mutating them into a
//! bootable state without ever entering the guest, running the provisioning
//! pipeline that turns a [`spec::ContainerSpec`] into a running container,
//! and managing the lifecycle and port-forwarding of containers once they
//! exist.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

mod catalog;
mod config;
mod error;
mod fsmutate;
mod inspector;
mod invoker;
mod lifecycle;
mod pipeline;
mod portforward;
mod registry;
mod spec;

pub use catalog::{normalize_arch, resolve, ResolvedDistro};
pub use config::{OrchestratorConfig, Timeouts};
pub use error::{OrchestratorError, Result};
pub use inspector::{HostInfo, HostInspector};
pub use invoker::{CommandOutcome, HostInvoker, ProcessInvoker, RecordedCall, RecordingInvoker};
pub use lifecycle::LifecycleController;
pub use pipeline::ProvisioningPipeline;
pub use portforward::{NewPortForwardRule, PortForwardRule, PortForwardStore, Protocol};
pub use registry::{CreationJob, JobRegistry, Stage, TerminalStatus};
pub use spec::{ContainerRecord, ContainerSpec, ContainerStatus, Ipv6Policy};
