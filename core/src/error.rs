//! The error kinds the core surfaces to its caller.

use std::time::Duration;

use thiserror::Error;

/// Every distinct error category the core can return.
///
/// Pipeline-stage variants carry just the failure detail (and, when
/// available, the scrubbed tail of the failing command's stderr); no secret
/// ever reaches this type, since scrubbing happens at the Host Invoker
/// boundary before the message is built. The stage name itself is prefixed
/// once, by the Provisioning Pipeline, onto whatever message these variants
/// carry — not baked into the variant's own `Display`, which would double it.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A `ContainerSpec` failed validation against its §3 constraints.
    #[error("validation failed: {0}")]
    ValidationError(String),
    /// A container with this name already exists.
    #[error("name conflict: {0}")]
    NameConflict(String),
    /// The requested distro/release/arch combination is not in the catalog.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The `bootstrap_rootfs` stage failed.
    #[error("{0}")]
    BootstrapFailed(String),
    /// The `set_root_password` stage failed.
    #[error("{0}")]
    PasswordFailed(String),
    /// The `configure_network` stage failed.
    #[error("{0}")]
    NetworkFailed(String),
    /// The `install_ssh` stage failed.
    #[error("{0}")]
    SshFailed(String),
    /// The `configure_wireguard` stage failed.
    #[error("{0}")]
    WireGuardFailed(String),
    /// The `write_host_unit` stage failed.
    #[error("{0}")]
    UnitFailed(String),
    /// The `start` stage, or a later explicit `start()` call, failed.
    #[error("{0}")]
    StartFailed(String),
    /// A `stop()`/`force_stop()` call failed.
    #[error("stop: {0}")]
    StopFailed(String),
    /// A `delete()` call failed.
    #[error("delete: {0}")]
    DeleteFailed(String),
    /// A port-forward rule would duplicate an existing `(host_port, protocol)`.
    #[error("port-forward rule conflict on {0}")]
    RuleConflict(String),
    /// An external command exceeded its timeout and was killed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// An external privileged command returned a non-zero exit code outside
    /// of a named pipeline stage (e.g. a Lifecycle Controller or Port-Forward
    /// Rule Store call).
    #[error("host command failed: {0}")]
    HostError(String),
    /// No container or rule exists with the given identifier.
    #[error("not found: {0}")]
    NotFound(String),
    /// I/O error unrelated to a privileged external command (registry
    /// persistence, port-forward store file, etc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON in a persisted store file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The type of Result used throughout the core.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
