//! Mutate a freshly bootstrapped root filesystem on the host, without ever
//! booting or entering the guest.
//!
//! Every function here takes a [`cap_std_ext::cap_std::fs::Dir`] rooted at
//! the container's root filesystem directory and operates purely through
//! that capability, the same pattern the pack's sysusers/tmpfiles parsers
//! use for sandboxed access to a guest tree from the host.
// SPDX-License-Identifier: Apache-2.0 OR MIT

mod network;
mod scripts;
mod shadow;

pub use network::configure_dns;
pub use network::write_network_unit;
pub use network::Ipv6Mode;
pub use scripts::install_ssh_script;
pub use scripts::write_wireguard_config;
pub use scripts::SSH_INSTALL_SCRIPT_PATH;
pub use scripts::WIREGUARD_INSTALL_SCRIPT_PATH;
pub use shadow::set_root_password;

use std::path::PathBuf;

use thiserror::Error;

/// An error mutating a root filesystem.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("I/O error on {path}: {err}")]
    PathIo { path: PathBuf, err: std::io::Error },
    #[error("no root entry found in etc/passwd")]
    NoRootUser,
    #[error("failed to hash password: {0}")]
    HashFailure(String),
}

impl Error {
    // `fn_error_context::context` requires an inherent `context` method on
    // the function's error type. `Error`'s variants are matched on directly
    // by callers (see tests), so this preserves the original variant rather
    // than wrapping it.
    fn context(self, _context: impl std::fmt::Display) -> Self {
        self
    }
}

/// The type of Result.
pub type Result<T> = std::result::Result<T, Error>;
