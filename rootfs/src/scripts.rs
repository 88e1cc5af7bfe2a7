//! Staged scripts run inside the guest (via the Host Invoker's
//! `systemd-nspawn --ephemeral=no --pipe` path) to install packages that
//! direct file writes alone cannot provide: the SSH server and WireGuard.
//!
//! Writing the script here and executing it elsewhere (see
//! `orchestrator-core`'s pipeline) keeps this crate free of any dependency
//! on actually running a child process.

use cap_std_ext::cap_std::fs::{Dir, Permissions, PermissionsExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::Result;

/// Path, relative to the container root, of the staged SSH install script.
pub const SSH_INSTALL_SCRIPT_PATH: &str = "tmp/install_ssh.sh";
/// Path, relative to the container root, of the staged WireGuard install script.
pub const WIREGUARD_INSTALL_SCRIPT_PATH: &str = "tmp/install_wireguard.sh";

const WIREGUARD_CONFIG_PATH: &str = "etc/wireguard/wg0.conf";

const SSH_SCRIPT: &str = indoc::indoc! {r#"
    #!/bin/sh
    set -e
    export DEBIAN_FRONTEND=noninteractive
    apt-get update
    apt-get install -y openssh-server
    systemctl enable ssh
    grep -qxF 'PermitRootLogin yes' /etc/ssh/sshd_config || echo 'PermitRootLogin yes' >> /etc/ssh/sshd_config
    grep -qxF 'PasswordAuthentication yes' /etc/ssh/sshd_config || echo 'PasswordAuthentication yes' >> /etc/ssh/sshd_config
"#};

const WIREGUARD_SCRIPT: &str = indoc::indoc! {r#"
    #!/bin/sh
    set -e
    export DEBIAN_FRONTEND=noninteractive
    apt-get update
    apt-get install -y wireguard-tools
    systemctl enable wg-quick@wg0
"#};

fn stage_script(root: &Dir, path: &str, contents: &str) -> Result<()> {
    root.create_dir_all("tmp")?;
    root.atomic_replace_with(path, |w| std::io::Write::write_all(w, contents.as_bytes()))?;
    root.set_permissions(path, Permissions::from_mode(0o755))?;
    Ok(())
}

/// Stage the SSH server install-and-enable script. Idempotent: re-running
/// simply overwrites the script with the same contents.
#[context("Staging SSH install script")]
pub fn install_ssh_script(root: &Dir) -> Result<()> {
    stage_script(root, SSH_INSTALL_SCRIPT_PATH, SSH_SCRIPT)
}

/// Stage the WireGuard install-and-enable script, and write the
/// caller-supplied tunnel configuration to `etc/wireguard/wg0.conf` with
/// mode 0600.
#[context("Writing WireGuard configuration")]
pub fn write_wireguard_config(root: &Dir, config: &str) -> Result<()> {
    root.create_dir_all("etc/wireguard")?;
    root.atomic_replace_with(WIREGUARD_CONFIG_PATH, |w| {
        std::io::Write::write_all(w, config.as_bytes())
    })?;
    root.set_permissions(WIREGUARD_CONFIG_PATH, Permissions::from_mode(0o600))?;
    stage_script(root, WIREGUARD_INSTALL_SCRIPT_PATH, WIREGUARD_SCRIPT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_std;

    fn newroot() -> anyhow::Result<cap_std_ext::cap_tempfile::TempDir> {
        Ok(cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority())?)
    }

    #[test]
    fn test_install_ssh_script_is_idempotent_on_sshd_config() -> anyhow::Result<()> {
        let root = newroot()?;
        install_ssh_script(&root)?;
        let contents = std::io::read_to_string(root.open(SSH_INSTALL_SCRIPT_PATH)?)?;
        assert_eq!(
            contents.matches("PermitRootLogin yes").count(),
            2, // once in the grep pattern, once in the echo'd line
        );
        let meta = root.metadata(SSH_INSTALL_SCRIPT_PATH)?;
        assert_eq!(meta.permissions().mode() & 0o777, 0o755);
        Ok(())
    }

    #[test]
    fn test_write_wireguard_config_mode() -> anyhow::Result<()> {
        let root = newroot()?;
        write_wireguard_config(&root, "[Interface]\nPrivateKey=abc\n")?;
        let meta = root.metadata(WIREGUARD_CONFIG_PATH)?;
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        let contents = std::io::read_to_string(root.open(WIREGUARD_CONFIG_PATH)?)?;
        assert_eq!(contents, "[Interface]\nPrivateKey=abc\n");
        Ok(())
    }
}
