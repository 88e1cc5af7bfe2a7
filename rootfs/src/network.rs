//! DNS and network-unit configuration inside a freshly bootstrapped root.

use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::Result;

const RESOLV_CONF: &str = "etc/resolv.conf";
const NETWORK_UNIT_DIR: &str = "etc/systemd/network";
const NETWORK_UNIT_NAME: &str = "80-container-host0.network";

/// Whether a container's network unit should accept router advertisements
/// for native IPv6. `wireguard`-mode containers handle IPv6 entirely inside
/// the guest tunnel and never set this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6Mode {
    /// No IPv6 configuration on the bridge interface.
    Disabled,
    /// Accept router advertisements on the bridge interface.
    AcceptRa,
}

/// Point the guest at public DNS resolvers, replacing whatever
/// `resolv.conf` the bootstrap tool left behind.
///
/// If `etc/resolv.conf` is a symlink (as debootstrap typically leaves it,
/// pointing at systemd-resolved's stub), it is removed first so the
/// replacement is a real file.
#[context("Configuring DNS")]
pub fn configure_dns(root: &Dir) -> Result<()> {
    if let Ok(meta) = root.symlink_metadata(RESOLV_CONF) {
        if meta.file_type().is_symlink() {
            root.remove_file(RESOLV_CONF)?;
        }
    }
    root.atomic_replace_with(RESOLV_CONF, |w| {
        std::io::Write::write_all(w, b"nameserver 8.8.8.8\nnameserver 1.1.1.1\n")
    })?;
    Ok(())
}

/// Write a systemd-networkd unit attaching the guest's default interface to
/// the host bridge via DHCP, with IPv6 behavior controlled by `ipv6`.
#[context("Configuring network")]
pub fn write_network_unit(root: &Dir, bridge: &str, ipv6: Ipv6Mode) -> Result<()> {
    root.create_dir_all(NETWORK_UNIT_DIR)?;
    let accept_ra = match ipv6 {
        Ipv6Mode::Disabled => "no",
        Ipv6Mode::AcceptRa => "yes",
    };
    let contents = format!(
        indoc::indoc! {"
            [Match]
            Name=host0

            [Network]
            Bridge={bridge}
            DHCP=ipv4
            IPv6AcceptRA={accept_ra}
        "},
        bridge = bridge,
        accept_ra = accept_ra,
    );
    let path = camino::Utf8Path::new(NETWORK_UNIT_DIR).join(NETWORK_UNIT_NAME);
    root.atomic_replace_with(path.as_str(), |w| {
        std::io::Write::write_all(w, contents.as_bytes())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_std;

    fn newroot() -> anyhow::Result<cap_std_ext::cap_tempfile::TempDir> {
        Ok(cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority())?)
    }

    #[test]
    fn test_configure_dns_removes_symlink() -> anyhow::Result<()> {
        let root = newroot()?;
        root.create_dir("etc")?;
        root.symlink("../run/systemd/resolve/stub-resolv.conf", RESOLV_CONF)?;
        configure_dns(&root)?;
        let meta = root.symlink_metadata(RESOLV_CONF)?;
        assert!(!meta.file_type().is_symlink());
        let contents = std::io::read_to_string(root.open(RESOLV_CONF)?)?;
        assert_eq!(contents, "nameserver 8.8.8.8\nnameserver 1.1.1.1\n");
        Ok(())
    }

    #[test]
    fn test_configure_dns_plain_file() -> anyhow::Result<()> {
        let root = newroot()?;
        root.create_dir("etc")?;
        root.write(RESOLV_CONF, b"nameserver 127.0.0.53\n")?;
        configure_dns(&root)?;
        let contents = std::io::read_to_string(root.open(RESOLV_CONF)?)?;
        assert_eq!(contents, "nameserver 8.8.8.8\nnameserver 1.1.1.1\n");
        Ok(())
    }

    #[test]
    fn test_write_network_unit() -> anyhow::Result<()> {
        let root = newroot()?;
        write_network_unit(&root, "br0", Ipv6Mode::AcceptRa)?;
        let path = camino::Utf8Path::new(NETWORK_UNIT_DIR).join(NETWORK_UNIT_NAME);
        let contents = std::io::read_to_string(root.open(path.as_str())?)?;
        assert!(contents.contains("Bridge=br0"));
        assert!(contents.contains("DHCP=ipv4"));
        assert!(contents.contains("IPv6AcceptRA=yes"));
        Ok(())
    }
}
