//! Maps `(distro, release, arch)` to a bootstrap tool, mirror URL, and
//! suite name, and normalizes architecture strings.

use crate::error::{OrchestratorError, Result};

/// The Debian-family bootstrap utility. Debian and Ubuntu are the only
/// supported distro families; anything else is rejected here, fast, rather
/// than mid-pipeline.
pub const DEBOOTSTRAP: &str = "debootstrap";

/// A resolved `(distro, release, arch)` lookup, ready to drive
/// `bootstrap_rootfs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDistro {
    /// The distro family, e.g. `"debian"` or `"ubuntu"`.
    pub distro: String,
    /// The normalized architecture, e.g. `"amd64"`.
    pub arch: String,
    /// The bootstrap suite/codename, e.g. `"bookworm"` or `"jammy"`.
    pub suite: String,
    /// The mirror URL to bootstrap from.
    pub mirror: String,
    /// The bootstrap tool to invoke.
    pub bootstrap_tool: &'static str,
}

/// Normalize a host-reported architecture string to the catalog's vocabulary.
/// Unrecognized values pass through unchanged.
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

fn ubuntu_suite(release: &str) -> &str {
    match release {
        "20.04" => "focal",
        "22.04" => "jammy",
        "24.04" => "noble",
        other => other,
    }
}

/// Resolve a `ContainerSpec.distro` string (`"<distro>:<release>"`) and a
/// raw host architecture into everything `bootstrap_rootfs` needs.
pub fn resolve(distro_spec: &str, host_arch: &str) -> Result<ResolvedDistro> {
    let (distro, release) = distro_spec.split_once(':').ok_or_else(|| {
        OrchestratorError::Unsupported(format!(
            "malformed distro spec {distro_spec:?}, expected \"<distro>:<release>\""
        ))
    })?;
    let arch = normalize_arch(host_arch);

    let bootstrap_tool = match distro {
        "debian" | "ubuntu" => DEBOOTSTRAP,
        other => {
            return Err(OrchestratorError::Unsupported(format!(
                "distro {other:?} is not in the catalog"
            )))
        }
    };

    let mirror = match (distro, arch.as_str()) {
        ("ubuntu", "arm64") => "http://ports.ubuntu.com/ubuntu-ports",
        ("ubuntu", _) => "http://archive.ubuntu.com/ubuntu",
        ("debian", _) => "http://deb.debian.org/debian",
        _ => unreachable!("bootstrap_tool match above already rejects other distros"),
    }
    .to_string();

    let suite = match distro {
        "ubuntu" => ubuntu_suite(release).to_string(),
        _ => release.to_string(),
    };

    Ok(ResolvedDistro {
        distro: distro.to_string(),
        arch,
        suite,
        mirror,
        bootstrap_tool,
    })
}
