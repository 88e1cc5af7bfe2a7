//! Direct-shadow-file root password provisioning.
//!
//! This is the only password path the core implements; the source's other
//! prior path (in-guest `chpasswd`, which requires booting or `nspawn`-ing
//! into the guest) is deprecated and intentionally absent here.

use cap_std_ext::cap_std::fs::{Dir, Permissions, PermissionsExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use chrono::{NaiveDate, Utc};
use fn_error_context::context;
use rustix::fs::{chownat, AtFlags, Gid, Uid};
use sha_crypt::{sha512_simple, Sha512Params};

use crate::{Error, Result};

const SHADOW_PATH: &str = "etc/shadow";
const PASSWD_PATH: &str = "etc/passwd";

fn days_since_epoch() -> i64 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
    Utc::now().date_naive().signed_duration_since(epoch).num_days()
}

/// Set the root account's password by writing `etc/shadow` directly.
///
/// Never boots or enters the guest, and never shells out to `chpasswd`.
#[context("Setting root password")]
pub fn set_root_password(root: &Dir, password: &str) -> Result<()> {
    let passwd = read_file(root, PASSWD_PATH)?;
    if !passwd.lines().any(|l| l.starts_with("root:")) {
        return Err(Error::NoRootUser);
    }

    let hash = sha512_simple(password, &Sha512Params::default())
        .map_err(|e| Error::HashFailure(format!("{e:?}")))?;
    let days = days_since_epoch();

    let shadow = read_file(root, SHADOW_PATH)?;
    let mut found = false;
    let mut lines: Vec<String> = shadow
        .lines()
        .map(|line| {
            if let Some(rest) = line.strip_prefix("root:") {
                found = true;
                let mut fields: Vec<&str> = rest.split(':').collect();
                // root:<hash>:<days>:<min>:<max>:<warn>:<inactive>:<expire>:
                if fields.len() < 8 {
                    fields.resize(8, "");
                }
                let days_s = days.to_string();
                fields[0] = hash.as_str();
                fields[1] = days_s.as_str();
                format!("root:{}", fields.join(":"))
            } else {
                line.to_string()
            }
        })
        .collect();

    if !found {
        lines.insert(0, format!("root:{hash}:{days}:0:99999:7:::"));
    }
    let mut contents = lines.join("\n");
    contents.push('\n');

    root.atomic_replace_with(SHADOW_PATH, |w| std::io::Write::write_all(w, contents.as_bytes()))?;
    root.set_permissions(SHADOW_PATH, Permissions::from_mode(0o640))?;
    chownat(
        root,
        SHADOW_PATH,
        Some(Uid::ROOT),
        Some(Gid::ROOT),
        AtFlags::empty(),
    )
    .map_err(std::io::Error::from)?;

    Ok(())
}

fn read_file(root: &Dir, path: &str) -> Result<String> {
    if !root.try_exists(path).map_err(|e| Error::PathIo {
        path: path.into(),
        err: e,
    })? {
        return Ok(String::new());
    }
    let mut f = root.open(path).map_err(|e| Error::PathIo {
        path: path.into(),
        err: e,
    })?;
    let mut s = String::new();
    std::io::Read::read_to_string(&mut f, &mut s).map_err(|e| Error::PathIo {
        path: path.into(),
        err: e,
    })?;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_std;

    fn newroot() -> anyhow::Result<cap_std_ext::cap_tempfile::TempDir> {
        let root = cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority())?;
        root.create_dir("etc")?;
        root.write(PASSWD_PATH, b"root:x:0:0:root:/root:/bin/bash\n")?;
        Ok(root)
    }

    #[test]
    fn test_no_root_user_rejected() -> anyhow::Result<()> {
        let root = newroot()?;
        root.write(PASSWD_PATH, b"bin:x:1:1:bin:/bin:/usr/sbin/nologin\n")?;
        let err = set_root_password(&root, "hunter2!").unwrap_err();
        assert!(matches!(err, Error::NoRootUser));
        Ok(())
    }

    #[test]
    fn test_set_root_password_prepends_when_missing() -> anyhow::Result<()> {
        let root = newroot()?;
        set_root_password(&root, "hunter2!")?;
        let shadow = read_file(&root, SHADOW_PATH)?;
        let line = shadow.lines().next().unwrap();
        assert!(line.starts_with("root:$6$"));
        let fields: Vec<&str> = line.split(':').collect();
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[2].parse::<i64>().unwrap(), days_since_epoch());
        assert_eq!(fields[3], "0");
        assert_eq!(fields[4], "99999");
        assert_eq!(fields[5], "7");

        let hash = fields[1];
        sha_crypt::sha512_check("hunter2!", hash).expect("password verifies");
        assert!(sha_crypt::sha512_check("wrong", hash).is_err());
        Ok(())
    }

    #[test]
    fn test_set_root_password_replaces_existing_line() -> anyhow::Result<()> {
        let root = newroot()?;
        root.write(SHADOW_PATH, b"root:!locked:19000:0:99999:7:::\ndaemon:*:19000:0:99999:7:::\n")?;
        set_root_password(&root, "newpass1")?;
        let shadow = read_file(&root, SHADOW_PATH)?;
        let mut lines = shadow.lines();
        let root_line = lines.next().unwrap();
        assert!(root_line.starts_with("root:$6$"));
        assert_eq!(lines.next().unwrap(), "daemon:*:19000:0:99999:7:::");
        Ok(())
    }
}
