//! Materializes the operator key into the guest's SSH configuration.

use crate::error::TdxInitResult;
use crate::key::PublicKey;
use log::{debug, info, warn};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{chown, OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// Options forced onto the authorized key.
const KEY_RESTRICTIONS: &str = "no-port-forwarding,no-agent-forwarding,no-X11-forwarding";
const AUTHORIZED_KEYS: &str = "authorized_keys";

/// Owner of the SSH directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SshOwner {
    pub uid: u32,
    pub gid: u32,
}

/// Single authorized_keys entry for `key`.
pub fn authorized_keys_line(key: &PublicKey) -> String {
    format!("{KEY_RESTRICTIONS} ssh-ed25519 {}", key.as_str())
}

/// Write `key` into `ssh_dir/authorized_keys` and the flat `key_file`.
///
/// The flat file is read back when the key is embedded into the volume
/// header, so it must be in place before provisioning starts.
pub fn persist_key(
    key: &PublicKey,
    ssh_dir: &Path,
    key_file: &Path,
    owner: SshOwner,
) -> TdxInitResult<()> {
    fs::create_dir_all(ssh_dir)?;
    fs::set_permissions(ssh_dir, fs::Permissions::from_mode(0o700))?;
    if let Err(err) = chown(ssh_dir, Some(owner.uid), Some(owner.gid)) {
        warn!(
            "could not set ownership of {} to {}:{}: {err}",
            ssh_dir.display(),
            owner.uid,
            owner.gid
        );
    }

    let authorized_keys = ssh_dir.join(AUTHORIZED_KEYS);
    let line = authorized_keys_line(key);
    let existing = match fs::read_to_string(&authorized_keys) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
    };
    if existing.lines().any(|entry| entry == line) {
        debug!("{} already carries the key", authorized_keys.display());
    } else {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&authorized_keys)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::set_permissions(&authorized_keys, fs::Permissions::from_mode(0o600))?;

    write_key_file(key_file, key.as_str().as_bytes())?;
    info!(
        "persisted public key sha256:{} to {} and {}",
        key.fingerprint(),
        authorized_keys.display(),
        key_file.display()
    );
    Ok(())
}

/// Write the raw key bytes with owner-only permissions.
fn write_key_file(path: &Path, key: &[u8]) -> TdxInitResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, key)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{SAMPLE_KEY, SECOND_KEY};
    use tempfile::tempdir;

    fn owner() -> SshOwner {
        SshOwner {
            uid: 1000,
            gid: 1000,
        }
    }

    #[test]
    fn persist_writes_both_files_with_owner_only_modes() {
        let dir = tempdir().unwrap();
        let ssh_dir = dir.path().join("home").join(".ssh");
        let key_file = dir.path().join("etc").join("root_key");
        let key = PublicKey::parse(SAMPLE_KEY).unwrap();

        persist_key(&key, &ssh_dir, &key_file, owner()).unwrap();

        let authorized = fs::read_to_string(ssh_dir.join("authorized_keys")).unwrap();
        assert_eq!(
            authorized,
            format!(
                "no-port-forwarding,no-agent-forwarding,no-X11-forwarding ssh-ed25519 {SAMPLE_KEY}\n"
            )
        );
        assert_eq!(fs::read_to_string(&key_file).unwrap(), SAMPLE_KEY);

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&ssh_dir), 0o700);
        assert_eq!(mode(&ssh_dir.join("authorized_keys")), 0o600);
        assert_eq!(mode(&key_file), 0o600);
    }

    #[test]
    fn persist_appends_without_duplicating() {
        let dir = tempdir().unwrap();
        let ssh_dir = dir.path().join(".ssh");
        fs::create_dir_all(&ssh_dir).unwrap();
        fs::write(ssh_dir.join("authorized_keys"), "ssh-ed25519 AAAAexisting").unwrap();
        let key_file = dir.path().join("key");

        let first = PublicKey::parse(SAMPLE_KEY).unwrap();
        persist_key(&first, &ssh_dir, &key_file, owner()).unwrap();
        persist_key(&first, &ssh_dir, &key_file, owner()).unwrap();
        let second = PublicKey::parse(SECOND_KEY).unwrap();
        persist_key(&second, &ssh_dir, &key_file, owner()).unwrap();

        let authorized = fs::read_to_string(ssh_dir.join("authorized_keys")).unwrap();
        let lines: Vec<&str> = authorized.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "ssh-ed25519 AAAAexisting");
        assert_eq!(lines[1], authorized_keys_line(&first));
        assert_eq!(lines[2], authorized_keys_line(&second));
        assert_eq!(fs::read_to_string(&key_file).unwrap(), SECOND_KEY);
    }
}
