//! Helpers for reading the kernel mount table.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

/// Mount targets listed in `/proc/mounts`-formatted `contents`.
pub(crate) fn mount_targets(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_octal)
        .collect()
}

pub(crate) fn is_mount_target(contents: &str, mount_point: &Path) -> bool {
    mount_targets(contents)
        .iter()
        .any(|target| target.as_path() == mount_point)
}

/// The kernel writes space, tab, newline and backslash in mount paths as
/// three-digit octal escapes (`\040` and friends).
fn unescape_octal(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value =
                (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    PathBuf::from(OsString::from_vec(out))
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3
        && digits.iter().all(|d| (b'0'..=b'7').contains(d))
        && digits[0] <= b'3'
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/vda1 / ext4 rw,relatime 0 0
/dev/mapper/cryptdisk /persistent ext4 rw,relatime 0 0
/dev/sdc1 /mnt/backup\\040disk ext4 rw 0 0
";

    #[test]
    fn finds_exact_mount_point() {
        assert!(is_mount_target(MOUNTS, Path::new("/persistent")));
        assert!(is_mount_target(MOUNTS, Path::new("/persistent/")));
        assert!(!is_mount_target(MOUNTS, Path::new("/persist")));
        assert!(!is_mount_target(MOUNTS, Path::new("/persistent/data")));
    }

    #[test]
    fn decodes_escaped_spaces() {
        assert!(is_mount_target(MOUNTS, Path::new("/mnt/backup disk")));
        assert!(!is_mount_target(MOUNTS, Path::new("/mnt/backup\\040disk")));
    }

    #[test]
    fn leaves_non_escapes_alone() {
        assert_eq!(unescape_octal("/a\\9b"), PathBuf::from("/a\\9b"));
        assert_eq!(unescape_octal("/tail\\04"), PathBuf::from("/tail\\04"));
        assert_eq!(unescape_octal("/a\\134b"), PathBuf::from("/a\\b"));
    }

    #[test]
    fn ignores_short_lines() {
        assert_eq!(mount_targets("garbage\n\n"), Vec::<PathBuf>::new());
    }
}
