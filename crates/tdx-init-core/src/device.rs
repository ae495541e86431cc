//! Block device selection policies.

use crate::cancel::CancelSignal;
use crate::error::{TdxInitError, TdxInitResult};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Block size `/proc/partitions` reports its counts in.
const PARTITION_BLOCK_SIZE: u64 = 1024;

/// Chooses the block device a run operates on.
pub trait DeviceLocator: Send + Sync {
    fn find_device(&self) -> TdxInitResult<PathBuf>;
}

/// Picks the whole SCSI disk with the most blocks.
#[derive(Debug, Clone)]
pub struct LargestDisk {
    partitions_path: PathBuf,
}

impl LargestDisk {
    pub fn new(partitions_path: impl Into<PathBuf>) -> Self {
        Self {
            partitions_path: partitions_path.into(),
        }
    }
}

impl Default for LargestDisk {
    fn default() -> Self {
        Self::new("/proc/partitions")
    }
}

impl DeviceLocator for LargestDisk {
    fn find_device(&self) -> TdxInitResult<PathBuf> {
        let contents = fs::read_to_string(&self.partitions_path).map_err(|err| {
            TdxInitError::DeviceNotFound(format!(
                "unable to read {}: {err}",
                self.partitions_path.display()
            ))
        })?;
        let (name, blocks) = largest_scsi_disk(&contents).ok_or_else(|| {
            TdxInitError::DeviceNotFound("no SCSI disk found".to_string())
        })?;
        let device = Path::new("/dev").join(name);
        info!(
            "selected largest disk {} ({} bytes)",
            device.display(),
            blocks.saturating_mul(PARTITION_BLOCK_SIZE)
        );
        Ok(device)
    }
}

/// Scan `/proc/partitions` text and return the biggest whole `sd*` disk.
/// Ties keep the first entry seen.
pub fn largest_scsi_disk(contents: &str) -> Option<(&str, u64)> {
    let mut best: Option<(&str, u64)> = None;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("major") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let name = fields[3];
        if !is_whole_scsi_disk(name) {
            continue;
        }
        let Ok(blocks) = fields[2].parse::<u64>() else {
            continue;
        };
        if best.map_or(true, |(_, size)| blocks > size) {
            best = Some((name, blocks));
        }
    }
    best
}

fn is_whole_scsi_disk(name: &str) -> bool {
    name.starts_with("sd")
        && name
            .chars()
            .last()
            .map(|c| !c.is_ascii_digit())
            .unwrap_or(false)
}

/// Returns the first lexicographic match of a glob under a device directory.
#[derive(Debug, Clone)]
pub struct PathGlob {
    base_dir: PathBuf,
    pattern: String,
}

impl PathGlob {
    pub fn new(base_dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            pattern: pattern.into(),
        }
    }
}

impl DeviceLocator for PathGlob {
    fn find_device(&self) -> TdxInitResult<PathBuf> {
        let full = self.base_dir.join(&self.pattern);
        let full = full.to_string_lossy();
        let mut matches: Vec<PathBuf> = glob::glob(&full)
            .map_err(|err| {
                TdxInitError::InvalidConfig(format!("invalid device glob `{full}`: {err}"))
            })?
            .filter_map(Result::ok)
            .collect();
        matches.sort();
        let device = matches
            .into_iter()
            .next()
            .ok_or_else(|| TdxInitError::DeviceNotFound(format!("no disk matches {full}")))?;
        info!("selected disk {} by path glob", device.display());
        Ok(device)
    }
}

/// Poll `locator` until it finds a device, `deadline` elapses, or the run is
/// cancelled. Only `DeviceNotFound` is retried.
pub async fn wait_for_device(
    locator: &dyn DeviceLocator,
    deadline: Duration,
    poll: Duration,
    cancel: &CancelSignal,
) -> TdxInitResult<PathBuf> {
    let give_up = Instant::now() + deadline;
    loop {
        if cancel.is_cancelled() {
            return Err(TdxInitError::Cancelled);
        }
        match locator.find_device() {
            Ok(device) => return Ok(device),
            Err(TdxInitError::DeviceNotFound(reason)) => {
                if Instant::now() + poll > give_up {
                    return Err(TdxInitError::DeviceNotFound(reason));
                }
                warn!("waiting for block device to appear: {reason}");
            }
            Err(other) => return Err(other),
        }
        tokio::select! {
            _ = sleep(poll) => {}
            _ = cancel.cancelled() => return Err(TdxInitError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    const PARTITIONS: &str = "major minor  #blocks  name

   8        0       1000 sda
   8        1       2000 sda1
   8       16       2000 sdb
 259        0    9000000 nvme0n1
";

    #[test]
    fn largest_skips_partitions_and_non_scsi() {
        assert_eq!(largest_scsi_disk(PARTITIONS), Some(("sdb", 2000)));
    }

    #[test]
    fn largest_keeps_first_on_tie() {
        let table = "major minor #blocks name\n 8 0 500 sdc\n 8 16 500 sdd\n";
        assert_eq!(largest_scsi_disk(table), Some(("sdc", 500)));
    }

    #[test]
    fn largest_ignores_malformed_lines() {
        let table = "garbage\n 8 0 notanumber sda\n 8 16 10 sdb\n";
        assert_eq!(largest_scsi_disk(table), Some(("sdb", 10)));
        assert_eq!(largest_scsi_disk("major minor #blocks name\n"), None);
    }

    #[test]
    fn largest_disk_reads_partition_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partitions");
        fs::write(&path, PARTITIONS).unwrap();
        let device = LargestDisk::new(&path).find_device().unwrap();
        assert_eq!(device, PathBuf::from("/dev/sdb"));
    }

    #[test]
    fn largest_disk_missing_source_is_not_found() {
        let dir = tempdir().unwrap();
        let err = LargestDisk::new(dir.path().join("absent"))
            .find_device()
            .unwrap_err();
        assert!(matches!(err, TdxInitError::DeviceNotFound(_)));
    }

    #[test]
    fn path_glob_returns_first_lexicographic_match() {
        let dir = tempdir().unwrap();
        for name in ["pci-0-scsi-0:0:0:2", "pci-0-scsi-0:0:0:1", "pci-0-ata-1"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let device = PathGlob::new(dir.path(), "*scsi*").find_device().unwrap();
        assert_eq!(device, dir.path().join("pci-0-scsi-0:0:0:1"));
    }

    #[test]
    fn path_glob_without_match_is_not_found() {
        let dir = tempdir().unwrap();
        let err = PathGlob::new(dir.path(), "*scsi*").find_device().unwrap_err();
        assert!(matches!(err, TdxInitError::DeviceNotFound(_)));
    }

    struct AppearsAfter {
        calls: AtomicUsize,
        after: usize,
    }

    impl DeviceLocator for AppearsAfter {
        fn find_device(&self) -> TdxInitResult<PathBuf> {
            let seen = self.calls.fetch_add(1, Ordering::SeqCst);
            if seen >= self.after {
                Ok(PathBuf::from("/dev/sdz"))
            } else {
                Err(TdxInitError::DeviceNotFound("not yet".into()))
            }
        }
    }

    #[tokio::test]
    async fn wait_for_device_polls_until_found() {
        let locator = AppearsAfter {
            calls: AtomicUsize::new(0),
            after: 2,
        };
        let device = wait_for_device(
            &locator,
            Duration::from_secs(5),
            Duration::from_millis(10),
            &CancelSignal::never(),
        )
        .await
        .unwrap();
        assert_eq!(device, PathBuf::from("/dev/sdz"));
        assert_eq!(locator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wait_for_device_gives_up_after_deadline() {
        let locator = AppearsAfter {
            calls: AtomicUsize::new(0),
            after: usize::MAX,
        };
        let err = wait_for_device(
            &locator,
            Duration::from_millis(30),
            Duration::from_millis(10),
            &CancelSignal::never(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TdxInitError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn wait_for_device_honours_cancellation() {
        let locator = AppearsAfter {
            calls: AtomicUsize::new(0),
            after: usize::MAX,
        };
        let (handle, signal) = cancel_pair();
        handle.cancel();
        let err = wait_for_device(
            &locator,
            Duration::from_secs(60),
            Duration::from_secs(1),
            &signal,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TdxInitError::Cancelled));
    }
}
