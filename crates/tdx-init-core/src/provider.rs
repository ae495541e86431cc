use crate::error::TdxInitResult;
use std::path::Path;

/// Header slot the bound public key is stored in.
pub const METADATA_TOKEN_SLOT: u32 = 1;

/// State of the target device, recomputed from the system on every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    /// No recognizable encryption header.
    Unformatted,
    /// Header present, mount point not mounted.
    Formatted,
    /// Mount point already present in the live mount table.
    Mounted,
}

/// Abstraction over the block-encryption, filesystem and mount tooling.
///
/// Implementations are thin wrappers over single tool invocations so the
/// volume lifecycle can be exercised without touching real devices. Every
/// method is synchronous; rollback on partial failure is the caller's job.
pub trait VolumeProvider {
    /// Whether `device` carries a recognizable encrypted-volume header.
    fn has_header(&self, device: &Path) -> TdxInitResult<bool>;

    /// Format `device` as a new encrypted volume unlocked by `passphrase`.
    fn format(&self, device: &Path, passphrase: &[u8]) -> TdxInitResult<()>;

    /// Unlock `device` and expose it as the mapper `name`.
    fn open(&self, device: &Path, name: &str, passphrase: &[u8]) -> TdxInitResult<()>;

    /// Tear down the mapper `name`.
    fn close(&self, name: &str) -> TdxInitResult<()>;

    /// Create a filesystem on the unlocked mapper device.
    fn make_filesystem(&self, mapper_device: &Path) -> TdxInitResult<()>;

    fn mount(&self, source: &Path, target: &Path) -> TdxInitResult<()>;

    fn unmount(&self, target: &Path) -> TdxInitResult<()>;

    /// Whether `mount_point` currently appears in the live mount table.
    fn is_mounted(&self, mount_point: &Path) -> TdxInitResult<bool>;

    /// Import a JSON token into header slot `slot`.
    fn import_token(&self, device: &Path, slot: u32, token_json: &str) -> TdxInitResult<()>;

    /// Export the JSON token stored in slot `slot`, or `None` when the slot is empty.
    fn export_token(&self, device: &Path, slot: u32) -> TdxInitResult<Option<String>>;
}

impl<T: VolumeProvider + ?Sized> VolumeProvider for &T {
    fn has_header(&self, device: &Path) -> TdxInitResult<bool> {
        (**self).has_header(device)
    }

    fn format(&self, device: &Path, passphrase: &[u8]) -> TdxInitResult<()> {
        (**self).format(device, passphrase)
    }

    fn open(&self, device: &Path, name: &str, passphrase: &[u8]) -> TdxInitResult<()> {
        (**self).open(device, name, passphrase)
    }

    fn close(&self, name: &str) -> TdxInitResult<()> {
        (**self).close(name)
    }

    fn make_filesystem(&self, mapper_device: &Path) -> TdxInitResult<()> {
        (**self).make_filesystem(mapper_device)
    }

    fn mount(&self, source: &Path, target: &Path) -> TdxInitResult<()> {
        (**self).mount(source, target)
    }

    fn unmount(&self, target: &Path) -> TdxInitResult<()> {
        (**self).unmount(target)
    }

    fn is_mounted(&self, mount_point: &Path) -> TdxInitResult<bool> {
        (**self).is_mounted(mount_point)
    }

    fn import_token(&self, device: &Path, slot: u32, token_json: &str) -> TdxInitResult<()> {
        (**self).import_token(device, slot, token_json)
    }

    fn export_token(&self, device: &Path, slot: u32) -> TdxInitResult<Option<String>> {
        (**self).export_token(device, slot)
    }
}
