//! System-backed volume provider for tdx-init. `system` implements the
//! provider; `command` and `parse` cover process spawning and the mount table.

mod command;
mod parse;
mod system;

pub use system::{
    SystemLuksProvider, DEFAULT_CRYPTSETUP_PATHS, DEFAULT_MKFS_PATHS, DEFAULT_MOUNT_PATHS,
    DEFAULT_UMOUNT_PATHS,
};
