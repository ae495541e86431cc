//! System-backed `VolumeProvider`: shells out to `cryptsetup`, `mkfs.ext4`,
//! `mount` and `umount`, and reads the live mount table.

use crate::command::{CommandRunner, Output};
use crate::parse::is_mount_target;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tdx_init_core::config::SetupConfig;
use tdx_init_core::error::{TdxInitError, TdxInitResult};
use tdx_init_core::provider::VolumeProvider;

/// Default locations probed for `cryptsetup`.
pub const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/sbin/cryptsetup",
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/bin/cryptsetup",
];

/// Default locations probed for `mkfs.ext4`.
pub const DEFAULT_MKFS_PATHS: &[&str] = &[
    "/sbin/mkfs.ext4",
    "/usr/sbin/mkfs.ext4",
    "/usr/bin/mkfs.ext4",
];

pub const DEFAULT_MOUNT_PATHS: &[&str] = &["/bin/mount", "/usr/bin/mount", "/sbin/mount"];

pub const DEFAULT_UMOUNT_PATHS: &[&str] = &["/bin/umount", "/usr/bin/umount", "/sbin/umount"];

/// `cryptsetup isLuks` exit status for "not a LUKS device".
const NOT_LUKS_STATUS: i32 = 1;

#[derive(Debug, Clone)]
pub struct SystemLuksProvider {
    cryptsetup: CommandRunner,
    mkfs: CommandRunner,
    mount: CommandRunner,
    umount: CommandRunner,
    mounts_path: PathBuf,
}

impl SystemLuksProvider {
    /// Build a provider from `tools`, discovering binaries that are not pinned.
    pub fn from_config(config: &SetupConfig) -> TdxInitResult<Self> {
        let timeout = config.tool_timeout();
        let tools = &config.tools;
        Ok(Self {
            cryptsetup: Self::runner(
                "cryptsetup",
                tools.cryptsetup_path.as_deref(),
                DEFAULT_CRYPTSETUP_PATHS,
                timeout,
            )?,
            mkfs: Self::runner(
                "mkfs.ext4",
                tools.mkfs_path.as_deref(),
                DEFAULT_MKFS_PATHS,
                timeout,
            )?,
            mount: Self::runner(
                "mount",
                tools.mount_path.as_deref(),
                DEFAULT_MOUNT_PATHS,
                timeout,
            )?,
            umount: Self::runner(
                "umount",
                tools.umount_path.as_deref(),
                DEFAULT_UMOUNT_PATHS,
                timeout,
            )?,
            mounts_path: tools.mounts_path.clone(),
        })
    }

    fn runner(
        name: &str,
        explicit: Option<&str>,
        candidates: &[&str],
        timeout: Duration,
    ) -> TdxInitResult<CommandRunner> {
        if let Some(path) = explicit {
            return Self::runner_with_path(PathBuf::from(path), timeout);
        }
        candidates
            .iter()
            .map(Path::new)
            .find(|candidate| candidate.exists())
            .map(|found| CommandRunner::new(found.to_path_buf(), timeout))
            .ok_or_else(|| {
                TdxInitError::InvalidConfig(format!(
                    "unable to locate {name} binary; tried {candidates:?}"
                ))
            })
    }

    fn runner_with_path(path: PathBuf, timeout: Duration) -> TdxInitResult<CommandRunner> {
        if !path.exists() {
            return Err(TdxInitError::InvalidConfig(format!(
                "binary not found at {}",
                path.display()
            )));
        }
        Ok(CommandRunner::new(path, timeout))
    }

    /// Run and turn a non-zero exit into an `ExternalTool` error.
    fn run_checked(
        runner: &CommandRunner,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> TdxInitResult<Output> {
        let out = runner.run(args, input)?;
        if out.status != 0 {
            return Err(Self::classify_cli_error(runner.binary(), args, &out));
        }
        Ok(out)
    }

    fn classify_cli_error(binary: &Path, args: &[&str], output: &Output) -> TdxInitError {
        let diagnostic = output.diagnostic();
        TdxInitError::tool(format!(
            "{} {} exited with code {}: {}",
            binary.display(),
            args.join(" "),
            output.status,
            if diagnostic.is_empty() {
                "no additional output"
            } else {
                diagnostic
            }
        ))
    }
}

fn path_arg(path: &Path) -> TdxInitResult<&str> {
    path.to_str().ok_or_else(|| {
        TdxInitError::InvalidConfig(format!("path {} is not valid UTF-8", path.display()))
    })
}

impl VolumeProvider for SystemLuksProvider {
    fn has_header(&self, device: &Path) -> TdxInitResult<bool> {
        let args = ["isLuks", path_arg(device)?];
        let out = self.cryptsetup.run(&args, None)?;
        match out.status {
            0 => Ok(true),
            NOT_LUKS_STATUS => Ok(false),
            _ => Err(Self::classify_cli_error(self.cryptsetup.binary(), &args, &out)),
        }
    }

    fn format(&self, device: &Path, passphrase: &[u8]) -> TdxInitResult<()> {
        let args = [
            "luksFormat",
            "--type",
            "luks2",
            "-q",
            "--key-file",
            "-",
            path_arg(device)?,
        ];
        Self::run_checked(&self.cryptsetup, &args, Some(passphrase))?;
        Ok(())
    }

    fn open(&self, device: &Path, name: &str, passphrase: &[u8]) -> TdxInitResult<()> {
        let args = ["open", "--key-file", "-", path_arg(device)?, name];
        Self::run_checked(&self.cryptsetup, &args, Some(passphrase))?;
        Ok(())
    }

    fn close(&self, name: &str) -> TdxInitResult<()> {
        Self::run_checked(&self.cryptsetup, &["close", name], None)?;
        Ok(())
    }

    fn make_filesystem(&self, mapper_device: &Path) -> TdxInitResult<()> {
        Self::run_checked(&self.mkfs, &[path_arg(mapper_device)?], None)?;
        Ok(())
    }

    fn mount(&self, source: &Path, target: &Path) -> TdxInitResult<()> {
        Self::run_checked(&self.mount, &[path_arg(source)?, path_arg(target)?], None)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> TdxInitResult<()> {
        Self::run_checked(&self.umount, &[path_arg(target)?], None)?;
        Ok(())
    }

    fn is_mounted(&self, mount_point: &Path) -> TdxInitResult<bool> {
        let contents = fs::read_to_string(&self.mounts_path)?;
        Ok(is_mount_target(&contents, mount_point))
    }

    fn import_token(&self, device: &Path, slot: u32, token_json: &str) -> TdxInitResult<()> {
        let slot = slot.to_string();
        let args = ["token", "import", "--token-id", slot.as_str(), path_arg(device)?];
        Self::run_checked(&self.cryptsetup, &args, Some(token_json.as_bytes()))?;
        Ok(())
    }

    fn export_token(&self, device: &Path, slot: u32) -> TdxInitResult<Option<String>> {
        let slot = slot.to_string();
        let args = ["token", "export", "--token-id", slot.as_str(), path_arg(device)?];
        let out = self.cryptsetup.run(&args, None)?;
        if out.status != 0 {
            warn!(
                "no token exported from slot {slot} of {}: {}",
                device.display(),
                out.diagnostic()
            );
            return Ok(None);
        }
        debug!("exported token from slot {slot} of {}", device.display());
        Ok(Some(out.stdout))
    }
}
