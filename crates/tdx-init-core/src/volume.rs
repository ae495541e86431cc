//! Volume lifecycle: brings the target device to "open and mounted", either by
//! formatting it once or by unlocking an existing volume.

use crate::config::SetupOptions;
use crate::error::{TdxInitError, TdxInitResult};
use crate::provider::{VolumeProvider, VolumeState, METADATA_TOKEN_SLOT};
use crate::token::MetadataToken;
use log::{info, warn};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Which transition `provision` performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Unformatted -> Mounted: formatted, filesystem created, key embedded.
    Initialized,
    /// Formatted -> Mounted: unlocked and mounted.
    Resumed,
}

/// Drives the `VolumeProvider` through first-time and resume paths.
pub struct VolumeManager<P: VolumeProvider> {
    provider: P,
    lock_file: PathBuf,
}

/// Steps already taken that must be undone if a later step fails.
#[derive(Default)]
struct Progress<'a> {
    opened: Option<&'a str>,
    mounted: Option<&'a Path>,
}

impl<'a> Progress<'a> {
    /// Undo completed steps in reverse order; returns joined cleanup failures.
    fn unwind<P: VolumeProvider>(&self, provider: &P) -> Option<String> {
        let mut failures = Vec::new();
        if let Some(target) = self.mounted {
            if let Err(err) = provider.unmount(target) {
                failures.push(format!("error unmounting filesystem: {}", detail(&err)));
            }
        }
        if let Some(name) = self.opened {
            if let Err(err) = provider.close(name) {
                failures.push(format!("error closing LUKS device: {}", detail(&err)));
            }
        }
        (!failures.is_empty()).then(|| failures.join("; "))
    }
}

/// Message of an error without its code prefix.
fn detail(err: &TdxInitError) -> String {
    match err.root() {
        TdxInitError::ExternalTool { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

impl<P: VolumeProvider> VolumeManager<P> {
    pub fn new(provider: P, lock_file: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            lock_file: lock_file.into(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Derive the current state of `device` from the header probe and mount table.
    pub fn probe(&self, device: &Path, mount_point: &Path) -> TdxInitResult<VolumeState> {
        if self.provider.is_mounted(mount_point)? {
            return Ok(VolumeState::Mounted);
        }
        if self.provider.has_header(device)? {
            Ok(VolumeState::Formatted)
        } else {
            Ok(VolumeState::Unformatted)
        }
    }

    /// Bring `device` to the mounted state.
    ///
    /// Fails with `AlreadyMounted` when the mount point is already live, and
    /// with `MissingKeyFile` when the key has not been materialized yet.
    pub fn provision(
        &self,
        device: &Path,
        passphrase: &[u8],
        options: &SetupOptions,
    ) -> TdxInitResult<ProvisionOutcome> {
        let _lock = acquire_lock(&self.lock_file)?;

        if self.provider.is_mounted(&options.mount_point)? {
            return Err(TdxInitError::AlreadyMounted(options.mount_point.clone()));
        }

        if !options.key_file.exists() {
            return Err(TdxInitError::MissingKeyFile(options.key_file.clone()));
        }

        if self.provider.has_header(device)? {
            self.resume(device, passphrase, options)?;
            info!(
                "encrypted disk {} mounted at {}",
                device.display(),
                options.mount_point.display()
            );
            Ok(ProvisionOutcome::Resumed)
        } else {
            self.initialize(device, passphrase, options)?;
            info!(
                "encrypted disk {} initialized and mounted at {}",
                device.display(),
                options.mount_point.display()
            );
            Ok(ProvisionOutcome::Initialized)
        }
    }

    fn resume(&self, device: &Path, passphrase: &[u8], options: &SetupOptions) -> TdxInitResult<()> {
        let mut progress = Progress::default();

        info!("unlocking existing volume on {}", device.display());
        self.provider
            .open(device, &options.mapper_name, passphrase)
            .map_err(|err| self.fail(&progress, "error opening LUKS device", err))?;
        progress.opened = Some(options.mapper_name.as_str());

        self.mount_mapper(options, &mut progress)
    }

    fn initialize(
        &self,
        device: &Path,
        passphrase: &[u8],
        options: &SetupOptions,
    ) -> TdxInitResult<()> {
        let mut progress = Progress::default();

        info!("formatting {} with LUKS2", device.display());
        self.provider
            .format(device, passphrase)
            .map_err(|err| self.fail(&progress, "error formatting disk", err))?;

        self.provider
            .open(device, &options.mapper_name, passphrase)
            .map_err(|err| self.fail(&progress, "error opening LUKS device", err))?;
        progress.opened = Some(options.mapper_name.as_str());

        info!("creating filesystem on {}", options.mapper_device.display());
        self.provider
            .make_filesystem(&options.mapper_device)
            .map_err(|err| self.fail(&progress, "error creating filesystem", err))?;

        self.mount_mapper(options, &mut progress)?;

        let key = fs::read_to_string(&options.key_file)
            .map_err(|err| self.fail(&progress, "error reading SSH key file", err.into()))?;
        let token = MetadataToken::with_metadata(key)
            .to_json()
            .map_err(|err| self.fail(&progress, "error serializing token JSON", err))?;

        info!("embedding public key into header token slot {METADATA_TOKEN_SLOT}");
        self.provider
            .import_token(device, METADATA_TOKEN_SLOT, &token)
            .map_err(|err| self.fail(&progress, "error importing token to LUKS header", err))?;
        Ok(())
    }

    fn mount_mapper<'a>(
        &self,
        options: &'a SetupOptions,
        progress: &mut Progress<'a>,
    ) -> TdxInitResult<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&options.mount_point)
            .map_err(|err| self.fail(progress, "error creating mount point", err.into()))?;

        self.provider
            .mount(&options.mapper_device, &options.mount_point)
            .map_err(|err| self.fail(progress, "error mounting filesystem", err))?;
        progress.mounted = Some(options.mount_point.as_path());
        Ok(())
    }

    /// Roll back `progress` and fold any cleanup failure into the error.
    fn fail(&self, progress: &Progress<'_>, context: &str, err: TdxInitError) -> TdxInitError {
        let cleanup = progress.unwind(&self.provider);
        if let Some(cleanup) = &cleanup {
            warn!("rollback after `{context}` was incomplete: {cleanup}");
        }
        TdxInitError::ExternalTool {
            message: format!("{context}: {}", detail(&err)),
            cleanup,
        }
    }
}

/// Exclusive, non-blocking advisory lock held for the whole provisioning run.
fn acquire_lock(path: &Path) -> TdxInitResult<Flock<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .mode(0o600)
        .open(path)?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
        if errno == Errno::EWOULDBLOCK {
            TdxInitError::Locked(path.to_path_buf())
        } else {
            TdxInitError::Io(io::Error::from(errno))
        }
    })
}
