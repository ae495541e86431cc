//! Setup orchestrator: locate disk, resolve key, persist it, obtain a
//! passphrase, then provision the encrypted volume.

use super::{event, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::cancel::CancelSignal;
use crate::config::{DiskStrategy, KeyStrategy, PassphraseStrategy, SetupConfig, SetupOptions};
use crate::credentials::{persist_key, SshOwner};
use crate::device::{wait_for_device, DeviceLocator, LargestDisk, PathGlob};
use crate::error::{SetupStage, TdxInitError, TdxInitResult};
use crate::key::{KeySource, PublicKey, WebServerKey};
use crate::passphrase::{NamedPipePassphrase, PassphraseSource, RandomPassphrase};
use crate::provider::{VolumeProvider, VolumeState, METADATA_TOKEN_SLOT};
use crate::token::MetadataToken;
use crate::volume::{ProvisionOutcome, VolumeManager};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct DeviceWait {
    deadline: Duration,
    poll: Duration,
}

/// Runs one setup pass against a concrete volume provider.
///
/// Strategies are chosen once at construction and shared behind `Arc<dyn _>`.
pub struct SetupManager<P: VolumeProvider> {
    locator: Arc<dyn DeviceLocator>,
    keys: Arc<dyn KeySource>,
    passphrases: Arc<dyn PassphraseSource>,
    volumes: VolumeManager<P>,
    options: SetupOptions,
    device_wait: Option<DeviceWait>,
}

impl<P: VolumeProvider> SetupManager<P> {
    pub fn new(
        provider: P,
        options: SetupOptions,
        locator: Arc<dyn DeviceLocator>,
        keys: Arc<dyn KeySource>,
        passphrases: Arc<dyn PassphraseSource>,
    ) -> Self {
        let volumes = VolumeManager::new(provider, options.lock_file.clone());
        Self {
            locator,
            keys,
            passphrases,
            volumes,
            options,
            device_wait: None,
        }
    }

    /// Build the strategies named in `config`.
    pub fn from_config(config: &SetupConfig, provider: P) -> TdxInitResult<Self> {
        config.validate()?;

        let locator: Arc<dyn DeviceLocator> = match config.disk.strategy {
            DiskStrategy::Largest => Arc::new(LargestDisk::new(&config.disk.partitions_path)),
            DiskStrategy::PathGlob => Arc::new(PathGlob::new(
                &config.disk.by_path_dir,
                config.disk.path_glob.clone(),
            )),
        };
        let keys: Arc<dyn KeySource> = match config.key.strategy {
            KeyStrategy::Webserver => Arc::new(WebServerKey::new(config.server_addr()?)),
        };
        let passphrases: Arc<dyn PassphraseSource> = match config.passphrase.strategy {
            PassphraseStrategy::Random => Arc::new(RandomPassphrase),
            PassphraseStrategy::NamedPipe => {
                Arc::new(NamedPipePassphrase::new(&config.passphrase.pipe_path))
            }
        };
        info!(
            "setup strategies: key={} passphrase={} disk={}",
            config.key.strategy, config.passphrase.strategy, config.disk.strategy
        );

        let mut manager = Self::new(provider, config.paths.clone(), locator, keys, passphrases);
        if let Some(deadline) = config.device_wait() {
            manager = manager.with_device_wait(deadline, config.device_poll_interval());
        }
        Ok(manager)
    }

    /// Keep polling the locator for up to `deadline` instead of failing on the first miss.
    pub fn with_device_wait(mut self, deadline: Duration, poll: Duration) -> Self {
        self.device_wait = Some(DeviceWait { deadline, poll });
        self
    }

    pub fn options(&self) -> &SetupOptions {
        &self.options
    }

    /// Run the full setup sequence once.
    ///
    /// Volume provisioning invokes external tools synchronously on the
    /// calling task; every other stage observes `cancel`.
    pub async fn setup(&self, cancel: &CancelSignal) -> TdxInitResult<WorkflowReport> {
        let mut events = Vec::new();

        checkpoint(cancel)?;
        let device = self
            .locate(cancel)
            .await
            .map_err(|err| err.at(SetupStage::LocateDevice))?;
        events.push(event(
            WorkflowLevel::Info,
            format!("Selected disk {}", device.display()),
        ));

        // A live mount means an earlier run already finished; nothing is re-applied.
        let state = self
            .volumes
            .probe(&device, &self.options.mount_point)
            .map_err(|err| err.at(SetupStage::Volume))?;
        if state == VolumeState::Mounted {
            return Err(
                TdxInitError::AlreadyMounted(self.options.mount_point.clone())
                    .at(SetupStage::Volume),
            );
        }

        checkpoint(cancel)?;
        let key = self
            .resolve_key(&device, state, cancel, &mut events)
            .await
            .map_err(|err| err.at(SetupStage::ResolveKey))?;

        checkpoint(cancel)?;
        let owner = SshOwner {
            uid: self.options.ssh_owner_uid,
            gid: self.options.ssh_owner_gid,
        };
        persist_key(&key, &self.options.ssh_dir, &self.options.key_file, owner)
            .map_err(|err| err.at(SetupStage::PersistKey))?;
        events.push(event(
            WorkflowLevel::Security,
            format!(
                "Authorized key sha256:{} for SSH in {}",
                key.fingerprint(),
                self.options.ssh_dir.display()
            ),
        ));

        checkpoint(cancel)?;
        let passphrase = self
            .passphrases
            .wait_for_passphrase(cancel)
            .await
            .map_err(|err| err.at(SetupStage::Passphrase))?;

        checkpoint(cancel)?;
        let outcome = self
            .volumes
            .provision(&device, &passphrase, &self.options)
            .map_err(|err| err.at(SetupStage::Volume))?;
        let mount_point = self.options.mount_point.display();
        events.push(match outcome {
            ProvisionOutcome::Initialized => event(
                WorkflowLevel::Success,
                format!(
                    "Formatted {} and mounted it at {mount_point}; key embedded in token slot {METADATA_TOKEN_SLOT}",
                    device.display()
                ),
            ),
            ProvisionOutcome::Resumed => event(
                WorkflowLevel::Success,
                format!("Unlocked {} and mounted it at {mount_point}", device.display()),
            ),
        });

        Ok(WorkflowReport {
            title: format!("Encrypted storage ready at {mount_point}"),
            events,
        })
    }

    async fn locate(&self, cancel: &CancelSignal) -> TdxInitResult<PathBuf> {
        match self.device_wait {
            Some(wait) => {
                wait_for_device(self.locator.as_ref(), wait.deadline, wait.poll, cancel).await
            }
            None => self.locator.find_device(),
        }
    }

    /// A formatted disk already carries its key; only a fresh disk asks the key source.
    async fn resolve_key(
        &self,
        device: &Path,
        state: VolumeState,
        cancel: &CancelSignal,
        events: &mut Vec<WorkflowEvent>,
    ) -> TdxInitResult<PublicKey> {
        if state == VolumeState::Unformatted {
            let key = self.keys.wait_for_key(cancel).await?;
            events.push(event(
                WorkflowLevel::Info,
                format!("Received public key sha256:{}", key.fingerprint()),
            ));
            return Ok(key);
        }

        info!(
            "{} is already formatted; recovering public key from its header",
            device.display()
        );
        let raw = self
            .volumes
            .provider()
            .export_token(device, METADATA_TOKEN_SLOT)?
            .ok_or_else(|| {
                TdxInitError::Token(format!(
                    "no token found in slot {METADATA_TOKEN_SLOT} of {}",
                    device.display()
                ))
            })?;
        let key = MetadataToken::from_json(&raw)?.public_key()?;
        events.push(event(
            WorkflowLevel::Info,
            format!(
                "Recovered public key sha256:{} from the volume header",
                key.fingerprint()
            ),
        ));
        Ok(key)
    }
}

fn checkpoint(cancel: &CancelSignal) -> TdxInitResult<()> {
    if cancel.is_cancelled() {
        Err(TdxInitError::Cancelled)
    } else {
        Ok(())
    }
}
