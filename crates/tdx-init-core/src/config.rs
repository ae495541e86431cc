use crate::error::{TdxInitError, TdxInitResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the operator's public key reaches the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    #[default]
    Webserver,
}

/// How the volume passphrase is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PassphraseStrategy {
    #[default]
    Random,
    NamedPipe,
}

/// How the target block device is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DiskStrategy {
    #[default]
    Largest,
    PathGlob,
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Webserver => f.write_str("webserver"),
        }
    }
}

impl fmt::Display for PassphraseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassphraseStrategy::Random => f.write_str("random"),
            PassphraseStrategy::NamedPipe => f.write_str("namedpipe"),
        }
    }
}

impl fmt::Display for DiskStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskStrategy::Largest => f.write_str("largest"),
            DiskStrategy::PathGlob => f.write_str("pathglob"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeyCfg {
    #[serde(default)]
    pub strategy: KeyStrategy,

    #[serde(default = "default_server_addr")]
    pub server_addr: String,
}

fn default_server_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for KeyCfg {
    fn default() -> Self {
        Self {
            strategy: KeyStrategy::default(),
            server_addr: default_server_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PassphraseCfg {
    #[serde(default)]
    pub strategy: PassphraseStrategy,

    #[serde(default = "default_pipe_path")]
    pub pipe_path: PathBuf,
}

fn default_pipe_path() -> PathBuf {
    PathBuf::from("/tmp/passphrase")
}

impl Default for PassphraseCfg {
    fn default() -> Self {
        Self {
            strategy: PassphraseStrategy::default(),
            pipe_path: default_pipe_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DiskCfg {
    #[serde(default)]
    pub strategy: DiskStrategy,

    #[serde(default = "default_path_glob")]
    pub path_glob: String,

    #[serde(default = "default_by_path_dir")]
    pub by_path_dir: PathBuf,

    #[serde(default = "default_partitions_path")]
    pub partitions_path: PathBuf,

    /// Keep polling for the device this long; 0 means a single attempt.
    #[serde(default)]
    pub wait_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_path_glob() -> String {
    "*".to_string()
}

fn default_by_path_dir() -> PathBuf {
    PathBuf::from("/dev/disk/by-path")
}

fn default_partitions_path() -> PathBuf {
    PathBuf::from("/proc/partitions")
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

impl Default for DiskCfg {
    fn default() -> Self {
        Self {
            strategy: DiskStrategy::default(),
            path_glob: default_path_glob(),
            by_path_dir: default_by_path_dir(),
            partitions_path: default_partitions_path(),
            wait_secs: 0,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Paths and identifiers resolved once per run and held by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SetupOptions {
    #[serde(default = "default_ssh_dir")]
    pub ssh_dir: PathBuf,

    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    #[serde(default = "default_mapper_name")]
    pub mapper_name: String,

    #[serde(default = "default_mapper_device")]
    pub mapper_device: PathBuf,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    #[serde(default = "default_ssh_owner")]
    pub ssh_owner_uid: u32,

    #[serde(default = "default_ssh_owner")]
    pub ssh_owner_gid: u32,
}

fn default_ssh_dir() -> PathBuf {
    PathBuf::from("/root/.ssh")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("/etc/root_key")
}

fn default_mount_point() -> PathBuf {
    PathBuf::from("/persistent")
}

fn default_mapper_name() -> String {
    "cryptdisk".to_string()
}

fn default_mapper_device() -> PathBuf {
    PathBuf::from("/dev/mapper/cryptdisk")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/run/tdx-init.lock")
}

fn default_ssh_owner() -> u32 {
    1000
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            ssh_dir: default_ssh_dir(),
            key_file: default_key_file(),
            mount_point: default_mount_point(),
            mapper_name: default_mapper_name(),
            mapper_device: default_mapper_device(),
            lock_file: default_lock_file(),
            ssh_owner_uid: default_ssh_owner(),
            ssh_owner_gid: default_ssh_owner(),
        }
    }
}

/// Locations of the external tools and how long each invocation may run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolsCfg {
    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default)]
    pub mkfs_path: Option<String>,

    #[serde(default)]
    pub mount_path: Option<String>,

    #[serde(default)]
    pub umount_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_mounts_path")]
    pub mounts_path: PathBuf,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_mounts_path() -> PathBuf {
    PathBuf::from("/proc/mounts")
}

impl Default for ToolsCfg {
    fn default() -> Self {
        Self {
            cryptsetup_path: None,
            mkfs_path: None,
            mount_path: None,
            umount_path: None,
            timeout_secs: default_timeout_secs(),
            mounts_path: default_mounts_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SetupConfig {
    #[serde(default)]
    pub key: KeyCfg,

    #[serde(default)]
    pub passphrase: PassphraseCfg,

    #[serde(default)]
    pub disk: DiskCfg,

    #[serde(default)]
    pub paths: SetupOptions,

    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl SetupConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> TdxInitResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = Some(path.to_path_buf());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that cannot possibly produce a working setup.
    pub fn validate(&self) -> TdxInitResult<()> {
        if self.paths.mapper_name.trim().is_empty() || self.paths.mapper_name.contains('/') {
            return Err(TdxInitError::InvalidConfig(format!(
                "paths.mapper_name `{}` is not a valid device-mapper name",
                self.paths.mapper_name
            )));
        }
        if !self.paths.mount_point.is_absolute() {
            return Err(TdxInitError::InvalidConfig(format!(
                "paths.mount_point must be absolute (got {})",
                self.paths.mount_point.display()
            )));
        }
        if self.key.strategy == KeyStrategy::Webserver {
            self.server_addr()?;
        }
        if self.disk.strategy == DiskStrategy::PathGlob && self.disk.path_glob.trim().is_empty() {
            return Err(TdxInitError::InvalidConfig(
                "disk.path_glob must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> TdxInitResult<SocketAddr> {
        self.key.server_addr.parse().map_err(|err| {
            TdxInitError::InvalidConfig(format!(
                "key.server_addr `{}` is not a socket address: {err}",
                self.key.server_addr
            ))
        })
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.timeout_secs)
    }

    /// `None` when the locator should be tried exactly once.
    pub fn device_wait(&self) -> Option<Duration> {
        (self.disk.wait_secs > 0).then(|| Duration::from_secs(self.disk.wait_secs))
    }

    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_millis(self.disk.poll_interval_ms.max(1))
    }
}
