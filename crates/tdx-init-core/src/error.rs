use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for core operations.
pub type TdxInitResult<T> = Result<T, TdxInitError>;

/// Orchestrator stage an error surfaced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    LocateDevice,
    ResolveKey,
    PersistKey,
    Passphrase,
    Volume,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SetupStage::LocateDevice => "locate device",
            SetupStage::ResolveKey => "resolve public key",
            SetupStage::PersistKey => "persist public key",
            SetupStage::Passphrase => "obtain passphrase",
            SetupStage::Volume => "provision volume",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum TdxInitError {
    #[error("[TI1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[TI1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[TI1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[TI1003] json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[TI1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[TI1200] no block device found: {0}")]
    DeviceNotFound(String),

    #[error("[TI1300] operation cancelled")]
    Cancelled,

    #[error("[TI1400] key listener error: {0}")]
    Transport(String),

    #[error("[TI1401] invalid public key: {0}")]
    InvalidKey(String),

    #[error("[TI1500] metadata token error: {0}")]
    Token(String),

    #[error("[TI1600] {} is already mounted; encrypted disk already set up", .0.display())]
    AlreadyMounted(PathBuf),

    #[error("[TI1601] key file {} not found; the public key must be provided before the volume is provisioned", .0.display())]
    MissingKeyFile(PathBuf),

    #[error("[TI1602] provisioning lock {} is held by another run", .0.display())]
    Locked(PathBuf),

    #[error("[TI2000] {message}{}", .cleanup.as_ref().map(|c| format!("; cleanup also failed: {c}")).unwrap_or_default())]
    ExternalTool {
        message: String,
        cleanup: Option<String>,
    },

    #[error("{stage}: {source}")]
    Stage {
        stage: SetupStage,
        #[source]
        source: Box<TdxInitError>,
    },
}

impl TdxInitError {
    /// Build an `ExternalTool` error without a cleanup failure attached.
    pub fn tool(message: impl Into<String>) -> Self {
        TdxInitError::ExternalTool {
            message: message.into(),
            cleanup: None,
        }
    }

    /// Label the error with the orchestrator stage it escaped from.
    pub fn at(self, stage: SetupStage) -> Self {
        TdxInitError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Strip stage labels and return the error that actually occurred.
    pub fn root(&self) -> &TdxInitError {
        match self {
            TdxInitError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stage label of the outermost wrapper, if any.
    pub fn stage(&self) -> Option<SetupStage> {
        match self {
            TdxInitError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self.root() {
            TdxInitError::Io(_) => "TI1000",
            TdxInitError::Toml(_) => "TI1001",
            TdxInitError::Yaml(_) => "TI1002",
            TdxInitError::Json(_) => "TI1003",
            TdxInitError::InvalidConfig(_) => "TI1100",
            TdxInitError::DeviceNotFound(_) => "TI1200",
            TdxInitError::Cancelled => "TI1300",
            TdxInitError::Transport(_) => "TI1400",
            TdxInitError::InvalidKey(_) => "TI1401",
            TdxInitError::Token(_) => "TI1500",
            TdxInitError::AlreadyMounted(_) => "TI1600",
            TdxInitError::MissingKeyFile(_) => "TI1601",
            TdxInitError::Locked(_) => "TI1602",
            TdxInitError::ExternalTool { .. } => "TI2000",
            TdxInitError::Stage { .. } => unreachable!("root() never returns a stage wrapper"),
        }
    }
}
