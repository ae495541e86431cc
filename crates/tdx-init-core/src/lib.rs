pub mod cancel;
pub mod config;
pub mod credentials;
pub mod device;
pub mod error;
pub mod key;
pub mod logging;
pub mod passphrase;
pub mod provider;
pub mod token;
pub mod volume;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use config::{
    DiskStrategy, KeyStrategy, PassphraseStrategy, SetupConfig, SetupOptions, ToolsCfg,
};
pub use error::{SetupStage, TdxInitError, TdxInitResult};
pub use key::{KeySource, PublicKey};
pub use provider::{VolumeProvider, VolumeState, METADATA_TOKEN_SLOT};
pub use volume::{ProvisionOutcome, VolumeManager};
pub use workflow::{SetupManager, WorkflowEvent, WorkflowLevel, WorkflowReport};
