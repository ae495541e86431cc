//! tdx-init command-line interface: one-shot setup of the encrypted data disk
//! and operator SSH access inside a confidential guest.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use tdx_init_core::{
    cancel_pair, logging,
    workflow::{WorkflowLevel, WorkflowReport},
    CancelHandle, DiskStrategy, KeyStrategy, PassphraseStrategy, SetupConfig, SetupManager,
};
use tdx_init_luks::SystemLuksProvider;
use tokio::signal::unix::{signal, SignalKind};

/// Top-level options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "tdx-init",
    version,
    about = "Trusted device setup: encrypted persistent storage bound to an operator SSH key."
)]
struct Cli {
    /// Optional configuration file (TOML when it ends in .toml, YAML otherwise).
    #[arg(short, long, env = "TDX_INIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the complete setup sequence.
    Setup {
        #[command(flatten)]
        strategies: StrategyArgs,
    },

    /// Show the resolved configuration.
    Config {
        #[command(flatten)]
        strategies: StrategyArgs,

        /// Output the JSON schema of the configuration file instead.
        #[arg(long)]
        schema: bool,
    },
}

#[derive(Args, Debug)]
struct PathArgs {
    /// SSH directory that receives authorized_keys.
    #[arg(long, global = true)]
    ssh_dir: Option<PathBuf>,

    /// Flat file the public key is written to.
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// Mount point for the encrypted disk.
    #[arg(long, global = true)]
    mount_point: Option<PathBuf>,

    /// Device-mapper name for the unlocked volume.
    #[arg(long, global = true)]
    mapper_name: Option<String>,

    /// Device-mapper path for the unlocked volume.
    #[arg(long, global = true)]
    mapper_device: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StrategyArgs {
    /// Key initialization strategy.
    #[arg(long = "key-strategy.type", value_enum)]
    key_strategy: Option<KeyChoice>,

    /// Listen address for the webserver key strategy.
    #[arg(long = "key-strategy.server-url")]
    server_url: Option<String>,

    /// Passphrase strategy.
    #[arg(long = "passphrase-strategy.type", value_enum)]
    passphrase_strategy: Option<PassphraseChoice>,

    /// FIFO path for the namedpipe passphrase strategy.
    #[arg(long = "passphrase-strategy.pipe-path")]
    pipe_path: Option<PathBuf>,

    /// Disk selection strategy.
    #[arg(long = "disk-strategy.type", value_enum)]
    disk_strategy: Option<DiskChoice>,

    /// Glob matched against /dev/disk/by-path for the pathglob strategy.
    #[arg(long = "disk-strategy.path-glob")]
    path_glob: Option<String>,

    /// Keep looking for the disk this many seconds (0 = single attempt).
    #[arg(long = "disk-strategy.wait-secs")]
    wait_secs: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KeyChoice {
    Webserver,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PassphraseChoice {
    Random,
    Namedpipe,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DiskChoice {
    Largest,
    Pathglob,
}

impl PathArgs {
    fn apply(self, config: &mut SetupConfig) {
        let paths = &mut config.paths;
        if let Some(dir) = self.ssh_dir {
            paths.ssh_dir = dir;
        }
        if let Some(file) = self.key_file {
            paths.key_file = file;
        }
        if let Some(mount_point) = self.mount_point {
            paths.mount_point = mount_point;
        }
        if let Some(name) = self.mapper_name {
            paths.mapper_name = name;
        }
        if let Some(device) = self.mapper_device {
            paths.mapper_device = device;
        }
    }
}

impl StrategyArgs {
    fn apply(self, config: &mut SetupConfig) {
        if let Some(KeyChoice::Webserver) = self.key_strategy {
            config.key.strategy = KeyStrategy::Webserver;
        }
        if let Some(addr) = self.server_url {
            config.key.server_addr = addr;
        }
        if let Some(choice) = self.passphrase_strategy {
            config.passphrase.strategy = match choice {
                PassphraseChoice::Random => PassphraseStrategy::Random,
                PassphraseChoice::Namedpipe => PassphraseStrategy::NamedPipe,
            };
        }
        if let Some(path) = self.pipe_path {
            config.passphrase.pipe_path = path;
        }
        if let Some(choice) = self.disk_strategy {
            config.disk.strategy = match choice {
                DiskChoice::Largest => DiskStrategy::Largest,
                DiskChoice::Pathglob => DiskStrategy::PathGlob,
            };
        }
        if let Some(glob) = self.path_glob {
            config.disk.path_glob = glob;
        }
        if let Some(secs) = self.wait_secs {
            config.disk.wait_secs = secs;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    cli.paths.apply(&mut config);

    match cli.command {
        Commands::Setup { strategies } => {
            strategies.apply(&mut config);
            config.validate().context("invalid configuration")?;
            let report = run_setup(&config).await?;
            print_report(report);
        }
        Commands::Config { strategies, schema } => {
            if schema {
                let schema = schema_for!(SetupConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }
            strategies.apply(&mut config);
            config.validate().context("invalid configuration")?;
            print_config(&config);
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SetupConfig> {
    match path {
        Some(path) => SetupConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(SetupConfig::default()),
    }
}

async fn run_setup(config: &SetupConfig) -> Result<WorkflowReport> {
    let provider = SystemLuksProvider::from_config(config).context("initialise luks provider")?;
    let manager = SetupManager::from_config(config, provider)?;

    let (handle, cancel) = cancel_pair();
    tokio::spawn(cancel_on_shutdown(handle));

    info!("starting setup");
    let report = manager.setup(&cancel).await?;
    Ok(report)
}

/// Cancel the run on Ctrl-C or SIGTERM.
async fn cancel_on_shutdown(handle: CancelHandle) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            warn!("cannot listen for SIGTERM: {err}");
            None
        }
    };
    let sigterm = async {
        match terminate.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt, cancelling setup"),
        _ = sigterm => info!("received SIGTERM, cancelling setup"),
    }
    handle.cancel();
}

fn print_config(config: &SetupConfig) {
    println!("Current configuration:");
    if let Some(path) = &config.path {
        println!("  Loaded from: {}", path.display());
    }
    println!("  Key strategy: {}", config.key.strategy);
    println!("    Server address: {}", config.key.server_addr);
    println!("  Passphrase strategy: {}", config.passphrase.strategy);
    if config.passphrase.strategy == PassphraseStrategy::NamedPipe {
        println!("    Pipe path: {}", config.passphrase.pipe_path.display());
    }
    println!("  Disk strategy: {}", config.disk.strategy);
    if config.disk.strategy == DiskStrategy::PathGlob {
        println!(
            "    Path glob: {}/{}",
            config.disk.by_path_dir.display(),
            config.disk.path_glob
        );
    }
    if config.disk.wait_secs > 0 {
        println!("    Wait for disk: {}s", config.disk.wait_secs);
    }
    let paths = &config.paths;
    println!("  SSH directory: {}", paths.ssh_dir.display());
    println!("  Key file: {}", paths.key_file.display());
    println!("  Mount point: {}", paths.mount_point.display());
    println!("  Mapper name: {}", paths.mapper_name);
    println!("  Mapper device: {}", paths.mapper_device.display());
    println!("  Lock file: {}", paths.lock_file.display());
}

fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Security => "SEC",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config_defaults() {
        let cli = Cli::try_parse_from([
            "tdx-init",
            "--mount-point",
            "/data",
            "setup",
            "--passphrase-strategy.type",
            "namedpipe",
            "--passphrase-strategy.pipe-path",
            "/run/pass",
            "--disk-strategy.type",
            "pathglob",
            "--disk-strategy.path-glob",
            "pci-0000:00:1f.2-*",
        ])
        .unwrap();

        let mut config = SetupConfig::default();
        cli.paths.apply(&mut config);
        let Commands::Setup { strategies } = cli.command else {
            panic!("expected setup");
        };
        strategies.apply(&mut config);

        assert_eq!(config.paths.mount_point, PathBuf::from("/data"));
        assert_eq!(config.passphrase.strategy, PassphraseStrategy::NamedPipe);
        assert_eq!(config.passphrase.pipe_path, PathBuf::from("/run/pass"));
        assert_eq!(config.disk.strategy, DiskStrategy::PathGlob);
        assert_eq!(config.disk.path_glob, "pci-0000:00:1f.2-*");
        assert_eq!(config.key.server_addr, "0.0.0.0:8080");
        config.validate().unwrap();
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let parsed = Cli::try_parse_from(["tdx-init", "setup", "--disk-strategy.type", "smallest"]);
        assert!(parsed.is_err());
    }
}
