//! Volume passphrase sources.

use crate::cancel::CancelSignal;
use crate::error::{TdxInitError, TdxInitResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::spawn_blocking;
use tokio::time::sleep;
use zeroize::Zeroizing;

const RANDOM_PASSPHRASE_LEN: usize = 32;
const PIPE_READ_LIMIT: usize = 1024;
/// Writer opens tried before a cancelled reader is abandoned.
const RELEASE_ATTEMPTS: usize = 40;
const RELEASE_INTERVAL: Duration = Duration::from_millis(50);

/// Produces the secret that formats or unlocks the volume.
#[async_trait]
pub trait PassphraseSource: Send + Sync {
    async fn wait_for_passphrase(&self, cancel: &CancelSignal)
        -> TdxInitResult<Zeroizing<Vec<u8>>>;
}

/// 32 bytes from the operating system CSPRNG.
#[derive(Debug, Clone, Default)]
pub struct RandomPassphrase;

#[async_trait]
impl PassphraseSource for RandomPassphrase {
    async fn wait_for_passphrase(
        &self,
        _cancel: &CancelSignal,
    ) -> TdxInitResult<Zeroizing<Vec<u8>>> {
        let mut bytes = Zeroizing::new(vec![0u8; RANDOM_PASSPHRASE_LEN]);
        OsRng
            .try_fill_bytes(&mut bytes[..])
            .map_err(|err| TdxInitError::Io(io::Error::new(io::ErrorKind::Other, err)))?;
        Ok(bytes)
    }
}

/// Blocks on a FIFO until a writer hands over the passphrase.
#[derive(Debug, Clone)]
pub struct NamedPipePassphrase {
    path: PathBuf,
}

impl NamedPipePassphrase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PassphraseSource for NamedPipePassphrase {
    async fn wait_for_passphrase(
        &self,
        cancel: &CancelSignal,
    ) -> TdxInitResult<Zeroizing<Vec<u8>>> {
        ensure_fifo(&self.path)?;
        info!("waiting for passphrase on {}", self.path.display());

        let path = self.path.clone();
        let mut reader = spawn_blocking(move || read_fifo(&path));

        tokio::select! {
            joined = &mut reader => {
                let passphrase = joined.map_err(|err| {
                    TdxInitError::Io(io::Error::new(io::ErrorKind::Other, err))
                })??;
                if passphrase.is_empty() {
                    return Err(TdxInitError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} closed without a passphrase", self.path.display()),
                    )));
                }
                Ok(passphrase)
            }
            _ = cancel.cancelled() => {
                // The blocking reader sits in open(2)/read(2); a writer that
                // connects and hangs up hands it EOF.
                for _ in 0..RELEASE_ATTEMPTS {
                    if let Err(err) = release_reader(&self.path) {
                        if err.kind() == io::ErrorKind::NotFound {
                            warn!(
                                "{} disappeared; abandoning the blocked reader",
                                self.path.display()
                            );
                            break;
                        }
                    }
                    tokio::select! {
                        _ = &mut reader => return Err(TdxInitError::Cancelled),
                        _ = sleep(RELEASE_INTERVAL) => {}
                    }
                }
                if !reader.is_finished() {
                    warn!("passphrase reader on {} did not exit", self.path.display());
                }
                Err(TdxInitError::Cancelled)
            }
        }
    }
}

/// Create the FIFO unless something already exists at `path`.
fn ensure_fifo(path: &Path) -> TdxInitResult<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) => {
            debug!("created named pipe {}", path.display());
            Ok(())
        }
        Err(Errno::EEXIST) => Ok(()),
        Err(errno) => Err(TdxInitError::Io(io::Error::new(
            io::Error::from(errno).kind(),
            format!("failed to create named pipe {}: {errno}", path.display()),
        ))),
    }
}

/// Read a single message of at most `PIPE_READ_LIMIT` bytes, dropping one
/// trailing newline.
fn read_fifo(path: &Path) -> TdxInitResult<Zeroizing<Vec<u8>>> {
    let mut file = File::open(path)?;
    let mut buf = Zeroizing::new(vec![0u8; PIPE_READ_LIMIT]);
    let len = file.read(&mut buf[..])?;
    let mut passphrase = Zeroizing::new(buf[..len].to_vec());
    if passphrase.last() == Some(&b'\n') {
        passphrase.pop();
    }
    Ok(passphrase)
}

fn release_reader(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
        .map(drop)
}
