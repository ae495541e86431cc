//! In-memory stand-ins for the external tools and key/passphrase sources.

use crate::cancel::CancelSignal;
use crate::error::{TdxInitError, TdxInitResult};
use crate::key::{KeySource, PublicKey};
use crate::passphrase::PassphraseSource;
use crate::provider::VolumeProvider;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use zeroize::Zeroizing;

pub(crate) const SAMPLE_KEY: &str =
    "AAAAC3NzaC1lZDI1NTE5AAAAIAABAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4f";
pub(crate) const SECOND_KEY: &str =
    "AAAAC3NzaC1lZDI1NTE5AAAAIGRlZmdoaWprbG1ub3BxcnN0dXZ3eHl6e3x9fn+AgYKD";

#[derive(Default)]
struct FakeState {
    /// device -> passphrase the header was formatted with
    headers: HashMap<PathBuf, Vec<u8>>,
    tokens: HashMap<PathBuf, String>,
    open: HashSet<String>,
    mounts: HashSet<PathBuf>,
    calls: Vec<String>,
    fail: HashSet<&'static str>,
}

/// Fake volume tooling. Only mutating operations are recorded in `calls`.
#[derive(Default)]
pub(crate) struct FakeVolumes {
    state: Mutex<FakeState>,
}

impl FakeVolumes {
    pub(crate) fn with_header(device: &Path, passphrase: &[u8], token: Option<&str>) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state.lock().unwrap();
            state.headers.insert(device.to_path_buf(), passphrase.to_vec());
            if let Some(token) = token {
                state.tokens.insert(device.to_path_buf(), token.to_string());
            }
        }
        fake
    }

    pub(crate) fn fail_on(&self, op: &'static str) {
        self.state.lock().unwrap().fail.insert(op);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub(crate) fn token(&self, device: &Path) -> Option<String> {
        self.state.lock().unwrap().tokens.get(device).cloned()
    }

    pub(crate) fn is_open(&self, name: &str) -> bool {
        self.state.lock().unwrap().open.contains(name)
    }

    /// Forget everything that does not survive a reboot.
    pub(crate) fn reboot(&self) {
        let mut state = self.state.lock().unwrap();
        state.open.clear();
        state.mounts.clear();
        state.calls.clear();
    }

    fn record(
        &self,
        op: &'static str,
        detail: String,
    ) -> TdxInitResult<MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{op} {detail}"));
        if state.fail.contains(op) {
            return Err(TdxInitError::tool(format!("{op} failed")));
        }
        Ok(state)
    }
}

impl VolumeProvider for FakeVolumes {
    fn has_header(&self, device: &Path) -> TdxInitResult<bool> {
        Ok(self.state.lock().unwrap().headers.contains_key(device))
    }

    fn format(&self, device: &Path, passphrase: &[u8]) -> TdxInitResult<()> {
        let mut state = self.record("format", device.display().to_string())?;
        state.headers.insert(device.to_path_buf(), passphrase.to_vec());
        state.tokens.remove(device);
        Ok(())
    }

    fn open(&self, device: &Path, name: &str, passphrase: &[u8]) -> TdxInitResult<()> {
        let mut state = self.record("open", format!("{} {name}", device.display()))?;
        match state.headers.get(device) {
            Some(expected) if expected.as_slice() == passphrase => {}
            Some(_) => return Err(TdxInitError::tool("no key available with this passphrase")),
            None => return Err(TdxInitError::tool("device is not a LUKS device")),
        }
        state.open.insert(name.to_string());
        Ok(())
    }

    fn close(&self, name: &str) -> TdxInitResult<()> {
        let mut state = self.record("close", name.to_string())?;
        if !state.open.remove(name) {
            return Err(TdxInitError::tool(format!("{name} is not active")));
        }
        Ok(())
    }

    fn make_filesystem(&self, mapper_device: &Path) -> TdxInitResult<()> {
        self.record("mkfs", mapper_device.display().to_string())?;
        Ok(())
    }

    fn mount(&self, source: &Path, target: &Path) -> TdxInitResult<()> {
        let mut state =
            self.record("mount", format!("{} {}", source.display(), target.display()))?;
        state.mounts.insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> TdxInitResult<()> {
        let mut state = self.record("unmount", target.display().to_string())?;
        if !state.mounts.remove(target) {
            return Err(TdxInitError::tool(format!("{} not mounted", target.display())));
        }
        Ok(())
    }

    fn is_mounted(&self, mount_point: &Path) -> TdxInitResult<bool> {
        Ok(self.state.lock().unwrap().mounts.contains(mount_point))
    }

    fn import_token(&self, device: &Path, slot: u32, token_json: &str) -> TdxInitResult<()> {
        let mut state = self.record("import", format!("{} {slot}", device.display()))?;
        state.tokens.insert(device.to_path_buf(), token_json.to_string());
        Ok(())
    }

    fn export_token(&self, device: &Path, _slot: u32) -> TdxInitResult<Option<String>> {
        let state = self.state.lock().unwrap();
        if state.fail.contains("export") {
            return Err(TdxInitError::tool("export failed"));
        }
        Ok(state.tokens.get(device).cloned())
    }
}

/// Key source that hands out a fixed key and counts how often it was asked.
pub(crate) struct FixedKey {
    key: Option<PublicKey>,
    calls: AtomicUsize,
}

impl FixedKey {
    pub(crate) fn new(raw: &str) -> Self {
        Self {
            key: Some(PublicKey::parse(raw).unwrap()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A source that must never be consulted.
    pub(crate) fn unused() -> Self {
        Self {
            key: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for FixedKey {
    async fn wait_for_key(&self, _cancel: &CancelSignal) -> TdxInitResult<PublicKey> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.key
            .clone()
            .ok_or_else(|| TdxInitError::Transport("no key configured".to_string()))
    }
}

/// Passphrase source with a fixed secret that counts how often it was asked.
pub(crate) struct StaticPassphrase {
    secret: Vec<u8>,
    calls: AtomicUsize,
}

impl StaticPassphrase {
    pub(crate) fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PassphraseSource for StaticPassphrase {
    async fn wait_for_passphrase(
        &self,
        _cancel: &CancelSignal,
    ) -> TdxInitResult<Zeroizing<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Zeroizing::new(self.secret.clone()))
    }
}
