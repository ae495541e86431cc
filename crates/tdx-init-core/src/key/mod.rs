//! Operator public key: format validation and the sources that deliver it.

mod webserver;

use crate::cancel::CancelSignal;
use crate::error::{TdxInitError, TdxInitResult};
use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;

pub use webserver::WebServerKey;

/// Base64 body of an OpenSSH ed25519 public key.
const PUBLIC_KEY_PATTERN: &str = r"^[A-Za-z0-9+/]{68}$";

/// Validated base64 body of an `ssh-ed25519` public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(String);

impl PublicKey {
    /// Accept exactly 68 characters of the standard base64 alphabet.
    pub fn parse(raw: &str) -> TdxInitResult<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(PUBLIC_KEY_PATTERN).expect("public key pattern is a valid regex")
        });
        if pattern.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(TdxInitError::InvalidKey(
                "expected base64-encoded OpenSSH ed25519 public key".to_string(),
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex SHA-256 of the key body, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(sha256:{})", self.fingerprint())
    }
}

/// Delivers the operator public key for a fresh volume.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn wait_for_key(&self, cancel: &CancelSignal) -> TdxInitResult<PublicKey>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SAMPLE_KEY;

    #[test]
    fn accepts_exact_length_base64() {
        assert_eq!(SAMPLE_KEY.len(), 68);
        let key = PublicKey::parse(SAMPLE_KEY).unwrap();
        assert_eq!(key.as_str(), SAMPLE_KEY);
        assert_eq!(key.fingerprint().len(), 64);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(PublicKey::parse(&SAMPLE_KEY[..67]).is_err());
        assert!(PublicKey::parse(&format!("{SAMPLE_KEY}A")).is_err());
        assert!(PublicKey::parse("").is_err());
    }

    #[test]
    fn rejects_characters_outside_alphabet() {
        let mut bad = SAMPLE_KEY.to_string();
        bad.replace_range(10..11, "-");
        assert!(matches!(
            PublicKey::parse(&bad),
            Err(TdxInitError::InvalidKey(_))
        ));
        assert!(PublicKey::parse(&format!("{}\n", &SAMPLE_KEY[..67])).is_err());
        assert!(PublicKey::parse(&format!("{}=", &SAMPLE_KEY[..67])).is_err());
    }

    #[test]
    fn debug_does_not_leak_key() {
        let key = PublicKey::parse(SAMPLE_KEY).unwrap();
        assert!(!format!("{key:?}").contains(SAMPLE_KEY));
    }
}
