//! JSON token stored in the volume header to carry the bound public key.

use crate::error::{TdxInitError, TdxInitResult};
use crate::key::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const TOKEN_TYPE: &str = "user";
const METADATA_FIELD: &str = "metadata";

/// Header token in the shape `cryptsetup token import/export` exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataToken {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub keyslots: Vec<String>,
    #[serde(default)]
    pub user_data: BTreeMap<String, String>,
}

impl MetadataToken {
    /// Token carrying `metadata` verbatim.
    pub fn with_metadata(metadata: impl Into<String>) -> Self {
        let mut user_data = BTreeMap::new();
        user_data.insert(METADATA_FIELD.to_string(), metadata.into());
        Self {
            kind: TOKEN_TYPE.to_string(),
            keyslots: Vec::new(),
            user_data,
        }
    }

    pub fn to_json(&self) -> TdxInitResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> TdxInitResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| TdxInitError::Token(format!("failed to parse token JSON: {err}")))
    }

    pub fn metadata(&self) -> Option<&str> {
        self.user_data.get(METADATA_FIELD).map(String::as_str)
    }

    /// Recover the bound key; a token without a well-formed key is corrupt.
    pub fn public_key(&self) -> TdxInitResult<PublicKey> {
        let metadata = self
            .metadata()
            .ok_or_else(|| TdxInitError::Token("no metadata found in token".to_string()))?;
        PublicKey::parse(metadata).map_err(|err| {
            TdxInitError::Token(format!("token metadata is not a usable public key: {err}"))
        })
    }
}
