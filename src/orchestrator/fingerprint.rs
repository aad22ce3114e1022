//! Request fingerprints.
//!
//! A fingerprint is the SHA-256 of the request kind and the normalized input:
//! text with whitespace runs collapsed, trimmed URL and canonical (key-sorted)
//! metadata. Equal fingerprints share one computation and one cache entry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Extracted content submitted for analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ContentInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Text with every whitespace run collapsed to one space.
    pub fn normalized_text(&self) -> String {
        self.text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Hex SHA-256 request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(kind: &str, input: &ContentInput) -> Self {
        let text = input.normalized_text();
        let url = input.url.as_deref().map(str::trim).unwrap_or("");
        let mut hasher = Sha256::new();
        for part in [kind, text.as_str(), url] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        // serde_json maps are key-ordered, so nested objects are canonical too.
        let metadata = serde_json::to_vec(&input.metadata).unwrap_or_default();
        hasher.update(&metadata);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
