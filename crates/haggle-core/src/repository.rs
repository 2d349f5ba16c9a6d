//! Opaque per-manager persistent key/value entries
//!
//! Managers persist small blobs (forwarder state, counters) keyed by
//! `(authority, key)` so they survive a daemon restart.

use serde::{Deserialize, Serialize};
use std::fmt;

/// String or binary value of a repository entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RepositoryValue {
    String(String),
    Blob(Vec<u8>),
}

impl RepositoryValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RepositoryValue::String(s) => Some(s),
            RepositoryValue::Blob(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RepositoryValue::String(s) => s.as_bytes(),
            RepositoryValue::Blob(b) => b,
        }
    }
}

/// A persistent blob owned by a specific manager
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryEntry {
    pub authority: String,
    pub key: String,
    pub value: RepositoryValue,
    pub id: u32,
}

impl RepositoryEntry {
    pub fn string(
        authority: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        RepositoryEntry {
            authority: authority.into(),
            key: key.into(),
            value: RepositoryValue::String(value.into()),
            id: 0,
        }
    }

    pub fn blob(
        authority: impl Into<String>,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> Self {
        RepositoryEntry {
            authority: authority.into(),
            key: key.into(),
            value: RepositoryValue::Blob(value),
            id: 0,
        }
    }
}

impl fmt::Display for RepositoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.authority, self.key)
    }
}
