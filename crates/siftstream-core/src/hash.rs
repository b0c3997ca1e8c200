use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConsumerError;

/// Length of a stream hash in hex characters.
pub const HASH_LEN: usize = 32;

/// Validated 32-character hex stream hash.
///
/// Hex digits are stored lowercased so lookups from server status messages
/// match regardless of the case the server echoes back.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamHash(String);

impl StreamHash {
    pub fn parse(s: &str) -> Result<Self, ConsumerError> {
        if validate_hash(s) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(ConsumerError::InvalidHash(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// True when `s` is exactly 32 characters of `[0-9a-fA-F]`.
pub fn validate_hash(s: &str) -> bool {
    s.len() == HASH_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl fmt::Display for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StreamHash {
    type Err = ConsumerError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StreamHash {
    type Error = ConsumerError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<StreamHash> for String {
    fn from(hash: StreamHash) -> Self {
        hash.0
    }
}

impl AsRef<str> for StreamHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
