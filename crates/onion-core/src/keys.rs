//! Node keys and destination public keys

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Length in bytes of an ed25519 / x25519 node key
pub const NODE_KEY_LEN: usize = 32;

/// Hex length of a destination public key (`05` prefix + 32 bytes)
pub const PUBKEY_HEX_LEN: usize = 66;

/// 32-byte snode key (ed25519 identity or x25519 encryption key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey([u8; NODE_KEY_LEN]);

impl NodeKey {
    pub fn new(bytes: [u8; NODE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        let actual = bytes.len();
        let bytes: [u8; NODE_KEY_LEN] = bytes.try_into().map_err(|_| Error::KeyLength {
            expected: NODE_KEY_LEN,
            actual,
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Shortened form for logs: `abcd...wxyz`
    pub fn short(&self) -> String {
        let full = self.to_hex();
        format!("{}...{}", &full[..4], &full[full.len() - 4..])
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", self.short())
    }
}

impl FromStr for NodeKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Destination public key (a session id or a closed group id), hex encoded
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PubKey(String);

impl PubKey {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into().to_ascii_lowercase();
        if key.len() != PUBKEY_HEX_LEN {
            return Err(Error::InvalidPubKey(format!(
                "expected {} hex chars, got {}",
                PUBKEY_HEX_LEN,
                key.len()
            )));
        }
        if !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidPubKey(format!("not hex: {}", key)));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for logs: `(...wxyz)`
    pub fn short(&self) -> String {
        format!("(...{})", &self.0[self.0.len() - 4..])
    }
}

impl TryFrom<String> for PubKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PubKey> for String {
    fn from(key: PubKey) -> Self {
        key.0
    }
}

impl FromStr for PubKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey{}", self.short())
    }
}
