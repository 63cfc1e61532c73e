//! Service node records

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::NodeKey;

/// A storage server reachable as an onion hop.
///
/// Identity is `pubkey_ed25519`; two records with the same ed25519 key
/// are the same node regardless of address.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceNode {
    pub ip: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    pub pubkey_x25519: NodeKey,
    pub pubkey_ed25519: NodeKey,
}

impl ServiceNode {
    pub fn new(
        ip: impl Into<String>,
        port: u16,
        pubkey_x25519: NodeKey,
        pubkey_ed25519: NodeKey,
    ) -> Self {
        Self {
            ip: ip.into(),
            port,
            pubkey_x25519,
            pubkey_ed25519,
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.pubkey_ed25519
    }

    /// First three octets of an IPv4 address, used for subnet diversity
    pub fn subnet24(&self) -> &str {
        match self.ip.rfind('.') {
            Some(idx) => &self.ip[..idx],
            None => &self.ip,
        }
    }

    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.ip, self.port)
    }

    /// Placeholder address returned for nodes that are not publicly reachable
    pub fn is_unroutable(&self) -> bool {
        self.ip == "0.0.0.0" || self.ip.is_empty()
    }
}

impl PartialEq for ServiceNode {
    fn eq(&self, other: &Self) -> bool {
        self.pubkey_ed25519 == other.pubkey_ed25519
    }
}

impl Eq for ServiceNode {}

impl std::hash::Hash for ServiceNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.pubkey_ed25519.hash(state);
    }
}

impl fmt::Debug for ServiceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.ip, self.port, self.pubkey_ed25519.short())
    }
}

fn port_from_number_or_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(p) => Ok(p),
        Port::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ip: &str, seed: u8) -> ServiceNode {
        ServiceNode::new(ip, 22021, NodeKey::new([seed; 32]), NodeKey::new([seed + 1; 32]))
    }

    #[test]
    fn test_port_as_string() {
        let json = format!(
            r#"{{"ip":"1.2.3.4","port":"22021","pubkey_x25519":"{}","pubkey_ed25519":"{}"}}"#,
            "aa".repeat(32),
            "bb".repeat(32)
        );
        let node: ServiceNode = serde_json::from_str(&json).unwrap();
        assert_eq!(node.port, 22021);
        assert_eq!(node.base_url(), "https://1.2.3.4:22021");
    }

    #[test]
    fn test_identity_is_ed25519() {
        let a = node("1.2.3.4", 1);
        let mut b = node("5.6.7.8", 1);
        b.port = 1;
        assert_eq!(a, b);
        assert_ne!(a, node("1.2.3.4", 3));
    }

    #[test]
    fn test_subnet24() {
        assert_eq!(node("10.1.2.3", 1).subnet24(), "10.1.2");
        assert!(node("0.0.0.0", 1).is_unroutable());
    }
}
