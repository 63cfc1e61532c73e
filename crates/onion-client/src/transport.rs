//! Onion request wire format and HTTP transport
//!
//! Each layer is `u32 LE ciphertext length || ciphertext || JSON`. The JSON
//! control object tells the hop where to forward: `destination` (the next
//! hop's ed25519 key) or, for the final hop of a server request,
//! `host/target/method/protocol/port`. The layer's `ephemeral_key` lets the
//! hop derive the key for the inner ciphertext.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use onion_core::{NodeKey, OnionPath, ServiceNode, SnodeResponse};
use reqwest::Client;
use serde_json::{json, Map, Value};

use crate::error::{ClientError, Result};

/// Result of encrypting a payload for one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationContext {
    pub ciphertext: Vec<u8>,
    pub symmetric_key: Vec<u8>,
    pub ephemeral_key: Vec<u8>,
}

/// x25519 + AES-GCM primitives supplied by the embedding application
#[async_trait]
pub trait OnionCrypto: Send + Sync {
    async fn encrypt_for_pubkey(&self, x25519: &NodeKey, plaintext: &[u8]) -> Result<DestinationContext>;

    async fn decrypt(&self, symmetric_key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// A non-snode server reached through the exit hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDestination {
    pub host: String,
    pub target: String,
    pub method: String,
    pub protocol: String,
    pub port: u16,
    pub pubkey_x25519: NodeKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalDestination {
    Snode(ServiceNode),
    Server(ServerDestination),
}

impl FinalDestination {
    fn x25519(&self) -> &NodeKey {
        match self {
            FinalDestination::Snode(node) => &node.pubkey_x25519,
            FinalDestination::Server(server) => &server.pubkey_x25519,
        }
    }

    fn control_object(&self) -> Map<String, Value> {
        let mut control = Map::new();
        match self {
            FinalDestination::Snode(node) => {
                control.insert("destination".into(), json!(node.pubkey_ed25519.to_hex()));
            }
            FinalDestination::Server(server) => {
                control.insert("host".into(), json!(server.host));
                control.insert("target".into(), json!(server.target));
                control.insert("method".into(), json!(server.method));
                control.insert("protocol".into(), json!(server.protocol));
                control.insert("port".into(), json!(server.port));
            }
        }
        control
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionRequest {
    pub destination: FinalDestination,
    pub payload: Vec<u8>,
}

impl OnionRequest {
    pub fn to_snode(node: ServiceNode, payload: Vec<u8>) -> Self {
        Self {
            destination: FinalDestination::Snode(node),
            payload,
        }
    }

    /// Target snode key, when the destination is a snode
    pub fn target(&self) -> Option<&NodeKey> {
        match &self.destination {
            FinalDestination::Snode(node) => Some(node.key()),
            FinalDestination::Server(_) => None,
        }
    }
}

pub fn encode_ciphertext_plus_json(ciphertext: &[u8], json: &Value) -> Vec<u8> {
    let json = json.to_string();
    let mut out = Vec::with_capacity(4 + ciphertext.len() + json.len());
    out.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
    out.extend_from_slice(ciphertext);
    out.extend_from_slice(json.as_bytes());
    out
}

pub fn decode_ciphertext_plus_json(data: &[u8]) -> Result<(Vec<u8>, Value)> {
    let header: [u8; 4] = data
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| ClientError::Transport("onion layer shorter than its header".into()))?;
    let len = u32::from_le_bytes(header) as usize;
    let ciphertext = data
        .get(4..4 + len)
        .ok_or_else(|| ClientError::Transport("onion layer truncated".into()))?;
    let json = serde_json::from_slice(&data[4 + len..])?;
    Ok((ciphertext.to_vec(), json))
}

/// Guard payload plus the key needed to read the destination's reply
#[derive(Debug, Clone)]
pub struct OnionPayload {
    pub guard_payload: Vec<u8>,
    pub destination_ctx: DestinationContext,
}

/// Wrap `request` for every hop of `path`, innermost layer first
pub async fn build_onion_guard_payload(
    crypto: &dyn OnionCrypto,
    path: &OnionPath,
    request: &OnionRequest,
) -> Result<OnionPayload> {
    if path.is_empty() {
        return Err(ClientError::NoOnionPath);
    }
    let destination_ctx = crypto
        .encrypt_for_pubkey(request.destination.x25519(), &request.payload)
        .await?;

    let mut ctx = destination_ctx.clone();
    let last = path.len() - 1;
    for (i, hop) in path.nodes.iter().enumerate().rev() {
        let mut control = if i == last {
            request.destination.control_object()
        } else {
            let mut next = Map::new();
            next.insert(
                "destination".into(),
                json!(path.nodes[i + 1].pubkey_ed25519.to_hex()),
            );
            next
        };
        control.insert("ephemeral_key".into(), json!(hex::encode(&ctx.ephemeral_key)));
        let plaintext = encode_ciphertext_plus_json(&ctx.ciphertext, &Value::Object(control));
        ctx = crypto.encrypt_for_pubkey(&hop.pubkey_x25519, &plaintext).await?;
    }

    let guard_payload = encode_ciphertext_plus_json(
        &ctx.ciphertext,
        &json!({ "ephemeral_key": hex::encode(&ctx.ephemeral_key) }),
    );
    Ok(OnionPayload {
        guard_payload,
        destination_ctx,
    })
}

/// Decrypt a 200 body: base64 ciphertext, possibly wrapped as `{"result": ...}`
pub async fn decode_onion_response(
    crypto: &dyn OnionCrypto,
    text: &str,
    symmetric_key: &[u8],
) -> Result<String> {
    let wrapped = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("result").and_then(Value::as_str).map(str::to_string));
    let encoded = wrapped.as_deref().unwrap_or(text).trim();
    let ciphertext = STANDARD
        .decode(encoded)
        .map_err(|e| ClientError::Crypto(format!("response is not base64: {}", e)))?;
    let plaintext = crypto.decrypt(symmetric_key, &ciphertext).await?;
    String::from_utf8(plaintext).map_err(|e| ClientError::Crypto(format!("response is not UTF-8: {}", e)))
}

/// Delivers an onion request to a path's guard and returns its raw answer.
/// An `Http` or `Transport` error means no answer was received. Any other
/// error, such as an answer that does not decrypt, is a local failure.
#[async_trait]
pub trait OnionTransport: Send + Sync {
    async fn send(&self, path: &OnionPath, request: &OnionRequest) -> Result<SnodeResponse>;
}

/// reqwest transport posting to `/onion_req/v2` on the guard
pub struct HttpOnionTransport {
    http: Client,
    crypto: Arc<dyn OnionCrypto>,
}

impl HttpOnionTransport {
    pub fn new(crypto: Arc<dyn OnionCrypto>) -> Result<Self> {
        // Snodes serve self-signed certificates
        let http = Client::builder()
            .timeout(Duration::from_secs(25))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { http, crypto })
    }
}

#[async_trait]
impl OnionTransport for HttpOnionTransport {
    async fn send(&self, path: &OnionPath, request: &OnionRequest) -> Result<SnodeResponse> {
        let guard = path.guard().ok_or(ClientError::NoOnionPath)?;
        let payload = build_onion_guard_payload(self.crypto.as_ref(), path, request).await?;

        let url = format!("{}/onion_req/v2", guard.base_url());
        tracing::debug!(guard = %guard.key().short(), hops = path.len(), "Sending onion request");
        let resp = self.http.post(&url).body(payload.guard_payload).send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        if status != 200 {
            return Ok(SnodeResponse::new(status, text));
        }

        let body = decode_onion_response(
            self.crypto.as_ref(),
            &text,
            &payload.destination_ctx.symmetric_key,
        )
        .await?;
        Ok(SnodeResponse::new(200, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_nodes;

    /// Identity "encryption" that records the recipient as the ephemeral key
    struct PlainCrypto;

    #[async_trait]
    impl OnionCrypto for PlainCrypto {
        async fn encrypt_for_pubkey(&self, x25519: &NodeKey, plaintext: &[u8]) -> Result<DestinationContext> {
            Ok(DestinationContext {
                ciphertext: plaintext.to_vec(),
                symmetric_key: x25519.as_bytes().to_vec(),
                ephemeral_key: x25519.as_bytes().to_vec(),
            })
        }

        async fn decrypt(&self, _symmetric_key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
            Ok(ciphertext.to_vec())
        }
    }

    #[test]
    fn test_encode_layout() {
        let encoded = encode_ciphertext_plus_json(b"abc", &json!({"k": 1}));
        assert_eq!(&encoded[..4], &3u32.to_le_bytes());
        assert_eq!(&encoded[4..7], b"abc");
        assert_eq!(&encoded[7..], br#"{"k":1}"#);

        let (ciphertext, value) = decode_ciphertext_plus_json(&encoded).unwrap();
        assert_eq!(ciphertext, b"abc");
        assert_eq!(value["k"], 1);
        assert!(decode_ciphertext_plus_json(&[9, 0, 0, 0, 1]).is_err());
    }

    #[tokio::test]
    async fn test_layers_peel_in_path_order() {
        let nodes = make_nodes(4);
        let path = OnionPath::new(nodes[..3].to_vec());
        let request = OnionRequest::to_snode(nodes[3].clone(), b"payload".to_vec());

        let payload = build_onion_guard_payload(&PlainCrypto, &path, &request).await.unwrap();
        assert_eq!(payload.destination_ctx.symmetric_key, nodes[3].pubkey_x25519.as_bytes().to_vec());

        // Guard wrapper only carries the ephemeral key for the guard layer
        let (mut layer, control) = decode_ciphertext_plus_json(&payload.guard_payload).unwrap();
        assert_eq!(control["ephemeral_key"], hex::encode(nodes[0].pubkey_x25519.as_bytes()));
        assert!(control.get("destination").is_none());

        // Each hop forwards to the next; the exit forwards to the destination
        let expected = [&nodes[1], &nodes[2], &nodes[3]];
        for next in expected {
            let (inner, control) = decode_ciphertext_plus_json(&layer).unwrap();
            assert_eq!(control["destination"], next.pubkey_ed25519.to_hex());
            layer = inner;
        }
        assert_eq!(layer, b"payload");
    }

    #[tokio::test]
    async fn test_server_destination_control() {
        let nodes = make_nodes(3);
        let path = OnionPath::new(nodes.clone());
        let request = OnionRequest {
            destination: FinalDestination::Server(ServerDestination {
                host: "open.example".into(),
                target: "/loki/v3/lsrpc".into(),
                method: "POST".into(),
                protocol: "https".into(),
                port: 443,
                pubkey_x25519: NodeKey::new([9; 32]),
            }),
            payload: b"{}".to_vec(),
        };
        assert!(request.target().is_none());

        let payload = build_onion_guard_payload(&PlainCrypto, &path, &request).await.unwrap();
        let (mut layer, _) = decode_ciphertext_plus_json(&payload.guard_payload).unwrap();
        for _ in 0..2 {
            layer = decode_ciphertext_plus_json(&layer).unwrap().0;
        }
        let (_, exit_control) = decode_ciphertext_plus_json(&layer).unwrap();
        assert_eq!(exit_control["host"], "open.example");
        assert_eq!(exit_control["port"], 443);
        assert!(exit_control.get("destination").is_none());
    }

    #[tokio::test]
    async fn test_decode_wrapped_response() {
        let b64 = STANDARD.encode(br#"{"status":200}"#);
        let plain = decode_onion_response(&PlainCrypto, &b64, &[]).await.unwrap();
        assert_eq!(plain, r#"{"status":200}"#);

        let wrapped = json!({ "result": b64 }).to_string();
        let plain = decode_onion_response(&PlainCrypto, &wrapped, &[]).await.unwrap();
        assert_eq!(plain, r#"{"status":200}"#);

        assert!(decode_onion_response(&PlainCrypto, "!!!", &[]).await.is_err());
    }
}
