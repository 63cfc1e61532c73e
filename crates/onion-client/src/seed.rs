//! Bootstrap node pool from trusted seed nodes

use std::time::Duration;

use async_trait::async_trait;
use onion_core::{NodeKey, OnionConfig, SeedUrl, ServiceNode};
use rand::seq::SliceRandom;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ClientError, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};

#[async_trait]
pub trait SeedNodeSource: Send + Sync {
    /// Fetch the full list of active service nodes
    async fn fetch_snode_pool(&self, seeds: &[SeedUrl]) -> Result<Vec<ServiceNode>>;
}

#[derive(Deserialize)]
struct SeedNodeState {
    public_ip: Option<String>,
    storage_port: Option<u16>,
    pubkey_x25519: Option<String>,
    pubkey_ed25519: Option<String>,
}

/// Decode a `get_n_service_nodes` JSON-RPC response, dropping unroutable
/// and malformed entries.
pub fn parse_seed_response(value: &Value) -> Result<Vec<ServiceNode>> {
    let states = value
        .get("result")
        .and_then(|r| r.get("service_node_states"))
        .ok_or_else(|| ClientError::Transport("seed response has no service_node_states".into()))?;
    let states: Vec<SeedNodeState> = serde_json::from_value(states.clone())?;

    let mut nodes = Vec::with_capacity(states.len());
    for state in states {
        let (Some(ip), Some(port), Some(x25519), Some(ed25519)) = (
            state.public_ip,
            state.storage_port,
            state.pubkey_x25519,
            state.pubkey_ed25519,
        ) else {
            continue;
        };
        let (Ok(x25519), Ok(ed25519)) = (NodeKey::from_hex(&x25519), NodeKey::from_hex(&ed25519))
        else {
            tracing::warn!(ip = %ip, "Skipping seed entry with invalid keys");
            continue;
        };
        let node = ServiceNode::new(ip, port, x25519, ed25519);
        if !node.is_unroutable() {
            nodes.push(node);
        }
    }
    Ok(nodes)
}

/// JSON-RPC client for seed nodes
pub struct SeedNodeClient {
    http: Client,
    policy: RetryPolicy,
}

impl SeedNodeClient {
    pub fn new(config: &OnionConfig) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            policy: RetryPolicy::new(config.seed_attempts, config.seed_min_timeout())
                .with_factor(config.seed_backoff_factor),
        })
    }

    async fn fetch_from(&self, seed: &SeedUrl) -> Result<Vec<ServiceNode>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": "get_n_service_nodes",
            "params": {
                "active_only": true,
                "fields": {
                    "public_ip": true,
                    "storage_port": true,
                    "pubkey_x25519": true,
                    "pubkey_ed25519": true,
                }
            }
        });

        let resp = self.http.post(seed.json_rpc_url()).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::Transport(format!(
                "seed {} returned {}",
                seed.url,
                resp.status()
            )));
        }
        let value: Value = resp.json().await?;
        let nodes = parse_seed_response(&value)?;
        if nodes.is_empty() {
            return Err(ClientError::Transport(format!("seed {} returned no nodes", seed.url)));
        }
        Ok(nodes)
    }
}

#[async_trait]
impl SeedNodeSource for SeedNodeClient {
    async fn fetch_snode_pool(&self, seeds: &[SeedUrl]) -> Result<Vec<ServiceNode>> {
        if seeds.is_empty() {
            return Err(ClientError::SeedNodesExhausted("no seed urls configured".into()));
        }

        let result = retry_with_backoff(
            self.policy,
            |attempt| {
                // A different random seed each attempt
                let seed = seeds
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .unwrap_or_else(|| seeds[0].clone());
                async move {
                    tracing::info!(seed = %seed.url, attempt, "Fetching snode pool from seed");
                    self.fetch_from(&seed).await
                }
            },
            |_| true,
        )
        .await;

        match result {
            Ok(mut nodes) => {
                nodes.shuffle(&mut rand::thread_rng());
                tracing::info!(count = nodes.len(), "Fetched snode pool from seed");
                Ok(nodes)
            }
            Err(e) => Err(ClientError::SeedNodesExhausted(e.into_inner().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(ip: &str, seed: u8) -> Value {
        json!({
            "public_ip": ip,
            "storage_port": 22021,
            "pubkey_x25519": hex::encode([seed; 32]),
            "pubkey_ed25519": hex::encode([seed + 100; 32]),
        })
    }

    #[test]
    fn test_parse_filters_unroutable() {
        let value = json!({
            "result": {
                "service_node_states": [state("1.1.1.1", 1), state("0.0.0.0", 2), state("2.2.2.2", 3)]
            }
        });
        let nodes = parse_seed_response(&value).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].ip, "1.1.1.1");
        assert_eq!(nodes[1].pubkey_ed25519, NodeKey::new([103; 32]));
    }

    #[test]
    fn test_parse_skips_malformed() {
        let value = json!({
            "result": {
                "service_node_states": [
                    {"public_ip": "3.3.3.3", "storage_port": 1},
                    {"public_ip": "4.4.4.4", "storage_port": 1, "pubkey_x25519": "zz", "pubkey_ed25519": "zz"},
                    state("5.5.5.5", 4)
                ]
            }
        });
        let nodes = parse_seed_response(&value).unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn test_parse_missing_result() {
        assert!(parse_seed_response(&json!({"error": "down"})).is_err());
    }
}
