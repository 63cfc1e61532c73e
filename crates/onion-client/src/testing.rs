//! Test doubles for the pool, paths and transport

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use onion_core::{NodeKey, OnionPath, PubKey, SeedUrl, ServiceNode, SnodeResponse};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{ClientError, Result};
use crate::onion_path::GuardProbe;
use crate::seed::SeedNodeSource;
use crate::storage::{KeyValueStore, MemoryStore};
use crate::transport::{OnionRequest, OnionTransport};

/// Deterministic key; `tag` separates x25519 from ed25519 keys
pub fn node_key(i: usize, tag: u8) -> NodeKey {
    let mut bytes = [tag; 32];
    bytes[0] = i as u8;
    bytes[1] = (i >> 8) as u8;
    NodeKey::new(bytes)
}

/// Node `i`, alone in its /24 subnet
pub fn make_node(i: usize) -> ServiceNode {
    ServiceNode::new(
        format!("10.{}.{}.1", i / 250, i % 250),
        22021,
        node_key(i, 0x25),
        node_key(i, 0xed),
    )
}

pub fn make_nodes(n: usize) -> Vec<ServiceNode> {
    (0..n).map(make_node).collect()
}

pub fn pubkey(i: u8) -> PubKey {
    PubKey::new(format!("05{}", hex::encode([i; 32]))).expect("valid test pubkey")
}

/// Seed source returning a fixed node list and counting fetches
pub struct FakeSeedSource {
    nodes: Mutex<Vec<ServiceNode>>,
    calls: AtomicUsize,
    fail: bool,
}

impl FakeSeedSource {
    pub fn new(nodes: Vec<ServiceNode>) -> Self {
        Self {
            nodes: Mutex::new(nodes),
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn set_nodes(&self, nodes: Vec<ServiceNode>) {
        *self.nodes.lock() = nodes;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SeedNodeSource for FakeSeedSource {
    async fn fetch_snode_pool(&self, _seeds: &[SeedUrl]) -> Result<Vec<ServiceNode>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ClientError::SeedNodesExhausted("seed offline".into()));
        }
        Ok(self.nodes.lock().clone())
    }
}

/// Memory store that counts writes per key
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStore,
    writes: Mutex<HashMap<String, usize>>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self, id: &str) -> usize {
        self.writes.lock().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl KeyValueStore for CountingStore {
    async fn get_item(&self, id: &str) -> Result<Option<Value>> {
        self.inner.get_item(id).await
    }

    async fn create_or_update_item(&self, id: &str, value: Value) -> Result<()> {
        *self.writes.lock().entry(id.to_string()).or_insert(0) += 1;
        self.inner.create_or_update_item(id, value).await
    }
}

/// Probe that fails for a fixed set of nodes
pub struct RejectingProbe {
    dead: HashSet<NodeKey>,
}

impl RejectingProbe {
    pub fn new(dead: HashSet<NodeKey>) -> Self {
        Self { dead }
    }
}

#[async_trait]
impl GuardProbe for RejectingProbe {
    async fn probe(&self, node: &ServiceNode) -> bool {
        !self.dead.contains(node.key())
    }
}

/// A transport reply: a guard response, or no response at all
pub type ScriptedReply = Result<SnodeResponse>;

/// Transport answering from a script, then with a default success envelope
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<ScriptedReply>>,
    sent: Mutex<Vec<(OnionPath, OnionRequest)>>,
    hang: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never answers; for cancellation tests
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn push_status(&self, status: u16, body: impl Into<String>) {
        self.push(Ok(SnodeResponse::new(status, body)));
    }

    /// 200 from the guard wrapping a destination envelope
    pub fn push_envelope(&self, status: u16, body: Value) {
        self.push_status(200, json!({ "status": status, "body": body }).to_string());
    }

    pub fn sent(&self) -> Vec<(OnionPath, OnionRequest)> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl OnionTransport for ScriptedTransport {
    async fn send(&self, path: &OnionPath, request: &OnionRequest) -> Result<SnodeResponse> {
        self.sent.lock().push((path.clone(), request.clone()));
        if self.hang {
            std::future::pending::<()>().await;
        }
        let next = self.replies.lock().pop_front();
        next.unwrap_or_else(|| {
            Ok(SnodeResponse::new(
                200,
                json!({ "status": 200, "body": "{}" }).to_string(),
            ))
        })
    }
}
