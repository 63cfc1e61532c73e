//! Onion client facade: paths, interpretation and swarm resolution

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use onion_core::{OnionConfig, PubKey, ResponseBody, ServiceNode};
use rand::seq::SliceRandom;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{AbortReason, ClientError, Result};
use crate::interpreter::{parse_swarm_snodes, InterpretContext, OnionOutcome, OnionResponseInterpreter};
use crate::onion_path::{GuardProbe, OnionPathManager};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::seed::SeedNodeSource;
use crate::snode_pool::SnodePool;
use crate::storage::KeyValueStore;
use crate::transport::{OnionRequest, OnionTransport};

/// Parameters of a `store` request to a destination's swarm
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub destination: PubKey,
    pub data: Vec<u8>,
    pub ttl_ms: u64,
    pub namespace: i32,
    pub timestamp_ms: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Routes requests to snodes through onion paths
pub struct OnionClient {
    config: OnionConfig,
    pool: Arc<SnodePool>,
    paths: Arc<OnionPathManager>,
    interpreter: OnionResponseInterpreter,
    transport: Arc<dyn OnionTransport>,
}

impl OnionClient {
    /// Create a client over the given collaborators
    pub fn new(
        config: OnionConfig,
        store: Arc<dyn KeyValueStore>,
        seeds: Arc<dyn SeedNodeSource>,
        transport: Arc<dyn OnionTransport>,
    ) -> Self {
        ClientBuilder::new(config, store, seeds, transport).build()
    }

    /// Restore the pool and guards persisted by a previous run
    pub async fn start(&self) -> Result<()> {
        let nodes = self.pool.load().await?;
        let guards = self.paths.load_guards().await?;
        tracing::info!(nodes, guards, "Onion client started");
        Ok(())
    }

    pub fn config(&self) -> &OnionConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<SnodePool> {
        &self.pool
    }

    pub fn paths(&self) -> &Arc<OnionPathManager> {
        &self.paths
    }

    /// One onion request, classified. Retryable outcomes have already
    /// charged or repaired the path when this returns.
    pub async fn send_once(
        &self,
        request: &OnionRequest,
        associated_with: Option<&PubKey>,
        cancel: &CancellationToken,
    ) -> Result<OnionOutcome> {
        let target = request.target().copied();
        if cancel.is_cancelled() {
            return Ok(OnionOutcome::Aborted(AbortReason::Cancelled));
        }

        let path = self.paths.get_onion_path(target.as_ref()).await?;
        let guard = *path
            .guard()
            .ok_or(ClientError::NoOnionPath)?
            .key();

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = self.transport.send(&path, request) => Some(res),
        };
        let response = match reply {
            Some(Ok(resp)) => Some(resp),
            Some(Err(e)) if e.is_no_response() => {
                tracing::warn!(guard = %guard.short(), error = %e, "Onion request failed in transport");
                None
            }
            Some(Err(e)) => {
                // Failed locally (encrypting or decoding); the path is not at fault
                tracing::warn!(guard = %guard.short(), error = %e, "Onion request failed locally");
                return Err(e);
            }
            None => None,
        };

        let ctx = InterpretContext {
            guard: &guard,
            target: target.as_ref(),
            associated_with,
        };
        self.interpreter
            .interpret(cancel.is_cancelled(), response.as_ref(), &ctx)
            .await
    }

    /// Onion request to `node`, retried while the outcome is retryable
    pub async fn send_to_snode(
        &self,
        node: &ServiceNode,
        payload: Vec<u8>,
        associated_with: Option<&PubKey>,
        cancel: &CancellationToken,
    ) -> Result<ResponseBody> {
        let request = OnionRequest::to_snode(node.clone(), payload);
        let policy = RetryPolicy::new(
            self.config.onion_fetch_attempts,
            self.config.onion_fetch_min_timeout(),
        );
        retry_with_backoff(
            policy,
            |_| async {
                self.send_once(&request, associated_with, cancel)
                    .await?
                    .into_result()
            },
            ClientError::is_retryable,
        )
        .await
        .map_err(|e| e.into_inner())
    }

    /// Swarm of `destination`: the cached one, else fetched with `get_swarm`
    pub async fn swarm_for(
        &self,
        destination: &PubKey,
        cancel: &CancellationToken,
    ) -> Result<Vec<ServiceNode>> {
        let cached = self.pool.get_swarm_for(destination).await?;
        if !cached.is_empty() {
            return Ok(cached);
        }

        self.pool.ensure_minimum_pool().await?;
        let node = self.pool.get_random_snode(&[]).await?;
        let payload = json!({
            "method": "get_swarm",
            "params": { "pubkey": destination.as_str() },
        });
        let body = self
            .send_to_snode(&node, serde_json::to_vec(&payload)?, None, cancel)
            .await?;

        let snodes = match &body {
            ResponseBody::Json(value) => parse_swarm_snodes(value),
            _ => Vec::new(),
        };
        if snodes.is_empty() {
            return Err(ClientError::EmptySwarm);
        }
        tracing::debug!(destination = %destination.short(), count = snodes.len(), "Fetched swarm");
        self.pool.update_swarm_for(destination, snodes.clone()).await?;
        Ok(snodes)
    }

    /// Store a message on one random member of the destination's swarm.
    /// Single attempt; the caller owns the retry policy.
    pub async fn store_message(
        &self,
        request: &StoreRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponseBody> {
        let swarm = self.swarm_for(&request.destination, cancel).await?;
        let target = swarm
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ClientError::EmptySwarm)?;

        let payload = json!({
            "method": "store",
            "params": {
                "pubkey": request.destination.as_str(),
                "ttl": request.ttl_ms.to_string(),
                "timestamp": request.timestamp_ms.to_string(),
                "data": STANDARD.encode(&request.data),
                "namespace": request.namespace,
            }
        });
        let onion = OnionRequest::to_snode(target, serde_json::to_vec(&payload)?);
        self.send_once(&onion, Some(&request.destination), cancel)
            .await?
            .into_result()
    }
}

/// Builder for OnionClient
pub struct ClientBuilder {
    config: OnionConfig,
    store: Arc<dyn KeyValueStore>,
    seeds: Arc<dyn SeedNodeSource>,
    transport: Arc<dyn OnionTransport>,
    probe: Option<Arc<dyn GuardProbe>>,
}

impl ClientBuilder {
    pub fn new(
        config: OnionConfig,
        store: Arc<dyn KeyValueStore>,
        seeds: Arc<dyn SeedNodeSource>,
        transport: Arc<dyn OnionTransport>,
    ) -> Self {
        Self {
            config,
            store,
            seeds,
            transport,
            probe: None,
        }
    }

    pub fn guard_probe(mut self, probe: Arc<dyn GuardProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> OnionClient {
        let pool = Arc::new(SnodePool::new(&self.config, self.seeds, self.store.clone()));
        let mut paths = OnionPathManager::new(&self.config, pool.clone(), self.store);
        if let Some(probe) = self.probe {
            paths = paths.with_guard_probe(probe);
        }
        let paths = Arc::new(paths);
        let interpreter = OnionResponseInterpreter::new(pool.clone(), paths.clone());
        OnionClient {
            config: self.config,
            pool,
            paths,
            interpreter,
            transport: self.transport,
        }
    }
}
