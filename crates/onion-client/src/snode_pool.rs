//! Master list of known service nodes and per-destination swarms

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use onion_core::{NodeKey, OnionConfig, PubKey, SeedUrl, ServiceNode};
use rand::seq::SliceRandom;
use tokio::sync::Mutex;

use crate::error::{ClientError, Result};
use crate::seed::SeedNodeSource;
use crate::storage::{load_json, save_json, swarm_key, KeyValueStore, SNODE_POOL_KEY};

/// Pool activity counters
#[derive(Debug, Default)]
pub struct PoolStats {
    pub seed_fetches: AtomicU64,
    pub pool_evictions: AtomicU64,
    pub swarm_evictions: AtomicU64,
    pub swarm_updates: AtomicU64,
    pub pool_persists: AtomicU64,
}

impl PoolStats {
    pub fn seed_fetches(&self) -> u64 {
        self.seed_fetches.load(Ordering::Relaxed)
    }

    pub fn pool_evictions(&self) -> u64 {
        self.pool_evictions.load(Ordering::Relaxed)
    }

    pub fn swarm_evictions(&self) -> u64 {
        self.swarm_evictions.load(Ordering::Relaxed)
    }

    pub fn swarm_updates(&self) -> u64 {
        self.swarm_updates.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct PoolState {
    nodes: Vec<ServiceNode>,
    swarms: HashMap<PubKey, Vec<ServiceNode>>,
}

pub struct SnodePool {
    state: Mutex<PoolState>,
    seeds: Arc<dyn SeedNodeSource>,
    store: Arc<dyn KeyValueStore>,
    seed_urls: Vec<SeedUrl>,
    min_pool_size: usize,
    stats: PoolStats,
}

impl SnodePool {
    pub fn new(
        config: &OnionConfig,
        seeds: Arc<dyn SeedNodeSource>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            seeds,
            store,
            seed_urls: config.seed_urls.clone(),
            min_pool_size: config.min_pool_size,
            stats: PoolStats::default(),
        }
    }

    /// Hydrate from storage; returns the number of nodes loaded
    pub async fn load(&self) -> Result<usize> {
        let nodes: Vec<ServiceNode> = load_json(self.store.as_ref(), SNODE_POOL_KEY)
            .await?
            .unwrap_or_default();
        let count = nodes.len();
        self.state.lock().await.nodes = nodes;
        tracing::debug!(count, "Loaded snode pool from storage");
        Ok(count)
    }

    /// Refetch from a seed when the pool is below the minimum size.
    ///
    /// The lock is held across the fetch so concurrent callers see one refetch.
    pub async fn ensure_minimum_pool(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.nodes.len() >= self.min_pool_size {
            return Ok(());
        }
        tracing::info!(
            current = state.nodes.len(),
            minimum = self.min_pool_size,
            "Snode pool too small, refetching from seed"
        );
        self.refetch_locked(&mut state).await?;

        let available = state.nodes.len();
        if available < self.min_pool_size {
            tracing::warn!(
                available,
                minimum = self.min_pool_size,
                "Seed returned too few snodes"
            );
            return Err(ClientError::PoolExhausted {
                needed: self.min_pool_size,
                available,
            });
        }
        Ok(())
    }

    /// Unconditionally replace the pool with a fresh seed fetch
    pub async fn refresh_from_seed(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.refetch_locked(&mut state).await?;
        Ok(state.nodes.len())
    }

    async fn refetch_locked(&self, state: &mut PoolState) -> Result<()> {
        let nodes = self.seeds.fetch_snode_pool(&self.seed_urls).await?;
        self.stats.seed_fetches.fetch_add(1, Ordering::Relaxed);
        state.nodes = nodes;
        self.persist_locked(state).await
    }

    async fn persist_locked(&self, state: &PoolState) -> Result<()> {
        save_json(self.store.as_ref(), SNODE_POOL_KEY, &state.nodes).await?;
        self.stats.pool_persists.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a node from the pool; idempotent
    pub async fn drop_snode_from_pool(&self, key: &NodeKey) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.nodes.len();
        state.nodes.retain(|n| n.key() != key);
        if state.nodes.len() == before {
            return Ok(false);
        }
        self.persist_locked(&state).await?;
        self.stats.pool_evictions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("onion_snode_evictions_total").increment(1);
        tracing::info!(
            node = %key.short(),
            remaining = state.nodes.len(),
            "Dropped snode from pool"
        );
        Ok(true)
    }

    /// Remove a node from the cached swarm of `destination`, if it is there
    pub async fn drop_snode_from_swarm_if_needed(
        &self,
        destination: &PubKey,
        key: &NodeKey,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.ensure_swarm_cached(&mut state, destination).await?;
        let Some(swarm) = state.swarms.get_mut(destination) else {
            return Ok(false);
        };
        let before = swarm.len();
        swarm.retain(|n| n.key() != key);
        if swarm.len() == before {
            return Ok(false);
        }
        save_json(self.store.as_ref(), &swarm_key(destination), &*swarm).await?;
        self.stats.swarm_evictions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            node = %key.short(),
            destination = %destination.short(),
            "Dropped snode from swarm"
        );
        Ok(true)
    }

    /// Cached swarm of `destination`, loaded from storage on first use
    pub async fn get_swarm_for(&self, destination: &PubKey) -> Result<Vec<ServiceNode>> {
        let mut state = self.state.lock().await;
        self.ensure_swarm_cached(&mut state, destination).await?;
        Ok(state.swarms.get(destination).cloned().unwrap_or_default())
    }

    /// Replace the swarm of `destination`
    pub async fn update_swarm_for(&self, destination: &PubKey, nodes: Vec<ServiceNode>) -> Result<()> {
        let mut state = self.state.lock().await;
        save_json(self.store.as_ref(), &swarm_key(destination), &nodes).await?;
        tracing::debug!(
            destination = %destination.short(),
            count = nodes.len(),
            "Updated swarm"
        );
        state.swarms.insert(destination.clone(), nodes);
        self.stats.swarm_updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn ensure_swarm_cached(&self, state: &mut PoolState, destination: &PubKey) -> Result<()> {
        if state.swarms.contains_key(destination) {
            return Ok(());
        }
        let stored: Option<Vec<ServiceNode>> =
            load_json(self.store.as_ref(), &swarm_key(destination)).await?;
        if let Some(nodes) = stored {
            state.swarms.insert(destination.clone(), nodes);
        }
        Ok(())
    }

    /// Random pool member not in `exclude`
    pub async fn get_random_snode(&self, exclude: &[NodeKey]) -> Result<ServiceNode> {
        let state = self.state.lock().await;
        let candidates: Vec<&ServiceNode> = state
            .nodes
            .iter()
            .filter(|n| !exclude.contains(n.key()))
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|n| (*n).clone())
            .ok_or(ClientError::PoolExhausted {
                needed: 1,
                available: 0,
            })
    }

    /// Snapshot of the pool in its stored order
    pub async fn nodes(&self) -> Vec<ServiceNode> {
        self.state.lock().await.nodes.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.nodes.is_empty()
    }

    pub async fn contains(&self, key: &NodeKey) -> bool {
        self.state.lock().await.nodes.iter().any(|n| n.key() == key)
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}
