//! Onion path construction, repair and failure accounting
//!
//! Every path slot starts with a guard node. Guards are persisted so the
//! same guards are reused across restarts. Failures are counted per slot
//! and per snode; crossing a threshold evicts the node and repairs only
//! the affected slot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::join_all;
use onion_core::{NodeKey, OnionConfig, OnionPath, PubKey, ServiceNode};
use rand::seq::SliceRandom;
use reqwest::Client;
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::{ClientError, Result};
use crate::job_queue::JobQueue;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::snode_pool::SnodePool;
use crate::storage::{load_json, save_json, KeyValueStore, GUARD_NODES_KEY};

/// Builds attempted by `get_onion_path` before giving up
const MAX_PATH_BUILDS: u32 = 10;

const BUILD_JOB_ID: u8 = 0;

/// Checks that a prospective guard answers requests
#[async_trait]
pub trait GuardProbe: Send + Sync {
    async fn probe(&self, node: &ServiceNode) -> bool;
}

/// Probes a guard with a direct `get_swarm` storage RPC
pub struct HttpGuardProbe {
    http: Client,
    pubkey: PubKey,
}

impl HttpGuardProbe {
    pub fn new(pubkey: PubKey) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { http, pubkey })
    }
}

#[async_trait]
impl GuardProbe for HttpGuardProbe {
    async fn probe(&self, node: &ServiceNode) -> bool {
        let url = format!("{}/storage_rpc/v1", node.base_url());
        let body = json!({
            "method": "get_swarm",
            "params": { "pubkey": self.pubkey.as_str() },
        });
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::debug!(node = %node.key().short(), status = resp.status().as_u16(), "Guard probe rejected");
                false
            }
            Err(e) => {
                tracing::debug!(node = %node.key().short(), error = %e, "Guard probe failed");
                false
            }
        }
    }
}

/// Path activity counters
#[derive(Debug, Default)]
pub struct PathStats {
    pub builds: AtomicU64,
    pub slot_rebuilds: AtomicU64,
    pub node_repairs: AtomicU64,
    pub guard_persists: AtomicU64,
    pub snode_increments: AtomicU64,
    pub path_increments: AtomicU64,
}

impl PathStats {
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn slot_rebuilds(&self) -> u64 {
        self.slot_rebuilds.load(Ordering::Relaxed)
    }

    pub fn node_repairs(&self) -> u64 {
        self.node_repairs.load(Ordering::Relaxed)
    }

    pub fn guard_persists(&self) -> u64 {
        self.guard_persists.load(Ordering::Relaxed)
    }

    pub fn snode_increments(&self) -> u64 {
        self.snode_increments.load(Ordering::Relaxed)
    }

    pub fn path_increments(&self) -> u64 {
        self.path_increments.load(Ordering::Relaxed)
    }
}

/// Guards and slots; `guards[i]` is the first hop of `slots[i]` once built
#[derive(Default)]
struct PathState {
    guards: Vec<ServiceNode>,
    slots: Vec<OnionPath>,
    used_guards: HashSet<NodeKey>,
}

impl PathState {
    fn member_keys(&self) -> HashSet<NodeKey> {
        self.slots
            .iter()
            .flat_map(|p| p.nodes.iter())
            .chain(self.guards.iter())
            .map(|n| *n.key())
            .collect()
    }
}

#[derive(Default)]
struct FailureCounters {
    path: HashMap<usize, u32>,
    snode: HashMap<NodeKey, u32>,
}

pub struct OnionPathManager {
    pool: Arc<SnodePool>,
    store: Arc<dyn KeyValueStore>,
    probe: Option<Arc<dyn GuardProbe>>,
    path_count: usize,
    hops: usize,
    path_failure_threshold: u32,
    snode_failure_threshold: u32,
    min_path_count: usize,
    guard_probe_rounds: u32,
    build_policy: RetryPolicy,
    state: Mutex<PathState>,
    snapshot: ArcSwap<Vec<OnionPath>>,
    counters: parking_lot::Mutex<FailureCounters>,
    build_jobs: JobQueue<u8, Result<()>>,
    stats: PathStats,
}

impl OnionPathManager {
    pub fn new(config: &OnionConfig, pool: Arc<SnodePool>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            pool,
            store,
            probe: None,
            path_count: config.path_count,
            hops: config.hops.max(1),
            path_failure_threshold: config.path_failure_threshold.max(1),
            snode_failure_threshold: config.snode_failure_threshold.max(1),
            min_path_count: config.min_path_count,
            guard_probe_rounds: config.guard_probe_rounds.max(1),
            build_policy: RetryPolicy::new(config.path_build_attempts, config.path_build_min_timeout()),
            state: Mutex::new(PathState::default()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            counters: parking_lot::Mutex::new(FailureCounters::default()),
            build_jobs: JobQueue::new(),
            stats: PathStats::default(),
        }
    }

    pub fn with_guard_probe(mut self, probe: Arc<dyn GuardProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Current built paths, without locking
    pub fn paths(&self) -> Arc<Vec<OnionPath>> {
        self.snapshot.load_full()
    }

    pub async fn guard_nodes(&self) -> Vec<ServiceNode> {
        self.state.lock().await.guards.clone()
    }

    pub fn stats(&self) -> &PathStats {
        &self.stats
    }

    pub fn path_failure_count(&self, slot: usize) -> u32 {
        self.counters.lock().path.get(&slot).copied().unwrap_or(0)
    }

    pub fn snode_failure_count(&self, key: &NodeKey) -> u32 {
        self.counters.lock().snode.get(key).copied().unwrap_or(0)
    }

    pub fn reset_path_failure_count(&self) {
        self.counters.lock().path.clear();
    }

    pub fn reset_snode_failure_count(&self) {
        self.counters.lock().snode.clear();
    }

    /// Restore the persisted guard set, resolving keys against the pool.
    /// Guards that left the pool are dropped and reselected at build time.
    pub async fn load_guards(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let pool_nodes = self.pool.nodes().await;
        self.load_guards_locked(&mut state, &pool_nodes).await
    }

    async fn load_guards_locked(&self, state: &mut PathState, pool_nodes: &[ServiceNode]) -> Result<usize> {
        let keys: Vec<NodeKey> = load_json(self.store.as_ref(), GUARD_NODES_KEY)
            .await?
            .unwrap_or_default();
        let guards: Vec<ServiceNode> = keys
            .iter()
            .filter_map(|k| pool_nodes.iter().find(|n| n.key() == k).cloned())
            .take(self.path_count)
            .collect();
        if guards.len() < keys.len() {
            tracing::info!(
                stored = keys.len(),
                resolved = guards.len(),
                "Some stored guard nodes are no longer in the pool"
            );
        }
        for g in &guards {
            state.used_guards.insert(*g.key());
        }
        state.guards = guards;
        Ok(state.guards.len())
    }

    async fn persist_guards(&self, guards: &[ServiceNode]) -> Result<()> {
        let keys: Vec<NodeKey> = guards.iter().map(|g| *g.key()).collect();
        save_json(self.store.as_ref(), GUARD_NODES_KEY, &keys).await?;
        self.stats.guard_persists.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pick a fresh guard set of `count` nodes and persist it.
    /// Built paths are discarded; the next build uses the new guards.
    pub async fn select_guard_nodes(&self, count: usize) -> Result<Vec<ServiceNode>> {
        let mut state = self.state.lock().await;
        let pool_nodes = self.pool.nodes().await;
        let picked = self
            .pick_guards(&mut state, &pool_nodes, count, &HashSet::new())
            .await?;
        state.guards = picked.clone();
        state.slots.clear();
        self.publish(&state);
        self.persist_guards(&state.guards).await?;
        Ok(picked)
    }

    /// Candidates in pool order: never-used nodes first, known-bad nodes skipped
    async fn pick_guards(
        &self,
        state: &mut PathState,
        pool_nodes: &[ServiceNode],
        count: usize,
        exclude: &HashSet<NodeKey>,
    ) -> Result<Vec<ServiceNode>> {
        let known_bad: HashSet<NodeKey> = {
            let counters = self.counters.lock();
            counters
                .snode
                .iter()
                .filter(|(_, c)| **c > 0)
                .map(|(k, _)| *k)
                .collect()
        };
        let (fresh, reused): (Vec<ServiceNode>, Vec<ServiceNode>) = pool_nodes
            .iter()
            .filter(|n| !exclude.contains(n.key()) && !known_bad.contains(n.key()))
            .cloned()
            .partition(|n| !state.used_guards.contains(n.key()));
        let candidates: Vec<ServiceNode> = fresh.into_iter().chain(reused).collect();

        if candidates.len() < count {
            return Err(ClientError::PoolExhausted {
                needed: count,
                available: candidates.len(),
            });
        }

        let picked: Vec<ServiceNode> = match &self.probe {
            None => candidates.into_iter().take(count).collect(),
            Some(probe) => {
                let mut picked = Vec::with_capacity(count);
                let mut offset = 0;
                for round in 0..self.guard_probe_rounds {
                    if picked.len() >= count || offset >= candidates.len() {
                        break;
                    }
                    let end = (offset + count - picked.len()).min(candidates.len());
                    let batch = &candidates[offset..end];
                    offset = end;
                    let results = join_all(batch.iter().map(|n| probe.probe(n))).await;
                    for (node, ok) in batch.iter().zip(results) {
                        if ok {
                            picked.push(node.clone());
                        } else {
                            tracing::debug!(node = %node.key().short(), round, "Guard candidate unresponsive");
                        }
                    }
                }
                if picked.len() < count {
                    return Err(ClientError::PoolExhausted {
                        needed: count,
                        available: picked.len(),
                    });
                }
                picked
            }
        };

        for node in &picked {
            state.used_guards.insert(*node.key());
        }
        Ok(picked)
    }

    /// Top up the guard set to `path_count`, persisting it if it changed
    async fn ensure_guards_locked(&self, state: &mut PathState, pool_nodes: &[ServiceNode]) -> Result<()> {
        if state.guards.is_empty() {
            self.load_guards_locked(state, pool_nodes).await?;
        }
        let before = state.guards.len();
        state
            .guards
            .retain(|g| pool_nodes.iter().any(|n| n.key() == g.key()));
        state.guards.truncate(self.path_count);

        let missing = self.path_count - state.guards.len();
        if missing > 0 {
            let exclude: HashSet<NodeKey> = state.guards.iter().map(|g| *g.key()).collect();
            let picked = self.pick_guards(state, pool_nodes, missing, &exclude).await?;
            state.guards.extend(picked);
        }
        if missing > 0 || state.guards.len() != before {
            self.persist_guards(&state.guards).await?;
        }
        Ok(())
    }

    /// `[guard, hops - 1 relays]` avoiding `taken` and repeating no /24 subnet
    fn build_path_for_guard(
        &self,
        guard: &ServiceNode,
        pool_nodes: &[ServiceNode],
        taken: &HashSet<NodeKey>,
    ) -> Result<OnionPath> {
        let mut candidates: Vec<&ServiceNode> = pool_nodes
            .iter()
            .filter(|n| n.key() != guard.key() && !taken.contains(n.key()))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        let mut nodes = vec![guard.clone()];
        let mut subnets: HashSet<&str> = HashSet::from([guard.subnet24()]);
        for candidate in candidates {
            if nodes.len() >= self.hops {
                break;
            }
            if subnets.insert(candidate.subnet24()) {
                nodes.push(candidate.clone());
            }
        }

        if nodes.len() < self.hops {
            return Err(ClientError::PoolExhausted {
                needed: self.hops - 1,
                available: nodes.len() - 1,
            });
        }
        Ok(OnionPath::new(nodes))
    }

    fn publish(&self, state: &PathState) {
        self.snapshot.store(Arc::new(state.slots.clone()));
    }

    /// Build every slot. Concurrent callers share a single build.
    pub async fn build_paths(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.build_jobs
            .add_with_id(BUILD_JOB_ID, async move { this.build_paths_with_retry().await })
            .await?
    }

    async fn build_paths_with_retry(&self) -> Result<()> {
        retry_with_backoff(
            self.build_policy,
            |_| self.build_paths_once(),
            |e| !matches!(e, ClientError::PoolExhausted { .. }),
        )
        .await
        .map_err(|e| e.into_inner())
    }

    async fn build_paths_once(&self) -> Result<()> {
        self.pool.ensure_minimum_pool().await?;

        let mut state = self.state.lock().await;
        let pool_nodes = self.pool.nodes().await;
        self.ensure_guards_locked(&mut state, &pool_nodes).await?;

        let mut taken: HashSet<NodeKey> = state.guards.iter().map(|g| *g.key()).collect();
        let mut slots = Vec::with_capacity(state.guards.len());
        for guard in &state.guards {
            let path = self.build_path_for_guard(guard, &pool_nodes, &taken)?;
            taken.extend(path.nodes.iter().map(|n| *n.key()));
            slots.push(path);
        }
        state.slots = slots;
        self.publish(&state);
        self.reset_path_failure_count();

        self.stats.builds.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("onion_path_rebuilds_total").increment(1);
        tracing::info!(
            paths = state.slots.len(),
            hops = self.hops,
            pool = pool_nodes.len(),
            "Built onion paths"
        );
        Ok(())
    }

    /// A random built path not containing `exclude`, building paths first
    /// when fewer than the minimum are available.
    pub async fn get_onion_path(self: &Arc<Self>, exclude: Option<&NodeKey>) -> Result<OnionPath> {
        let mut builds = 0;
        while self.paths().len() < self.min_path_count {
            if builds >= MAX_PATH_BUILDS {
                return Err(ClientError::NoOnionPath);
            }
            builds += 1;
            self.build_paths().await?;
        }

        let paths = self.paths();
        let usable: Vec<&OnionPath> = paths
            .iter()
            .filter(|p| exclude.map_or(true, |k| !p.contains(k)))
            .collect();
        usable
            .choose(&mut rand::thread_rng())
            .map(|p| (*p).clone())
            .ok_or(ClientError::NoOnionPath)
    }

    /// Replace one hop in place; other hops and slots are untouched.
    /// Returns false if the node is in no path.
    pub async fn drop_snode_from_path(&self, key: &NodeKey) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some((slot, pos)) = state
            .slots
            .iter()
            .enumerate()
            .find_map(|(i, p)| p.position(key).map(|pos| (i, pos)))
        else {
            return Ok(false);
        };

        self.pool.ensure_minimum_pool().await?;
        let pool_nodes = self.pool.nodes().await;
        let members = state.member_keys();
        let path_subnets: HashSet<&str> = state.slots[slot]
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != pos)
            .map(|(_, n)| n.subnet24())
            .collect();

        let mut candidates: Vec<&ServiceNode> = pool_nodes
            .iter()
            .filter(|n| !members.contains(n.key()))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        let replacement = candidates
            .iter()
            .find(|n| !path_subnets.contains(n.subnet24()))
            .or_else(|| candidates.first())
            .map(|n| (*n).clone())
            .ok_or(ClientError::PoolExhausted {
                needed: 1,
                available: 0,
            })?;

        state.slots[slot].nodes[pos] = replacement.clone();
        if pos == 0 {
            if let Some(guard) = state.guards.get_mut(slot) {
                *guard = replacement.clone();
            }
            state.used_guards.insert(*replacement.key());
            self.persist_guards(&state.guards).await?;
        }
        self.publish(&state);

        self.stats.node_repairs.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            node = %key.short(),
            replacement = %replacement.key().short(),
            slot,
            position = pos,
            "Replaced snode in onion path"
        );
        Ok(true)
    }

    /// Count a failure against `key`; at the threshold the node leaves the
    /// swarm of `associated_with`, the pool and any path. Returns true if
    /// the node was evicted.
    pub async fn increment_bad_snode_count_or_drop(
        &self,
        key: &NodeKey,
        associated_with: Option<&PubKey>,
    ) -> Result<bool> {
        self.stats.snode_increments.fetch_add(1, Ordering::Relaxed);
        let reached = {
            let mut counters = self.counters.lock();
            let count = counters.snode.entry(*key).or_insert(0);
            *count += 1;
            tracing::debug!(node = %key.short(), count = *count, "Snode failure counted");
            if *count >= self.snode_failure_threshold {
                counters.snode.remove(key);
                true
            } else {
                false
            }
        };
        if !reached {
            return Ok(false);
        }

        tracing::warn!(node = %key.short(), "Snode failure threshold reached, dropping");
        if let Some(destination) = associated_with {
            self.pool.drop_snode_from_swarm_if_needed(destination, key).await?;
        }
        self.pool.drop_snode_from_pool(key).await?;
        self.drop_snode_from_path(key).await?;
        Ok(true)
    }

    /// Count a failure against the path starting at `guard`. Every relay of
    /// the path is counted as well. At the threshold the guard is evicted
    /// and its slot rebuilt. Returns true if the slot was rebuilt.
    ///
    /// The slot counter moves before any relay eviction is awaited, so a
    /// concurrent rebuild of the slot cannot receive this failure.
    pub async fn increment_bad_path_count_or_drop(&self, guard: &NodeKey) -> Result<bool> {
        let counted = {
            let mut counters = self.counters.lock();
            let paths = self.paths();
            paths
                .iter()
                .enumerate()
                .find(|(_, p)| p.guard().map(|g| g.key()) == Some(guard))
                .map(|(slot, path)| {
                    let relays: Vec<NodeKey> = path.relays().iter().map(|n| *n.key()).collect();
                    let count = counters.path.entry(slot).or_insert(0);
                    *count += 1;
                    tracing::debug!(slot, guard = %guard.short(), count = *count, "Path failure counted");
                    let reached = *count >= self.path_failure_threshold;
                    if reached {
                        counters.path.remove(&slot);
                    }
                    (slot, relays, reached)
                })
        };
        let Some((slot, relays, reached)) = counted else {
            tracing::debug!(node = %guard.short(), "Guard is in no path, counting it as a snode");
            return self.increment_bad_snode_count_or_drop(guard, None).await;
        };
        self.stats.path_increments.fetch_add(1, Ordering::Relaxed);

        for relay in &relays {
            self.increment_bad_snode_count_or_drop(relay, None).await?;
        }
        if !reached {
            return Ok(false);
        }

        self.drop_path_starting_with_guard(slot, guard).await?;
        Ok(true)
    }

    /// Evict `guard` and rebuild its slot with a fresh guard and relays
    async fn drop_path_starting_with_guard(&self, slot: usize, guard: &NodeKey) -> Result<()> {
        let mut state = self.state.lock().await;
        let still_there = state
            .slots
            .get(slot)
            .and_then(|p| p.guard())
            .is_some_and(|g| g.key() == guard);
        if !still_there {
            tracing::debug!(slot, guard = %guard.short(), "Slot already rebuilt");
            return Ok(());
        }

        tracing::warn!(slot, guard = %guard.short(), "Path failure threshold reached, replacing guard");
        self.pool.drop_snode_from_pool(guard).await?;
        self.pool.ensure_minimum_pool().await?;
        let pool_nodes = self.pool.nodes().await;

        let exclude = state.member_keys();
        let new_guard = self
            .pick_guards(&mut state, &pool_nodes, 1, &exclude)
            .await?
            .pop()
            .ok_or(ClientError::PoolExhausted {
                needed: 1,
                available: 0,
            })?;
        match state.guards.get_mut(slot) {
            Some(g) => *g = new_guard.clone(),
            None => state.guards.push(new_guard.clone()),
        }
        self.persist_guards(&state.guards).await?;

        let taken: HashSet<NodeKey> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != slot)
            .flat_map(|(_, p)| p.nodes.iter())
            .chain(state.guards.iter())
            .map(|n| *n.key())
            .collect();
        let path = self.build_path_for_guard(&new_guard, &pool_nodes, &taken)?;
        state.slots[slot] = path;
        self.publish(&state);
        // Failures counted against the evicted guard do not carry over
        self.counters.lock().path.remove(&slot);

        self.stats.slot_rebuilds.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("onion_path_rebuilds_total").increment(1);
        tracing::info!(slot, guard = %new_guard.key().short(), "Rebuilt onion path");
        Ok(())
    }
}
