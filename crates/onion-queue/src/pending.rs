//! Persisted per-destination pending messages

use std::sync::Arc;

use onion_client::storage::{load_json, save_json};
use onion_client::{ClientError, KeyValueStore};
use onion_core::PubKey;
use tokio::sync::Mutex;

use crate::message::RawMessage;

pub const PENDING_MESSAGES_KEY: &str = "pending_messages";

/// Messages waiting to be sent, loaded from storage on first use
pub struct PendingMessageCache {
    store: Arc<dyn KeyValueStore>,
    cache: Mutex<Option<Vec<RawMessage>>>,
}

impl PendingMessageCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(None),
        }
    }

    async fn with_cache<T>(
        &self,
        mutate: bool,
        f: impl FnOnce(&mut Vec<RawMessage>) -> T,
    ) -> Result<T, ClientError> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            let stored: Vec<RawMessage> = load_json(self.store.as_ref(), PENDING_MESSAGES_KEY)
                .await?
                .unwrap_or_default();
            *guard = Some(stored);
        }
        let messages = guard.get_or_insert_with(Vec::new);
        let out = f(messages);
        if mutate {
            save_json(self.store.as_ref(), PENDING_MESSAGES_KEY, messages.as_slice()).await?;
        }
        Ok(out)
    }

    /// Add a message unless the same one is already pending
    pub async fn add(&self, message: RawMessage) -> Result<(), ClientError> {
        self.with_cache(true, |messages| {
            if !messages.iter().any(|m| m.same_as(&message)) {
                messages.push(message);
            }
        })
        .await
    }

    pub async fn remove(&self, message: &RawMessage) -> Result<(), ClientError> {
        self.with_cache(true, |messages| messages.retain(|m| !m.same_as(message)))
            .await
    }

    pub async fn for_destination(&self, destination: &PubKey) -> Result<Vec<RawMessage>, ClientError> {
        self.with_cache(false, |messages| {
            messages
                .iter()
                .filter(|m| &m.destination == destination)
                .cloned()
                .collect()
        })
        .await
    }

    /// Oldest pending message for `destination`
    pub async fn next_for(&self, destination: &PubKey) -> Result<Option<RawMessage>, ClientError> {
        self.with_cache(false, |messages| {
            messages.iter().find(|m| &m.destination == destination).cloned()
        })
        .await
    }

    /// Destinations with pending messages, in first-queued order
    pub async fn destinations(&self) -> Result<Vec<PubKey>, ClientError> {
        self.with_cache(false, |messages| {
            let mut out: Vec<PubKey> = Vec::new();
            for m in messages.iter() {
                if !out.contains(&m.destination) {
                    out.push(m.destination.clone());
                }
            }
            out
        })
        .await
    }

    pub async fn len(&self) -> Result<usize, ClientError> {
        self.with_cache(false, |messages| messages.len()).await
    }
}
