//! Single-attempt delivery of one raw message

use std::sync::Arc;

use async_trait::async_trait;
use onion_client::{now_ms, ClientError, OnionClient, StoreRequest};
use tokio_util::sync::CancellationToken;

use crate::message::RawMessage;

/// One delivery attempt. The queue owns retries.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, message: &RawMessage) -> Result<(), ClientError>;
}

/// Stores messages on the destination's swarm through onion paths
pub struct SwarmSender {
    client: Arc<OnionClient>,
    cancel: CancellationToken,
}

impl SwarmSender {
    pub fn new(client: Arc<OnionClient>) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
        }
    }

    /// Sends in flight resolve to `Aborted(Cancelled)` once this is cancelled
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[async_trait]
impl MessageTransport for SwarmSender {
    async fn send(&self, message: &RawMessage) -> Result<(), ClientError> {
        let request = StoreRequest {
            destination: message.destination.clone(),
            data: message.payload.clone(),
            ttl_ms: message.ttl_ms,
            namespace: message.namespace,
            timestamp_ms: now_ms(),
        };
        self.client.store_message(&request, &self.cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OutgoingMessage;
    use onion_client::testing::{make_nodes, pubkey, FakeSeedSource, ScriptedTransport};
    use onion_client::{AbortReason, MemoryStore};
    use onion_core::OnionConfig;

    #[tokio::test]
    async fn test_cancelled_sender_aborts() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = Arc::new(OnionClient::new(
            OnionConfig::default().without_delays(),
            Arc::new(MemoryStore::new()),
            Arc::new(FakeSeedSource::new(make_nodes(20))),
            transport.clone(),
        ));
        let dest = pubkey(1);
        client
            .pool()
            .update_swarm_for(&dest, make_nodes(40)[30..33].to_vec())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let sender = SwarmSender::new(client).with_cancellation(cancel);
        let raw = RawMessage::new(dest, &OutgoingMessage::new("m", vec![1], 1000), None);

        let err = sender.send(&raw).await.unwrap_err();
        assert!(matches!(err, ClientError::Aborted(AbortReason::Cancelled)));
        assert_eq!(transport.sent_count(), 0);
    }
}
