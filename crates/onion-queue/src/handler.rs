//! Callbacks for terminal send outcomes

use async_trait::async_trait;
use onion_client::OpenGroupPostResult;

use crate::error::QueueError;
use crate::message::RawMessage;

/// Told exactly once per message when its delivery finishes.
/// Intermediate retries are never reported.
#[async_trait]
pub trait MessageSentHandler: Send + Sync {
    async fn handle_message_sent_success(&self, message: &RawMessage, sent_at_ms: u64);

    async fn handle_message_sent_failure(&self, message: &RawMessage, error: &QueueError);

    async fn handle_public_message_sent_success(
        &self,
        identifier: &str,
        result: &OpenGroupPostResult,
    );

    async fn handle_public_message_sent_failure(&self, identifier: &str, error: &QueueError);
}
