//! Per-destination outbound message queue
//!
//! Every destination has at most one drain job in flight. A drain sends the
//! destination's pending messages one by one, retrying each within a fixed
//! attempt budget, and reports each message exactly once to the handler.

use std::sync::Arc;

use futures::future::join_all;
use onion_client::{
    now_ms, retry_with_backoff, ClientError, JobQueue, KeyValueStore, OpenGroupMessage,
    OpenGroupPostResult, OpenGroupRoom, RetryError, RetryPolicy,
};
use onion_core::{OnionConfig, PubKey};

use crate::error::{QueueError, Result};
use crate::group::{GroupMembership, OpenGroupPoster};
use crate::handler::MessageSentHandler;
use crate::message::{OutboundMessage, OutgoingMessage, RawMessage};
use crate::pending::PendingMessageCache;
use crate::sender::MessageTransport;

pub struct MessageQueue {
    our_pubkey: PubKey,
    pending: PendingMessageCache,
    jobs: JobQueue<PubKey, Result<()>>,
    transport: Arc<dyn MessageTransport>,
    handler: Arc<dyn MessageSentHandler>,
    groups: Option<Arc<dyn GroupMembership>>,
    open_groups: Option<Arc<dyn OpenGroupPoster>>,
    policy: RetryPolicy,
}

impl MessageQueue {
    pub fn new(
        config: &OnionConfig,
        our_pubkey: PubKey,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn MessageTransport>,
        handler: Arc<dyn MessageSentHandler>,
    ) -> Self {
        Self {
            our_pubkey,
            pending: PendingMessageCache::new(store),
            jobs: JobQueue::new(),
            transport,
            handler,
            groups: None,
            open_groups: None,
            policy: RetryPolicy::new(
                config.message_send_attempts,
                config.message_retry_min_timeout(),
            ),
        }
    }

    pub fn with_group_membership(mut self, groups: Arc<dyn GroupMembership>) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_open_group_poster(mut self, poster: Arc<dyn OpenGroupPoster>) -> Self {
        self.open_groups = Some(poster);
        self
    }

    pub fn pending(&self) -> &PendingMessageCache {
        &self.pending
    }

    /// True while a drain is running for `destination`
    pub fn is_sending_to(&self, destination: &PubKey) -> bool {
        self.jobs.has(destination)
    }

    pub async fn send_to_pub_key(
        self: &Arc<Self>,
        destination: PubKey,
        message: &OutgoingMessage,
    ) -> Result<()> {
        self.process(RawMessage::new(destination, message, None))
            .await
    }

    /// Persist the message as pending, then drain its destination
    pub async fn process(self: &Arc<Self>, message: RawMessage) -> Result<()> {
        let destination = message.destination.clone();
        self.pending.add(message).await?;
        self.process_pending(&destination).await
    }

    /// Drain `destination`, joining the drain already running for it.
    /// Returns once nothing is pending for the destination.
    pub async fn process_pending(self: &Arc<Self>, destination: &PubKey) -> Result<()> {
        loop {
            let queue = Arc::clone(self);
            let id = destination.clone();
            let handle = self
                .jobs
                .add_with_id(destination.clone(), async move { queue.drain(&id).await });
            handle.await.map_err(ClientError::from)??;

            // A message added while the joined drain was finishing is picked up here
            if self.pending.next_for(destination).await?.is_none() {
                return Ok(());
            }
        }
    }

    /// Drain every destination with pending messages, e.g. after a restart
    pub async fn process_all_pending(self: &Arc<Self>) -> Result<()> {
        let destinations = self.pending.destinations().await?;
        if destinations.is_empty() {
            return Ok(());
        }
        tracing::info!(destinations = destinations.len(), "Resuming pending messages");

        join_all(destinations.iter().map(|d| self.process_pending(d)))
            .await
            .into_iter()
            .collect()
    }

    /// Send without touching the pending cache; the outcome is returned
    /// and the handler is not called.
    pub async fn send_to_pub_key_non_durably(&self, message: &RawMessage) -> Result<()> {
        self.send_with_retry(message).await
    }

    pub async fn send_to_group(self: &Arc<Self>, message: OutboundMessage) -> Result<()> {
        match message {
            OutboundMessage::ClosedGroup { group, message } => {
                self.send_to_closed_group(&group, &message).await
            }
            OutboundMessage::OpenGroup { room, message } => {
                self.send_to_open_group_v2(&message, &room).await.map(|_| ())
            }
            OutboundMessage::Direct { .. } => Err(QueueError::NotAGroupMessage),
        }
    }

    async fn send_to_closed_group(
        self: &Arc<Self>,
        group: &PubKey,
        message: &OutgoingMessage,
    ) -> Result<()> {
        let groups = self
            .groups
            .as_ref()
            .ok_or_else(|| QueueError::Membership("no group membership resolver".into()))?;
        let recipients: Vec<PubKey> = groups
            .members(group)
            .await?
            .into_iter()
            .filter(|m| m != &self.our_pubkey)
            .collect();
        if recipients.is_empty() {
            tracing::debug!(group = %group.short(), "Closed group has no other members");
            return Ok(());
        }

        tracing::debug!(group = %group.short(), recipients = recipients.len(), "Fanning out group message");
        join_all(
            recipients
                .into_iter()
                .map(|member| self.process(RawMessage::new(member, message, Some(group.clone())))),
        )
        .await
        .into_iter()
        .collect()
    }

    pub async fn send_to_open_group_v2(
        &self,
        message: &OpenGroupMessage,
        room: &OpenGroupRoom,
    ) -> Result<OpenGroupPostResult> {
        let posted = match &self.open_groups {
            Some(poster) => poster.post(room, message).await,
            None => Err(ClientError::Transport("no open group poster".into())),
        };

        match posted {
            Ok(result) => {
                metrics::counter!("message_queue_sent_total", "mode" => "open_group").increment(1);
                self.handler
                    .handle_public_message_sent_success(&message.identifier, &result)
                    .await;
                Ok(result)
            }
            Err(e) => {
                let err = QueueError::OpenGroup(e);
                metrics::counter!("message_queue_failed_total", "mode" => "open_group").increment(1);
                self.handler
                    .handle_public_message_sent_failure(&message.identifier, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn drain(&self, destination: &PubKey) -> Result<()> {
        while let Some(message) = self.pending.next_for(destination).await? {
            let outcome = self.send_with_retry(&message).await;
            self.pending.remove(&message).await?;

            match outcome {
                Ok(()) => {
                    metrics::counter!("message_queue_sent_total", "mode" => "swarm").increment(1);
                    self.handler
                        .handle_message_sent_success(&message, now_ms())
                        .await;
                }
                Err(e) => {
                    tracing::warn!(
                        id = %message.identifier,
                        destination = %destination.short(),
                        error = %e,
                        "Giving up on message"
                    );
                    metrics::counter!("message_queue_failed_total", "mode" => "swarm").increment(1);
                    self.handler.handle_message_sent_failure(&message, &e).await;
                }
            }
        }
        Ok(())
    }

    async fn send_with_retry(&self, message: &RawMessage) -> Result<()> {
        retry_with_backoff(
            self.policy,
            |attempt| async move {
                tracing::debug!(id = %message.identifier, attempt, "Sending message");
                self.transport.send(message).await
            },
            ClientError::is_retryable,
        )
        .await
        .map_err(|e| match e {
            RetryError::Permanent(e) => QueueError::from_terminal(e),
            RetryError::Exhausted { attempts, last } => {
                QueueError::AttemptsExhausted { attempts, last }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingHandler, ScriptedPoster, ScriptedSender, StaticGroups};
    use onion_client::testing::{pubkey, CountingStore};
    use onion_client::AbortReason;
    use std::time::Duration;

    struct Fixture {
        queue: Arc<MessageQueue>,
        sender: Arc<ScriptedSender>,
        handler: Arc<RecordingHandler>,
        store: Arc<CountingStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(CountingStore::new());
        let sender = Arc::new(ScriptedSender::new());
        let handler = Arc::new(RecordingHandler::new());
        let queue = MessageQueue::new(
            &OnionConfig::default().without_delays(),
            pubkey(0),
            store.clone(),
            sender.clone(),
            handler.clone(),
        );
        Fixture {
            queue: Arc::new(queue),
            sender,
            handler,
            store,
        }
    }

    fn msg(id: &str) -> OutgoingMessage {
        OutgoingMessage::new(id, id.as_bytes().to_vec(), 86_400_000)
    }

    #[tokio::test]
    async fn test_send_success_calls_handler_once() {
        let f = fixture();
        f.queue.send_to_pub_key(pubkey(1), &msg("m1")).await.unwrap();

        let successes = f.handler.successes();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].identifier, "m1");
        assert!(f.handler.failures().is_empty());
        assert_eq!(f.queue.pending().len().await.unwrap(), 0);
        assert!(!f.queue.is_sending_to(&pubkey(1)));
    }

    #[tokio::test]
    async fn test_retryable_errors_are_invisible() {
        let f = fixture();
        f.sender.push(Err(ClientError::BadPath { status: 502 }));
        f.sender.push(Err(ClientError::SwarmChanged));

        f.queue.send_to_pub_key(pubkey(1), &msg("m1")).await.unwrap();
        assert_eq!(f.sender.sent_count(), 3);
        assert_eq!(f.handler.successes().len(), 1);
        assert!(f.handler.failures().is_empty());
    }

    #[tokio::test]
    async fn test_attempts_exhausted_reports_failure() {
        let f = fixture();
        for _ in 0..3 {
            f.sender.push(Err(ClientError::Transport("reset".into())));
        }

        f.queue.send_to_pub_key(pubkey(1), &msg("m1")).await.unwrap();
        assert_eq!(f.sender.sent_count(), 3);
        let failures = f.handler.failures();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0].1,
            QueueError::AttemptsExhausted { attempts: 3, .. }
        ));
        assert_eq!(f.queue.pending().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abort_and_pool_exhausted_are_terminal() {
        let f = fixture();
        f.sender
            .push(Err(ClientError::Aborted(AbortReason::Cancelled)));
        f.sender.push(Err(ClientError::PoolExhausted {
            needed: 3,
            available: 1,
        }));

        f.queue.send_to_pub_key(pubkey(1), &msg("a")).await.unwrap();
        f.queue.send_to_pub_key(pubkey(1), &msg("b")).await.unwrap();

        assert_eq!(f.sender.sent_count(), 2);
        let failures = f.handler.failures();
        assert!(matches!(
            failures[0].1,
            QueueError::Aborted(AbortReason::Cancelled)
        ));
        assert!(matches!(
            failures[1].1,
            QueueError::Client(ClientError::PoolExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_application_error_not_retried() {
        let f = fixture();
        f.sender.push(Err(ClientError::ServerApplication {
            status: 401,
            body: "unauthorized".into(),
        }));

        f.queue.send_to_pub_key(pubkey(1), &msg("m1")).await.unwrap();
        assert_eq!(f.sender.sent_count(), 1);
        assert_eq!(f.handler.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_messages_survive_restart() {
        let f = fixture();
        f.queue
            .pending()
            .add(RawMessage::new(pubkey(1), &msg("a"), None))
            .await
            .unwrap();
        f.queue
            .pending()
            .add(RawMessage::new(pubkey(2), &msg("b"), None))
            .await
            .unwrap();

        let restarted = Arc::new(MessageQueue::new(
            &OnionConfig::default().without_delays(),
            pubkey(0),
            f.store.clone(),
            f.sender.clone(),
            f.handler.clone(),
        ));
        restarted.process_all_pending().await.unwrap();

        let mut ids: Vec<String> = f
            .handler
            .successes()
            .into_iter()
            .map(|m| m.identifier)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(restarted.pending().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_one_send_in_flight_per_destination() {
        struct SlowSender {
            in_flight: parking_lot::Mutex<u32>,
            max_seen: parking_lot::Mutex<u32>,
        }

        #[async_trait::async_trait]
        impl MessageTransport for SlowSender {
            async fn send(&self, _message: &RawMessage) -> std::result::Result<(), ClientError> {
                {
                    let mut n = self.in_flight.lock();
                    *n += 1;
                    let mut max = self.max_seen.lock();
                    *max = (*max).max(*n);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                *self.in_flight.lock() -= 1;
                Ok(())
            }
        }

        let sender = Arc::new(SlowSender {
            in_flight: parking_lot::Mutex::new(0),
            max_seen: parking_lot::Mutex::new(0),
        });
        let handler = Arc::new(RecordingHandler::new());
        let queue = Arc::new(MessageQueue::new(
            &OnionConfig::default().without_delays(),
            pubkey(0),
            Arc::new(CountingStore::new()),
            sender.clone(),
            handler.clone(),
        ));

        let sends = (0..5).map(|i| {
            let queue = queue.clone();
            async move {
                queue
                    .send_to_pub_key(pubkey(1), &msg(&format!("m{i}")))
                    .await
            }
        });
        for res in join_all(sends).await {
            res.unwrap();
        }

        assert_eq!(*sender.max_seen.lock(), 1);
        assert_eq!(handler.successes().len(), 5);
    }

    #[tokio::test]
    async fn test_closed_group_fans_out_and_skips_self() {
        let f = fixture();
        let group = pubkey(9);
        let groups = StaticGroups::new().with_group(group.clone(), vec![pubkey(0), pubkey(1), pubkey(2)]);
        let queue = Arc::new(
            MessageQueue::new(
                &OnionConfig::default().without_delays(),
                pubkey(0),
                f.store.clone(),
                f.sender.clone(),
                f.handler.clone(),
            )
            .with_group_membership(Arc::new(groups)),
        );

        queue
            .send_to_group(OutboundMessage::ClosedGroup {
                group: group.clone(),
                message: msg("g1"),
            })
            .await
            .unwrap();

        let mut destinations: Vec<PubKey> = f.sender.sent().into_iter().map(|m| m.destination).collect();
        destinations.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(destinations, vec![pubkey(1), pubkey(2)]);
        assert!(f
            .handler
            .successes()
            .iter()
            .all(|m| m.group.as_ref() == Some(&group)));
    }

    #[tokio::test]
    async fn test_closed_group_of_only_self_sends_nothing() {
        let f = fixture();
        let groups = StaticGroups::new().with_group(pubkey(9), vec![pubkey(0)]);
        let queue = Arc::new(
            MessageQueue::new(
                &OnionConfig::default().without_delays(),
                pubkey(0),
                f.store.clone(),
                f.sender.clone(),
                f.handler.clone(),
            )
            .with_group_membership(Arc::new(groups)),
        );

        queue
            .send_to_group(OutboundMessage::ClosedGroup {
                group: pubkey(9),
                message: msg("g1"),
            })
            .await
            .unwrap();
        assert_eq!(f.sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_direct_message_rejected_by_send_to_group() {
        let f = fixture();
        let err = f
            .queue
            .send_to_group(OutboundMessage::Direct {
                destination: pubkey(1),
                message: msg("d"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotAGroupMessage));
        assert_eq!(err.to_string(), "Invalid group message passed in send_to_group");
        assert_eq!(f.sender.sent_count(), 0);
        assert_eq!(f.store.writes(crate::pending::PENDING_MESSAGES_KEY), 0);
    }

    #[tokio::test]
    async fn test_open_group_outcomes_reach_handler() {
        let f = fixture();
        let poster = Arc::new(ScriptedPoster::new());
        poster.push(Ok(OpenGroupPostResult {
            server_id: 77,
            server_timestamp: 5,
        }));
        poster.push(Err(ClientError::ServerApplication {
            status: 403,
            body: "banned".into(),
        }));
        let queue = Arc::new(
            MessageQueue::new(
                &OnionConfig::default().without_delays(),
                pubkey(0),
                f.store.clone(),
                f.sender.clone(),
                f.handler.clone(),
            )
            .with_open_group_poster(poster.clone()),
        );
        let room = OpenGroupRoom::new("https://open.example", "lobby");
        let message = |id: &str| OpenGroupMessage {
            identifier: id.into(),
            data: b"hello".to_vec(),
            signature: vec![0; 64],
            sent_timestamp: 1,
        };

        queue
            .send_to_group(OutboundMessage::OpenGroup {
                room: room.clone(),
                message: message("o1"),
            })
            .await
            .unwrap();
        let err = queue
            .send_to_open_group_v2(&message("o2"), &room)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::OpenGroup(_)));
        assert_eq!(f.handler.public_successes()[0].0, "o1");
        assert_eq!(f.handler.public_successes()[0].1.server_id, 77);
        assert_eq!(f.handler.public_failures()[0].0, "o2");
        assert_eq!(poster.posts(), 2);
    }

    #[tokio::test]
    async fn test_open_group_without_poster_reports_failure() {
        let f = fixture();
        let room = OpenGroupRoom::new("https://open.example", "lobby");
        let message = OpenGroupMessage {
            identifier: "o3".into(),
            data: b"hello".to_vec(),
            signature: vec![0; 64],
            sent_timestamp: 1,
        };

        let err = f
            .queue
            .send_to_open_group_v2(&message, &room)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::OpenGroup(ClientError::Transport(_))));
        let failures = f.handler.public_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "o3");
        assert!(f.handler.public_successes().is_empty());
    }

    #[tokio::test]
    async fn test_non_durable_send_skips_cache() {
        let f = fixture();
        f.sender.push(Err(ClientError::NoOnionPath));
        let raw = RawMessage::new(pubkey(1), &msg("n"), None);

        f.queue.send_to_pub_key_non_durably(&raw).await.unwrap();
        assert_eq!(f.sender.sent_count(), 2);
        assert_eq!(f.store.writes(crate::pending::PENDING_MESSAGES_KEY), 0);
        assert!(f.handler.successes().is_empty());
    }
}
