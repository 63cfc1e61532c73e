//! Test doubles for the queue's collaborators

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use onion_client::{ClientError, OpenGroupMessage, OpenGroupPostResult, OpenGroupRoom};
use onion_core::PubKey;
use parking_lot::Mutex;

use crate::error::{QueueError, Result};
use crate::group::{GroupMembership, OpenGroupPoster};
use crate::handler::MessageSentHandler;
use crate::message::RawMessage;
use crate::sender::MessageTransport;

/// Records every terminal outcome
#[derive(Default)]
pub struct RecordingHandler {
    successes: Mutex<Vec<RawMessage>>,
    failures: Mutex<Vec<(RawMessage, QueueError)>>,
    public_successes: Mutex<Vec<(String, OpenGroupPostResult)>>,
    public_failures: Mutex<Vec<(String, QueueError)>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn successes(&self) -> Vec<RawMessage> {
        self.successes.lock().clone()
    }

    pub fn failures(&self) -> Vec<(RawMessage, QueueError)> {
        self.failures.lock().clone()
    }

    pub fn public_successes(&self) -> Vec<(String, OpenGroupPostResult)> {
        self.public_successes.lock().clone()
    }

    pub fn public_failures(&self) -> Vec<(String, QueueError)> {
        self.public_failures.lock().clone()
    }
}

#[async_trait]
impl MessageSentHandler for RecordingHandler {
    async fn handle_message_sent_success(&self, message: &RawMessage, _sent_at_ms: u64) {
        self.successes.lock().push(message.clone());
    }

    async fn handle_message_sent_failure(&self, message: &RawMessage, error: &QueueError) {
        self.failures.lock().push((message.clone(), error.clone()));
    }

    async fn handle_public_message_sent_success(
        &self,
        identifier: &str,
        result: &OpenGroupPostResult,
    ) {
        self.public_successes
            .lock()
            .push((identifier.to_string(), *result));
    }

    async fn handle_public_message_sent_failure(&self, identifier: &str, error: &QueueError) {
        self.public_failures
            .lock()
            .push((identifier.to_string(), error.clone()));
    }
}

/// Answers sends from a script, succeeding once it runs dry
#[derive(Default)]
pub struct ScriptedSender {
    replies: Mutex<VecDeque<std::result::Result<(), ClientError>>>,
    sent: Mutex<Vec<RawMessage>>,
}

impl ScriptedSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: std::result::Result<(), ClientError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn sent(&self) -> Vec<RawMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl MessageTransport for ScriptedSender {
    async fn send(&self, message: &RawMessage) -> std::result::Result<(), ClientError> {
        self.sent.lock().push(message.clone());
        let next = self.replies.lock().pop_front();
        next.unwrap_or(Ok(()))
    }
}

/// Fixed group membership
#[derive(Default)]
pub struct StaticGroups {
    groups: HashMap<PubKey, Vec<PubKey>>,
}

impl StaticGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: PubKey, members: Vec<PubKey>) -> Self {
        self.groups.insert(group, members);
        self
    }
}

#[async_trait]
impl GroupMembership for StaticGroups {
    async fn members(&self, group: &PubKey) -> Result<Vec<PubKey>> {
        self.groups
            .get(group)
            .cloned()
            .ok_or_else(|| QueueError::Membership(format!("unknown group {}", group.short())))
    }
}

/// Open group poster answering from a script and counting posts
#[derive(Default)]
pub struct ScriptedPoster {
    replies: Mutex<VecDeque<std::result::Result<OpenGroupPostResult, ClientError>>>,
    posts: AtomicUsize,
}

impl ScriptedPoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: std::result::Result<OpenGroupPostResult, ClientError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn posts(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OpenGroupPoster for ScriptedPoster {
    async fn post(
        &self,
        _room: &OpenGroupRoom,
        _message: &OpenGroupMessage,
    ) -> std::result::Result<OpenGroupPostResult, ClientError> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().pop_front();
        next.unwrap_or(Ok(OpenGroupPostResult {
            server_id: 1,
            server_timestamp: 0,
        }))
    }
}
