//! onion-net: onion-routed delivery to the service node network
//!
//! Re-exports the workspace crates under one name.

pub use onion_client as client;
pub use onion_core as core;
pub use onion_queue as queue;

pub use onion_client::{ClientError, OnionClient, OnionPathManager, SnodePool};
pub use onion_core::{NodeKey, OnionConfig, PubKey, ServiceNode};
pub use onion_queue::{MessageQueue, MessageSentHandler, QueueError};
