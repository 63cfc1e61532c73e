//! onion-queue: outbound message delivery over onion paths
//!
//! Messages are persisted per destination and drained by one job per
//! destination, so at most one send to a device is in flight at a time.

pub mod error;
pub mod group;
pub mod handler;
pub mod message;
pub mod pending;
pub mod queue;
pub mod sender;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{QueueError, Result};
pub use group::{GroupMembership, OpenGroupPoster};
pub use handler::MessageSentHandler;
pub use message::{OutboundMessage, OutgoingMessage, RawMessage};
pub use pending::{PendingMessageCache, PENDING_MESSAGES_KEY};
pub use queue::MessageQueue;
pub use sender::{MessageTransport, SwarmSender};
