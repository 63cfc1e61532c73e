//! onion-core: Core types for the onion request network client
//!
//! This crate defines the foundational types shared by the path builder,
//! the response interpreter and the outbound message queue:
//! - Service nodes and their keys
//! - Onion paths (guard first, exit last)
//! - Layered responses (path-level status, destination-level envelope)
//! - Client configuration
//!
//! # Threat Model
//!
//! Onion paths hide the client's IP from the destination snode and the
//! destination from the guard.
//!
//! | Information | Guard | Middle hop | Exit hop | Destination |
//! |-------------|-------|------------|----------|-------------|
//! | Client IP | **YES** | NO | NO | NO |
//! | Destination | NO | NO | **YES** | **YES** |
//! | Request body | NO | NO | NO | **YES** |
//!
//! Guards are kept stable across restarts so a client does not keep exposing
//! its IP to fresh nodes.

mod config;
mod error;
mod keys;
mod node;
mod path;
mod response;

pub use config::{OnionConfig, SeedUrl};
pub use error::Error;
pub use keys::{NodeKey, PubKey, NODE_KEY_LEN, PUBKEY_HEX_LEN};
pub use node::ServiceNode;
pub use path::OnionPath;
pub use response::{ResponseBody, SnodeResponse};

pub type Result<T> = std::result::Result<T, Error>;

/// Constants for the onion request network
pub mod constants {
    /// Below this many known snodes, path building refetches from a seed node
    pub const MIN_SNODE_POOL_COUNT: usize = 12;

    /// Number of guard nodes (and therefore onion paths) we maintain
    pub const DESIRED_GUARD_COUNT: usize = 3;

    /// Fewer built paths than this triggers a rebuild before sending
    pub const MINIMUM_PATH_COUNT: usize = 2;

    /// Number of hops in an onion path, guard included
    pub const ONION_REQUEST_HOPS: usize = 3;

    /// Failures tolerated before a path (or a snode) is replaced
    pub const FAILURE_THRESHOLD: u32 = 3;

    /// Prefix of the body a relay returns when it cannot reach the next hop
    pub const NEXT_NODE_NOT_FOUND_PREFIX: &str = "Next node not found: ";

    /// Status used when no response was received at all
    pub const STATUS_NO_STATUS: u16 = 8888;
}
