//! onion-client: onion routing client for the service node network
//!
//! Keeps a pool of service nodes bootstrapped from seed nodes, builds and
//! repairs multi-hop onion paths from persisted guard nodes, and classifies
//! layered responses into retry / repair / abort decisions.

pub mod client;
pub mod encoding;
pub mod error;
pub mod interpreter;
pub mod job_queue;
pub mod onion_path;
pub mod open_group;
pub mod retry;
pub mod seed;
pub mod snode_pool;
pub mod storage;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{now_ms, ClientBuilder, OnionClient, StoreRequest};
pub use error::{AbortReason, ClientError, JobError};
pub use interpreter::{InterpretContext, OnionOutcome, OnionResponseInterpreter};
pub use job_queue::JobQueue;
pub use onion_path::{GuardProbe, HttpGuardProbe, OnionPathManager, PathStats};
pub use open_group::{OpenGroupClient, OpenGroupMessage, OpenGroupPostResult, OpenGroupRoom};
pub use retry::{retry_with_backoff, RetryError, RetryPolicy};
pub use seed::{SeedNodeClient, SeedNodeSource};
pub use snode_pool::{PoolStats, SnodePool};
pub use storage::{JsonFileStore, KeyValueStore, MemoryStore};
pub use transport::{
    DestinationContext, FinalDestination, HttpOnionTransport, OnionCrypto, OnionRequest,
    OnionTransport, ServerDestination,
};
