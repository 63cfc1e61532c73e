//! Client error types

use std::sync::Arc;

use thiserror::Error;

/// Why a request was abandoned without retrying
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The caller cancelled the request
    Cancelled,
    /// 406 / 425: the client clock is out of sync with the network
    ClockSkew,
    /// A status the client has no recovery for
    Status(u16),
    /// The destination rejected the request; passed through verbatim
    ServerApplication { status: u16, body: String },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::ClockSkew => f.write_str("clock out of sync"),
            AbortReason::Status(code) => write!(f, "status {}", code),
            AbortReason::ServerApplication { status, body } => {
                write!(f, "destination returned {}: {}", status, body)
            }
        }
    }
}

/// A job registered in a [`crate::JobQueue`] did not run to completion
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job panicked")]
    Panicked,

    #[error("Job cancelled by runtime shutdown")]
    Cancelled,
}

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("Core error: {0}")]
    Core(Arc<onion_core::Error>),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("All seed nodes failed: {0}")]
    SeedNodesExhausted(String),

    #[error("Not enough service nodes: needed {needed}, available {available}")]
    PoolExhausted { needed: usize, available: usize },

    #[error("No onion path available")]
    NoOnionPath,

    #[error("Swarm is empty")]
    EmptySwarm,

    #[error("Request aborted: {0}")]
    Aborted(AbortReason),

    #[error("Clock out of sync with the network")]
    ClockSkew,

    #[error("Swarm changed, retry with a new target")]
    SwarmChanged,

    #[error("Bad path: status {status}")]
    BadPath { status: u16 },

    #[error("Destination returned {status}: {body}")]
    ServerApplication { status: u16, body: String },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

impl ClientError {
    /// Whether a fresh attempt (possibly over a repaired path) can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Http(_)
                | ClientError::Transport(_)
                | ClientError::SwarmChanged
                | ClientError::BadPath { .. }
                | ClientError::NoOnionPath
                | ClientError::EmptySwarm
        )
    }

    /// Whether a transport error means the guard never answered
    pub fn is_no_response(&self) -> bool {
        matches!(self, ClientError::Http(_) | ClientError::Transport(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Http(Arc::new(e))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Json(Arc::new(e))
    }
}

impl From<onion_core::Error> for ClientError {
    fn from(e: onion_core::Error) -> Self {
        ClientError::Core(Arc::new(e))
    }
}

impl From<AbortReason> for ClientError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::ClockSkew => ClientError::ClockSkew,
            AbortReason::ServerApplication { status, body } => {
                ClientError::ServerApplication { status, body }
            }
            other => ClientError::Aborted(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
