//! Queue error types

use onion_client::{AbortReason, ClientError};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Invalid group message passed in send_to_group")]
    NotAGroupMessage,

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Send failed after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: ClientError },

    #[error("Send aborted: {0}")]
    Aborted(AbortReason),

    #[error("Open group post failed: {0}")]
    OpenGroup(ClientError),

    #[error("Group membership unavailable: {0}")]
    Membership(String),
}

impl QueueError {
    /// Map a terminal client error onto the queue taxonomy
    pub fn from_terminal(e: ClientError) -> Self {
        match e {
            ClientError::Aborted(reason) => QueueError::Aborted(reason),
            other => QueueError::Client(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
