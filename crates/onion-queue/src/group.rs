//! Group collaborators

use async_trait::async_trait;
use onion_client::{ClientError, OpenGroupClient, OpenGroupMessage, OpenGroupPostResult, OpenGroupRoom};
use onion_core::PubKey;

use crate::error::Result;

/// Resolves the members of a closed group
#[async_trait]
pub trait GroupMembership: Send + Sync {
    async fn members(&self, group: &PubKey) -> Result<Vec<PubKey>>;
}

/// Posts a message to an open group room
#[async_trait]
pub trait OpenGroupPoster: Send + Sync {
    async fn post(
        &self,
        room: &OpenGroupRoom,
        message: &OpenGroupMessage,
    ) -> std::result::Result<OpenGroupPostResult, ClientError>;
}

#[async_trait]
impl OpenGroupPoster for OpenGroupClient {
    async fn post(
        &self,
        room: &OpenGroupRoom,
        message: &OpenGroupMessage,
    ) -> std::result::Result<OpenGroupPostResult, ClientError> {
        self.post_message(room, message).await
    }
}
