//! Open group (public room) posting over plain HTTPS

use std::time::Duration;

use onion_core::OnionConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ClientError, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpenGroupRoom {
    pub server_url: String,
    pub room: String,
}

impl OpenGroupRoom {
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            room: room.into(),
        }
    }
}

/// A signed message for a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenGroupMessage {
    pub identifier: String,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub signature: Vec<u8>,
    pub sent_timestamp: u64,
}

/// Server-assigned id and timestamp of a posted message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenGroupPostResult {
    pub server_id: i64,
    pub server_timestamp: u64,
}

/// Extract the server id and timestamp from a post response
pub fn parse_post_response(value: &Value) -> Result<OpenGroupPostResult> {
    if let Some(status) = value.get("status_code").and_then(Value::as_u64) {
        if status != 200 {
            return Err(ClientError::ServerApplication {
                status: u16::try_from(status).unwrap_or(u16::MAX),
                body: value.to_string(),
            });
        }
    }
    let message = value
        .get("message")
        .ok_or_else(|| ClientError::Transport("post response has no message".into()))?;
    let server_id = message
        .get("server_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| ClientError::Transport("post response has no server_id".into()))?;
    let server_timestamp = message
        .get("timestamp")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Ok(OpenGroupPostResult {
        server_id,
        server_timestamp,
    })
}

pub struct OpenGroupClient {
    http: Client,
    policy: RetryPolicy,
    auth_token: Option<String>,
}

impl OpenGroupClient {
    pub fn new(config: &OnionConfig) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            policy: RetryPolicy::new(config.open_group_attempts, config.open_group_min_timeout()),
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Post to a room, retrying transport failures and server errors
    pub async fn post_message(
        &self,
        room: &OpenGroupRoom,
        message: &OpenGroupMessage,
    ) -> Result<OpenGroupPostResult> {
        retry_with_backoff(
            self.policy,
            |attempt| async move {
                tracing::debug!(room = %room.room, attempt, "Posting open group message");
                self.post_once(room, message).await
            },
            |e| {
                e.is_retryable()
                    || matches!(e, ClientError::ServerApplication { status, .. } if *status >= 500)
            },
        )
        .await
        .map_err(|e| e.into_inner())
    }

    async fn post_once(&self, room: &OpenGroupRoom, message: &OpenGroupMessage) -> Result<OpenGroupPostResult> {
        let url = format!("{}/messages", room.server_url);
        let encoded = serde_json::to_value(message)?;
        let body = json!({
            "data": encoded["data"],
            "signature": encoded["signature"],
        });

        let mut req = self.http.post(&url).header("Room", &room.room).json(&body);
        if let Some(token) = &self.auth_token {
            req = req.header("Authorization", token);
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            return Err(ClientError::ServerApplication {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let value: Value = resp.json().await?;
        parse_post_response(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_post_response() {
        let ok = json!({"status_code": 200, "message": {"server_id": 42, "timestamp": 1700000000000u64}});
        assert_eq!(
            parse_post_response(&ok).unwrap(),
            OpenGroupPostResult {
                server_id: 42,
                server_timestamp: 1_700_000_000_000
            }
        );

        let rejected = json!({"status_code": 403});
        assert!(matches!(
            parse_post_response(&rejected),
            Err(ClientError::ServerApplication { status: 403, .. })
        ));

        assert!(parse_post_response(&json!({"status_code": 200})).is_err());
    }

    #[test]
    fn test_message_serializes_base64() {
        let msg = OpenGroupMessage {
            identifier: "m1".into(),
            data: b"hi".to_vec(),
            signature: vec![1, 2],
            sent_timestamp: 5,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["data"], "aGk=");
        assert_eq!(value["signature"], "AQI=");
    }

    #[test]
    fn test_room_trims_slash() {
        let room = OpenGroupRoom::new("https://open.example/", "lobby");
        assert_eq!(room.server_url, "https://open.example");
    }
}
