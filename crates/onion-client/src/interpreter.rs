//! Classification of onion responses
//!
//! A response has two layers. The guard's HTTP status describes the path;
//! on 200 the decrypted body is an envelope `{status | status_code, body}`
//! from the destination. Each failure class carries a fixed set of side
//! effects on the pool and the paths, applied here and nowhere else.

use std::sync::Arc;

use onion_core::constants::STATUS_NO_STATUS;
use onion_core::{NodeKey, PubKey, ResponseBody, ServiceNode, SnodeResponse};
use serde_json::Value;

use crate::error::{AbortReason, ClientError, Result};
use crate::onion_path::OnionPathManager;
use crate::snode_pool::SnodePool;

#[derive(Debug, Clone, PartialEq)]
pub enum OnionOutcome {
    Success(ResponseBody),
    Aborted(AbortReason),
    /// The target left the destination's swarm; pick another target
    RetryWithNewTarget,
    /// The path misbehaved; it has been charged or repaired
    RetryableBadPath { status: u16 },
}

impl OnionOutcome {
    pub fn into_result(self) -> Result<ResponseBody> {
        match self {
            OnionOutcome::Success(body) => Ok(body),
            OnionOutcome::Aborted(reason) => Err(reason.into()),
            OnionOutcome::RetryWithNewTarget => Err(ClientError::SwarmChanged),
            OnionOutcome::RetryableBadPath { status } => Err(ClientError::BadPath { status }),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            OnionOutcome::Success(_) => "success",
            OnionOutcome::Aborted(AbortReason::Cancelled) => "cancelled",
            OnionOutcome::Aborted(AbortReason::ClockSkew) => "clock_skew",
            OnionOutcome::Aborted(_) => "aborted",
            OnionOutcome::RetryWithNewTarget => "swarm_changed",
            OnionOutcome::RetryableBadPath { .. } => "bad_path",
        }
    }
}

/// Who the request went through and to
#[derive(Debug, Clone, Copy)]
pub struct InterpretContext<'a> {
    pub guard: &'a NodeKey,
    pub target: Option<&'a NodeKey>,
    pub associated_with: Option<&'a PubKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    Path,
    Destination,
}

/// Nodes listed under `snodes` in a swarm response; invalid entries are skipped
pub fn parse_swarm_snodes(value: &Value) -> Vec<ServiceNode> {
    value
        .get("snodes")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| serde_json::from_value::<ServiceNode>(e.clone()).ok())
                .filter(|n| !n.is_unroutable())
                .collect()
        })
        .unwrap_or_default()
}

pub struct OnionResponseInterpreter {
    pool: Arc<SnodePool>,
    paths: Arc<OnionPathManager>,
}

impl OnionResponseInterpreter {
    pub fn new(pool: Arc<SnodePool>, paths: Arc<OnionPathManager>) -> Self {
        Self { pool, paths }
    }

    /// Classify a transport outcome and apply its side effects.
    /// `response` is `None` when the guard never answered.
    pub async fn interpret(
        &self,
        cancelled: bool,
        response: Option<&SnodeResponse>,
        ctx: &InterpretContext<'_>,
    ) -> Result<OnionOutcome> {
        let outcome = self.classify(cancelled, response, ctx).await?;
        metrics::counter!("onion_requests_total", "outcome" => outcome.label()).increment(1);
        Ok(outcome)
    }

    async fn classify(
        &self,
        cancelled: bool,
        response: Option<&SnodeResponse>,
        ctx: &InterpretContext<'_>,
    ) -> Result<OnionOutcome> {
        if cancelled {
            tracing::debug!("Onion request cancelled");
            return Ok(OnionOutcome::Aborted(AbortReason::Cancelled));
        }

        let Some(response) = response else {
            tracing::warn!(guard = %ctx.guard.short(), "No response through onion path");
            self.paths.increment_bad_path_count_or_drop(ctx.guard).await?;
            return Ok(OnionOutcome::RetryableBadPath {
                status: STATUS_NO_STATUS,
            });
        };

        if response.is_ok() {
            return self.destination_layer(&response.body, ctx).await;
        }
        self.failure(response.status, &response.body, ctx, Layer::Path)
            .await
    }

    async fn destination_layer(&self, body: &str, ctx: &InterpretContext<'_>) -> Result<OnionOutcome> {
        let Ok(envelope) = serde_json::from_str::<Value>(body) else {
            return Ok(OnionOutcome::Success(ResponseBody::decode(body)));
        };

        let status = envelope
            .get("status_code")
            .or_else(|| envelope.get("status"))
            .and_then(Value::as_u64);
        let Some(status) = status else {
            // Legacy destinations answer without a status
            return Ok(OnionOutcome::Success(ResponseBody::Json(envelope)));
        };
        let status = u16::try_from(status).unwrap_or(STATUS_NO_STATUS);

        let inner = ResponseBody::from_value(envelope.get("body").cloned().unwrap_or(Value::Null));
        if (200..300).contains(&status) {
            return Ok(OnionOutcome::Success(inner));
        }
        self.failure(status, &inner.to_text(), ctx, Layer::Destination)
            .await
    }

    async fn failure(
        &self,
        status: u16,
        body: &str,
        ctx: &InterpretContext<'_>,
        layer: Layer,
    ) -> Result<OnionOutcome> {
        match status {
            406 | 425 => {
                tracing::warn!(status, ?layer, "Clock out of sync with the network");
                Ok(OnionOutcome::Aborted(AbortReason::ClockSkew))
            }
            421 => self.swarm_changed(body, ctx).await,
            500 | 502 => {
                let marker = SnodeResponse::new(status, body).next_node_not_found();
                if let Some(node) = marker {
                    tracing::warn!(node = %node.short(), status, "Relay could not reach next node");
                    self.paths
                        .increment_bad_snode_count_or_drop(&node, ctx.associated_with)
                        .await?;
                    self.paths.drop_snode_from_path(&node).await?;
                } else if let (Layer::Destination, Some(target)) = (layer, ctx.target) {
                    tracing::warn!(node = %target.short(), status, "Destination snode failed");
                    self.paths
                        .increment_bad_snode_count_or_drop(target, ctx.associated_with)
                        .await?;
                } else {
                    tracing::warn!(guard = %ctx.guard.short(), status, "Onion path failed");
                    self.paths.increment_bad_path_count_or_drop(ctx.guard).await?;
                }
                Ok(OnionOutcome::RetryableBadPath { status })
            }
            _ if layer == Layer::Path => {
                tracing::warn!(status, "Unexpected onion path status");
                Ok(OnionOutcome::Aborted(AbortReason::Status(status)))
            }
            _ => Ok(OnionOutcome::Aborted(AbortReason::ServerApplication {
                status,
                body: body.to_string(),
            })),
        }
    }

    /// 421: the target is no longer in the destination's swarm
    async fn swarm_changed(&self, body: &str, ctx: &InterpretContext<'_>) -> Result<OnionOutcome> {
        let Some(destination) = ctx.associated_with else {
            tracing::warn!("421 without a destination to update");
            return Ok(OnionOutcome::Aborted(AbortReason::Status(421)));
        };

        let snodes = serde_json::from_str::<Value>(body)
            .map(|v| parse_swarm_snodes(&v))
            .unwrap_or_default();
        if !snodes.is_empty() {
            tracing::info!(
                destination = %destination.short(),
                count = snodes.len(),
                "Swarm changed, updating"
            );
            self.pool.update_swarm_for(destination, snodes).await?;
            return Ok(OnionOutcome::RetryWithNewTarget);
        }

        let Some(target) = ctx.target else {
            tracing::warn!("421 without a target to drop");
            return Ok(OnionOutcome::Aborted(AbortReason::Status(421)));
        };
        tracing::info!(
            node = %target.short(),
            destination = %destination.short(),
            "Snode left swarm"
        );
        self.pool.drop_snode_from_swarm_if_needed(destination, target).await?;
        self.paths
            .increment_bad_snode_count_or_drop(target, Some(destination))
            .await?;
        Ok(OnionOutcome::RetryWithNewTarget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::{make_nodes, FakeSeedSource};
    use onion_core::OnionConfig;
    use serde_json::json;

    struct Fixture {
        pool: Arc<SnodePool>,
        paths: Arc<OnionPathManager>,
        interpreter: OnionResponseInterpreter,
    }

    async fn fixture() -> Fixture {
        let config = OnionConfig::default().without_delays();
        let store = Arc::new(MemoryStore::new());
        let pool = Arc::new(SnodePool::new(
            &config,
            Arc::new(FakeSeedSource::new(make_nodes(20))),
            store.clone(),
        ));
        let paths = Arc::new(OnionPathManager::new(&config, pool.clone(), store));
        paths.build_paths().await.unwrap();
        let interpreter = OnionResponseInterpreter::new(pool.clone(), paths.clone());
        Fixture {
            pool,
            paths,
            interpreter,
        }
    }

    fn envelope(status: u16, body: Value) -> SnodeResponse {
        SnodeResponse::new(200, json!({"status": status, "body": body}).to_string())
    }

    #[tokio::test]
    async fn test_success_envelope() {
        let f = fixture().await;
        let guard = *f.paths.paths()[0].nodes[0].key();
        let ctx = InterpretContext { guard: &guard, target: None, associated_with: None };

        let out = f
            .interpreter
            .interpret(false, Some(&envelope(200, json!("{\"messages\":[]}"))), &ctx)
            .await
            .unwrap();
        match out {
            OnionOutcome::Success(ResponseBody::Json(v)) => assert!(v.get("messages").is_some()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_legacy_and_text_bodies_succeed() {
        let f = fixture().await;
        let guard = *f.paths.paths()[0].nodes[0].key();
        let ctx = InterpretContext { guard: &guard, target: None, associated_with: None };

        let legacy = SnodeResponse::new(200, r#"{"snodes":[]}"#);
        assert!(matches!(
            f.interpreter.interpret(false, Some(&legacy), &ctx).await.unwrap(),
            OnionOutcome::Success(ResponseBody::Json(_))
        ));

        let text = SnodeResponse::new(200, "ok");
        assert_eq!(
            f.interpreter.interpret(false, Some(&text), &ctx).await.unwrap(),
            OnionOutcome::Success(ResponseBody::Text("ok".into()))
        );
    }

    #[tokio::test]
    async fn test_missing_response_charges_path() {
        let f = fixture().await;
        let guard = *f.paths.paths()[0].nodes[0].key();
        let ctx = InterpretContext { guard: &guard, target: None, associated_with: None };

        let out = f.interpreter.interpret(false, None, &ctx).await.unwrap();
        assert_eq!(out, OnionOutcome::RetryableBadPath { status: STATUS_NO_STATUS });
        assert_eq!(f.paths.path_failure_count(0), 1);
    }

    #[tokio::test]
    async fn test_bad_gateway_without_marker_charges_path() {
        let f = fixture().await;
        let guard = *f.paths.paths()[2].nodes[0].key();
        let ctx = InterpretContext { guard: &guard, target: None, associated_with: None };

        let out = f
            .interpreter
            .interpret(false, Some(&SnodeResponse::new(502, "Bad gateway")), &ctx)
            .await
            .unwrap();
        assert_eq!(out, OnionOutcome::RetryableBadPath { status: 502 });
        assert_eq!(f.paths.path_failure_count(2), 1);
    }

    #[tokio::test]
    async fn test_inner_500_charges_target() {
        let f = fixture().await;
        let guard = *f.paths.paths()[0].nodes[0].key();
        let target = *make_nodes(30)[25].key();
        let ctx = InterpretContext { guard: &guard, target: Some(&target), associated_with: None };

        let out = f
            .interpreter
            .interpret(false, Some(&envelope(500, json!("oops"))), &ctx)
            .await
            .unwrap();
        assert_eq!(out, OnionOutcome::RetryableBadPath { status: 500 });
        assert_eq!(f.paths.snode_failure_count(&target), 1);
        assert_eq!(f.paths.path_failure_count(0), 0);
    }

    #[tokio::test]
    async fn test_server_application_error_is_verbatim() {
        let f = fixture().await;
        let guard = *f.paths.paths()[0].nodes[0].key();
        let ctx = InterpretContext { guard: &guard, target: None, associated_with: None };

        let out = f
            .interpreter
            .interpret(false, Some(&envelope(404, json!("no such room"))), &ctx)
            .await
            .unwrap();
        assert_eq!(
            out,
            OnionOutcome::Aborted(AbortReason::ServerApplication {
                status: 404,
                body: "no such room".into()
            })
        );
        assert_eq!(f.paths.path_failure_count(0), 0);
        assert_eq!(f.paths.stats().snode_increments(), 0);
    }

    #[tokio::test]
    async fn test_unknown_path_status_aborts() {
        let f = fixture().await;
        let guard = *f.paths.paths()[0].nodes[0].key();
        let ctx = InterpretContext { guard: &guard, target: None, associated_with: None };

        let out = f
            .interpreter
            .interpret(false, Some(&SnodeResponse::new(418, "")), &ctx)
            .await
            .unwrap();
        assert_eq!(out, OnionOutcome::Aborted(AbortReason::Status(418)));
    }

    #[tokio::test]
    async fn test_421_without_context_aborts() {
        let f = fixture().await;
        let guard = *f.paths.paths()[0].nodes[0].key();
        let ctx = InterpretContext { guard: &guard, target: None, associated_with: None };

        let out = f
            .interpreter
            .interpret(false, Some(&SnodeResponse::new(421, "")), &ctx)
            .await
            .unwrap();
        assert_eq!(out, OnionOutcome::Aborted(AbortReason::Status(421)));
        assert_eq!(f.pool.stats().swarm_updates(), 0);
    }

    #[test]
    fn test_parse_swarm_snodes() {
        let nodes = make_nodes(2);
        let value = json!({
            "snodes": [
                {"ip": nodes[0].ip, "port": "443", "pubkey_x25519": nodes[0].pubkey_x25519, "pubkey_ed25519": nodes[0].pubkey_ed25519},
                {"ip": "0.0.0.0", "port": 1, "pubkey_x25519": nodes[1].pubkey_x25519, "pubkey_ed25519": nodes[1].pubkey_ed25519},
                {"ip": "bad"}
            ]
        });
        let parsed = parse_swarm_snodes(&value);
        assert_eq!(parsed, vec![nodes[0].clone()]);
        assert!(parse_swarm_snodes(&json!({})).is_empty());
    }
}
