//! Redis integration for the publish service.
//!
//! Events go out on the `publish` and `merge-proposal` channels; the
//! `runner` channel is consumed so freshly-finished runs are published
//! without waiting for the next cycle.

use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Event data for publish notifications.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PublishEvent {
    /// The codebase that was published.
    pub codebase: String,
    /// The campaign that was published.
    pub campaign: String,
    /// The publish mode used.
    pub mode: String,
    /// The result code of the publish operation.
    pub result_code: String,
    /// Optional description of the result.
    pub description: Option<String>,
    /// Optional URL of the merge proposal created.
    pub proposal_url: Option<String>,
    /// The branch name that was published.
    pub branch_name: Option<String>,
    /// The revision that was published.
    pub revision: Option<String>,
    /// The run the publish came from.
    pub run_id: String,
    /// Timestamp of the event.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Event data for merge proposal notifications.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MergeProposalEvent {
    /// URL of the merge proposal.
    pub url: String,
    /// Web URL of the merge proposal.
    pub web_url: Option<String>,
    /// Status of the merge proposal.
    pub status: String,
    /// The codebase this proposal belongs to.
    pub codebase: String,
    /// The campaign this proposal belongs to.
    pub campaign: String,
    /// The target branch URL.
    pub target_branch_url: String,
    /// Timestamp of the event.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

async fn publish_json(
    redis: Option<redis::aio::ConnectionManager>,
    channel: &str,
    payload: &impl serde::Serialize,
) {
    let Some(mut redis) = redis else {
        return;
    };
    let message = match serde_json::to_string(payload) {
        Ok(message) => message,
        Err(e) => {
            log::error!("Failed to serialize {} event: {}", channel, e);
            return;
        }
    };
    let result: Result<(), redis::RedisError> = redis.publish(channel, &message).await;
    match result {
        Ok(()) => log::debug!("Published message to channel '{}': {}", channel, message),
        Err(e) => log::warn!("Failed to publish to channel '{}': {}", channel, e),
    }
}

/// Publish a publish event to the "publish" channel.
pub async fn pubsub_publish_publish(
    redis: Option<redis::aio::ConnectionManager>,
    event: &PublishEvent,
) {
    publish_json(redis, "publish", event).await;
}

/// Publish a merge proposal event to the "merge-proposal" channel.
pub async fn pubsub_publish_merge_proposal(
    redis: Option<redis::aio::ConnectionManager>,
    event: &MergeProposalEvent,
) {
    publish_json(redis, "merge-proposal", event).await;
}

/// Message the runner emits when a run finishes.
#[derive(Debug, serde::Deserialize)]
struct RunnerMessage {
    id: String,
    #[allow(dead_code)]
    codebase: Option<String>,
    #[allow(dead_code)]
    campaign: Option<String>,
    result_code: Option<String>,
}

/// Listen to the runner service for new runs to publish.
///
/// Subscribes to the "runner" Redis channel; every successful run is
/// considered for publication immediately.
pub async fn listen_to_runner(
    state: Arc<crate::AppState>,
    redis_url: &str,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    log::info!("Starting Redis listener for runner messages");

    use futures::StreamExt;

    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe("runner").await?;

    let mut pubsub_stream = pubsub.into_on_message();

    loop {
        tokio::select! {
            result = shutdown_rx.recv() => {
                match result {
                    Some(()) => log::info!("Received shutdown signal, stopping Redis listener"),
                    None => log::warn!("Shutdown channel closed, stopping Redis listener"),
                }
                break;
            }

            msg = pubsub_stream.next() => {
                let Some(msg) = msg else {
                    log::warn!("Redis pubsub stream ended");
                    break;
                };
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Undecodable runner message: {}", e);
                        continue;
                    }
                };
                let message: RunnerMessage = match serde_json::from_str(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Malformed runner message {:?}: {}", payload, e);
                        continue;
                    }
                };
                if message.result_code.as_deref() != Some("success") {
                    continue;
                }
                if !state.auto_publish {
                    continue;
                }
                log::info!("Run {} finished successfully; considering publish", message.id);
                if let Err(e) = crate::queue::publish_run(state.clone(), &message.id).await {
                    match e {
                        crate::PublishError::NothingToDo(reason) => {
                            log::debug!("Nothing to publish for {}: {}", message.id, reason);
                        }
                        other => {
                            log::warn!("Failed to publish run {}: {}", message.id, other);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_message_parsing() {
        let message: RunnerMessage = serde_json::from_str(
            r#"{"id": "01hgw27s1qmvp3z9e6e6p06g64", "codebase": "pkg-a",
                "campaign": "lintian-fixes", "result_code": "success"}"#,
        )
        .unwrap();
        assert_eq!(message.id, "01hgw27s1qmvp3z9e6e6p06g64");
        assert_eq!(message.result_code.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn test_publish_without_redis_is_noop() {
        pubsub_publish_publish(
            None,
            &PublishEvent {
                codebase: "pkg-a".to_string(),
                campaign: "lintian-fixes".to_string(),
                mode: "propose".to_string(),
                result_code: "success".to_string(),
                description: None,
                proposal_url: None,
                branch_name: None,
                revision: None,
                run_id: "x".to_string(),
                timestamp: chrono::Utc::now(),
            },
        )
        .await;
    }
}
