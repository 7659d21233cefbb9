//! The publish processing loop.

use crate::{consider_publish_run, AppState, PublishError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

/// Process the publish queue in a loop.
///
/// Each cycle refreshes the bucket counters, rescans stale merge
/// proposals, and publishes pending ready changes.
pub async fn process_queue_loop(state: Arc<AppState>, interval: chrono::Duration) {
    log::info!(
        "Starting publish queue processing loop (auto_publish: {}, interval: {:?})",
        state.auto_publish,
        interval
    );

    loop {
        let cycle_start = Utc::now();

        if let Err(e) = crate::refresh_bucket_mp_counts(&state).await {
            log::error!("Failed to refresh bucket proposal counts: {}", e);
        }

        if let Err(e) = crate::scan::check_existing(&state).await {
            log::error!("Proposal scan failed: {}", e);
        }

        if state.auto_publish {
            if let Err(e) = publish_pending_ready(state.clone(), state.push_limit).await {
                log::error!("Error publishing pending ready changes: {}", e);
            }
        } else {
            log::debug!("Auto-publish disabled, skipping publish phase");
        }

        let cycle_duration = Utc::now() - cycle_start;
        let sleep_duration = interval - cycle_duration;

        if sleep_duration > chrono::Duration::zero() {
            log::debug!(
                "Cycle completed in {:?}, sleeping for {:?}",
                cycle_duration,
                sleep_duration
            );
            tokio::time::sleep(std::time::Duration::from_millis(
                sleep_duration.num_milliseconds().max(0) as u64,
            ))
            .await;
        } else {
            log::warn!(
                "Cycle took {:?}, longer than interval {:?}",
                cycle_duration,
                interval
            );
        }
    }
}

/// Publish all pending ready changes.
///
/// # Arguments
/// * `state` - The application state
/// * `push_limit` - Optional limit on the number of publications
pub async fn publish_pending_ready(
    state: Arc<AppState>,
    push_limit: Option<usize>,
) -> Result<(), PublishError> {
    let start_time = std::time::Instant::now();
    let mut actions: HashMap<String, usize> = HashMap::new();
    let mut published_count = 0;

    let ready = crate::state::iter_publish_ready(&state.conn, None, None)
        .await
        .map_err(|e| PublishError::Failure {
            code: "database-error".to_string(),
            description: format!("Failed to iterate publish-ready runs: {}", e),
        })?;

    log::info!(
        "Considering {} publish-ready runs (push_limit: {:?})",
        ready.len(),
        push_limit
    );

    for ready_run in ready {
        if let Some(limit) = push_limit {
            if published_count >= limit {
                log::info!("Reached push limit of {}, stopping", limit);
                break;
            }
        }

        match consider_publish_run(&state, &ready_run, true).await {
            Ok(outcomes) => {
                for outcome in outcomes {
                    *actions.entry(outcome.status.clone()).or_insert(0) += 1;
                    if outcome.status == "published" {
                        published_count += 1;
                    }
                }
            }
            Err(e) => {
                log::error!(
                    "Error considering run {} for publishing: {}",
                    ready_run.run.id,
                    e
                );
                *actions.entry("error".to_string()).or_insert(0) += 1;
            }
        }
    }

    log::info!(
        "Completed publish_pending_ready in {:?}: {} published, actions: {:?}",
        start_time.elapsed(),
        published_count,
        actions
    );

    Ok(())
}

/// Publish a single run on request, bypassing the value threshold.
pub async fn publish_run(
    state: Arc<AppState>,
    run_id: &str,
) -> Result<Vec<crate::BranchPublishOutcome>, PublishError> {
    let ready = crate::state::iter_publish_ready(&state.conn, Some(run_id), Some(1))
        .await
        .map_err(|e| PublishError::Failure {
            code: "database-error".to_string(),
            description: e.to_string(),
        })?;
    let Some(ready_run) = ready.into_iter().next() else {
        return Err(PublishError::NothingToDo(format!(
            "run {} has no unpublished branches",
            run_id
        )));
    };
    consider_publish_run(&state, &ready_run, false)
        .await
        .map_err(|e| PublishError::Failure {
            code: "database-error".to_string(),
            description: e.to_string(),
        })
}
