//! Publish crate for the Janitor project.
//!
//! Consumes successful runs, decides per-branch how to surface them
//! (push, propose, or nothing), creates and maintains merge proposals,
//! and keeps the local proposal mirror in sync with the forges.

use chrono::{DateTime, Utc};
use janitor::config::{Config, ConfigHandle};
use janitor::publish::{MergeProposalStatus, Mode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Module for the forge capability interface.
pub mod forge;
/// Module for Prometheus metrics collection.
pub mod metrics;
/// Module for publishing a single branch.
pub mod publish_one;
/// Module for queue processing functionality.
pub mod queue;
/// Module for rate limiting publish operations.
pub mod rate_limiter;
/// Module for Redis pub/sub integration.
pub mod redis;
/// Module for the proposal maintenance scan.
pub mod scan;
/// Module for managing publish state.
pub mod state;
/// Module for web interface to publish functionality.
pub mod web;

use rate_limiter::RateLimiter;
use state::{PublishReadyRun, UnpublishedBranch};

/// Calculate the next time to try publishing based on previous attempts.
///
/// Exponential backoff: 2^attempts hours, capped at 7 days.
pub fn calculate_next_try_time(finish_time: DateTime<Utc>, attempt_count: usize) -> DateTime<Utc> {
    if attempt_count == 0 {
        finish_time
    } else {
        let delta = chrono::Duration::hours(2usize.pow(attempt_count.min(16) as u32).min(7 * 24) as i64);

        finish_time + delta
    }
}

/// Errors that can occur during publishing.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// A failure with a code recorded in the publish history.
    #[error("{code}: {description}")]
    Failure {
        /// Error code that indicates the type of failure.
        code: String,
        /// Detailed description of the failure.
        description: String,
    },
    /// Nothing to do, with a reason.
    #[error("nothing to do: {0}")]
    NothingToDo(String),
    /// Another publisher holds the lock for this branch.
    #[error("branch is busy: {0}")]
    BranchBusy(url::Url),
    /// The rate-limit bucket is at capacity.
    #[error("rate limited (bucket {bucket})")]
    BranchRateLimited {
        bucket: String,
        retry_after: Option<chrono::Duration>,
    },
}

impl PublishError {
    /// Get the error code.
    pub fn code(&self) -> &str {
        match self {
            PublishError::Failure { code, .. } => code,
            PublishError::NothingToDo(_) => "nothing-to-do",
            PublishError::BranchBusy(_) => "branch-busy",
            PublishError::BranchRateLimited { .. } => "rate-limited",
        }
    }
}

/// Check if a run is sufficient to create a merge proposal based on its
/// value.
pub fn run_sufficient_for_proposal(
    campaign_config: &janitor::config::Campaign,
    run_value: Option<i32>,
) -> bool {
    if let (Some(run_value), Some(threshold)) =
        (run_value, &campaign_config.merge_proposal.value_threshold)
    {
        run_value >= *threshold
    } else {
        // Assume yes, if the run doesn't have an associated value or if
        // there is no threshold configured.
        true
    }
}

/// Resolve the effective publish mode for a branch role.
///
/// Most specific wins: the per-role entry of the codebase policy, then the
/// codebase policy mode, then the campaign per-role policy, then the
/// campaign default.
pub async fn resolve_publish_mode(
    conn: &sqlx::PgPool,
    config: &Config,
    codebase: &str,
    campaign: &str,
    role: &str,
) -> Result<Mode, sqlx::Error> {
    let policy: Option<(Option<String>, Option<serde_json::Value>)> = sqlx::query_as(
        "SELECT publish_mode, per_branch FROM policy WHERE codebase = $1 AND suite = $2",
    )
    .bind(codebase)
    .bind(campaign)
    .fetch_optional(conn)
    .await?;

    if let Some((publish_mode, per_branch)) = policy {
        if let Some(mode) = per_branch
            .as_ref()
            .and_then(|pb| pb.get(role))
            .and_then(|m| m.as_str())
            .and_then(|m| m.parse().ok())
        {
            return Ok(mode);
        }
        if let Some(mode) = publish_mode.as_deref().and_then(|m| m.parse().ok()) {
            return Ok(mode);
        }
    }

    Ok(config
        .get_campaign(campaign)
        .map(|c| c.mode_for_role(role))
        .unwrap_or(Mode::Skip))
}

/// Application state for the publish service.
pub struct AppState {
    /// Database connection pool.
    pub conn: sqlx::PgPool,
    /// Shared pointer to the current configuration snapshot.
    pub config: ConfigHandle,
    /// Rate limiter for buckets.
    pub bucket_rate_limiter: Mutex<Box<dyn RateLimiter>>,
    /// Forge hosts backing off until the given time.
    pub forge_rate_limiter: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    /// Consecutive rate-limit hits per forge host, driving the
    /// exponential backoff.
    pub forge_failure_counts: Mutex<HashMap<String, u32>>,
    /// Optional limit on the number of pushes per cycle.
    pub push_limit: Option<usize>,
    /// Optional Redis connection manager.
    pub redis: Option<::redis::aio::ConnectionManager>,
    /// Lock manager serialising publishes per (forge host, bucket).
    pub lock_manager: Option<rslock::LockManager>,
    /// Whether publishes happen automatically or only on request.
    pub auto_publish: bool,
}

impl AppState {
    /// Whether a forge host is currently backing off.
    pub fn forge_backoff_remaining(&self, host: &str) -> Option<chrono::Duration> {
        let limiter = self.forge_rate_limiter.read().expect("lock poisoned");
        limiter.get(host).and_then(|until| {
            let remaining = *until - Utc::now();
            (remaining > chrono::Duration::zero()).then_some(remaining)
        })
    }

    /// Record a forge-imposed backoff for a host.
    pub fn set_forge_backoff(&self, host: &str, retry_after: chrono::Duration) {
        let mut limiter = self.forge_rate_limiter.write().expect("lock poisoned");
        limiter.insert(host.to_string(), Utc::now() + retry_after);
    }

    pub fn clear_forge_backoff(&self, host: &str) {
        let mut limiter = self.forge_rate_limiter.write().expect("lock poisoned");
        limiter.remove(host);
    }
}

/// Outcome of considering one branch for publication.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BranchPublishOutcome {
    pub role: String,
    pub status: String,
    pub mode: Option<Mode>,
    pub proposal_url: Option<url::Url>,
    pub description: Option<String>,
}

/// Decide and perform publication of every unpublished branch of a run.
///
/// Errors per branch are recorded in the outcome rather than aborting the
/// run: an internal error leaves the unpublished-branch record intact so
/// the next tick retries.
pub async fn consider_publish_run(
    state: &AppState,
    ready: &PublishReadyRun,
    require_sufficient_value: bool,
) -> Result<Vec<BranchPublishOutcome>, sqlx::Error> {
    let run = &ready.run;
    let config = state.config.get();
    let campaign_config = match config.get_campaign(&run.suite) {
        Some(campaign) => campaign,
        None => {
            log::warn!(
                "Run {} is for unknown campaign {}; not publishing",
                run.id,
                run.suite
            );
            return Ok(vec![]);
        }
    };

    // The proposal bucket is the codebase's at creation time, falling back
    // to the campaign's.
    let bucket = ready
        .rate_limit_bucket
        .clone()
        .or_else(|| campaign_config.rate_limit_bucket.clone())
        .unwrap_or_else(|| "default".to_string());

    let mut outcomes = Vec::with_capacity(ready.unpublished_branches.len());

    for branch in &ready.unpublished_branches {
        let mode = resolve_publish_mode(
            &state.conn,
            &config,
            &run.codebase,
            &run.suite,
            &branch.role,
        )
        .await?;

        if matches!(mode, Mode::Skip | Mode::BuildOnly) {
            outcomes.push(BranchPublishOutcome {
                role: branch.role.clone(),
                status: "skipped".to_string(),
                mode: Some(mode),
                proposal_url: None,
                description: Some(format!("publish mode is {}", mode)),
            });
            continue;
        }

        if require_sufficient_value
            && matches!(mode, Mode::Propose | Mode::AttemptPush)
            && !run_sufficient_for_proposal(campaign_config, run.value)
        {
            outcomes.push(BranchPublishOutcome {
                role: branch.role.clone(),
                status: "insufficient-value".to_string(),
                mode: Some(mode),
                proposal_url: None,
                description: Some("run value below campaign threshold".to_string()),
            });
            continue;
        }

        let outcome =
            publish_branch(state, ready, campaign_config, branch, mode, &bucket).await;
        outcomes.push(match outcome {
            Ok(result) => {
                metrics::PUBLISH_COUNT
                    .with_label_values(&[&result.mode.to_string(), "success"])
                    .inc();
                BranchPublishOutcome {
                    role: branch.role.clone(),
                    status: "published".to_string(),
                    mode: Some(result.mode),
                    proposal_url: result.proposal_url.clone(),
                    description: result.description.clone(),
                }
            }
            Err(PublishError::BranchRateLimited {
                bucket,
                retry_after,
            }) => {
                metrics::RATE_LIMITED_COUNT.inc();
                BranchPublishOutcome {
                    role: branch.role.clone(),
                    status: "rate-limited".to_string(),
                    mode: Some(mode),
                    proposal_url: None,
                    description: Some(format!(
                        "bucket {} is at capacity{}",
                        bucket,
                        retry_after
                            .map(|d| format!(", retry after {}s", d.num_seconds()))
                            .unwrap_or_default()
                    )),
                }
            }
            Err(PublishError::NothingToDo(reason)) => BranchPublishOutcome {
                role: branch.role.clone(),
                status: "nothing-to-do".to_string(),
                mode: Some(mode),
                proposal_url: None,
                description: Some(reason),
            },
            Err(PublishError::BranchBusy(url)) => BranchPublishOutcome {
                role: branch.role.clone(),
                status: "busy".to_string(),
                mode: Some(mode),
                proposal_url: None,
                description: Some(format!("branch is busy: {}", url)),
            },
            Err(PublishError::Failure { code, description }) => {
                metrics::PUBLISH_COUNT
                    .with_label_values(&[&mode.to_string(), &code])
                    .inc();
                log::warn!(
                    "Publishing {}/{} for run {} failed: {}: {}",
                    run.codebase,
                    branch.role,
                    run.id,
                    code,
                    description
                );
                BranchPublishOutcome {
                    role: branch.role.clone(),
                    status: "failed".to_string(),
                    mode: Some(mode),
                    proposal_url: None,
                    description: Some(format!("{}: {}", code, description)),
                }
            }
        });
    }

    Ok(outcomes)
}

/// Publish one branch, enforcing bucket limits, the per-branch cooldown
/// and the distributed lock.
async fn publish_branch(
    state: &AppState,
    ready: &PublishReadyRun,
    campaign_config: &janitor::config::Campaign,
    branch: &UnpublishedBranch,
    mode: Mode,
    bucket: &str,
) -> Result<publish_one::PublishOneResult, PublishError> {
    let run = &ready.run;

    let target_branch_url: url::Url = run
        .target_branch_url
        .as_deref()
        .or(run.branch_url.as_deref())
        .and_then(|u| u.parse().ok())
        .ok_or_else(|| PublishError::NothingToDo("run has no target branch URL".to_string()))?;

    // Bucket limit comes before mode dispatch: push modes can still end up
    // opening a proposal when the push is denied.
    let status = state
        .bucket_rate_limiter
        .lock()
        .expect("lock poisoned")
        .check_allowed(bucket);
    if !status.is_allowed() {
        return Err(PublishError::BranchRateLimited {
            bucket: bucket.to_string(),
            retry_after: None,
        });
    }

    // Forge-level backoff.
    if let Some(host) = target_branch_url.host_str() {
        if let Some(remaining) = state.forge_backoff_remaining(host) {
            return Err(PublishError::BranchRateLimited {
                bucket: host.to_string(),
                retry_after: Some(remaining),
            });
        }
    }

    // Per-branch cooldown.
    let min_interval =
        chrono::Duration::seconds(state.config.get().publisher.min_publish_interval as i64);
    if let Ok(Some(last)) =
        state::check_last_published(&state.conn, &run.suite, &run.codebase).await
    {
        if Utc::now() - last < min_interval {
            return Err(PublishError::NothingToDo(format!(
                "published less than {}h ago",
                min_interval.num_hours()
            )));
        }
    }

    let lock_key = format!(
        "publish:{}:{}",
        target_branch_url.host_str().unwrap_or("-"),
        bucket
    );
    let guard = match &state.lock_manager {
        Some(lock_manager) => match lock_manager
            .lock(lock_key.as_bytes(), std::time::Duration::from_secs(60))
            .await
        {
            Ok(guard) => Some(guard),
            Err(_) => return Err(PublishError::BranchBusy(target_branch_url)),
        },
        None => None,
    };

    let result = publish_one::publish_one(state, ready, campaign_config, branch, mode).await;

    if let (Some(lock_manager), Some(guard)) = (&state.lock_manager, guard) {
        lock_manager.unlock(&guard).await;
    }

    let result = match result {
        Ok(result) => result,
        Err(PublishError::Failure { code, description }) => {
            // Failure rows are history; the unpublished-branch record stays
            // pending so the next tick retries.
            if let Err(e) = state::store_publish(
                &state.conn,
                &run.codebase,
                branch.remote_name.as_deref(),
                Some(&target_branch_url),
                None,
                branch.base_revision.as_deref(),
                branch.revision.as_deref(),
                &branch.role,
                mode,
                &code,
                &description,
                None,
                &ulid::Ulid::new().to_string().to_lowercase(),
                None,
                Some(&run.id),
                Some(bucket),
            )
            .await
            {
                log::error!("Failed to record publish failure for {}: {}", run.id, e);
            }
            return Err(PublishError::Failure { code, description });
        }
        Err(other) => return Err(other),
    };

    state::store_publish(
        &state.conn,
        &run.codebase,
        result.branch_name.as_deref(),
        Some(&result.target_branch_url),
        None,
        branch.base_revision.as_deref(),
        branch.revision.as_deref(),
        &branch.role,
        result.mode,
        "success",
        result.description.as_deref().unwrap_or("published"),
        result.proposal_url.as_ref(),
        &ulid::Ulid::new().to_string().to_lowercase(),
        None,
        Some(&run.id),
        Some(bucket),
    )
    .await
    .map_err(|e| PublishError::Failure {
        code: "database-error".to_string(),
        description: e.to_string(),
    })?;

    if result.is_new.unwrap_or(false) {
        if let Some(proposal_url) = &result.proposal_url {
            state
                .bucket_rate_limiter
                .lock()
                .expect("lock poisoned")
                .inc(bucket);
            let event = redis::MergeProposalEvent {
                url: proposal_url.to_string(),
                web_url: result.proposal_web_url.as_ref().map(|u| u.to_string()),
                status: "open".to_string(),
                codebase: run.codebase.clone(),
                campaign: run.suite.clone(),
                target_branch_url: result.target_branch_url.to_string(),
                timestamp: Utc::now(),
            };
            redis::pubsub_publish_merge_proposal(state.redis.clone(), &event).await;
        }
    }

    let event = redis::PublishEvent {
        codebase: run.codebase.clone(),
        campaign: run.suite.clone(),
        mode: result.mode.to_string(),
        result_code: "success".to_string(),
        description: result.description.clone(),
        proposal_url: result.proposal_url.as_ref().map(|u| u.to_string()),
        branch_name: result.branch_name.clone(),
        revision: branch.revision.clone(),
        run_id: run.id.clone(),
        timestamp: Utc::now(),
    };
    redis::pubsub_publish_publish(state.redis.clone(), &event).await;

    Ok(result)
}

/// Refresh the counts of merge proposals per bucket.
pub async fn refresh_bucket_mp_counts(state: &AppState) -> Result<(), sqlx::Error> {
    let mut per_bucket: HashMap<MergeProposalStatus, HashMap<String, usize>> = HashMap::new();

    for (bucket, status, count) in state::get_merge_proposal_counts(&state.conn).await? {
        match status.parse::<MergeProposalStatus>() {
            Ok(status) => {
                per_bucket
                    .entry(status)
                    .or_default()
                    .insert(bucket, count as usize);
            }
            Err(e) => log::warn!("Ignoring unknown proposal status in database: {}", e),
        }
    }
    state
        .bucket_rate_limiter
        .lock()
        .expect("lock poisoned")
        .set_mps_per_bucket(&per_bucket);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_next_try_time() {
        let finish_time = Utc::now();
        assert_eq!(calculate_next_try_time(finish_time, 0), finish_time);
        assert_eq!(
            calculate_next_try_time(finish_time, 1),
            finish_time + chrono::Duration::hours(2)
        );
        assert_eq!(
            calculate_next_try_time(finish_time, 3),
            finish_time + chrono::Duration::hours(8)
        );
        // Verify that the maximum delay is 7 days
        assert_eq!(
            calculate_next_try_time(finish_time, 10),
            finish_time + chrono::Duration::days(7)
        );
        assert_eq!(
            calculate_next_try_time(finish_time, 60),
            finish_time + chrono::Duration::days(7)
        );
    }

    #[test]
    fn test_run_sufficient_for_proposal() {
        let mut campaign: janitor::config::Campaign = toml::from_str(
            r#"
name = "lintian-fixes"
command = "lintian-brush"
"#,
        )
        .unwrap();
        assert!(run_sufficient_for_proposal(&campaign, None));
        assert!(run_sufficient_for_proposal(&campaign, Some(1)));

        campaign.merge_proposal.value_threshold = Some(10);
        assert!(run_sufficient_for_proposal(&campaign, Some(10)));
        assert!(!run_sufficient_for_proposal(&campaign, Some(9)));
        // No value on the run: assume sufficient.
        assert!(run_sufficient_for_proposal(&campaign, None));
    }

    #[test]
    fn test_publish_error_codes() {
        assert_eq!(
            PublishError::NothingToDo("x".to_string()).code(),
            "nothing-to-do"
        );
        assert_eq!(
            PublishError::BranchRateLimited {
                bucket: "maint:alice".to_string(),
                retry_after: None
            }
            .code(),
            "rate-limited"
        );
    }
}
