//! Proposal maintenance.
//!
//! Periodically re-checks every open merge proposal against its forge,
//! keeps the local mirror current, detects proposals that need a rebase
//! and schedules refresh runs for them.

use crate::forge::{self, ForgeError};
use crate::state::MergeProposalRow;
use crate::AppState;
use chrono::Utc;
use janitor::publish::MergeProposalStatus;
use rand::Rng;

const SCAN_BATCH: i64 = 100;
const BACKOFF_BASE_SECONDS: i64 = 60;
const BACKOFF_CAP_SECONDS: i64 = 3600;

/// One maintenance pass over stale open proposals.
pub async fn check_existing(state: &AppState) -> Result<(), sqlx::Error> {
    let cutoff = Utc::now()
        - chrono::Duration::seconds(state.config.get().publisher.rescan_interval as i64);
    let proposals = crate::state::iter_proposals_to_scan(&state.conn, cutoff, SCAN_BATCH).await?;

    if proposals.is_empty() {
        log::debug!("No proposals due for a rescan");
        return Ok(());
    }

    log::info!("Rescanning {} open proposals", proposals.len());

    for mp in proposals {
        if let Err(e) = check_proposal(state, &mp).await {
            log::warn!("Failed to check proposal {}: {}", mp.url, e);
        }
    }

    Ok(())
}

async fn check_proposal(state: &AppState, mp: &MergeProposalRow) -> Result<(), sqlx::Error> {
    let url: url::Url = match mp.url.parse() {
        Ok(url) => url,
        Err(e) => {
            log::error!("Proposal with unparseable URL {}: {}", mp.url, e);
            crate::state::touch_proposal(&state.conn, &mp.url).await?;
            return Ok(());
        }
    };
    let Some(host) = url.host_str().map(|h| h.to_string()) else {
        crate::state::touch_proposal(&state.conn, &mp.url).await?;
        return Ok(());
    };

    if let Some(remaining) = state.forge_backoff_remaining(&host) {
        log::debug!(
            "Skipping {} ({}s of backoff left for {})",
            mp.url,
            remaining.num_seconds(),
            host
        );
        return Ok(());
    }

    let forge = match forge::get_forge(&state.config.get(), &url) {
        Ok(forge) => forge,
        Err(e) => {
            log::warn!("No forge configured for proposal {}: {}", mp.url, e);
            crate::state::touch_proposal(&state.conn, &mp.url).await?;
            return Ok(());
        }
    };

    match forge.get_proposal(&url).await {
        Ok(info) => {
            clear_backoff(state, &host);
            apply_observation(state, mp, &info).await?;
        }
        Err(ForgeError::RateLimited { retry_after }) => {
            let backoff = retry_after.unwrap_or_else(|| next_backoff(state, &host));
            log::warn!(
                "Forge {} rate limited us; backing off {}s",
                host,
                backoff.num_seconds()
            );
            state.set_forge_backoff(&host, backoff);
        }
        Err(ForgeError::NotFound(_)) | Err(ForgeError::LoginRequired) => {
            // Authoritative negative response; the proposal is gone for us.
            log::warn!("Marking proposal {} as abandoned", mp.url);
            crate::state::update_proposal_status(
                &state.conn,
                &mp.url,
                MergeProposalStatus::Abandoned,
                None,
                None,
                None,
            )
            .await?;
            emit_status_event(state, mp, MergeProposalStatus::Abandoned).await;
        }
        Err(ForgeError::Permanent(e)) => {
            log::warn!(
                "Permanent error checking {}; marking abandoned: {}",
                mp.url,
                e
            );
            crate::state::update_proposal_status(
                &state.conn,
                &mp.url,
                MergeProposalStatus::Abandoned,
                None,
                None,
                None,
            )
            .await?;
        }
        Err(e) => {
            // Transient; leave last_scanned so the next pass retries.
            log::debug!("Transient error checking {}: {}", mp.url, e);
        }
    }

    Ok(())
}

async fn apply_observation(
    state: &AppState,
    mp: &MergeProposalRow,
    info: &forge::ProposalInfo,
) -> Result<(), sqlx::Error> {
    let old_status: MergeProposalStatus = mp.status.parse().unwrap_or(MergeProposalStatus::Open);

    if info.status != old_status {
        log::info!(
            "Proposal {} transitioned {} -> {}",
            mp.url,
            old_status,
            info.status
        );
        crate::state::update_proposal_status(
            &state.conn,
            &mp.url,
            info.status,
            info.merged_by.as_deref(),
            info.merged_at,
            info.revision.as_deref(),
        )
        .await?;
        crate::metrics::PROPOSAL_STATUS_COUNT
            .with_label_values(&[&info.status.to_string()])
            .inc();
        emit_status_event(state, mp, info.status).await;

        if info.status == MergeProposalStatus::Merged {
            schedule_post_merge(state, mp).await;
        }
        return Ok(());
    }

    // Still open: check whether the target branch moved past our base.
    sqlx::query("UPDATE merge_proposal SET needs_rebase = $2, last_scanned = NOW() WHERE url = $1")
        .bind(&mp.url)
        .bind(info.needs_rebase())
        .execute(&state.conn)
        .await?;

    if info.needs_rebase() {
        if let Some(codebase) = &mp.codebase {
            log::info!(
                "Proposal {} needs a rebase; scheduling refresh of {}",
                mp.url,
                codebase
            );
            if let Err(e) = janitor::schedule::do_schedule_control(
                &state.conn,
                codebase,
                None,
                None,
                true,
                None,
                Some("publish-scan"),
                None,
            )
            .await
            {
                log::warn!("Failed to schedule refresh for {}: {}", codebase, e);
            }
        }
    }

    Ok(())
}

/// After a merge, schedule the campaign again so follow-up work happens
/// with the post-merge offset.
async fn schedule_post_merge(state: &AppState, mp: &MergeProposalRow) {
    let Some(codebase) = &mp.codebase else {
        return;
    };
    let run = match crate::state::get_proposal_run(&state.conn, &mp.url).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            log::warn!("No run found for merged proposal {}", mp.url);
            return;
        }
        Err(e) => {
            log::warn!("Failed to look up run for {}: {}", mp.url, e);
            return;
        }
    };
    match janitor::schedule::reschedule_from_run(
        &state.conn,
        codebase,
        &run.suite,
        run.command.as_deref(),
        "success",
        0,
        Some("publish-scan"),
    )
    .await
    {
        Ok(Some(queue_id)) => {
            log::info!(
                "Scheduled follow-up for {}/{} after merge (queue id {})",
                codebase,
                run.suite,
                queue_id
            );
        }
        Ok(None) => {}
        Err(e) => log::warn!("Failed to schedule follow-up for {}: {}", codebase, e),
    }
}

async fn emit_status_event(state: &AppState, mp: &MergeProposalRow, status: MergeProposalStatus) {
    let run = crate::state::get_proposal_run(&state.conn, &mp.url)
        .await
        .ok()
        .flatten();
    let event = crate::redis::MergeProposalEvent {
        url: mp.url.clone(),
        web_url: mp.web_url.clone(),
        status: status.to_string(),
        codebase: mp.codebase.clone().unwrap_or_default(),
        campaign: run.map(|r| r.suite).unwrap_or_default(),
        target_branch_url: mp.target_branch_url.clone().unwrap_or_default(),
        timestamp: Utc::now(),
    };
    crate::redis::pubsub_publish_merge_proposal(state.redis.clone(), &event).await;
}

/// Exponential backoff with jitter for a host, doubling per consecutive
/// rate-limit hit and capped at an hour.
fn next_backoff(state: &AppState, host: &str) -> chrono::Duration {
    let mut counts = state.forge_failure_counts.lock().expect("lock poisoned");
    let count = counts.entry(host.to_string()).or_insert(0);
    *count = count.saturating_add(1);
    let base = BACKOFF_BASE_SECONDS
        .saturating_mul(2i64.saturating_pow(count.saturating_sub(1).min(16)))
        .min(BACKOFF_CAP_SECONDS);
    let jitter = rand::thread_rng().gen_range(0..=base / 4);
    chrono::Duration::seconds(base + jitter)
}

fn clear_backoff(state: &AppState, host: &str) {
    state.clear_forge_backoff(host);
    state
        .forge_failure_counts
        .lock()
        .expect("lock poisoned")
        .remove(host);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, RwLock};

    fn test_state() -> AppState {
        let config: janitor::config::Config = toml::from_str(
            r#"
[database]
url = "postgresql://localhost/janitor_test"
"#,
        )
        .unwrap();
        AppState {
            conn: sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgresql://localhost/janitor_test")
                .unwrap(),
            config: janitor::config::ConfigHandle::new(config, None),
            bucket_rate_limiter: Mutex::new(Box::new(
                crate::rate_limiter::NonRateLimiter::new(),
            )),
            forge_rate_limiter: Arc::new(RwLock::new(HashMap::new())),
            forge_failure_counts: Mutex::new(HashMap::new()),
            push_limit: None,
            redis: None,
            lock_manager: None,
            auto_publish: true,
        }
    }

    #[tokio::test]
    async fn test_backoff_grows_and_clears() {
        let state = test_state();
        let first = next_backoff(&state, "gitlab.com");
        let second = next_backoff(&state, "gitlab.com");
        assert!(first.num_seconds() >= BACKOFF_BASE_SECONDS);
        assert!(second.num_seconds() >= first.num_seconds());
        clear_backoff(&state, "gitlab.com");
        let reset = next_backoff(&state, "gitlab.com");
        assert!(reset.num_seconds() <= BACKOFF_BASE_SECONDS + BACKOFF_BASE_SECONDS / 4);
    }

    #[tokio::test]
    async fn test_backoff_capped() {
        let state = test_state();
        for _ in 0..20 {
            next_backoff(&state, "github.com");
        }
        let capped = next_backoff(&state, "github.com");
        assert!(capped.num_seconds() <= BACKOFF_CAP_SECONDS + BACKOFF_CAP_SECONDS / 4);
    }
}
