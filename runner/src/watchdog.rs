//! Watchdog system for monitoring active runs.
//!
//! Workers push heartbeats (log appends or explicit pings); the watchdog
//! only reads timestamps. A run that goes silent past the heartbeat
//! timeout is reaped and its queue entry re-queued, up to the retry cap of
//! the failure-classification table.

use crate::database::RunnerDatabase;
use crate::ActiveRun;
use chrono::{Duration, Utc};
use janitor::config::ConfigHandle;
use std::sync::Arc;
use tokio::time::interval;

/// Reasons why a run might be terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Worker heartbeats stopped.
    HeartbeatTimeout,
    /// Run exceeded its wall-clock budget.
    WallClockTimeout,
    /// Run was cancelled and the worker never reported back.
    Killed,
}

impl TerminationReason {
    /// Get the result code for this termination reason.
    pub fn result_code(&self) -> &'static str {
        match self {
            TerminationReason::HeartbeatTimeout => "worker-timeout",
            TerminationReason::WallClockTimeout => "worker-timeout",
            TerminationReason::Killed => "killed",
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            TerminationReason::HeartbeatTimeout => "Worker stopped sending heartbeats",
            TerminationReason::WallClockTimeout => "Run exceeded maximum allowed duration",
            TerminationReason::Killed => "Run was cancelled",
        }
    }

    /// Whether the queue entry should be re-queued for another attempt.
    pub fn requeue(&self) -> bool {
        !matches!(self, TerminationReason::Killed)
    }
}

/// Background watchdog task for monitoring active runs.
pub struct Watchdog {
    database: Arc<RunnerDatabase>,
    config: ConfigHandle,
}

impl Watchdog {
    pub fn new(database: Arc<RunnerDatabase>, config: ConfigHandle) -> Self {
        Self { database, config }
    }

    /// Start the watchdog monitoring loop.
    pub async fn start(&self) {
        let check_interval = self.config.get().runner.heartbeat_interval;
        log::info!(
            "Starting watchdog with check interval {}s, heartbeat timeout {}s",
            check_interval,
            self.config.get().runner.heartbeat_timeout
        );

        let mut timer = interval(std::time::Duration::from_secs(check_interval));
        loop {
            timer.tick().await;
            if let Err(e) = self.tick().await {
                log::error!("Watchdog check failed: {}", e);
            }
        }
    }

    /// One full scan: expire un-acknowledged assignments, reap silent and
    /// overdue runs, refresh gauges.
    pub async fn tick(&self) -> Result<(), sqlx::Error> {
        let config = self.config.get();
        let expired = self
            .database
            .expire_stale_assignments(Duration::seconds(config.runner.handshake_window as i64))
            .await?;
        if expired > 0 {
            log::info!(
                "Rolled back {} assignments that missed the handshake window",
                expired
            );
            crate::metrics::HANDSHAKE_EXPIRED_COUNT.inc_by(expired);
        }

        let stale = self
            .database
            .stale_runs(Duration::seconds(config.runner.heartbeat_timeout as i64))
            .await?;
        for run in stale {
            let reason = if run.kill_requested {
                TerminationReason::Killed
            } else {
                TerminationReason::HeartbeatTimeout
            };
            if let Err(e) = self.terminate_run(&run, reason).await {
                log::error!("Failed to terminate run {}: {}", run.id, e);
            }
        }

        for run in self.overdue().await? {
            if let Err(e) = self
                .terminate_run(&run, TerminationReason::WallClockTimeout)
                .await
            {
                log::error!("Failed to terminate run {}: {}", run.id, e);
            }
        }

        let (queued, active) = self.database.get_queue_stats().await?;
        crate::metrics::QUEUE_LENGTH_GAUGE.set(queued);
        crate::metrics::ACTIVE_RUN_GAUGE.set(active);

        Ok(())
    }

    async fn overdue(&self) -> Result<Vec<ActiveRun>, sqlx::Error> {
        let config = self.config.get();
        // The per-campaign budget can only shrink the default, so scanning
        // with the default and re-checking per run is sufficient.
        let default_timeout = Duration::minutes(config.runner.run_timeout as i64);
        let min_campaign_timeout = config
            .campaigns
            .iter()
            .filter_map(|c| c.run_timeout)
            .min()
            .map(|minutes| Duration::minutes(minutes as i64))
            .unwrap_or(default_timeout);
        let candidates = self
            .database
            .overdue_runs(std::cmp::min(default_timeout, min_campaign_timeout))
            .await?;
        let now = Utc::now();
        Ok(candidates
            .into_iter()
            .filter(|run| {
                let budget = config
                    .get_campaign(&run.suite)
                    .and_then(|c| c.run_timeout)
                    .map(|minutes| Duration::minutes(minutes as i64))
                    .unwrap_or(default_timeout);
                now - run.start_time > budget
            })
            .collect())
    }

    /// Terminate a run and clean up its state.
    pub async fn terminate_run(
        &self,
        run: &ActiveRun,
        reason: TerminationReason,
    ) -> Result<(), sqlx::Error> {
        log::warn!(
            "Terminating run {} (worker: {}): {}",
            run.id,
            run.worker_name,
            reason.description()
        );

        let policy = janitor::schedule::reschedule_policy(reason.result_code());

        let failure_details = serde_json::json!({
            "termination_reason": reason.result_code(),
            "worker_name": run.worker_name,
            "last_ping": run.last_ping.map(|t| t.to_rfc3339()),
            "run_duration_seconds": (Utc::now() - run.start_time).num_seconds(),
        });

        self.database
            .terminate_run(
                run,
                reason.result_code(),
                reason.description(),
                Some(&failure_details),
                reason.requeue(),
                policy.max_attempts,
            )
            .await?;

        crate::metrics::TERMINATION_COUNT
            .with_label_values(&[reason.result_code()])
            .inc();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_reason_codes() {
        assert_eq!(
            TerminationReason::HeartbeatTimeout.result_code(),
            "worker-timeout"
        );
        assert_eq!(TerminationReason::Killed.result_code(), "killed");
        assert!(TerminationReason::HeartbeatTimeout.requeue());
        assert!(!TerminationReason::Killed.requeue());
    }
}
