//! Database operations for the runner.
//!
//! All state transitions of an active run happen here, as single-row
//! updates with an optimistic check on the current state.

use crate::{ActiveRun, RunState};
use janitor::api::FinishReport;
use janitor::queue::{Queue, QueueItem, VcsInfo};
use sqlx::postgres::types::PgInterval;
use sqlx::{PgPool, Row};
use std::collections::HashSet;

pub struct RunnerDatabase {
    pool: PgPool,
}

#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    #[error("nothing in the queue is assignable")]
    Empty,
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum FinishError {
    #[error("no active run {0}")]
    NoSuchRun(String),
    #[error("run {0} was finished concurrently")]
    AlreadyFinished(String),
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
}

impl RunnerDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Atomically pick the best assignable queue entry and create an
    /// active run for it.
    ///
    /// The queue row is locked with `FOR UPDATE SKIP LOCKED`, so two
    /// concurrent calls can never hand out the same entry; the loser simply
    /// sees the next entry, or nothing.
    #[allow(clippy::too_many_arguments)]
    pub async fn assign_next(
        &self,
        run_id: &str,
        worker_name: &str,
        worker_link: Option<&str>,
        token: &str,
        campaigns: &[String],
        campaign_filter: Option<&str>,
        exclude_hosts: &HashSet<String>,
        cooldown_seconds: u64,
    ) -> Result<(QueueItem, VcsInfo), AssignError> {
        let mut tx = self.pool.begin().await?;

        let query = "SELECT queue.id, queue.context, queue.command, queue.estimated_duration, \
             queue.suite AS campaign, queue.refresh, queue.requester, queue.codebase, \
             queue.bucket, queue.attempt_count, \
             codebase.vcs_type AS vcs_type, codebase.branch_url, codebase.subpath \
             FROM queue \
             LEFT JOIN codebase ON codebase.name = queue.codebase \
             WHERE queue.suite = ANY($1::text[]) \
             AND ($4::text IS NULL OR queue.suite = $4) \
             AND NOT EXISTS ( \
                 SELECT FROM active_run WHERE active_run.codebase = queue.codebase) \
             AND NOT EXISTS ( \
                 SELECT FROM run WHERE run.codebase = queue.codebase \
                 AND run.finish_time > NOW() - ($2 * interval '1 second')) \
             AND NOT (codebase.branch_url IS NOT NULL AND \
                 SUBSTRING(codebase.branch_url from '.*://(?:[^/@]*@)?([^/]*)') = ANY($3::text[])) \
             ORDER BY queue.bucket ASC, queue.priority ASC, queue.id ASC, \
                      hashtext(queue.codebase) ASC \
             LIMIT 1 FOR UPDATE OF queue SKIP LOCKED";

        let row = sqlx::query(query)
            .bind(campaigns)
            .bind(cooldown_seconds as f64)
            .bind(
                exclude_hosts
                    .iter()
                    .map(|h| h.to_string())
                    .collect::<Vec<_>>(),
            )
            .bind(campaign_filter)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AssignError::Empty)?;

        use sqlx::FromRow;
        let item = QueueItem::from_row(&row)?;
        let vcs_info = VcsInfo::from_row(&row)?;

        sqlx::query(
            "INSERT INTO active_run (id, queue_id, codebase, suite, command, state, \
             worker_name, worker_link, start_time, last_ping, token) \
             VALUES ($1, $2, $3, $4, $5, 'assigning', $6, $7, NOW(), NOW(), $8)",
        )
        .bind(run_id)
        .bind(item.id)
        .bind(&item.codebase)
        .bind(&item.campaign)
        .bind(&item.command)
        .bind(worker_name)
        .bind(worker_link)
        .bind(token)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((item, vcs_info))
    }

    pub async fn get_active_run(&self, run_id: &str) -> Result<Option<ActiveRun>, sqlx::Error> {
        sqlx::query_as::<_, ActiveRun>(
            "SELECT id, queue_id, codebase, suite, command, state, worker_name, worker_link, \
             start_time, last_ping, log_position, kill_requested, token \
             FROM active_run WHERE id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_active_runs(&self) -> Result<Vec<ActiveRun>, sqlx::Error> {
        sqlx::query_as::<_, ActiveRun>(
            "SELECT id, queue_id, codebase, suite, command, state, worker_name, worker_link, \
             start_time, last_ping, log_position, kill_requested, token \
             FROM active_run ORDER BY start_time ASC",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Record a heartbeat, moving an `assigning` run to `running`.
    ///
    /// # Returns
    /// Whether a kill was requested for the run, or None if the run is not
    /// active.
    pub async fn record_ping(
        &self,
        run_id: &str,
        log_position: Option<i64>,
    ) -> Result<Option<bool>, sqlx::Error> {
        let row = sqlx::query(
            "UPDATE active_run SET last_ping = NOW(), \
             state = CASE WHEN state = 'assigning' THEN 'running' ELSE state END, \
             log_position = GREATEST(log_position, COALESCE($2, log_position)) \
             WHERE id = $1 RETURNING kill_requested",
        )
        .bind(run_id)
        .bind(log_position)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row.try_get("kill_requested")).transpose()
    }

    /// Flag a run for cancellation; the worker learns on its next contact.
    pub async fn request_kill(&self, run_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE active_run SET kill_requested = true WHERE id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a run to `finishing`, guarding against concurrent ingestion.
    pub async fn start_finishing(&self, run_id: &str) -> Result<ActiveRun, FinishError> {
        let row = sqlx::query_as::<_, ActiveRun>(
            "UPDATE active_run SET state = 'finishing' \
             WHERE id = $1 AND state IN ('assigning', 'running') \
             RETURNING id, queue_id, codebase, suite, command, state, worker_name, worker_link, \
             start_time, last_ping, log_position, kill_requested, token",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(run) => Ok(run),
            None => {
                if self.get_active_run(run_id).await?.is_some() {
                    Err(FinishError::AlreadyFinished(run_id.to_string()))
                } else {
                    Err(FinishError::NoSuchRun(run_id.to_string()))
                }
            }
        }
    }

    /// Roll a `finishing` run back to `running` after a failed ingest so
    /// the next attempt can retry.
    pub async fn abort_finishing(&self, run_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE active_run SET state = 'running' WHERE id = $1 AND state = 'finishing'")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a finished run.
    ///
    /// The run row, its branch results, the queue-entry deletion and the
    /// active-run deletion commit together.
    pub async fn persist_finished_run(
        &self,
        active: &ActiveRun,
        report: &FinishReport,
        logfilenames: &[String],
    ) -> Result<(), FinishError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO run (id, suite, codebase, command, description, result_code, value, \
             start_time, finish_time, context, branch_url, target_branch_url, vcs_type, \
             revision, main_branch_revision, worker_name, worker_link, result, \
             failure_details, failure_stage, failure_transient, logfilenames) \
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, codebase.branch_url, $11, \
             codebase.vcs_type, $12, $13, $14, $15, $16, $17, $18, $19, $20 \
             FROM codebase WHERE codebase.name = $3",
        )
        .bind(&active.id)
        .bind(&active.suite)
        .bind(&active.codebase)
        .bind(&active.command)
        .bind(&report.description)
        .bind(&report.code)
        .bind(report.value)
        .bind(report.start_time)
        .bind(report.finish_time)
        .bind(None::<String>)
        .bind(report.target_branch_url.as_ref().map(|u| u.to_string()))
        .bind(&report.revision)
        .bind(report.branches.iter().find_map(|b| {
            if b.role == "main" {
                b.base_revision.clone()
            } else {
                None
            }
        }))
        .bind(&active.worker_name)
        .bind(&active.worker_link)
        .bind(&report.codemod)
        .bind(&report.failure_details)
        .bind(&report.failure_stage)
        .bind(report.transient)
        .bind(logfilenames)
        .execute(&mut *tx)
        .await?;

        for branch in &report.branches {
            sqlx::query(
                "INSERT INTO new_result_branch (run_id, role, remote_name, base_revision, revision) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (run_id, role) DO UPDATE SET remote_name = EXCLUDED.remote_name, \
                 base_revision = EXCLUDED.base_revision, revision = EXCLUDED.revision",
            )
            .bind(&active.id)
            .bind(&branch.role)
            .bind(&branch.name)
            .bind(&branch.base_revision)
            .bind(&branch.revision)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM queue WHERE id = $1")
            .bind(active.queue_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM active_run WHERE id = $1")
            .bind(&active.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Terminate a run from the watchdog: record a failure run, drop the
    /// active-run row and either bump the queue entry's attempt counter or
    /// drop the entry when the cap is reached.
    pub async fn terminate_run(
        &self,
        active: &ActiveRun,
        result_code: &str,
        description: &str,
        failure_details: Option<&serde_json::Value>,
        requeue: bool,
        max_attempts: Option<i32>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO run (id, suite, codebase, command, description, result_code, \
             start_time, finish_time, worker_name, worker_link, failure_details, \
             failure_transient) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), $8, $9, $10, true)",
        )
        .bind(&active.id)
        .bind(&active.suite)
        .bind(&active.codebase)
        .bind(&active.command)
        .bind(description)
        .bind(result_code)
        .bind(active.start_time)
        .bind(&active.worker_name)
        .bind(&active.worker_link)
        .bind(failure_details)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM active_run WHERE id = $1")
            .bind(&active.id)
            .execute(&mut *tx)
            .await?;

        if requeue {
            let attempt_count: i32 = sqlx::query_scalar(
                "UPDATE queue SET attempt_count = attempt_count + 1 WHERE id = $1 \
                 RETURNING attempt_count",
            )
            .bind(active.queue_id)
            .fetch_one(&mut *tx)
            .await?;
            if max_attempts.is_some_and(|cap| attempt_count >= cap) {
                log::info!(
                    "Dropping queue entry {} for {}/{}: attempt cap reached",
                    active.queue_id,
                    active.codebase,
                    active.suite
                );
                sqlx::query("DELETE FROM queue WHERE id = $1")
                    .bind(active.queue_id)
                    .execute(&mut *tx)
                    .await?;
            }
        } else {
            sqlx::query("DELETE FROM queue WHERE id = $1")
                .bind(active.queue_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Runs silent for longer than the timeout.
    pub async fn stale_runs(
        &self,
        heartbeat_timeout: chrono::Duration,
    ) -> Result<Vec<ActiveRun>, sqlx::Error> {
        sqlx::query_as::<_, ActiveRun>(
            "SELECT id, queue_id, codebase, suite, command, state, worker_name, worker_link, \
             start_time, last_ping, log_position, kill_requested, token \
             FROM active_run \
             WHERE state = 'running' AND last_ping < NOW() - ($1 * interval '1 second')",
        )
        .bind(heartbeat_timeout.num_seconds() as f64)
        .fetch_all(&self.pool)
        .await
    }

    /// Assignments whose handshake window lapsed without worker contact.
    ///
    /// These are rolled back to the queue: the active-run row is deleted
    /// and the still-present queue entry becomes assignable again.
    pub async fn expire_stale_assignments(
        &self,
        handshake_window: chrono::Duration,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM active_run \
             WHERE state = 'assigning' AND start_time < NOW() - ($1 * interval '1 second')",
        )
        .bind(handshake_window.num_seconds() as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Wall-clock timeout per run, from the campaign config.
    pub async fn overdue_runs(
        &self,
        max_duration: chrono::Duration,
    ) -> Result<Vec<ActiveRun>, sqlx::Error> {
        sqlx::query_as::<_, ActiveRun>(
            "SELECT id, queue_id, codebase, suite, command, state, worker_name, worker_link, \
             start_time, last_ping, log_position, kill_requested, token \
             FROM active_run \
             WHERE start_time < NOW() - ($1 * interval '1 second')",
        )
        .bind(max_duration.num_seconds() as f64)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn run_exists(&self, run_id: &str) -> Result<bool, sqlx::Error> {
        Ok(sqlx::query("SELECT 1 FROM run WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    pub async fn get_queue_stats(&self) -> Result<(i64, i64), sqlx::Error> {
        let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue")
            .fetch_one(&self.pool)
            .await?;
        let active: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM active_run")
            .fetch_one(&self.pool)
            .await?;
        Ok((queued, active))
    }

    /// Most recent successful run for the pair, for resume hand-off.
    pub async fn get_resume_run(
        &self,
        codebase: &str,
        campaign: &str,
    ) -> Result<Option<(String, Option<String>, serde_json::Value)>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, branch_url, COALESCE(result, 'null'::json) FROM run \
             WHERE codebase = $1 AND suite = $2 AND result_code = 'success' \
             ORDER BY finish_time DESC LIMIT 1",
        )
        .bind(codebase)
        .bind(campaign)
        .fetch_optional(&self.pool)
        .await
    }

    pub fn queue(&self) -> Queue<'_> {
        Queue::new(&self.pool)
    }

    /// Median wait estimate for the queue introspection endpoint.
    pub async fn estimated_duration_sum(&self) -> Result<Option<chrono::Duration>, sqlx::Error> {
        let interval: Option<PgInterval> =
            sqlx::query_scalar("SELECT SUM(estimated_duration) FROM queue")
                .fetch_one(&self.pool)
                .await?;
        Ok(interval.map(|i| chrono::Duration::microseconds(i.microseconds)))
    }
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Assigning => "assigning",
            RunState::Running => "running",
            RunState::Finishing => "finishing",
        }
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigning" => Ok(RunState::Assigning),
            "running" => Ok(RunState::Running),
            "finishing" => Ok(RunState::Finishing),
            _ => Err(format!("unknown run state: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_round_trip() {
        for state in [RunState::Assigning, RunState::Running, RunState::Finishing] {
            assert_eq!(state.as_str().parse::<RunState>().unwrap(), state);
        }
        assert!("done".parse::<RunState>().is_err());
    }

    #[tokio::test]
    #[ignore = "requires database connection"]
    async fn test_assign_next_empty_queue() {
        let pool = sqlx::PgPool::connect("postgresql://localhost/janitor_test")
            .await
            .unwrap();
        janitor::schema::setup_test_database(&pool).await.unwrap();
        let db = RunnerDatabase::new(pool);
        let result = db
            .assign_next(
                "01hgw27s1qmvp3z9e6e6p06g64",
                "worker-1",
                None,
                "token",
                &["lintian-fixes".to_string()],
                None,
                &HashSet::new(),
                0,
            )
            .await;
        assert!(matches!(result, Err(AssignError::Empty)));
    }
}
