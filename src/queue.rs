use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use sqlx::postgres::types::PgInterval;
use sqlx::{Error, FromRow, PgPool, Row};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

#[derive(Debug, FromRow)]
pub struct QueueItem {
    pub id: i32,
    pub context: Option<String>,
    pub command: Option<String>,
    pub estimated_duration: Option<PgInterval>,
    pub campaign: String,
    pub refresh: bool,
    pub requester: Option<String>,
    pub codebase: String,
    pub bucket: String,
    pub attempt_count: i32,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for QueueItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

pub struct Queue<'a> {
    pool: &'a PgPool,
}

#[derive(FromRow)]
pub struct ETA {
    pub position: i64,
    pub wait_time: PgInterval,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, Default)]
pub struct VcsInfo {
    pub branch_url: Option<String>,
    pub subpath: Option<String>,
    pub vcs_type: Option<String>,
}

const QUEUE_ITEM_COLUMNS: &str = "queue.id, queue.context, queue.command, \
     queue.estimated_duration, queue.suite AS campaign, queue.refresh, queue.requester, \
     queue.codebase, queue.bucket, queue.attempt_count";

impl<'a> Queue<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Queue { pool }
    }

    pub async fn get_position(&self, campaign: &str, codebase: &str) -> Result<Option<ETA>, Error> {
        let row: Option<ETA> = sqlx::query_as::<_, ETA>(
            "SELECT position, wait_time FROM queue_positions WHERE codebase = $1 AND suite = $2",
        )
        .bind(codebase)
        .bind(campaign)
        .fetch_optional(self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_item(&self, queue_id: i32) -> Result<Option<QueueItem>, Error> {
        let row = sqlx::query_as::<_, QueueItem>(&format!(
            "SELECT {} FROM queue WHERE id = $1",
            QUEUE_ITEM_COLUMNS
        ))
        .bind(queue_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row)
    }

    /// Return the next `limit` queue entries in scheduling order, without
    /// removing them.
    pub async fn peek(&self, limit: i64) -> Result<Vec<QueueItem>, Error> {
        sqlx::query_as::<_, QueueItem>(&format!(
            "SELECT {} FROM queue \
             ORDER BY queue.bucket ASC, queue.priority ASC, queue.id ASC, \
                      hashtext(queue.codebase) ASC \
             LIMIT $1",
            QUEUE_ITEM_COLUMNS
        ))
        .bind(limit)
        .fetch_all(self.pool)
        .await
    }

    /// Get the next item in the queue that is not assigned to any worker.
    ///
    /// Entries are skipped when another active run exists for the same
    /// codebase, when the codebase finished a run less than
    /// `cooldown_seconds` ago, or when the branch host is excluded.
    ///
    /// # Arguments
    /// * `campaign` - The campaign to filter by
    /// * `exclude_hosts` - A set of VCS URL hosts to exclude
    /// * `assigned_queue_items` - Queue items that are already assigned
    /// * `cooldown_seconds` - Per-codebase cooldown; 0 disables
    pub async fn next_item(
        &self,
        campaign: Option<&str>,
        exclude_hosts: Option<HashSet<String>>,
        assigned_queue_items: Option<HashSet<i32>>,
        cooldown_seconds: u64,
    ) -> Result<(Option<QueueItem>, Option<VcsInfo>), Error> {
        let query = format!(
            "SELECT {}, codebase.vcs_type AS vcs_type, codebase.branch_url, codebase.subpath \
             FROM queue \
             LEFT JOIN codebase ON codebase.name = queue.codebase \
             WHERE NOT EXISTS ( \
                 SELECT FROM active_run WHERE active_run.codebase = queue.codebase) \
             AND NOT EXISTS ( \
                 SELECT FROM run WHERE run.codebase = queue.codebase \
                 AND run.finish_time > NOW() - ($1 * interval '1 second')) \
             AND NOT (queue.id = ANY($2::int[])) \
             AND ($3::text IS NULL OR queue.suite = $3) \
             AND NOT (codebase.branch_url IS NOT NULL AND \
                 SUBSTRING(codebase.branch_url from '.*://(?:[^/@]*@)?([^/]*)') = ANY($4::text[])) \
             ORDER BY queue.bucket ASC, queue.priority ASC, queue.id ASC, \
                      hashtext(queue.codebase) ASC LIMIT 1",
            QUEUE_ITEM_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(cooldown_seconds as f64)
            .bind(
                assigned_queue_items
                    .unwrap_or_default()
                    .into_iter()
                    .collect::<Vec<_>>(),
            )
            .bind(campaign)
            .bind(
                exclude_hosts
                    .unwrap_or_default()
                    .into_iter()
                    .collect::<Vec<_>>(),
            )
            .fetch_optional(self.pool)
            .await?;

        if let Some(row) = row {
            let vcs_info = VcsInfo::from_row(&row)?;
            let queue_item: QueueItem = QueueItem::from_row(&row)?;

            Ok((Some(queue_item), Some(vcs_info)))
        } else {
            Ok((None, None))
        }
    }

    /// Add or refresh a queue entry.
    ///
    /// Idempotent per (codebase, campaign). An existing entry only moves to
    /// a better (bucket, priority); it is never demoted while waiting.
    #[allow(clippy::too_many_arguments)]
    pub async fn add(
        &self,
        codebase: &str,
        command: &str,
        campaign: &str,
        offset: f64,
        bucket: &str,
        context: Option<&str>,
        estimated_duration: Option<TimeDelta>,
        refresh: bool,
        requester: Option<&str>,
        attempt_count: i32,
    ) -> Result<(i32, String), Error> {
        let row = sqlx::query(
            "INSERT INTO queue (command, priority, bucket, context, estimated_duration, suite, refresh, requester, codebase, attempt_count)
             VALUES ($1, (SELECT COALESCE(MIN(priority), 0) FROM queue) + $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (codebase, suite)
             DO UPDATE SET context = EXCLUDED.context,
                           priority = EXCLUDED.priority,
                           bucket = EXCLUDED.bucket,
                           estimated_duration = EXCLUDED.estimated_duration,
                           refresh = EXCLUDED.refresh,
                           requester = EXCLUDED.requester,
                           command = EXCLUDED.command,
                           attempt_count = EXCLUDED.attempt_count
             WHERE queue.bucket > EXCLUDED.bucket OR
                   (queue.bucket = EXCLUDED.bucket AND queue.priority >= EXCLUDED.priority)
             RETURNING id, bucket"
        )
        .bind(command)
        .bind(offset)
        .bind(bucket)
        .bind(context)
        .bind(estimated_duration.and_then(|d| PgInterval::try_from(d).ok()))
        .bind(campaign)
        .bind(refresh)
        .bind(requester)
        .bind(codebase)
        .bind(attempt_count)
        .fetch_optional(self.pool)
        .await?;

        if let Some(row) = row {
            let id: i32 = row.try_get("id")?;
            let bucket: String = row.try_get("bucket")?;
            Ok((id, bucket))
        } else {
            // The conflict guard declined the update; report the entry that
            // kept its slot.
            let row =
                sqlx::query("SELECT id, bucket FROM queue WHERE codebase = $1 AND suite = $2")
                    .bind(codebase)
                    .bind(campaign)
                    .fetch_one(self.pool)
                    .await?;
            let id: i32 = row.try_get("id")?;
            let bucket: String = row.try_get("bucket")?;
            Ok((id, bucket))
        }
    }

    /// Remove a queue entry; used by administrative cancel.
    pub async fn drop_item(&self, queue_id: i32) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM queue WHERE id = $1")
            .bind(queue_id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_buckets(&self) -> Result<Vec<(String, i64)>, Error> {
        let rows =
            sqlx::query("SELECT bucket, count(*) FROM queue GROUP BY bucket ORDER BY bucket ASC")
                .fetch_all(self.pool)
                .await?;

        rows.into_iter()
            .map(|row| {
                let bucket: String = row.try_get("bucket")?;
                let count: i64 = row.try_get("count")?;
                Ok((bucket, count))
            })
            .collect()
    }
}
