use crate::publish::Mode;
use crate::queue::Queue;
use chrono::Duration;
use sqlx::postgres::types::PgInterval;
use sqlx::PgPool;
use std::collections::HashMap;

pub const FIRST_RUN_BONUS: f64 = 100.0;

// Default estimation if there is no median for the campaign or the codebase.
pub const DEFAULT_ESTIMATED_DURATION: i64 = 15;
pub const DEFAULT_SCHEDULE_OFFSET: f64 = -1.0;

fn publish_mode_value(mode: &Mode) -> usize {
    match mode {
        Mode::Skip => 0,
        Mode::BuildOnly => 0,
        Mode::Push => 500,
        Mode::Propose => 400,
        Mode::AttemptPush => 450,
        Mode::PushDerived => 200,
    }
}

/// How a finished run with a given result code feeds back into the queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReschedulePolicy {
    /// Delay before the pair becomes eligible again.
    pub requeue_delay: Duration,
    /// Attempts after which the pair is dropped instead of re-queued.
    pub max_attempts: Option<i32>,
    /// Bucket the requeued entry lands in.
    pub bucket: &'static str,
}

/// Failure-classification table: result code to reschedule policy.
///
/// Unknown result codes get the internal-error treatment.
pub fn reschedule_policy(result_code: &str) -> ReschedulePolicy {
    match result_code {
        "success" => ReschedulePolicy {
            requeue_delay: Duration::days(7),
            max_attempts: None,
            bucket: "update-existing-mp",
        },
        "success-unchanged" | "nothing-to-do" => ReschedulePolicy {
            requeue_delay: Duration::days(30),
            max_attempts: None,
            bucket: "reschedule",
        },
        "build-failed" | "missing-dependency" => ReschedulePolicy {
            requeue_delay: Duration::days(3),
            max_attempts: Some(10),
            bucket: "reschedule",
        },
        "branch-unavailable" => ReschedulePolicy {
            requeue_delay: Duration::days(90),
            max_attempts: Some(3),
            bucket: "missing-deps",
        },
        "worker-failure" | "worker-timeout" => ReschedulePolicy {
            requeue_delay: Duration::minutes(30),
            max_attempts: Some(5),
            bucket: "reschedule",
        },
        _ => ReschedulePolicy {
            requeue_delay: Duration::hours(1),
            max_attempts: Some(5),
            bucket: "reschedule",
        },
    }
}

#[derive(sqlx::FromRow)]
pub struct ScheduleRequest {
    pub codebase: String,
    pub campaign: String,
    pub context: Option<String>,
    pub value: i64,
    pub success_chance: f64,
    pub command: String,
}

/// Read the candidate set, joined with the per-campaign publish policy so
/// the candidate value reflects how visible a success would be.
pub async fn iter_schedule_requests_from_candidates(
    conn: &PgPool,
    config: &crate::config::Config,
    codebases: Option<Vec<&str>>,
    campaign: Option<&str>,
) -> Result<Vec<ScheduleRequest>, sqlx::Error> {
    let mut query = sqlx::QueryBuilder::new(
        r###"
SELECT
  codebase.name AS codebase,
  candidate.suite AS campaign,
  candidate.context AS context,
  COALESCE(candidate.value, 0)::bigint AS value,
  COALESCE(candidate.success_chance, 1.0)::float8 AS success_chance,
  candidate.command AS command
FROM candidate
INNER JOIN codebase ON codebase.name = candidate.codebase
WHERE codebase.inactive IS NOT true
"###,
    );
    if let Some(codebases) = codebases {
        query.push(" AND codebase.name = ANY(");
        query.push_bind(codebases);
        query.push("::text[])");
    }
    if let Some(campaign) = campaign {
        query.push(" AND candidate.suite = ");
        query.push_bind(campaign);
    }

    let rows = query.build().fetch_all(conn).await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            use sqlx::FromRow;
            let mut req = ScheduleRequest::from_row(&row).ok()?;
            if let Some(campaign) = config.get_campaign(&req.campaign) {
                req.value += publish_mode_value(&campaign.default_mode) as i64;
                req.value += campaign
                    .publish
                    .iter()
                    .map(|p| publish_mode_value(&p.mode))
                    .sum::<usize>() as i64;
            }
            Some(req)
        })
        .collect())
}

async fn estimate_duration_campaign_codebase(
    conn: &PgPool,
    codebase: Option<&str>,
    campaign: Option<&str>,
) -> Result<Option<Duration>, sqlx::Error> {
    let mut query = sqlx::QueryBuilder::new(
        r###"
SELECT AVG(finish_time - start_time) FROM run
WHERE failure_transient is not True
"###,
    );
    if let Some(codebase) = codebase {
        query.push(" AND codebase = ");
        query.push_bind(codebase);
    }
    if let Some(campaign) = campaign {
        query.push(" AND suite = ");
        query.push_bind(campaign);
    }
    let query = query.build_query_scalar::<Option<PgInterval>>();
    let duration: Option<Option<PgInterval>> = query.fetch_optional(conn).await?;
    Ok(duration
        .flatten()
        .map(|d| Duration::microseconds(d.microseconds)))
}

/// Estimate the duration of a run of a campaign against a codebase.
pub async fn estimate_duration(
    conn: &PgPool,
    codebase: &str,
    campaign: &str,
) -> Result<Duration, sqlx::Error> {
    if let Some(estimated_duration) =
        estimate_duration_campaign_codebase(conn, Some(codebase), Some(campaign)).await?
    {
        Ok(estimated_duration)
    } else if let Some(estimated_duration) =
        estimate_duration_campaign_codebase(conn, Some(codebase), None).await?
    {
        Ok(estimated_duration)
    } else if let Some(estimated_duration) =
        estimate_duration_campaign_codebase(conn, None, Some(campaign)).await?
    {
        Ok(estimated_duration)
    } else {
        Ok(Duration::seconds(DEFAULT_ESTIMATED_DURATION))
    }
}

async fn estimate_success_probability_and_duration(
    conn: &PgPool,
    codebase: &str,
    campaign: &str,
    context: Option<&str>,
) -> Result<(f64, Duration, usize), sqlx::Error> {
    let mut total = 0;
    let mut success = 0;
    let mut same_context_multiplier = if context.is_none() { 0.5 } else { 1.0 };
    let mut durations = vec![];

    #[derive(sqlx::FromRow)]
    struct PriorRun {
        result_code: String,
        instigated_context: Option<String>,
        context: Option<String>,
        duration: PgInterval,
        start_time: chrono::DateTime<chrono::Utc>,
    }

    // Some results are expected to clear up on their own; ignore them when
    // guessing whether a future run will succeed.
    fn ignore_result_code(run: &PriorRun) -> bool {
        match run.result_code.as_str() {
            "worker-failure" => (chrono::Utc::now() - run.start_time).num_days() > 0,
            _ => false,
        }
    }

    let query = sqlx::query_as::<_, PriorRun>(
        r#"
SELECT
  result_code, instigated_context, context,
  finish_time - start_time AS duration,
  start_time
FROM run
WHERE codebase = $1 AND suite = $2 AND failure_transient IS NOT True
ORDER BY start_time DESC
"#,
    );
    for run in query
        .bind(codebase)
        .bind(campaign)
        .fetch_all(conn)
        .await?
        .iter()
    {
        if ignore_result_code(run) {
            continue;
        }

        durations.push(run.duration.microseconds / (1000 * 1000));
        total += 1;
        if run.result_code == "success" {
            success += 1;
        }
        let same_context = context != Some("")
            && context.is_some()
            && [run.instigated_context.as_deref(), run.context.as_deref()].contains(&context);
        if same_context {
            same_context_multiplier = 0.1;
        }
    }

    let estimated_duration = if total == 0 {
        // With no previous runs it doesn't matter that we don't know the
        // context.
        same_context_multiplier = 1.0;

        estimate_duration(conn, codebase, campaign).await?
    } else {
        Duration::seconds(durations.iter().sum::<i64>() / durations.len() as i64)
    };

    Ok((
        (((success * 10 + 1) as f64 / (total * 10 + 1) as f64) * same_context_multiplier),
        estimated_duration,
        total,
    ))
}

// Overhead of doing a run; estimated to be roughly 20s
pub const MINIMUM_COST: f64 = 20000.0;
pub const MINIMUM_NORMALIZED_CODEBASE_VALUE: f64 = 0.1;
pub const DEFAULT_NORMALIZED_CODEBASE_VALUE: f64 = 0.5;

fn calculate_offset(
    estimated_duration: Duration,
    normalized_codebase_value: Option<f64>,
    estimated_probability_of_success: f64,
    candidate_value: Option<f64>,
    total_previous_runs: usize,
) -> f64 {
    let normalized_codebase_value =
        normalized_codebase_value.unwrap_or(DEFAULT_NORMALIZED_CODEBASE_VALUE);

    let normalized_codebase_value =
        f64::max(MINIMUM_NORMALIZED_CODEBASE_VALUE, normalized_codebase_value);

    let candidate_value = candidate_value.map_or(1.0, |v| {
        if total_previous_runs == 0 {
            v + FIRST_RUN_BONUS
        } else {
            v
        }
    });
    let candidate_value = f64::max(candidate_value, MINIMUM_NORMALIZED_CODEBASE_VALUE);

    assert!(
        (0.0..=1.0).contains(&estimated_probability_of_success),
        "Probability of success: {}",
        estimated_probability_of_success
    );

    // Estimated cost of doing the run, in milliseconds
    let estimated_cost = MINIMUM_COST
        + (1000.0 * (estimated_duration.num_seconds() as f64)
            + ((estimated_duration.num_microseconds().unwrap_or(0) as f64) / 1000.0));

    let estimated_value =
        normalized_codebase_value * estimated_probability_of_success * candidate_value;
    assert!(estimated_value > 0.0, "Estimated value: normalized_codebase_value({}) * estimated_probability_of_success({}) * candidate_value({})", normalized_codebase_value, estimated_probability_of_success, candidate_value);

    log::debug!(
        "normalized_codebase_value({}) * probability_of_success({}) * candidate_value({}) = estimated_value({}), estimated cost ({})",
        normalized_codebase_value,
        estimated_probability_of_success,
        candidate_value,
        estimated_value,
        estimated_cost,
    );

    estimated_cost / estimated_value
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No candidate available for {campaign} on {codebase}")]
    CandidateUnavailable { campaign: String, codebase: String },
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
}

#[allow(clippy::too_many_arguments)]
async fn do_schedule_regular(
    conn: &PgPool,
    codebase: &str,
    campaign: &str,
    command: Option<&str>,
    candidate_value: Option<f64>,
    mut normalized_codebase_value: Option<f64>,
    requester: Option<&str>,
    default_offset: f64,
    context: Option<&str>,
    dry_run: bool,
    refresh: bool,
    bucket: Option<&str>,
) -> Result<(f64, Duration, i32, String), Error> {
    let (candidate_value, command, context) = if candidate_value.is_none() || command.is_none() {
        let candidate = sqlx::query_as::<_, (Option<i32>, String, Option<String>)>(
            "SELECT value, command, context FROM candidate WHERE codebase = $1 AND suite = $2",
        )
        .bind(codebase)
        .bind(campaign)
        .fetch_optional(conn)
        .await?;
        let candidate = candidate.ok_or_else(|| Error::CandidateUnavailable {
            campaign: campaign.to_string(),
            codebase: codebase.to_string(),
        })?;
        (
            candidate_value.or(candidate.0.map(|v| v as f64)),
            command.unwrap_or(&candidate.1).to_owned(),
            context
                .map(|s| s.to_string())
                .or(candidate.2),
        )
    } else {
        (
            candidate_value,
            command.unwrap().to_string(),
            context.map(|s| s.to_owned()),
        )
    };

    let (estimated_probability_of_success, estimated_duration, total_previous_runs) =
        estimate_success_probability_and_duration(conn, codebase, campaign, context.as_deref())
            .await?;

    if normalized_codebase_value.is_none() {
        normalized_codebase_value = sqlx::query_scalar::<_, f64>(
            "select coalesce(least(1.0 * value / (select max(value) from codebase), 1.0), 1.0)::float8 from codebase WHERE name = $1").bind(codebase).fetch_optional(conn).await?
    }

    let offset = calculate_offset(
        estimated_duration,
        normalized_codebase_value,
        estimated_probability_of_success,
        candidate_value,
        total_previous_runs,
    );
    let offset = default_offset + offset;
    let bucket = bucket.unwrap_or("default");
    let requester = requester.unwrap_or("scheduler");

    let (queue_id, bucket): (i32, String) = if !dry_run {
        let queue = Queue::new(conn);
        queue
            .add(
                codebase,
                &command,
                campaign,
                offset,
                bucket,
                context.as_deref(),
                Some(estimated_duration),
                refresh,
                Some(requester),
                0,
            )
            .await?
    } else {
        (-1, bucket.to_owned())
    };
    log::debug!(
        "Scheduled {} ({}) with offset {}",
        codebase,
        campaign,
        offset
    );
    Ok((offset, estimated_duration, queue_id, bucket))
}

/// Recompute queue entries for a batch of candidates.
pub async fn bulk_add_to_queue(
    conn: &PgPool,
    todo: &[ScheduleRequest],
    dry_run: bool,
    default_offset: f64,
    bucket: Option<&str>,
    requester: Option<&str>,
    refresh: bool,
) -> Result<(), Error> {
    let bucket = bucket.unwrap_or("default");
    let mut codebase_values = sqlx::query_as::<_, (String, f64)>(
        "SELECT name, coalesce(value, 0)::float8 FROM codebase WHERE name IS NOT NULL",
    )
    .fetch_all(conn)
    .await?
    .into_iter()
    .collect::<HashMap<_, _>>();
    let max_codebase_value = codebase_values
        .values()
        .copied()
        .max_by(|a, b| a.partial_cmp(b).unwrap());
    if let Some(max_codebase_value) = max_codebase_value.filter(|&v| v > 0.0) {
        log::info!("Maximum value: {}", max_codebase_value);
    }
    for req in todo {
        let normalized_codebase_value = match max_codebase_value.filter(|&v| v > 0.0) {
            Some(max_codebase_value) => f64::min(
                codebase_values.remove(&req.codebase).unwrap_or(0.0) / max_codebase_value,
                1.0,
            ),
            None => 1.0,
        };
        do_schedule_regular(
            conn,
            &req.codebase,
            &req.campaign,
            Some(&req.command),
            Some(req.value as f64),
            Some(normalized_codebase_value),
            requester,
            default_offset,
            req.context.as_deref(),
            dry_run,
            refresh,
            Some(bucket),
        )
        .await?;
    }

    Ok(())
}

/// Schedule a control run: refresh the codebase state without running a
/// campaign command. Takes the same path as regular scheduling but skips
/// the candidate lookup.
pub async fn do_schedule_control(
    conn: &PgPool,
    codebase: &str,
    main_branch_revision: Option<&str>,
    offset: Option<f64>,
    refresh: bool,
    bucket: Option<&str>,
    requester: Option<&str>,
    estimated_duration: Option<Duration>,
) -> Result<(f64, Duration, i32, String), Error> {
    let mut command = vec!["brz".to_owned(), "up".to_owned()];
    if let Some(main_branch_revision) = main_branch_revision {
        command.push(format!("--revision={}", main_branch_revision));
    }
    let bucket = bucket.unwrap_or("control");
    let command = shlex::try_join(command.iter().map(|x| x.as_str()).collect::<Vec<_>>())
        .expect("command parts are shell-safe");
    do_schedule(
        conn,
        "control",
        codebase,
        bucket,
        offset,
        refresh,
        requester,
        estimated_duration,
        Some(&command),
    )
    .await
}

/// Insert or refresh a queue entry for one (codebase, campaign) pair.
///
/// Administrative requests come through here and bypass the assignment
/// cooldown; the default offset puts them near the front of their bucket.
#[allow(clippy::too_many_arguments)]
pub async fn do_schedule(
    conn: &PgPool,
    campaign: &str,
    codebase: &str,
    bucket: &str,
    offset: Option<f64>,
    refresh: bool,
    requester: Option<&str>,
    estimated_duration: Option<Duration>,
    command: Option<&str>,
) -> Result<(f64, Duration, i32, String), Error> {
    let offset = offset.unwrap_or(DEFAULT_SCHEDULE_OFFSET);
    let command = if let Some(command) = command {
        command.to_string()
    } else {
        let candidate: Option<(String,)> =
            sqlx::query_as("SELECT command FROM candidate WHERE codebase = $1 AND suite = $2")
                .bind(codebase)
                .bind(campaign)
                .fetch_optional(conn)
                .await?;
        match candidate {
            Some((command,)) => command,
            None => {
                return Err(Error::CandidateUnavailable {
                    campaign: campaign.to_owned(),
                    codebase: codebase.to_owned(),
                })
            }
        }
    };
    let estimated_duration = if let Some(estimated_duration) = estimated_duration {
        estimated_duration
    } else {
        estimate_duration(conn, codebase, campaign).await?
    };
    let queue = Queue::new(conn);
    let (queue_id, bucket) = queue
        .add(
            codebase,
            &command,
            campaign,
            offset,
            bucket,
            None,
            Some(estimated_duration),
            refresh,
            requester,
            0,
        )
        .await?;
    Ok((offset, estimated_duration, queue_id, bucket))
}

/// Feed a finished run back into the queue according to the
/// failure-classification table.
///
/// Returns the new queue id, or None when the attempt cap was reached or
/// the code maps to no further work.
pub async fn reschedule_from_run(
    conn: &PgPool,
    codebase: &str,
    campaign: &str,
    command: Option<&str>,
    result_code: &str,
    attempt_count: i32,
    requester: Option<&str>,
) -> Result<Option<i32>, Error> {
    let policy = reschedule_policy(result_code);
    if let Some(max_attempts) = policy.max_attempts {
        if attempt_count >= max_attempts {
            log::info!(
                "Not rescheduling {}/{}: attempt cap ({}) reached for {}",
                codebase,
                campaign,
                max_attempts,
                result_code
            );
            return Ok(None);
        }
    }
    let offset = policy.requeue_delay.num_seconds() as f64 / 60.0;
    let estimated_duration = estimate_duration(conn, codebase, campaign).await?;
    let queue = Queue::new(conn);
    let command = match command {
        Some(command) => command.to_string(),
        None => {
            let candidate: Option<(String,)> =
                sqlx::query_as("SELECT command FROM candidate WHERE codebase = $1 AND suite = $2")
                    .bind(codebase)
                    .bind(campaign)
                    .fetch_optional(conn)
                    .await?;
            match candidate {
                Some((command,)) => command,
                None => return Ok(None),
            }
        }
    };
    let (queue_id, _bucket) = queue
        .add(
            codebase,
            &command,
            campaign,
            offset,
            policy.bucket,
            None,
            Some(estimated_duration),
            false,
            requester,
            attempt_count + 1,
        )
        .await?;
    Ok(Some(queue_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_offset_prefers_probable_success() {
        let cheap = calculate_offset(Duration::seconds(30), Some(1.0), 1.0, Some(100.0), 1);
        let unlikely = calculate_offset(Duration::seconds(30), Some(1.0), 0.1, Some(100.0), 1);
        assert!(cheap < unlikely);
    }

    #[test]
    fn test_calculate_offset_first_run_bonus() {
        let first = calculate_offset(Duration::seconds(30), Some(1.0), 0.5, Some(10.0), 0);
        let later = calculate_offset(Duration::seconds(30), Some(1.0), 0.5, Some(10.0), 3);
        assert!(first < later);
    }

    #[test]
    fn test_reschedule_policy_table() {
        assert_eq!(reschedule_policy("success").max_attempts, None);
        assert_eq!(reschedule_policy("build-failed").max_attempts, Some(10));
        assert_eq!(
            reschedule_policy("worker-timeout").requeue_delay,
            Duration::minutes(30)
        );
        // Unknown codes fall back to the internal-error treatment.
        assert_eq!(reschedule_policy("internal-error").max_attempts, Some(5));
        assert_eq!(reschedule_policy("???").max_attempts, Some(5));
    }

    #[test]
    fn test_publish_mode_value_ordering() {
        assert!(publish_mode_value(&Mode::Push) > publish_mode_value(&Mode::Propose));
        assert_eq!(publish_mode_value(&Mode::Skip), 0);
    }
}
