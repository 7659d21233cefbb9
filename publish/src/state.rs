//! Publish-side persistence.

use janitor::publish::{MergeProposalStatus, Mode};
use sqlx::PgPool;
use url::Url;

/// A (run, role) pair the ingestor produced that has not been published
/// yet.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UnpublishedBranch {
    pub role: String,
    pub remote_name: Option<String>,
    pub base_revision: Option<String>,
    pub revision: Option<String>,
}

/// A successful run with unpublished branches.
#[derive(Debug, Clone)]
pub struct PublishReadyRun {
    pub run: janitor::state::Run,
    /// Bucket of the codebase; the campaign bucket applies when unset.
    pub rate_limit_bucket: Option<String>,
    pub unpublished_branches: Vec<UnpublishedBranch>,
}

/// Runs whose branches still need publishing, oldest first.
///
/// A branch is pending while no successful publish row exists for its
/// (run, role, revision) and a push has not absorbed it.
pub async fn iter_publish_ready(
    conn: &PgPool,
    run_id: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<PublishReadyRun>, sqlx::Error> {
    let runs = sqlx::query_as::<_, janitor::state::Run>(
        "SELECT DISTINCT ON (run.finish_time, run.id) \
         run.id, run.command, run.description, run.result_code, run.main_branch_revision, \
         run.revision, run.context, run.result, run.suite, run.instigated_context, \
         run.vcs_type, run.branch_url, run.logfilenames, run.worker_name, \
         run.target_branch_url, run.failure_details, run.failure_transient, \
         run.failure_stage, run.codebase, run.start_time, run.finish_time, run.value \
         FROM run \
         INNER JOIN new_result_branch ON new_result_branch.run_id = run.id \
         WHERE run.result_code = 'success' \
         AND new_result_branch.absorbed IS NOT true \
         AND ($1::text IS NULL OR run.id = $1) \
         AND NOT EXISTS ( \
             SELECT FROM publish WHERE publish.run_id = run.id \
             AND publish.role = new_result_branch.role \
             AND publish.revision = new_result_branch.revision \
             AND publish.result_code = 'success') \
         ORDER BY run.finish_time ASC, run.id \
         LIMIT $2",
    )
    .bind(run_id)
    .bind(limit.unwrap_or(100))
    .fetch_all(conn)
    .await?;

    let mut ready = Vec::with_capacity(runs.len());
    for run in runs {
        let unpublished_branches = sqlx::query_as::<_, UnpublishedBranch>(
            "SELECT role, remote_name, base_revision, revision FROM new_result_branch \
             WHERE run_id = $1 AND absorbed IS NOT true \
             AND NOT EXISTS ( \
                 SELECT FROM publish WHERE publish.run_id = new_result_branch.run_id \
                 AND publish.role = new_result_branch.role \
                 AND publish.revision = new_result_branch.revision \
                 AND publish.result_code = 'success')",
        )
        .bind(&run.id)
        .fetch_all(conn)
        .await?;
        let rate_limit_bucket = sqlx::query_scalar::<_, Option<String>>(
            "SELECT rate_limit_bucket FROM codebase WHERE name = $1",
        )
        .bind(&run.codebase)
        .fetch_optional(conn)
        .await?
        .flatten();
        if !unpublished_branches.is_empty() {
            ready.push(PublishReadyRun {
                run,
                rate_limit_bucket,
                unpublished_branches,
            });
        }
    }
    Ok(ready)
}

/// Record a publish attempt.
///
/// On success the merge-proposal mirror row is upserted (propose) or the
/// branch marked absorbed (push) in the same transaction. Repeating a
/// successful publish for the same (run, role, revision) is a no-op.
#[allow(clippy::too_many_arguments)]
pub async fn store_publish(
    conn: &PgPool,
    codebase: &str,
    branch_name: Option<&str>,
    target_branch_url: Option<&Url>,
    target_branch_web_url: Option<&str>,
    main_branch_revision: Option<&str>,
    revision: Option<&str>,
    role: &str,
    mode: Mode,
    result_code: &str,
    description: &str,
    merge_proposal_url: Option<&Url>,
    publish_id: &str,
    requester: Option<&str>,
    run_id: Option<&str>,
    rate_limit_bucket: Option<&str>,
) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;

    if result_code == "success" {
        if let Some(merge_proposal_url) = merge_proposal_url {
            assert_eq!(mode, Mode::Propose);
            sqlx::query(
                "INSERT INTO merge_proposal (url, web_url, status, revision, last_scanned, target_branch_url, codebase, rate_limit_bucket) \
                 VALUES ($1, $2, 'open', $3, NOW(), $4, $5, $6) \
                 ON CONFLICT (url) DO UPDATE SET revision = EXCLUDED.revision, \
                 last_scanned = EXCLUDED.last_scanned, \
                 target_branch_url = EXCLUDED.target_branch_url, \
                 codebase = EXCLUDED.codebase",
            )
            .bind(merge_proposal_url.to_string())
            .bind(target_branch_web_url)
            .bind(revision)
            .bind(target_branch_url.map(|u| u.to_string()))
            .bind(codebase)
            .bind(rate_limit_bucket)
            .execute(&mut *tx)
            .await?;
        } else {
            assert!(revision.is_some());
            assert!([Mode::Push, Mode::PushDerived].contains(&mode));
            assert!(run_id.is_some());
            if mode == Mode::Push {
                sqlx::query(
                    "UPDATE new_result_branch SET absorbed = true WHERE run_id = $1 AND role = $2",
                )
                .bind(run_id)
                .bind(role)
                .execute(&mut *tx)
                .await?;
            }
        }
    }

    sqlx::query(
        "INSERT INTO publish (id, run_id, role, codebase, branch_name, mode, result_code, \
         description, main_branch_revision, revision, merge_proposal_url, target_branch_url, \
         target_branch_web_url, requester) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
         ON CONFLICT (run_id, role, revision) WHERE result_code = 'success' DO NOTHING",
    )
    .bind(publish_id)
    .bind(run_id)
    .bind(role)
    .bind(codebase)
    .bind(branch_name)
    .bind(mode.to_string())
    .bind(result_code)
    .bind(description)
    .bind(main_branch_revision)
    .bind(revision)
    .bind(merge_proposal_url.map(|u| u.to_string()))
    .bind(target_branch_url.map(|u| u.to_string()))
    .bind(target_branch_web_url)
    .bind(requester)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Whether a successful publish of this revision to this branch already
/// happened in one of the given modes.
pub async fn already_published(
    conn: &PgPool,
    target_branch_url: &Url,
    branch_name: &str,
    revision: &str,
    modes: &[Mode],
) -> Result<bool, sqlx::Error> {
    let modes = modes.iter().map(|m| m.to_string()).collect::<Vec<_>>();
    let row = sqlx::query(
        "SELECT 1 FROM publish WHERE mode = ANY($1::text[]) AND revision = $2 \
         AND target_branch_url = $3 AND branch_name = $4 AND result_code = 'success'",
    )
    .bind(modes)
    .bind(revision)
    .bind(target_branch_url.to_string())
    .bind(branch_name)
    .fetch_optional(conn)
    .await?;
    Ok(row.is_some())
}

/// Open proposal for a codebase branch, if any.
pub async fn get_open_merge_proposal(
    conn: &PgPool,
    codebase: &str,
    branch_name: &str,
) -> Result<Option<(String, Url)>, sqlx::Error> {
    let row: Option<(String, String)> = sqlx::query_as(
        r#"
SELECT
    merge_proposal.revision,
    merge_proposal.url
FROM
    merge_proposal
INNER JOIN publish ON merge_proposal.url = publish.merge_proposal_url
WHERE
    merge_proposal.status = 'open' AND
    merge_proposal.codebase = $1 AND
    publish.branch_name = $2
ORDER BY timestamp DESC
"#,
    )
    .bind(codebase)
    .bind(branch_name)
    .fetch_optional(conn)
    .await?;

    row.map(|(revision, url)| {
        Ok((
            revision,
            Url::parse(&url).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        ))
    })
    .transpose()
}

/// When this campaign/codebase pair last published successfully.
pub async fn check_last_published(
    conn: &PgPool,
    campaign: &str,
    codebase: &str,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, sqlx::Error> {
    let row: Option<(Option<chrono::DateTime<chrono::Utc>>,)> = sqlx::query_as(
        r#"
SELECT timestamp FROM publish LEFT JOIN run ON run.id = publish.run_id
WHERE run.suite = $1 AND run.codebase = $2 AND publish.result_code = 'success'
ORDER BY timestamp DESC LIMIT 1
"#,
    )
    .bind(campaign)
    .bind(codebase)
    .fetch_optional(conn)
    .await?;
    Ok(row.and_then(|(timestamp,)| timestamp))
}

/// Locally-mirrored merge proposal row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MergeProposalRow {
    pub url: String,
    pub web_url: Option<String>,
    pub codebase: Option<String>,
    pub status: String,
    pub revision: Option<String>,
    pub target_branch_url: Option<String>,
    pub last_scanned: Option<chrono::DateTime<chrono::Utc>>,
    pub rate_limit_bucket: Option<String>,
}

/// Open proposals that have not been scanned since the cutoff.
pub async fn iter_proposals_to_scan(
    conn: &PgPool,
    cutoff: chrono::DateTime<chrono::Utc>,
    limit: i64,
) -> Result<Vec<MergeProposalRow>, sqlx::Error> {
    sqlx::query_as::<_, MergeProposalRow>(
        "SELECT url, web_url, codebase, status, revision, target_branch_url, last_scanned, \
         rate_limit_bucket \
         FROM merge_proposal \
         WHERE status = 'open' AND (last_scanned IS NULL OR last_scanned < $1) \
         ORDER BY last_scanned ASC NULLS FIRST LIMIT $2",
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(conn)
    .await
}

/// Apply a scan observation to the local mirror atomically.
pub async fn update_proposal_status(
    conn: &PgPool,
    url: &str,
    status: MergeProposalStatus,
    merged_by: Option<&str>,
    merged_at: Option<chrono::DateTime<chrono::Utc>>,
    revision: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE merge_proposal SET status = $2, merged_by = $3, merged_at = $4, \
         revision = COALESCE($5, revision), last_scanned = NOW() WHERE url = $1",
    )
    .bind(url)
    .bind(status.to_string())
    .bind(merged_by)
    .bind(merged_at)
    .bind(revision)
    .execute(conn)
    .await?;
    Ok(())
}

/// Bump only the scan time, when the proposal state is unchanged.
pub async fn touch_proposal(conn: &PgPool, url: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE merge_proposal SET last_scanned = NOW() WHERE url = $1")
        .bind(url)
        .execute(conn)
        .await?;
    Ok(())
}

/// Proposal counts per (status, bucket), feeding the rate limiters.
pub async fn get_merge_proposal_counts(
    conn: &PgPool,
) -> Result<Vec<(String, String, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (String, String, i64)>(
        r#"
SELECT
COALESCE(rate_limit_bucket, 'default') AS rate_limit_bucket,
status AS status,
count(*) AS c
FROM merge_proposal
GROUP BY 1, 2
"#,
    )
    .fetch_all(conn)
    .await
}

/// The run a proposal was created from, recovered through the publish
/// table.
pub async fn get_proposal_run(
    conn: &PgPool,
    proposal_url: &str,
) -> Result<Option<janitor::state::Run>, sqlx::Error> {
    sqlx::query_as::<_, janitor::state::Run>(
        "SELECT run.id, run.command, run.description, run.result_code, \
         run.main_branch_revision, run.revision, run.context, run.result, run.suite, \
         run.instigated_context, run.vcs_type, run.branch_url, run.logfilenames, \
         run.worker_name, run.target_branch_url, run.failure_details, \
         run.failure_transient, run.failure_stage, run.codebase, run.start_time, \
         run.finish_time, run.value \
         FROM run \
         INNER JOIN publish ON publish.run_id = run.id \
         WHERE publish.merge_proposal_url = $1 \
         ORDER BY publish.timestamp DESC LIMIT 1",
    )
    .bind(proposal_url)
    .fetch_optional(conn)
    .await
}
