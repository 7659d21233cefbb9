use crate::config::Config;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Pool, Postgres};

/// Create a connection pool to the database.
///
/// # Arguments
/// * `config` - The configuration to use for the database connection
///
/// # Returns
/// A connection pool to the database
pub async fn create_pool(config: &Config) -> Result<Pool<Postgres>, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
}

/// Immutable record of a completed attempt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Run {
    pub id: String,
    pub command: Option<String>,
    pub description: Option<String>,
    pub result_code: String,
    pub main_branch_revision: Option<String>,
    pub revision: Option<String>,
    pub context: Option<String>,
    pub result: Option<serde_json::Value>,
    pub suite: String,
    pub instigated_context: Option<String>,
    pub vcs_type: Option<String>,
    pub branch_url: Option<String>,
    pub logfilenames: Option<Vec<String>>,
    pub worker_name: Option<String>,
    pub target_branch_url: Option<String>,
    pub failure_details: Option<serde_json::Value>,
    pub failure_transient: Option<bool>,
    pub failure_stage: Option<String>,
    pub codebase: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub finish_time: chrono::DateTime<chrono::Utc>,
    pub value: Option<i32>,
}

impl PartialEq for Run {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Run {
    pub fn duration(&self) -> chrono::Duration {
        self.finish_time - self.start_time
    }
}

const RUN_COLUMNS: &str = "id, command, description, result_code, main_branch_revision, revision, \
     context, result, suite, instigated_context, vcs_type, branch_url, logfilenames, worker_name, \
     target_branch_url, failure_details, failure_transient, failure_stage, codebase, \
     start_time, finish_time, value";

/// Fetch a single run by id.
pub async fn get_run(conn: &PgPool, run_id: &str) -> Result<Option<Run>, sqlx::Error> {
    sqlx::query_as::<_, Run>(&format!("SELECT {} FROM run WHERE id = $1", RUN_COLUMNS))
        .bind(run_id)
        .fetch_optional(conn)
        .await
}

/// Fetch the most recent run for a (codebase, campaign) pair.
pub async fn get_last_run(
    conn: &PgPool,
    codebase: &str,
    campaign: &str,
) -> Result<Option<Run>, sqlx::Error> {
    sqlx::query_as::<_, Run>(&format!(
        "SELECT {} FROM run WHERE codebase = $1 AND suite = $2 ORDER BY start_time DESC LIMIT 1",
        RUN_COLUMNS
    ))
    .bind(codebase)
    .bind(campaign)
    .fetch_optional(conn)
    .await
}

/// A unit of upstream source tracked by the platform.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize, serde::Deserialize)]
pub struct Codebase {
    pub name: String,
    pub branch_url: Option<String>,
    pub url: Option<String>,
    pub branch: Option<String>,
    pub subpath: Option<String>,
    pub vcs_type: Option<String>,
    pub value: Option<i32>,
    pub inactive: Option<bool>,
    pub rate_limit_bucket: Option<String>,
}

/// Fetch a codebase by name.
pub async fn get_codebase(conn: &PgPool, name: &str) -> Result<Option<Codebase>, sqlx::Error> {
    sqlx::query_as::<_, Codebase>(
        "SELECT name, branch_url, url, branch, subpath, vcs_type, value, inactive, \
         rate_limit_bucket FROM codebase WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(conn)
    .await
}

/// Upsert codebases from an administrative update.
pub async fn update_codebases(conn: &PgPool, codebases: &[Codebase]) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;
    for codebase in codebases {
        sqlx::query(
            "INSERT INTO codebase (name, branch_url, url, branch, subpath, vcs_type, value, \
             inactive, rate_limit_bucket) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (name) DO UPDATE SET branch_url = EXCLUDED.branch_url, \
             url = EXCLUDED.url, branch = EXCLUDED.branch, subpath = EXCLUDED.subpath, \
             vcs_type = EXCLUDED.vcs_type, value = EXCLUDED.value, \
             inactive = EXCLUDED.inactive, rate_limit_bucket = EXCLUDED.rate_limit_bucket",
        )
        .bind(&codebase.name)
        .bind(&codebase.branch_url)
        .bind(&codebase.url)
        .bind(&codebase.branch)
        .bind(&codebase.subpath)
        .bind(&codebase.vcs_type)
        .bind(codebase.value)
        .bind(codebase.inactive)
        .bind(&codebase.rate_limit_bucket)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

/// Per-role branch produced by a run.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ResultBranch {
    pub run_id: String,
    pub role: String,
    pub remote_name: Option<String>,
    pub base_revision: Option<String>,
    pub revision: Option<String>,
    pub absorbed: Option<bool>,
}

/// Fetch the branch results attached to a run.
pub async fn get_result_branches(
    conn: &PgPool,
    run_id: &str,
) -> Result<Vec<ResultBranch>, sqlx::Error> {
    sqlx::query_as::<_, ResultBranch>(
        "SELECT run_id, role, remote_name, base_revision, revision, absorbed \
         FROM new_result_branch WHERE run_id = $1",
    )
    .bind(run_id)
    .fetch_all(conn)
    .await
}
