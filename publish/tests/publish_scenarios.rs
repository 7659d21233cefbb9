//! Database-backed scenarios for the publisher.

use janitor_publish::rate_limiter::FixedRateLimiter;
use janitor_publish::AppState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

fn test_config() -> janitor::config::Config {
    toml::from_str(
        r#"
[database]
url = "postgresql://localhost/janitor_test"

[[campaign]]
name = "lintian-fixes"
command = "lintian-brush"
default_mode = "propose"

[rate_limits]
default_max_open = 5

[rate_limits.per_bucket]
"maint:alice" = 2
"#,
    )
    .unwrap()
}

async fn seeded_state() -> Arc<AppState> {
    let config = test_config();
    let conn = sqlx::PgPool::connect(&config.database.url).await.unwrap();
    janitor::schema::setup_test_database(&conn).await.unwrap();
    let limits = config.rate_limits.clone();
    let state = Arc::new(AppState {
        conn,
        config: janitor::config::ConfigHandle::new(config, None),
        bucket_rate_limiter: Mutex::new(Box::new(FixedRateLimiter::new(limits))),
        forge_rate_limiter: Arc::new(RwLock::new(HashMap::new())),
        forge_failure_counts: Mutex::new(HashMap::new()),
        push_limit: None,
        redis: None,
        lock_manager: None,
        auto_publish: true,
    });

    sqlx::query(
        "INSERT INTO codebase (name, branch_url, vcs_type, rate_limit_bucket) \
         VALUES ('pkg-a', 'https://example.com/pkg-a', 'git', 'maint:alice') \
         ON CONFLICT (name) DO UPDATE SET rate_limit_bucket = EXCLUDED.rate_limit_bucket",
    )
    .execute(&state.conn)
    .await
    .unwrap();

    state
}

async fn seed_successful_run(state: &AppState, run_id: &str) {
    sqlx::query(
        "INSERT INTO run (id, suite, codebase, result_code, start_time, finish_time, \
         target_branch_url, revision, main_branch_revision, vcs_type) \
         VALUES ($1, 'lintian-fixes', 'pkg-a', 'success', NOW() - interval '10 minutes', \
         NOW(), 'https://example.com/pkg-a', $2, $3, 'git') \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(run_id)
    .bind("b".repeat(40))
    .bind("a".repeat(40))
    .execute(&state.conn)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO new_result_branch (run_id, role, remote_name, base_revision, revision) \
         VALUES ($1, 'main', 'lintian-fixes', $2, $3) ON CONFLICT (run_id, role) DO NOTHING",
    )
    .bind(run_id)
    .bind("a".repeat(40))
    .bind("b".repeat(40))
    .execute(&state.conn)
    .await
    .unwrap();
}

#[tokio::test]
#[ignore = "requires database connection"]
async fn test_publish_ready_iteration() {
    let state = seeded_state().await;
    seed_successful_run(&state, "run-ready-1").await;

    let ready = janitor_publish::state::iter_publish_ready(&state.conn, None, None)
        .await
        .unwrap();
    let entry = ready
        .iter()
        .find(|r| r.run.id == "run-ready-1")
        .expect("run should be publish-ready");
    assert_eq!(entry.rate_limit_bucket.as_deref(), Some("maint:alice"));
    assert_eq!(entry.unpublished_branches.len(), 1);
    assert_eq!(entry.unpublished_branches[0].role, "main");
}

#[tokio::test]
#[ignore = "requires database connection"]
async fn test_store_publish_idempotent() {
    let state = seeded_state().await;
    seed_successful_run(&state, "run-idem-1").await;

    let target: url::Url = "https://example.com/pkg-a".parse().unwrap();
    let revision = "b".repeat(40);
    for publish_id in ["pub-1", "pub-2"] {
        janitor_publish::state::store_publish(
            &state.conn,
            "pkg-a",
            Some("lintian-fixes"),
            Some(&target),
            None,
            None,
            Some(&revision),
            "main",
            janitor::publish::Mode::Push,
            "success",
            "pushed",
            None,
            publish_id,
            None,
            Some("run-idem-1"),
            Some("maint:alice"),
        )
        .await
        .unwrap();
    }

    // Repeating a successful publish for the same (run, role, revision)
    // converges on a single row.
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM publish WHERE run_id = 'run-idem-1' AND result_code = 'success'",
    )
    .fetch_one(&state.conn)
    .await
    .unwrap();
    assert_eq!(count, 1);

    // The push absorbed the branch, so the run is no longer ready.
    let ready = janitor_publish::state::iter_publish_ready(&state.conn, Some("run-idem-1"), None)
        .await
        .unwrap();
    assert!(ready.is_empty());
}

#[tokio::test]
#[ignore = "requires database connection"]
async fn test_bucket_rate_limit_blocks_publish() {
    let state = seeded_state().await;
    seed_successful_run(&state, "run-limited-1").await;

    // Two open proposals already in the bucket with limit 2.
    for n in 1..=2 {
        sqlx::query(
            "INSERT INTO merge_proposal (url, status, codebase, rate_limit_bucket) \
             VALUES ($1, 'open', 'pkg-a', 'maint:alice') ON CONFLICT (url) DO NOTHING",
        )
        .bind(format!("https://example.com/mr/{}", n))
        .execute(&state.conn)
        .await
        .unwrap();
    }
    janitor_publish::refresh_bucket_mp_counts(&state).await.unwrap();

    let ready = janitor_publish::state::iter_publish_ready(&state.conn, Some("run-limited-1"), None)
        .await
        .unwrap();
    let outcomes = janitor_publish::consider_publish_run(&state, &ready[0], true)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, "rate-limited");

    // No proposal was created and the unpublished branch persists.
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM publish WHERE run_id = 'run-limited-1'")
            .fetch_one(&state.conn)
            .await
            .unwrap();
    assert_eq!(count, 0);
    let still_ready =
        janitor_publish::state::iter_publish_ready(&state.conn, Some("run-limited-1"), None)
            .await
            .unwrap();
    assert_eq!(still_ready.len(), 1);
}

#[tokio::test]
#[ignore = "requires database connection"]
async fn test_resolve_publish_mode_precedence() {
    let state = seeded_state().await;

    // Campaign default applies without a policy row.
    let mode = janitor_publish::resolve_publish_mode(
        &state.conn,
        &state.config.get(),
        "pkg-a",
        "lintian-fixes",
        "main",
    )
    .await
    .unwrap();
    assert_eq!(mode, janitor::publish::Mode::Propose);

    // Codebase policy wins over the campaign default.
    sqlx::query(
        "INSERT INTO policy (codebase, suite, publish_mode, per_branch) \
         VALUES ('pkg-a', 'lintian-fixes', 'push', '{\"pristine-tar\": \"skip\"}'::json) \
         ON CONFLICT (codebase, suite) DO UPDATE SET publish_mode = EXCLUDED.publish_mode, \
         per_branch = EXCLUDED.per_branch",
    )
    .execute(&state.conn)
    .await
    .unwrap();
    let mode = janitor_publish::resolve_publish_mode(
        &state.conn,
        &state.config.get(),
        "pkg-a",
        "lintian-fixes",
        "main",
    )
    .await
    .unwrap();
    assert_eq!(mode, janitor::publish::Mode::Push);

    // The per-role entry is the most specific.
    let mode = janitor_publish::resolve_publish_mode(
        &state.conn,
        &state.config.get(),
        "pkg-a",
        "lintian-fixes",
        "pristine-tar",
    )
    .await
    .unwrap();
    assert_eq!(mode, janitor::publish::Mode::Skip);
}
