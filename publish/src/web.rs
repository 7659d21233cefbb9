//! Web interface to publish functionality.

use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

fn error_response(status: StatusCode, reason: String) -> Response {
    (status, Json(json!({"reason": reason}))).into_response()
}

async fn publish_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    match crate::queue::publish_run(state, &run_id).await {
        Ok(outcomes) => {
            let rate_limited = outcomes.iter().any(|o| o.status == "rate-limited");
            let body = Json(json!({"run_id": run_id, "outcomes": outcomes}));
            if rate_limited {
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, "3600".parse().expect("valid header"));
                response
            } else {
                (StatusCode::ACCEPTED, body).into_response()
            }
        }
        Err(crate::PublishError::NothingToDo(reason)) => {
            error_response(StatusCode::NOT_FOUND, reason)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn publish_scan(State(state): State<Arc<AppState>>) -> Response {
    tokio::spawn(async move {
        if let Err(e) = crate::scan::check_existing(&state).await {
            log::error!("Requested proposal scan failed: {}", e);
        }
    });
    (StatusCode::ACCEPTED, "scan started").into_response()
}

async fn refresh_rate_limits(State(state): State<Arc<AppState>>) -> Response {
    match crate::refresh_bucket_mp_counts(&state).await {
        Ok(()) => (StatusCode::OK, "refreshed").into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_rate_limits(State(state): State<Arc<AppState>>) -> Response {
    let limiter = state.bucket_rate_limiter.lock().expect("lock poisoned");
    match limiter.get_stats() {
        Some(stats) => Json(json!({
            "per_bucket": stats
                .per_bucket
                .iter()
                .map(|(bucket, open)| {
                    (bucket.clone(), json!({
                        "open": open,
                        "max_open": limiter.get_max_open(bucket),
                    }))
                })
                .collect::<serde_json::Map<_, _>>(),
        }))
        .into_response(),
        None => Json(json!({"per_bucket": null})).into_response(),
    }
}

#[derive(serde::Deserialize)]
struct ProposalQuery {
    status: Option<String>,
}

async fn get_merge_proposals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProposalQuery>,
) -> Response {
    let result = sqlx::query_as::<_, (String, Option<String>, String, Option<String>)>(
        "SELECT url, codebase, status, target_branch_url FROM merge_proposal \
         WHERE ($1::text IS NULL OR status = $1) ORDER BY url LIMIT 1000",
    )
    .bind(query.status.as_deref())
    .fetch_all(&state.conn)
    .await;
    match result {
        Ok(rows) => Json(
            rows.into_iter()
                .map(|(url, codebase, status, target_branch_url)| {
                    json!({
                        "url": url,
                        "codebase": codebase,
                        "status": status,
                        "target_branch_url": target_branch_url,
                    })
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn health() -> impl IntoResponse {
    "OK"
}

async fn ready() -> impl IntoResponse {
    "OK"
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::gather(),
    )
}

/// Create the publish router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/publish/{run_id}", post(publish_run))
        .route("/publish-scan", post(publish_scan))
        .route("/rate-limits", get(get_rate_limits).post(refresh_rate_limits))
        .route("/merge-proposals", get(get_merge_proposals))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}
