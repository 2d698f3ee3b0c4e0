use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use promagg::text;
use serde_json::{json, Value};

use super::http::AppState;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// The scrape endpoint: prune stale gauges, assemble the global merge and
/// encode it. A cross-job type conflict is the requester's signal that two
/// pushers disagree, hence a server error.
pub async fn scrape(State(state): State<Arc<AppState>>) -> Response {
    let start_time = time::Instant::now();
    let families = match state.store.snapshot() {
        Ok(families) => families,
        Err(err) => {
            tracing::error!(%err, "metrics merge failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("an error has occurred during metrics merge:\n\n{err}"),
            )
                .into_response();
        }
    };

    let mut body = String::new();
    for family in &families {
        text::encode(&mut body, family);
    }
    tracing::debug!(
        families = families.len(),
        elapsed = %start_time.elapsed(),
        "assembled scrape response"
    );
    (
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

pub async fn push_root(State(state): State<Arc<AppState>>, body: String) -> Response {
    with_cors(&state, handle_push(&state, None, &body))
}

pub async fn push(
    State(state): State<Arc<AppState>>,
    Path(suffix): Path<String>,
    body: String,
) -> Response {
    with_cors(&state, handle_push(&state, Some(&suffix), &body))
}

pub async fn healthy() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn with_cors(state: &AppState, parts: (StatusCode, String)) -> Response {
    let mut response = parts.into_response();
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, state.cors.clone());
    response
}

fn handle_push(state: &AppState, suffix: Option<&str>, body: &str) -> (StatusCode, String) {
    let source = if state.by_job {
        match job_from_suffix(suffix) {
            Ok(job) => job,
            Err(reason) => return (StatusCode::BAD_REQUEST, reason),
        }
    } else {
        String::new()
    };

    let families = match text::parse(body) {
        Ok(families) => families,
        Err(err) => {
            tracing::warn!(%err, "failed to parse pushed metrics");
            return (StatusCode::BAD_REQUEST, err.to_string());
        }
    };

    if let Err(err) = state.store.ingest(&source, families) {
        tracing::warn!(%err, source = %source, "failed to merge pushed metrics");
        return (StatusCode::BAD_REQUEST, err.to_string());
    }
    (StatusCode::OK, String::new())
}

/// In by-job mode the path below the push prefix must be `job/<name>`.
fn job_from_suffix(suffix: Option<&str>) -> Result<String, String> {
    let suffix = suffix.unwrap_or_default();
    let mut parts = suffix.split('/').filter(|p| !p.is_empty());
    match (parts.next(), parts.next()) {
        (Some("job"), Some(job)) => Ok(job.to_owned()),
        (Some(other), Some(_)) => Err(format!("first path component != job: {other}")),
        _ => Err("path is too short, expecting job/<name>".to_owned()),
    }
}
