use axum::extract::{Path, Query, State};
use axum::Json;
use bridge_core::store::DeadLetterEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ProjectFilter {
    #[serde(default)]
    pub project: Option<String>,
}

/// Entry view for operational inspection; the stored event payload is
/// reduced to what an operator needs to identify it.
#[derive(Serialize)]
pub struct EntrySummary {
    pub project: String,
    pub item_id: u64,
    pub event_kind: &'static str,
    pub event_time: DateTime<Utc>,
    pub phase: String,
    pub first_seen: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
    pub error_class: &'static str,
    pub last_attempt: DateTime<Utc>,
    pub rid: String,
}

impl From<DeadLetterEntry> for EntrySummary {
    fn from(entry: DeadLetterEntry) -> Self {
        Self {
            project: entry.sink_project_key,
            item_id: entry.item_id,
            event_kind: entry.event.kind.as_str(),
            event_time: entry.event.time,
            phase: entry.phase.to_string(),
            first_seen: entry.first_seen,
            attempts: entry.attempts,
            last_error: entry.last_error,
            error_class: entry.error_class.as_str(),
            last_attempt: entry.last_attempt,
            rid: entry.rid,
        }
    }
}

/// GET /queue — dead-letter entries, oldest first, optionally filtered by
/// sink project key.
pub async fn list_queue(
    State(app): State<AppState>,
    Query(filter): Query<ProjectFilter>,
) -> Result<Json<Vec<EntrySummary>>, AppError> {
    let entries = tokio::task::spawn_blocking(move || app.store.list(filter.project.as_deref()))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(entries.into_iter().map(EntrySummary::from).collect()))
}

/// GET /queue/count — number of dead-letter entries per (optional) project.
pub async fn count_queue(
    State(app): State<AppState>,
    Query(filter): Query<ProjectFilter>,
) -> Result<Json<serde_json::Value>, AppError> {
    let count = tokio::task::spawn_blocking(move || app.store.count(filter.project.as_deref()))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(serde_json::json!({ "count": count })))
}

/// DELETE /queue/{project}/{item_id} — manually drop an entry.
pub async fn delete_entry(
    State(app): State<AppState>,
    Path((project, item_id)): Path<(String, u64)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = {
        let project = project.clone();
        tokio::task::spawn_blocking(move || app.store.remove(&project, item_id))
            .await
            .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??
    };
    if !removed {
        return Err(AppError::not_found(format!(
            "no queue entry for {project}/{item_id}"
        )));
    }
    Ok(Json(serde_json::json!({ "removed": true })))
}
