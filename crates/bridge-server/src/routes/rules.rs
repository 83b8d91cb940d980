use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct TagFilter {
    #[serde(default)]
    pub tag: Option<String>,
}

/// GET /rules — the configured rule table, optionally narrowed to one tag.
/// Read-only: the table reloads only on restart.
pub async fn list_rules(
    State(app): State<AppState>,
    Query(filter): Query<TagFilter>,
) -> Result<Json<serde_json::Value>, AppError> {
    match filter.tag.as_deref() {
        Some(tag) => match app.rules.get(tag) {
            Some(rule) => Ok(Json(serde_json::to_value(rule)?)),
            None => Err(AppError::not_found(format!("no rule with tag '{tag}'"))),
        },
        None => Ok(Json(serde_json::to_value(app.rules.rules())?)),
    }
}
