use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::state::AppState;

/// GET /healthz — liveness plus a store writability check. Unauthenticated
/// so load balancers can probe it.
pub async fn healthz(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let writable = tokio::task::spawn_blocking(move || app.store.ping())
        .await
        .unwrap_or(false);
    let status = if writable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({ "store_writable": writable })),
    )
}
