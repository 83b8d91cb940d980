use axum::extract::State;
use axum::Json;
use bridge_core::event::Event;
use bridge_core::runner;

use crate::state::AppState;

/// POST /webhook — run one inbound source-tracker event through the
/// pipeline.
///
/// Always answers 200: the source tracker disables webhook delivery on
/// error responses, so failures are dead-lettered and reported in the body
/// instead. The body carries `status`: `processed`, `ignored`, or `queued`.
pub async fn submit_event(
    State(app): State<AppState>,
    Json(event): Json<Event>,
) -> Json<serde_json::Value> {
    let rid = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        rid = %rid,
        item = event.item.id,
        kind = event.kind.as_str(),
        "handling incoming event"
    );

    let result = tokio::task::spawn_blocking(move || {
        runner::submit(&event, &app.rules, &app.services, &app.store, &rid)
    })
    .await;

    let body = match result {
        Ok(Ok(outcome)) => serde_json::to_value(&outcome)
            .unwrap_or_else(|e| serde_json::json!({ "status": "error", "error": e.to_string() })),
        Ok(Err(e)) => {
            // Store access failed; the event could not even be queued.
            tracing::error!(error = %e, "could not process or queue event");
            serde_json::json!({ "status": "error", "error": e.to_string() })
        }
        Err(e) => {
            tracing::error!(error = %e, "pipeline task panicked");
            serde_json::json!({ "status": "error", "error": "internal task failure" })
        }
    };
    Json(body)
}
