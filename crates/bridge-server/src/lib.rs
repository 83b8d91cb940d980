pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use bridge_core::rule::RuleTable;
use bridge_core::settings::Settings;
use bridge_core::store::DeadLetterStore;
use state::AppState;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/webhook", post(routes::webhook::submit_event))
        .route("/queue", get(routes::queue::list_queue))
        .route("/queue/count", get(routes::queue::count_queue))
        .route(
            "/queue/{project}/{item_id}",
            delete(routes::queue::delete_entry),
        )
        .route("/rules", get(routes::rules::list_rules))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/healthz", get(routes::health::healthz))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the webhook server.
///
/// Loads the rule table once; changing the rules file requires a restart.
/// Unless disabled, a background task runs one retry pass immediately and
/// then on every `retry_interval`.
pub async fn serve(
    settings: Settings,
    port: u16,
    api_key: String,
    retry_loop: bool,
) -> anyhow::Result<()> {
    let rules = Arc::new(RuleTable::load(&settings.rules_path)?);
    let store = Arc::new(DeadLetterStore::open(&settings.store_path)?);
    let services = settings.services()?;
    let state = AppState::new(rules, store, services, api_key);

    if retry_loop {
        spawn_retry_loop(state.clone(), settings.clone());
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!("issuebridge listening on http://localhost:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodic in-process retry passes. A multi-process deployment can disable
/// this and drive `issuebridge retry` externally instead; duplicate
/// concurrent passes are harmless because steps are idempotent.
fn spawn_retry_loop(state: AppState, settings: Settings) {
    tokio::spawn(async move {
        let period = settings
            .retry_interval()
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(12 * 3600));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            // First tick fires immediately, draining any backlog left from
            // before the restart.
            ticker.tick().await;
            let state = state.clone();
            let retry_interval = settings.retry_interval();
            let max_age = settings.max_age();
            let result = tokio::task::spawn_blocking(move || {
                bridge_core::scheduler::run_once(
                    &state.rules,
                    &state.services,
                    &state.store,
                    retry_interval,
                    max_age,
                    chrono::Utc::now(),
                )
            })
            .await;
            match result {
                Ok(Ok(metrics)) => {
                    tracing::info!(
                        succeeded = metrics.succeeded,
                        failed = metrics.failed,
                        swept = metrics.swept,
                        "background retry pass finished"
                    );
                }
                Ok(Err(e)) => tracing::error!(error = %e, "background retry pass failed"),
                Err(e) => tracing::error!(error = %e, "background retry task panicked"),
            }
        }
    });
}
