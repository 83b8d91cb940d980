use bridge_core::client::Services;
use bridge_core::rule::RuleTable;
use bridge_core::store::DeadLetterStore;
use std::sync::Arc;

/// Shared application state passed to all route handlers.
///
/// The rule table is read-only for the process lifetime; the store and the
/// tracker clients are safe to share across concurrent pipeline runs.
#[derive(Clone)]
pub struct AppState {
    pub rules: Arc<RuleTable>,
    pub store: Arc<DeadLetterStore>,
    pub services: Services,
    pub api_key: Arc<String>,
}

impl AppState {
    pub fn new(
        rules: Arc<RuleTable>,
        store: Arc<DeadLetterStore>,
        services: Services,
        api_key: String,
    ) -> Self {
        Self {
            rules,
            store,
            services,
            api_key: Arc::new(api_key),
        }
    }
}
