use crate::client::{HttpSinkClient, HttpSourceClient, Services};
use std::path::PathBuf;
use std::sync::Arc;

/// Runtime settings, assembled by the CLI from flags and environment
/// variables. The rules file itself is separate (see `rule::RuleTable`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub rules_path: PathBuf,
    pub store_path: PathBuf,
    pub source_base_url: String,
    pub source_api_key: String,
    pub sink_base_url: String,
    pub sink_api_key: String,
    pub http_timeout_secs: u64,
    pub retry_interval_hours: i64,
    pub max_retry_age_days: i64,
}

impl Settings {
    pub fn retry_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retry_interval_hours)
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_retry_age_days)
    }

    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs)
    }

    /// Build the tracker client pair from these settings.
    pub fn services(&self) -> anyhow::Result<Services> {
        let source = HttpSourceClient::new(
            &self.source_base_url,
            &self.source_api_key,
            self.http_timeout(),
        )?;
        let sink = HttpSinkClient::new(
            &self.sink_base_url,
            &self.sink_api_key,
            self.http_timeout(),
        )?;
        Ok(Services {
            source: Arc::new(source),
            sink: Arc::new(sink),
        })
    }
}
