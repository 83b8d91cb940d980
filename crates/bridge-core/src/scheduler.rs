//! Scheduled replay of dead-lettered events.
//!
//! Runs independently of inbound traffic: sweep expired entries first, then
//! push every due entry back through the pipeline exactly as if freshly
//! received. One bad entry never aborts the rest of the batch; only a
//! store-access failure is a hard error.

use crate::client::Services;
use crate::error::Result;
use crate::resolver::{self, Resolution};
use crate::rule::RuleTable;
use crate::runner::{self, ProcessOutcome};
use crate::store::DeadLetterStore;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Counters from one scheduler pass, logged and printed by the CLI.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RetryMetrics {
    pub swept: usize,
    pub ready: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Entries dropped because replaying them is now pointless: the rule is
    /// gone or disabled, or the context builder classified them ignored.
    pub dropped: usize,
}

/// One full retry pass over the dead-letter store.
pub fn run_once(
    rules: &RuleTable,
    services: &Services,
    store: &DeadLetterStore,
    retry_interval: Duration,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<RetryMetrics> {
    // Sweep before listing so nothing past the retention window gets one
    // last attempt.
    let swept = store.sweep_expired(now, max_age)?;
    let ready = store.list_ready(now, retry_interval)?;

    let mut metrics = RetryMetrics {
        swept: swept.len(),
        ready: ready.len(),
        ..RetryMetrics::default()
    };

    for entry in ready {
        let label = entry.event.item.labels.as_deref().unwrap_or("");
        let rule = match resolver::resolve(rules, label) {
            Resolution::Matched(rule) => rule,
            _ => {
                tracing::info!(
                    project = %entry.sink_project_key,
                    item = entry.item_id,
                    "no enabled rule matches queued event anymore, dropping it"
                );
                match store.remove(&entry.sink_project_key, entry.item_id) {
                    Ok(_) => metrics.dropped += 1,
                    Err(e) => {
                        tracing::error!(item = entry.item_id, error = %e, "failed to drop entry");
                        metrics.failed += 1;
                    }
                }
                continue;
            }
        };

        match runner::process(&entry.event, rule, services, true) {
            Ok(ProcessOutcome::Executed(result)) => {
                match store.remove(&entry.sink_project_key, entry.item_id) {
                    Ok(_) => {
                        tracing::info!(
                            project = %entry.sink_project_key,
                            item = entry.item_id,
                            attempts = entry.attempts,
                            performed = result.performed,
                            "replayed queued event"
                        );
                        metrics.succeeded += 1;
                    }
                    Err(e) => {
                        tracing::error!(item = entry.item_id, error = %e, "failed to remove entry");
                        metrics.failed += 1;
                    }
                }
            }
            Ok(ProcessOutcome::Ignored(reason)) => {
                tracing::info!(
                    project = %entry.sink_project_key,
                    item = entry.item_id,
                    %reason,
                    "queued event now ignored, dropping it"
                );
                match store.remove(&entry.sink_project_key, entry.item_id) {
                    Ok(_) => metrics.dropped += 1,
                    Err(e) => {
                        tracing::error!(item = entry.item_id, error = %e, "failed to drop entry");
                        metrics.failed += 1;
                    }
                }
            }
            Err(failure) => {
                tracing::warn!(
                    project = %entry.sink_project_key,
                    item = entry.item_id,
                    attempts = entry.attempts,
                    class = failure.class.as_str(),
                    error = %failure.message,
                    "replay failed, keeping entry"
                );
                metrics.failed += 1;
                if let Err(e) = store.enqueue(
                    &entry.sink_project_key,
                    &entry.event,
                    failure.phase,
                    &failure.message,
                    failure.class,
                    &entry.rid,
                    now,
                ) {
                    tracing::error!(item = entry.item_id, error = %e, "failed to update entry");
                }
            }
        }
    }

    tracing::info!(
        swept = metrics.swept,
        ready = metrics.ready,
        succeeded = metrics.succeeded,
        failed = metrics.failed,
        dropped = metrics.dropped,
        "retry pass complete"
    );
    Ok(metrics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
