//! Event-to-action resolution and the `submit` boundary the transport
//! layer calls.
//!
//! Whatever happens here, the transport always reports success to the event
//! source: an error response would make the source disable its webhook.
//! Failures funnel into the dead-letter store instead.

use crate::client::Services;
use crate::context::{self, BuildOutcome, Phase};
use crate::error::{ErrorClass, Result};
use crate::event::Event;
use crate::pipeline::{Executor, PipelineResult};
use crate::resolver::{self, Resolution};
use crate::rule::{Rule, RuleTable};
use crate::steps::Details;
use crate::store::{DeadLetterStore, EnqueueDisposition};
use chrono::Utc;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What became of a submitted event. Serialized as the webhook response
/// body; the HTTP status is 200 in every case.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Processed { performed: bool, details: Details },
    Ignored { reason: String },
    Queued { error: String },
}

/// A pipeline-level failure, normalized for dead-letter bookkeeping.
#[derive(Debug)]
pub(crate) struct PipelineFailure {
    pub phase: Phase,
    pub step: Option<String>,
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug)]
pub(crate) enum ProcessOutcome {
    Executed(PipelineResult),
    Ignored(String),
}

// ---------------------------------------------------------------------------
// submit
// ---------------------------------------------------------------------------

/// Run one inbound event through resolution and the pipeline, dead-lettering
/// it on failure. `rid` is the transport's request id, kept for correlation.
///
/// Errors from this function are store-access failures only; everything
/// event-related is folded into the returned outcome.
pub fn submit(
    event: &Event,
    rules: &RuleTable,
    services: &Services,
    store: &DeadLetterStore,
    rid: &str,
) -> Result<SubmitOutcome> {
    let label = event.item.labels.as_deref().unwrap_or("");
    let rule = match resolver::resolve(rules, label) {
        Resolution::Matched(rule) => rule,
        Resolution::Disabled(rule) => {
            tracing::info!(item = event.item.id, tag = %rule.tag, "rule disabled, ignoring event");
            return Ok(SubmitOutcome::Ignored {
                reason: format!("rule '{}' is disabled", rule.tag),
            });
        }
        Resolution::NoMatch => {
            tracing::info!(item = event.item.id, label, "no rule matched, ignoring event");
            return Ok(SubmitOutcome::Ignored {
                reason: "no configured tag matches the item label".into(),
            });
        }
    };

    match process(event, rule, services, false) {
        Ok(ProcessOutcome::Ignored(reason)) => {
            tracing::info!(item = event.item.id, %reason, "ignoring event");
            Ok(SubmitOutcome::Ignored { reason })
        }
        Ok(ProcessOutcome::Executed(result)) => {
            // Anything still queued for this key now describes older state.
            if store.discard_stale(&rule.sink_project_key, event.item.id, event.time)? {
                tracing::debug!(
                    item = event.item.id,
                    "dropped queued entry superseded by successful run"
                );
            }
            tracing::info!(
                item = event.item.id,
                tag = %rule.tag,
                performed = result.performed,
                "event processed"
            );
            Ok(SubmitOutcome::Processed {
                performed: result.performed,
                details: result.details,
            })
        }
        Err(failure) => {
            let disposition = store.enqueue(
                &rule.sink_project_key,
                event,
                failure.phase,
                &failure.message,
                failure.class,
                rid,
                Utc::now(),
            )?;
            if disposition == EnqueueDisposition::Superseded {
                tracing::debug!(item = event.item.id, "failed event superseded in queue");
            } else {
                tracing::error!(
                    item = event.item.id,
                    tag = %rule.tag,
                    phase = %failure.phase,
                    step = failure.step.as_deref().unwrap_or("-"),
                    class = failure.class.as_str(),
                    error = %failure.message,
                    "event failed, queued for retry"
                );
            }
            Ok(SubmitOutcome::Queued {
                error: failure.message,
            })
        }
    }
}

/// Build the context and run the pipeline for one event under one rule.
/// Shared between live submission and scheduler replays.
pub(crate) fn process(
    event: &Event,
    rule: &Rule,
    services: &Services,
    replay: bool,
) -> std::result::Result<ProcessOutcome, PipelineFailure> {
    match context::build(event, rule, services, replay) {
        Ok(BuildOutcome::Ignored(reason)) => Ok(ProcessOutcome::Ignored(reason)),
        Ok(BuildOutcome::Ready(mut ctx)) => match Executor::new(rule, services).run(&mut ctx) {
            Ok(result) => Ok(ProcessOutcome::Executed(result)),
            Err(e) => Err(PipelineFailure {
                phase: ctx.phase,
                step: Some(e.step.clone()),
                class: e.class(),
                message: e.to_string(),
            }),
        },
        Err(e) => Err(PipelineFailure {
            phase: Phase::hint_for(event.kind),
            step: None,
            class: e.class,
            message: format!("context: {e}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
