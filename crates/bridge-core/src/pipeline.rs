use crate::client::Services;
use crate::context::{ExecutionContext, Phase};
use crate::error::ErrorClass;
use crate::rule::Rule;
use crate::steps::{self, Details, StepError, StepStatus};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Results and failures
// ---------------------------------------------------------------------------

/// What one pipeline run did. `performed=false` with no error means the
/// event legitimately required no sink-side change.
#[derive(Debug, Serialize)]
pub struct PipelineResult {
    pub performed: bool,
    pub details: Details,
}

#[derive(Debug, Error)]
#[error("step `{step}` failed: {source}")]
pub struct PipelineError {
    pub step: String,
    #[source]
    pub source: StepError,
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        self.source.class()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs the rule's step list for the context's phase, in strict order,
/// short-circuiting on the first failure. Step failures are never caught
/// here; the caller dead-letters the event.
pub struct Executor<'a> {
    rule: &'a Rule,
    services: &'a Services,
}

impl<'a> Executor<'a> {
    pub fn new(rule: &'a Rule, services: &'a Services) -> Self {
        Self { rule, services }
    }

    pub fn run(&self, ctx: &mut ExecutionContext) -> Result<PipelineResult, PipelineError> {
        let names = match ctx.phase {
            Phase::New => &self.rule.steps.new,
            Phase::Existing => &self.rule.steps.existing,
            Phase::Comment => &self.rule.steps.comment,
        };

        let mut details = Details::new();
        let mut performed = false;
        for name in names {
            // Unknown names are rejected at rule load; this guards replays
            // against a rules file that shrank since the event was queued.
            let Some(step) = steps::lookup(name) else {
                return Err(PipelineError {
                    step: name.clone(),
                    source: StepError::Config(format!("unknown step '{name}'")),
                });
            };
            match step(ctx, self.rule, self.services, &mut details) {
                Ok(status) => {
                    tracing::debug!(
                        step = %name,
                        status = status.as_str(),
                        phase = %ctx.phase,
                        item = ctx.item.id,
                        replay = ctx.replay,
                        "step finished"
                    );
                    if status == StepStatus::Performed {
                        performed = true;
                    }
                    details
                        .entry(name.clone())
                        .or_insert_with(|| json!(status.as_str()));
                }
                Err(source) => {
                    return Err(PipelineError {
                        step: name.clone(),
                        source,
                    })
                }
            }
        }
        Ok(PipelineResult { performed, details })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{fake, ClientError};
    use crate::event::{Event, EventKind, ItemSnapshot};
    use crate::rule::{RuleParams, StepLists};
    use chrono::{TimeZone, Utc};

    fn rule_with_new_steps(steps: &[&str]) -> Rule {
        Rule {
            tag: "proj".into(),
            description: None,
            enabled: true,
            sink_project_key: "PROJ".into(),
            steps: StepLists {
                new: steps.iter().map(|s| s.to_string()).collect(),
                existing: Vec::new(),
                comment: Vec::new(),
            },
            params: RuleParams::default(),
        }
    }

    fn item(id: u64) -> ItemSnapshot {
        ItemSnapshot {
            id,
            kind: Some("defect".into()),
            summary: Some("crash".into()),
            status: None,
            resolution: None,
            priority: None,
            product: None,
            component: None,
            labels: Some("[proj-123]".into()),
            keywords: Vec::new(),
            links: Vec::new(),
            assignee: None,
            is_private: false,
        }
    }

    fn new_ctx(item: ItemSnapshot) -> ExecutionContext {
        ExecutionContext {
            event: Event {
                kind: EventKind::Create,
                time: Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
                item: item.clone(),
                changes: None,
                comment: None,
            },
            item,
            phase: Phase::New,
            sink_project_key: "PROJ".into(),
            sink_key: None,
            sink_item: None,
            replay: false,
        }
    }

    #[test]
    fn new_item_runs_create_then_link() {
        let (services, _source, sink) = fake::services();
        let rule = rule_with_new_steps(&["create_item", "create_link"]);
        let mut ctx = new_ctx(item(42));

        let result = Executor::new(&rule, &services).run(&mut ctx).unwrap();
        assert!(result.performed);
        assert_eq!(sink.created_count(), 1);
        assert_eq!(sink.remote_links.lock().unwrap().len(), 1);
        assert_eq!(result.details["create_item"], serde_json::json!({"created": "PROJ-1"}));
        assert_eq!(result.details["create_link"], "performed");
    }

    #[test]
    fn rerunning_new_phase_converges_and_reports_unperformed() {
        let (services, _source, sink) = fake::services();
        let rule = rule_with_new_steps(&["create_item", "create_link"]);

        let mut first = new_ctx(item(42));
        let result = Executor::new(&rule, &services).run(&mut first).unwrap();
        assert!(result.performed);

        let mut second = new_ctx(item(42));
        let result = Executor::new(&rule, &services).run(&mut second).unwrap();
        assert!(!result.performed, "second run changed nothing");
        assert_eq!(sink.created_count(), 1, "sink end-state equals a single run");
        assert_eq!(sink.remote_links.lock().unwrap().len(), 1);
    }

    #[test]
    fn unmapped_status_yields_unperformed_without_error() {
        let (services, _source, sink) = fake::services();
        let mut rule = rule_with_new_steps(&[]);
        rule.steps.existing = vec!["maybe_update_status".into()];
        rule.params.status_map.insert("FIXED".into(), "Done".into());

        let mut it = item(7);
        it.status = Some("UNCONFIRMED".into());
        let mut ctx = new_ctx(it);
        ctx.phase = Phase::Existing;
        ctx.event.kind = EventKind::Update;
        ctx.sink_key = Some("PROJ-1".into());

        let result = Executor::new(&rule, &services).run(&mut ctx).unwrap();
        assert!(!result.performed);
        assert!(sink.fields.lock().unwrap().is_empty(), "no sink call made");
        assert_eq!(result.details["maybe_update_status"], "incomplete");
    }

    #[test]
    fn failure_short_circuits_remaining_steps() {
        let (services, source, sink) = fake::services();
        let rule = rule_with_new_steps(&["create_item", "link_from_source", "create_link"]);
        source.insert(item(42));
        source
            .fail
            .arm("add_link", ClientError::transient("source down"));

        let mut ctx = new_ctx(item(42));
        let err = Executor::new(&rule, &services).run(&mut ctx).unwrap_err();
        assert_eq!(err.step, "link_from_source");
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(
            sink.remote_links.lock().unwrap().is_empty(),
            "create_link never ran"
        );
    }

    #[test]
    fn config_failure_is_permanent() {
        let (services, _source, _sink) = fake::services();
        // create_link without create_item first: no sink key in context.
        let rule = rule_with_new_steps(&["create_link"]);
        let mut ctx = new_ctx(item(42));
        let err = Executor::new(&rule, &services).run(&mut ctx).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn empty_step_list_is_unperformed_success() {
        let (services, _source, _sink) = fake::services();
        let rule = rule_with_new_steps(&[]);
        let mut ctx = new_ctx(item(42));
        let result = Executor::new(&rule, &services).run(&mut ctx).unwrap();
        assert!(!result.performed);
        assert!(result.details.is_empty());
    }
}
