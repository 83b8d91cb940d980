use crate::client::{ClientError, Services, SinkItem};
use crate::event::{Event, EventKind, ItemSnapshot};
use crate::rule::Rule;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Which step list applies to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    New,
    Existing,
    Comment,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::New => "new",
            Phase::Existing => "existing",
            Phase::Comment => "comment",
        }
    }

    /// Best guess before link state is known; used for dead-letter
    /// bookkeeping when context building itself fails.
    pub fn hint_for(kind: EventKind) -> Phase {
        match kind {
            EventKind::Create => Phase::New,
            EventKind::Update => Phase::Existing,
            EventKind::Comment => Phase::Comment,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Everything one pipeline run works on. Built once per run and owned
/// exclusively by it; the only parts steps mutate are the sink link slot
/// (set when `create_item` runs) and the result accumulator kept by the
/// executor.
#[derive(Debug)]
pub struct ExecutionContext {
    /// The triggering event, exactly as received.
    pub event: Event,
    /// Source item state as refreshed at build time. Steps read this, not
    /// the event snapshot, so stale queued payloads converge on replay.
    pub item: ItemSnapshot,
    pub phase: Phase,
    pub sink_project_key: String,
    /// Linked sink item key, if any. `create_item` fills this in during a
    /// `new`-phase run.
    pub sink_key: Option<String>,
    pub sink_item: Option<SinkItem>,
    /// True when this run was resubmitted by the retry scheduler.
    pub replay: bool,
}

/// Context building either yields a runnable context or classifies the
/// event as ignored. Client failures bubble up as pipeline-level failures.
#[derive(Debug)]
pub enum BuildOutcome {
    Ready(Box<ExecutionContext>),
    Ignored(String),
}

/// Assemble the context for one event under one rule.
///
/// Refreshes the source item first: events can sit in the dead-letter store
/// for hours, and the pipeline must act on current state, not the snapshot
/// that failed. An item that went private or unreadable since is ignored.
pub fn build(
    event: &Event,
    rule: &Rule,
    services: &Services,
    replay: bool,
) -> Result<BuildOutcome, ClientError> {
    if event.item.is_private {
        return Ok(BuildOutcome::Ignored("private items are not synced".into()));
    }

    let Some(item) = services.source.fetch_item(event.item.id)? else {
        return Ok(BuildOutcome::Ignored(format!(
            "item {} is no longer accessible",
            event.item.id
        )));
    };
    if item.is_private {
        return Ok(BuildOutcome::Ignored(format!(
            "item {} became private",
            item.id
        )));
    }

    let linked = item.linked_sink_key(&rule.sink_project_key);
    let (phase, sink_key, sink_item) = match linked {
        None => {
            if event.kind == EventKind::Comment {
                return Ok(BuildOutcome::Ignored(format!(
                    "comment on item {} with no linked sink item",
                    item.id
                )));
            }
            (Phase::New, None, None)
        }
        Some(key) => {
            let Some(sink_item) = services.sink.fetch_item(&key)? else {
                return Ok(BuildOutcome::Ignored(format!(
                    "linked sink item {key} is not readable"
                )));
            };
            if sink_item.project_key != rule.sink_project_key {
                return Ok(BuildOutcome::Ignored(format!(
                    "linked sink item {key} lives in project '{}', rule expects '{}'",
                    sink_item.project_key, rule.sink_project_key
                )));
            }
            let phase = if event.kind == EventKind::Comment {
                Phase::Comment
            } else {
                Phase::Existing
            };
            (phase, Some(key), Some(sink_item))
        }
    };

    Ok(BuildOutcome::Ready(Box::new(ExecutionContext {
        event: event.clone(),
        item,
        phase,
        sink_project_key: rule.sink_project_key.clone(),
        sink_key,
        sink_item,
        replay,
    })))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
