//! The closed registry of pipeline steps.
//!
//! Each step performs at most one logical unit of work against the sink and
//! must be idempotent: retries replay from the first step of the phase, so a
//! step that already did its work detects the existing state and converges.

use crate::client::{ClientError, Services};
use crate::context::{ExecutionContext, Phase};
use crate::error::ErrorClass;
use crate::rule::{LabelsBrackets, Rule};
use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Step results and failures
// ---------------------------------------------------------------------------

/// What a step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Changed sink-side state.
    Performed,
    /// Nothing to do for this event.
    Noop,
    /// An anticipated shortfall (unmapped value, missing screen field);
    /// logged, not an error.
    Incomplete,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Performed => "performed",
            StepStatus::Noop => "noop",
            StepStatus::Incomplete => "incomplete",
        }
    }
}

/// A failure that aborts the pipeline run. Steps never swallow these.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("configuration: {0}")]
    Config(String),
}

impl StepError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StepError::Client(e) => e.class,
            StepError::Config(_) => ErrorClass::Permanent,
        }
    }
}

/// Per-run detail fragments, keyed by step name.
pub type Details = BTreeMap<String, serde_json::Value>;

pub type StepFn =
    fn(&mut ExecutionContext, &Rule, &Services, &mut Details) -> Result<StepStatus, StepError>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Resolve a configured step name. Rule validation walks this exhaustively
/// at load time, so an unknown name can never reach event processing.
pub fn lookup(name: &str) -> Option<StepFn> {
    let f: StepFn = match name {
        "create_item" => create_item,
        "maybe_drop_duplicate" => maybe_drop_duplicate,
        "create_link" => create_link,
        "link_from_source" => link_from_source,
        "sync_labels" => sync_labels,
        "sync_keyword_labels" => sync_keyword_labels,
        "update_summary" => update_summary,
        "maybe_update_status" => maybe_update_status,
        "maybe_update_resolution" => maybe_update_resolution,
        "maybe_update_priority" => maybe_update_priority,
        "maybe_update_components" => maybe_update_components,
        "maybe_assign_user" => maybe_assign_user,
        "comment_for_changes" => comment_for_changes,
        "create_comment" => create_comment,
        _ => return None,
    };
    Some(f)
}

pub fn is_known(name: &str) -> bool {
    lookup(name).is_some()
}

fn require_sink_key(ctx: &ExecutionContext) -> Result<String, StepError> {
    ctx.sink_key
        .clone()
        .ok_or_else(|| StepError::Config("no sink item key in context".into()))
}

// ---------------------------------------------------------------------------
// new-phase steps
// ---------------------------------------------------------------------------

/// Create the sink item, using the source item's description as the body.
///
/// Converges on replay: if the context already carries a link, or the sink
/// already holds an item marked with this source id (a previous run died
/// between creating and linking), nothing is created.
pub fn create_item(
    ctx: &mut ExecutionContext,
    rule: &Rule,
    services: &Services,
    details: &mut Details,
) -> Result<StepStatus, StepError> {
    if ctx.sink_key.is_some() {
        return Ok(StepStatus::Noop);
    }

    let existing = services
        .sink
        .find_linked(&ctx.sink_project_key, ctx.item.id)?;
    if let Some(key) = existing.first() {
        tracing::info!(item = ctx.item.id, key = %key, "adopting existing sink item");
        ctx.sink_key = Some(key.clone());
        details.insert("create_item".into(), json!({ "adopted": key }));
        return Ok(StepStatus::Noop);
    }

    let issue_type = rule
        .params
        .issue_type_map
        .get(ctx.item.kind.as_deref().unwrap_or(""))
        .cloned()
        .unwrap_or_else(|| "Task".to_string());
    let description = services.source.fetch_description(ctx.item.id)?;
    let fields = json!({
        "summary": ctx.item.summary.as_deref().unwrap_or(""),
        "description": description,
        "issue_type": issue_type,
        "source_item_id": ctx.item.id,
    });
    let key = services.sink.create_item(&ctx.sink_project_key, &fields)?;
    tracing::info!(item = ctx.item.id, key = %key, "created sink item");
    ctx.sink_key = Some(key.clone());
    details.insert("create_item".into(), json!({ "created": key }));
    Ok(StepStatus::Performed)
}

/// Re-fetch the source item after creation; if a concurrent run already
/// linked a different sink item, delete ours and adopt the earlier one.
pub fn maybe_drop_duplicate(
    ctx: &mut ExecutionContext,
    rule: &Rule,
    services: &Services,
    details: &mut Details,
) -> Result<StepStatus, StepError> {
    let our_key = require_sink_key(ctx)?;
    let Some(latest) = services.source.fetch_item(ctx.item.id)? else {
        return Ok(StepStatus::Noop);
    };
    match latest.linked_sink_key(&rule.sink_project_key) {
        Some(existing) if existing != our_key => {
            tracing::warn!(
                item = ctx.item.id,
                dropped = %our_key,
                kept = %existing,
                "dropping duplicate sink item"
            );
            services.sink.delete_item(&our_key)?;
            ctx.sink_key = Some(existing.clone());
            details.insert(
                "maybe_drop_duplicate".into(),
                json!({ "dropped": our_key, "kept": existing }),
            );
            Ok(StepStatus::Performed)
        }
        _ => Ok(StepStatus::Noop),
    }
}

/// Record a remote link on the sink item pointing back at the source item.
pub fn create_link(
    ctx: &mut ExecutionContext,
    _rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    let key = require_sink_key(ctx)?;
    let url = services.source.item_url(ctx.item.id);
    let created = services
        .sink
        .create_link(&key, &url, &format!("Item {}", ctx.item.id))?;
    Ok(if created {
        StepStatus::Performed
    } else {
        StepStatus::Noop
    })
}

/// Write the sink item's URL into the source item's cross-reference links.
pub fn link_from_source(
    ctx: &mut ExecutionContext,
    _rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    let key = require_sink_key(ctx)?;
    let url = services.sink.item_url(&key);
    if ctx.item.links.iter().any(|l| l == &url) {
        return Ok(StepStatus::Noop);
    }
    services.source.add_link(ctx.item.id, &url)?;
    Ok(StepStatus::Performed)
}

// ---------------------------------------------------------------------------
// Label sync
// ---------------------------------------------------------------------------

/// Split free-text labels (`[alpha] [team one]`) into sink label strings.
/// Sink labels cannot contain spaces; spaces become dots.
fn text_labels(brackets: LabelsBrackets, text: Option<&str>) -> Vec<String> {
    let plain: Vec<String> = text
        .unwrap_or("")
        .replace('[', "")
        .split(']')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.replace(' ', "."))
        .collect();
    let bracketed: Vec<String> = plain.iter().map(|s| format!("[{s}]")).collect();

    let mut labels = vec!["bridge".to_string()];
    match brackets {
        LabelsBrackets::Yes => labels.extend(bracketed),
        LabelsBrackets::No => labels.extend(plain),
        LabelsBrackets::Both => {
            labels.extend(plain);
            labels.extend(bracketed);
        }
    }
    labels
}

fn labels_diff(
    brackets: LabelsBrackets,
    added: &str,
    removed: &str,
) -> (Vec<String>, Vec<String>) {
    let additions = text_labels(brackets, Some(added));
    let mut removals: Vec<String> = text_labels(brackets, Some(removed))
        .into_iter()
        .filter(|l| !additions.contains(l))
        .collect();
    removals.sort();
    (additions, removals)
}

/// Mirror the free-text label field as labels on the sink item.
pub fn sync_labels(
    ctx: &mut ExecutionContext,
    rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    let key = require_sink_key(ctx)?;
    let brackets = rule.params.labels_brackets;
    let (add, remove) = match &ctx.event.changes {
        Some(_) => match ctx.event.change("labels") {
            Some(change) => labels_diff(brackets, &change.added, &change.removed),
            None => return Ok(StepStatus::Noop),
        },
        None => (text_labels(brackets, ctx.item.labels.as_deref()), Vec::new()),
    };
    services.sink.update_labels(&key, &add, &remove)?;
    Ok(StepStatus::Performed)
}

/// Mirror source keywords as labels on the sink item.
pub fn sync_keyword_labels(
    ctx: &mut ExecutionContext,
    _rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    let key = require_sink_key(ctx)?;
    let (add, remove) = match &ctx.event.changes {
        Some(_) => match ctx.event.change("keywords") {
            Some(change) => {
                let additions: Vec<String> = change
                    .added
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
                let mut removals: Vec<String> = change
                    .removed
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty() && !additions.iter().any(|a| a == *s))
                    .map(String::from)
                    .collect();
                removals.sort();
                (additions, removals)
            }
            None => return Ok(StepStatus::Noop),
        },
        None => (ctx.item.keywords.clone(), Vec::new()),
    };
    if add.is_empty() && remove.is_empty() {
        return Ok(StepStatus::Noop);
    }
    services.sink.update_labels(&key, &add, &remove)?;
    Ok(StepStatus::Performed)
}

// ---------------------------------------------------------------------------
// existing-phase steps
// ---------------------------------------------------------------------------

/// Carry a changed summary over to the sink item.
pub fn update_summary(
    ctx: &mut ExecutionContext,
    _rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    if !ctx.event.changed_fields().contains(&"summary") {
        return Ok(StepStatus::Noop);
    }
    let key = require_sink_key(ctx)?;
    let summary: String = ctx
        .item
        .summary
        .as_deref()
        .unwrap_or("")
        .chars()
        .take(255)
        .collect();
    services
        .sink
        .update_item(&key, &json!({ "summary": summary }))?;
    Ok(StepStatus::Performed)
}

/// Map the source status (resolution wins when set) through the rule's
/// status map and apply it. An unmapped status is an anticipated shortfall,
/// not an error.
pub fn maybe_update_status(
    ctx: &mut ExecutionContext,
    rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    let current = ctx
        .item
        .resolution
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(ctx.item.status.as_deref())
        .unwrap_or("");
    let Some(mapped) = rule.params.status_map.get(current) else {
        tracing::info!(status = current, "status not in the status map");
        return Ok(StepStatus::Incomplete);
    };

    let apply = match ctx.phase {
        Phase::New => true,
        Phase::Existing => {
            let changed = ctx.event.changed_fields();
            changed.contains(&"status") || changed.contains(&"resolution")
        }
        Phase::Comment => false,
    };
    if !apply {
        return Ok(StepStatus::Noop);
    }

    let key = require_sink_key(ctx)?;
    services
        .sink
        .update_item(&key, &json!({ "status": mapped }))?;
    Ok(StepStatus::Performed)
}

enum MappedField {
    Resolution,
    Priority,
}

/// Shared shape of the map-a-source-field steps: skip when the field is
/// empty on create or untouched on update, `Incomplete` when unmapped,
/// `(None)` in a map clears the sink field.
fn maybe_update_mapped(
    ctx: &mut ExecutionContext,
    rule: &Rule,
    services: &Services,
    field: MappedField,
) -> Result<StepStatus, StepError> {
    let (name, source_value, map) = match field {
        MappedField::Resolution => (
            "resolution",
            ctx.item.resolution.clone().unwrap_or_default(),
            &rule.params.resolution_map,
        ),
        MappedField::Priority => (
            "priority",
            ctx.item.priority.clone().unwrap_or_default(),
            &rule.params.priority_map,
        ),
    };

    let skip = match ctx.phase {
        Phase::New => matches!(source_value.as_str(), "" | "--" | "---"),
        Phase::Existing => !ctx.event.changed_fields().contains(&name),
        Phase::Comment => true,
    };
    if skip {
        return Ok(StepStatus::Noop);
    }

    let Some(target) = map.get(&source_value) else {
        tracing::info!(field = name, value = %source_value, "value not in the field map");
        return Ok(StepStatus::Incomplete);
    };
    let value = if target == "(None)" {
        serde_json::Value::Null
    } else {
        json!(target)
    };
    let key = require_sink_key(ctx)?;
    services.sink.update_item(&key, &json!({ name: value }))?;
    Ok(StepStatus::Performed)
}

pub fn maybe_update_resolution(
    ctx: &mut ExecutionContext,
    rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    maybe_update_mapped(ctx, rule, services, MappedField::Resolution)
}

pub fn maybe_update_priority(
    ctx: &mut ExecutionContext,
    rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    maybe_update_mapped(ctx, rule, services, MappedField::Priority)
}

/// Set sink components from the rule's component options. A 400 means the
/// components field is not on this project's screens; that downgrades to
/// `Incomplete` so one screen config gap doesn't dead-letter every event.
pub fn maybe_update_components(
    ctx: &mut ExecutionContext,
    rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    let opts = &rule.params.components;
    let mut components: Vec<String> = opts.custom.clone();
    if opts.use_item_component {
        if let Some(c) = ctx.item.component.as_deref() {
            components.push(c.to_string());
        }
    }
    if opts.use_item_product {
        if let Some(p) = ctx.item.product.as_deref() {
            components.push(p.to_string());
        }
    }
    if opts.use_product_prefix && ctx.item.component.is_some() {
        components.push(ctx.item.product_component());
    }
    components.sort();
    components.dedup();
    if components.is_empty() {
        return Ok(StepStatus::Noop);
    }

    let key = require_sink_key(ctx)?;
    match services
        .sink
        .update_item(&key, &json!({ "components": components }))
    {
        Ok(()) => Ok(StepStatus::Performed),
        Err(e) if e.status == Some(400) => {
            tracing::warn!(key = %key, error = %e, "could not set components");
            Ok(StepStatus::Incomplete)
        }
        Err(e) => Err(e.into()),
    }
}

/// Mirror the source assignee. An unknown sink user is `Incomplete` on
/// create; on update we fall back to clearing the assignee so the sink
/// never shows a stale owner.
pub fn maybe_assign_user(
    ctx: &mut ExecutionContext,
    _rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    let key = require_sink_key(ctx)?;
    let assignee = ctx.item.assignee.as_deref().filter(|a| !a.is_empty());

    match ctx.phase {
        Phase::New => {
            let Some(user) = assignee else {
                return Ok(StepStatus::Noop);
            };
            match services.sink.update_item(&key, &json!({ "assignee": user })) {
                Ok(()) => Ok(StepStatus::Performed),
                Err(e) if e.class == ErrorClass::Permanent => {
                    tracing::info!(key = %key, error = %e, "could not assign sink user");
                    Ok(StepStatus::Incomplete)
                }
                Err(e) => Err(e.into()),
            }
        }
        Phase::Existing => {
            if !ctx.event.changed_fields().contains(&"assignee") {
                return Ok(StepStatus::Noop);
            }
            let clear = json!({ "assignee": serde_json::Value::Null });
            match assignee {
                None => services.sink.update_item(&key, &clear)?,
                Some(user) => {
                    match services.sink.update_item(&key, &json!({ "assignee": user })) {
                        Ok(()) => {}
                        Err(e) if e.class == ErrorClass::Permanent => {
                            tracing::info!(key = %key, error = %e, "falling back to clearing assignee");
                            services.sink.update_item(&key, &clear)?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Ok(StepStatus::Performed)
        }
        Phase::Comment => Ok(StepStatus::Noop),
    }
}

/// Post one sink comment summarizing tracked field changes
/// (assignee, status, resolution).
pub fn comment_for_changes(
    ctx: &mut ExecutionContext,
    _rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    const TRACKED: [&str; 3] = ["assignee", "status", "resolution"];
    let Some(changes) = ctx.event.changes.as_deref() else {
        return Ok(StepStatus::Noop);
    };
    let lines: Vec<String> = changes
        .iter()
        .filter(|c| TRACKED.contains(&c.field.as_str()))
        .map(|c| format!("* {}: {} -> {}", c.field, c.removed, c.added))
        .collect();
    if lines.is_empty() {
        return Ok(StepStatus::Noop);
    }
    let key = require_sink_key(ctx)?;
    let body = format!("Source item {} changed:\n{}", ctx.item.id, lines.join("\n"));
    services.sink.post_comment(&key, &body)?;
    Ok(StepStatus::Performed)
}

// ---------------------------------------------------------------------------
// comment-phase steps
// ---------------------------------------------------------------------------

/// Mirror a source comment onto the sink item. Empty and private comments
/// are skipped.
pub fn create_comment(
    ctx: &mut ExecutionContext,
    _rule: &Rule,
    services: &Services,
    _details: &mut Details,
) -> Result<StepStatus, StepError> {
    let key = require_sink_key(ctx)?;
    let Some(comment) = &ctx.event.comment else {
        tracing::info!(item = ctx.item.id, "no comment found in payload");
        return Ok(StepStatus::Noop);
    };
    if comment.is_private {
        return Ok(StepStatus::Noop);
    }
    let Some(body) = comment.body.as_deref().filter(|b| !b.is_empty()) else {
        tracing::info!(item = ctx.item.id, "comment body is empty");
        return Ok(StepStatus::Noop);
    };
    let text = match comment.author.as_deref() {
        Some(author) => format!("{author} commented:\n{body}"),
        None => body.to_string(),
    };
    services.sink.post_comment(&key, &text)?;
    Ok(StepStatus::Performed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
