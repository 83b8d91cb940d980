use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Update,
    Comment,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Comment => "comment",
        }
    }
}

// ---------------------------------------------------------------------------
// FieldChange / CommentBody
// ---------------------------------------------------------------------------

/// One changed field in an `update` event, with the raw before/after text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    #[serde(default)]
    pub removed: String,
    #[serde(default)]
    pub added: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentBody {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

// ---------------------------------------------------------------------------
// ItemSnapshot
// ---------------------------------------------------------------------------

/// Full state of a source-tracker item as carried in an event payload, or as
/// returned by the source client when refreshing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub id: u64,
    /// Item kind in the source tracker (e.g. `task`, `defect`).
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    /// Free-text label field; sync tags are bracketed tokens inside it.
    #[serde(default)]
    pub labels: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Cross-reference URLs on the item; a sink item key in here marks the
    /// item as linked.
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

impl ItemSnapshot {
    /// Component prefixed with product, as shown in the source tracker UI
    /// (e.g. `Core::General`).
    pub fn product_component(&self) -> String {
        let prefix = self
            .product
            .as_deref()
            .map(|p| format!("{p}::"))
            .unwrap_or_default();
        match self.component.as_deref() {
            Some(c) => format!("{prefix}{c}"),
            None => prefix,
        }
    }

    /// Extract the linked sink item key from the item's cross-reference URLs.
    ///
    /// A key matching the configured project (`PROJ-123` for project `PROJ`)
    /// wins. Failing that, the first thing that looks like an item key is
    /// kept as a candidate; the context builder rejects candidates living in
    /// a different project than configured.
    pub fn linked_sink_key(&self, project_key: &str) -> Option<String> {
        let mut candidate = None;
        for url in &self.links {
            let tail = url.trim_end_matches('/').rsplit('/').next().unwrap_or("");
            let Some((prefix, number)) = tail.rsplit_once('-') else {
                continue;
            };
            if prefix.is_empty()
                || number.is_empty()
                || !number.bytes().all(|b| b.is_ascii_digit())
            {
                continue;
            }
            if prefix.eq_ignore_ascii_case(project_key) {
                return Some(tail.to_string());
            }
            if candidate.is_none()
                && prefix
                    .bytes()
                    .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
            {
                candidate = Some(tail.to_string());
            }
        }
        candidate
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A single occurrence reported by the source tracker. Immutable once
/// received; `time` is the source-side revision timestamp used for ordering
/// and supersession.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub time: DateTime<Utc>,
    pub item: ItemSnapshot,
    #[serde(default)]
    pub changes: Option<Vec<FieldChange>>,
    #[serde(default)]
    pub comment: Option<CommentBody>,
}

impl Event {
    pub fn changed_fields(&self) -> Vec<&str> {
        self.changes
            .as_deref()
            .map(|cs| cs.iter().map(|c| c.field.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn change(&self, field: &str) -> Option<&FieldChange> {
        self.changes
            .as_deref()
            .and_then(|cs| cs.iter().find(|c| c.field == field))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
