use crate::error::{BridgeError, Result};
use crate::steps;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// StepLists
// ---------------------------------------------------------------------------

/// Ordered step names to run for each phase. Defaults cover the common
/// mirror-everything setup; projects override per phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLists {
    #[serde(default = "default_new_steps")]
    pub new: Vec<String>,
    #[serde(default = "default_existing_steps")]
    pub existing: Vec<String>,
    #[serde(default = "default_comment_steps")]
    pub comment: Vec<String>,
}

fn default_new_steps() -> Vec<String> {
    [
        "create_item",
        "maybe_drop_duplicate",
        "create_link",
        "link_from_source",
        "sync_labels",
    ]
    .map(String::from)
    .to_vec()
}

fn default_existing_steps() -> Vec<String> {
    ["update_summary", "sync_labels", "comment_for_changes"]
        .map(String::from)
        .to_vec()
}

fn default_comment_steps() -> Vec<String> {
    vec!["create_comment".to_string()]
}

impl Default for StepLists {
    fn default() -> Self {
        Self {
            new: default_new_steps(),
            existing: default_existing_steps(),
            comment: default_comment_steps(),
        }
    }
}

impl StepLists {
    fn all(&self) -> impl Iterator<Item = (&'static str, &[String])> + '_ {
        [
            ("new", self.new.as_slice()),
            ("existing", self.existing.as_slice()),
            ("comment", self.comment.as_slice()),
        ]
        .into_iter()
    }
}

// ---------------------------------------------------------------------------
// RuleParams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LabelsBrackets {
    Yes,
    #[default]
    No,
    Both,
}

/// Controls which sink components the `maybe_update_components` step sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentOptions {
    #[serde(default = "default_true")]
    pub use_item_component: bool,
    #[serde(default)]
    pub use_item_product: bool,
    #[serde(default)]
    pub use_product_prefix: bool,
    #[serde(default)]
    pub custom: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for ComponentOptions {
    fn default() -> Self {
        Self {
            use_item_component: true,
            use_item_product: false,
            use_product_prefix: false,
            custom: Vec::new(),
        }
    }
}

/// Open parameter bag consumed only by steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleParams {
    #[serde(default = "default_issue_type_map")]
    pub issue_type_map: BTreeMap<String, String>,
    #[serde(default)]
    pub status_map: BTreeMap<String, String>,
    #[serde(default)]
    pub resolution_map: BTreeMap<String, String>,
    #[serde(default = "default_priority_map")]
    pub priority_map: BTreeMap<String, String>,
    #[serde(default)]
    pub components: ComponentOptions,
    #[serde(default)]
    pub labels_brackets: LabelsBrackets,
}

fn default_issue_type_map() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("task".to_string(), "Task".to_string()),
        ("defect".to_string(), "Bug".to_string()),
    ])
}

fn default_priority_map() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("".to_string(), "(None)".to_string()),
        ("--".to_string(), "(None)".to_string()),
        ("P1".to_string(), "P1".to_string()),
        ("P2".to_string(), "P2".to_string()),
        ("P3".to_string(), "P3".to_string()),
        ("P4".to_string(), "Low".to_string()),
        ("P5".to_string(), "Lowest".to_string()),
    ])
}

impl Default for RuleParams {
    fn default() -> Self {
        Self {
            issue_type_map: default_issue_type_map(),
            status_map: BTreeMap::new(),
            resolution_map: BTreeMap::new(),
            priority_map: default_priority_map(),
            components: ComponentOptions::default(),
            labels_brackets: LabelsBrackets::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// One sync rule, selected by tag. Loaded once at startup; read-only after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub tag: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub sink_project_key: String,
    #[serde(default)]
    pub steps: StepLists,
    #[serde(default)]
    pub params: RuleParams,
}

// ---------------------------------------------------------------------------
// RuleTable
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RulesFile {
    rules: Vec<Rule>,
}

/// In-memory index of configured rules, in configuration order.
///
/// Each rule's tag is compiled into a bracketed-token matcher at load time
/// so the resolver never recompiles per event.
#[derive(Debug)]
pub struct RuleTable {
    rules: Vec<Rule>,
    matchers: Vec<Regex>,
}

impl RuleTable {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BridgeError::RulesNotFound(path.display().to_string()));
        }
        let data = std::fs::read_to_string(path)?;
        let file: RulesFile = serde_yaml::from_str(&data)?;
        Self::from_rules(file.rules)
    }

    /// Build and validate a table from already-parsed rules.
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self> {
        validate(&rules)?;
        let matchers = rules
            .iter()
            .map(|r| tag_matcher(&r.tag))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules, matchers })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Exact tag lookup, case-insensitive.
    pub fn get(&self, tag: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.tag.eq_ignore_ascii_case(tag))
    }

    pub(crate) fn matchers(&self) -> impl Iterator<Item = (&Rule, &Regex)> {
        self.rules.iter().zip(self.matchers.iter())
    }
}

/// Matcher for `[tag]`, `[tag-suffix]`, `[tag-a-b]`, but not `[tagword]`
/// or `[word-tag]`.
fn tag_matcher(tag: &str) -> Result<Regex> {
    let pattern = format!(r"(?i)\[{}(-[^\]]*)*\]", regex::escape(tag));
    Regex::new(&pattern)
        .map_err(|e| BridgeError::InvalidRules(format!("tag '{tag}' is not matchable: {e}")))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Unknown step names, duplicate tags, and steps missing their required maps
/// all fail here, at load time, never during event processing.
fn validate(rules: &[Rule]) -> Result<()> {
    if rules.is_empty() {
        return Err(BridgeError::InvalidRules("no rules configured".into()));
    }

    let mut seen = std::collections::BTreeSet::new();
    for rule in rules {
        let tag = rule.tag.to_lowercase();
        if tag.is_empty() {
            return Err(BridgeError::InvalidRules("rule with empty tag".into()));
        }
        if !seen.insert(tag) {
            return Err(BridgeError::InvalidRules(format!(
                "duplicated tag '{}'",
                rule.tag
            )));
        }

        for (phase, names) in rule.steps.all() {
            for name in names {
                if !steps::is_known(name) {
                    return Err(BridgeError::InvalidRules(format!(
                        "rule '{}': unknown step '{}' in phase '{}'",
                        rule.tag, name, phase
                    )));
                }
            }
            // Resolution is only meaningful once the status transition has
            // happened on the sink side.
            if let (Some(res), Some(status)) = (
                names.iter().position(|n| n == "maybe_update_resolution"),
                names.iter().position(|n| n == "maybe_update_status"),
            ) {
                if res < status {
                    return Err(BridgeError::InvalidRules(format!(
                        "rule '{}': `maybe_update_resolution` must come after \
                         `maybe_update_status` in phase '{}'",
                        rule.tag, phase
                    )));
                }
            }

            let uses = |step: &str| names.iter().any(|n| n == step);
            if uses("maybe_update_status") && rule.params.status_map.is_empty() {
                return Err(BridgeError::InvalidRules(format!(
                    "rule '{}': `maybe_update_status` used without a status_map",
                    rule.tag
                )));
            }
            if uses("maybe_update_resolution") && rule.params.resolution_map.is_empty() {
                return Err(BridgeError::InvalidRules(format!(
                    "rule '{}': `maybe_update_resolution` used without a resolution_map",
                    rule.tag
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn rule(tag: &str, project: &str) -> Rule {
        Rule {
            tag: tag.to_string(),
            description: None,
            enabled: true,
            sink_project_key: project.to_string(),
            steps: StepLists::default(),
            params: RuleParams::default(),
        }
    }

    #[test]
    fn default_steps_validate() {
        let table = RuleTable::from_rules(vec![rule("proj", "PROJ")]).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("proj").unwrap().sink_project_key, "PROJ");
    }

    #[test]
    fn duplicate_tags_rejected() {
        let err = RuleTable::from_rules(vec![rule("proj", "A"), rule("Proj", "B")]).unwrap_err();
        assert!(err.to_string().contains("duplicated tag"));
    }

    #[test]
    fn unknown_step_rejected_at_load() {
        let mut r = rule("proj", "PROJ");
        r.steps.new = vec!["create_item".into(), "launch_rocket".into()];
        let err = RuleTable::from_rules(vec![r]).unwrap_err();
        assert!(err.to_string().contains("unknown step 'launch_rocket'"));
    }

    #[test]
    fn status_step_requires_status_map() {
        let mut r = rule("proj", "PROJ");
        r.steps.existing = vec!["maybe_update_status".into()];
        let err = RuleTable::from_rules(vec![r]).unwrap_err();
        assert!(err.to_string().contains("without a status_map"));
    }

    #[test]
    fn resolution_must_follow_status() {
        let mut r = rule("proj", "PROJ");
        r.params.status_map.insert("RESOLVED".into(), "Done".into());
        r.params
            .resolution_map
            .insert("FIXED".into(), "Fixed".into());
        r.steps.existing = vec![
            "maybe_update_resolution".into(),
            "maybe_update_status".into(),
        ];
        let err = RuleTable::from_rules(vec![r]).unwrap_err();
        assert!(err.to_string().contains("must come after"));
    }

    #[test]
    fn empty_table_rejected() {
        let err = RuleTable::from_rules(vec![]).unwrap_err();
        assert!(err.to_string().contains("no rules"));
    }

    #[test]
    fn yaml_rule_file_parses_with_defaults() {
        let yaml = r#"
rules:
  - tag: fidefe
    sink_project_key: FIDEFE
    params:
      status_map:
        ASSIGNED: In Progress
        FIXED: Done
"#;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, yaml).unwrap();
        let table = RuleTable::load(&path).unwrap();
        let r = table.get("fidefe").unwrap();
        assert!(r.enabled);
        assert_eq!(r.steps.comment, vec!["create_comment".to_string()]);
        assert_eq!(r.params.status_map["FIXED"], "Done");
        assert_eq!(r.params.issue_type_map["defect"], "Bug");
    }

    #[test]
    fn missing_rules_file_is_typed_error() {
        let err = RuleTable::load(Path::new("/nonexistent/rules.yaml")).unwrap_err();
        assert!(matches!(err, BridgeError::RulesNotFound(_)));
    }
}
