use crate::rule::{Rule, RuleTable};

/// Outcome of matching an event's label text against the rule table.
#[derive(Debug)]
pub enum Resolution<'a> {
    Matched(&'a Rule),
    /// A rule matched but is switched off.
    Disabled(&'a Rule),
    NoMatch,
}

/// Match bracketed tokens in `label_text` against configured tags.
///
/// Tags match `[tag]` and hyphen-suffixed forms like `[tag-fx-h2]`. When
/// several configured tags could match the same label, the first rule in
/// configuration order wins; a disabled winner classifies the event as
/// ignored rather than falling through to later rules.
pub fn resolve<'a>(table: &'a RuleTable, label_text: &str) -> Resolution<'a> {
    if label_text.is_empty() {
        return Resolution::NoMatch;
    }
    for (rule, matcher) in table.matchers() {
        if matcher.is_match(label_text) {
            if rule.enabled {
                return Resolution::Matched(rule);
            }
            return Resolution::Disabled(rule);
        }
    }
    Resolution::NoMatch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Rule, RuleParams, StepLists};

    fn rule(tag: &str, enabled: bool) -> Rule {
        Rule {
            tag: tag.to_string(),
            description: None,
            enabled,
            sink_project_key: tag.to_uppercase(),
            steps: StepLists::default(),
            params: RuleParams::default(),
        }
    }

    fn table(rules: Vec<Rule>) -> RuleTable {
        RuleTable::from_rules(rules).unwrap()
    }

    #[test]
    fn matches_bare_tag() {
        let t = table(vec![rule("proj", true)]);
        assert!(matches!(resolve(&t, "[proj]"), Resolution::Matched(r) if r.tag == "proj"));
    }

    #[test]
    fn matches_hyphen_suffixed_tag() {
        let t = table(vec![rule("proj", true)]);
        assert!(matches!(resolve(&t, "triaged [proj-fx-h2] p1"), Resolution::Matched(_)));
        assert!(matches!(resolve(&t, "[proj-]"), Resolution::Matched(_)));
    }

    #[test]
    fn is_case_insensitive() {
        let t = table(vec![rule("proj", true)]);
        assert!(matches!(resolve(&t, "[PROJ-moco]"), Resolution::Matched(_)));
    }

    #[test]
    fn rejects_prefixed_and_glued_tokens() {
        let t = table(vec![rule("proj", true)]);
        assert!(matches!(resolve(&t, "[myproj]"), Resolution::NoMatch));
        assert!(matches!(resolve(&t, "[projx]"), Resolution::NoMatch));
        assert!(matches!(resolve(&t, "[other-proj]"), Resolution::NoMatch));
        assert!(matches!(resolve(&t, "proj without brackets"), Resolution::NoMatch));
    }

    #[test]
    fn first_configured_rule_wins() {
        let t = table(vec![rule("alpha", true), rule("beta", true)]);
        let got = resolve(&t, "[beta] [alpha]");
        assert!(matches!(got, Resolution::Matched(r) if r.tag == "alpha"));
    }

    #[test]
    fn disabled_rule_is_ignored_not_skipped() {
        let t = table(vec![rule("alpha", false), rule("beta", true)]);
        assert!(matches!(resolve(&t, "[alpha] [beta]"), Resolution::Disabled(_)));
    }

    #[test]
    fn empty_label_never_matches() {
        let t = table(vec![rule("proj", true)]);
        assert!(matches!(resolve(&t, ""), Resolution::NoMatch));
    }
}
