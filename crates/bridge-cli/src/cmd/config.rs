use crate::output::print_json;
use anyhow::Context;
use bridge_core::rule::RuleTable;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Parse and validate the rules file
    Lint,
}

pub fn run(rules_path: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Lint => lint(rules_path, json),
    }
}

fn lint(rules_path: &Path, json: bool) -> anyhow::Result<()> {
    let table = RuleTable::load(rules_path)
        .with_context(|| format!("linting {}", rules_path.display()))?;

    if json {
        print_json(&serde_json::json!({
            "ok": true,
            "rules": table.len(),
            "tags": table.rules().iter().map(|r| r.tag.as_str()).collect::<Vec<_>>(),
        }))?;
    } else {
        println!(
            "No issues found: {} rule(s) in {}",
            table.len(),
            rules_path.display()
        );
    }
    Ok(())
}
