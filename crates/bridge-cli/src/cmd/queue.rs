use crate::output::{print_json, print_table};
use bridge_core::store::DeadLetterStore;
use bridge_server::routes::queue::EntrySummary;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// List queued entries, oldest first
    List {
        /// Only entries for this sink project key
        #[arg(long)]
        project: Option<String>,
    },

    /// Count queued entries
    Count {
        /// Only entries for this sink project key
        #[arg(long)]
        project: Option<String>,
    },
}

pub fn run(store_path: &Path, subcmd: QueueSubcommand, json: bool) -> anyhow::Result<()> {
    let store = DeadLetterStore::open(store_path)?;
    match subcmd {
        QueueSubcommand::List { project } => list(&store, project.as_deref(), json),
        QueueSubcommand::Count { project } => count(&store, project.as_deref(), json),
    }
}

fn list(store: &DeadLetterStore, project: Option<&str>, json: bool) -> anyhow::Result<()> {
    let entries: Vec<EntrySummary> = store
        .list(project)?
        .into_iter()
        .map(EntrySummary::from)
        .collect();

    if json {
        print_json(&entries)?;
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                e.project.clone(),
                e.item_id.to_string(),
                e.phase.clone(),
                e.attempts.to_string(),
                e.error_class.to_string(),
                e.first_seen.to_rfc3339(),
                e.last_error.chars().take(60).collect(),
            ]
        })
        .collect();
    print_table(
        &["PROJECT", "ITEM", "PHASE", "ATTEMPTS", "CLASS", "FIRST SEEN", "LAST ERROR"],
        rows,
    );
    Ok(())
}

fn count(store: &DeadLetterStore, project: Option<&str>, json: bool) -> anyhow::Result<()> {
    let count = store.count(project)?;
    if json {
        print_json(&serde_json::json!({ "count": count }))?;
    } else {
        println!("{count}");
    }
    Ok(())
}
