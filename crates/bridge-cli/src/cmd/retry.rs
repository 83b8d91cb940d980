use crate::output::print_json;
use bridge_core::rule::RuleTable;
use bridge_core::scheduler;
use bridge_core::settings::Settings;
use bridge_core::store::DeadLetterStore;
use chrono::Utc;

/// One scheduler pass over the dead-letter store.
///
/// Individual entry failures are counted in the metrics, not surfaced as an
/// error; a non-zero exit means the store or rules file itself was
/// unusable.
pub fn run(settings: &Settings, json: bool) -> anyhow::Result<()> {
    let rules = RuleTable::load(&settings.rules_path)?;
    let store = DeadLetterStore::open(&settings.store_path)?;
    let services = settings.services()?;

    let metrics = scheduler::run_once(
        &rules,
        &services,
        &store,
        settings.retry_interval(),
        settings.max_age(),
        Utc::now(),
    )?;

    if json {
        print_json(&metrics)?;
    } else {
        println!(
            "retry pass: {} ready, {} succeeded, {} failed, {} dropped, {} expired",
            metrics.ready, metrics.succeeded, metrics.failed, metrics.dropped, metrics.swept
        );
    }
    Ok(())
}
