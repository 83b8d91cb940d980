mod cmd;
mod output;

use bridge_core::settings::Settings;
use clap::{Args, Parser, Subcommand};
use cmd::{config::ConfigSubcommand, queue::QueueSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "issuebridge",
    about = "Sync source-tracker events into a sink tracker via declarative rules",
    version,
    propagate_version = true
)]
struct Cli {
    /// Rules file (YAML)
    #[arg(
        long,
        global = true,
        env = "ISSUEBRIDGE_RULES",
        default_value = "config/rules.yaml"
    )]
    rules: PathBuf,

    /// Dead-letter store file
    #[arg(
        long,
        global = true,
        env = "ISSUEBRIDGE_STORE",
        default_value = "issuebridge.redb"
    )]
    store: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Tracker endpoints and retry tuning shared by `serve` and `retry`.
#[derive(Args)]
struct TrackerArgs {
    /// Source tracker base URL
    #[arg(long, env = "ISSUEBRIDGE_SOURCE_URL")]
    source_url: String,

    /// Source tracker API key
    #[arg(long, env = "ISSUEBRIDGE_SOURCE_KEY", hide_env_values = true)]
    source_key: String,

    /// Sink tracker base URL
    #[arg(long, env = "ISSUEBRIDGE_SINK_URL")]
    sink_url: String,

    /// Sink tracker API key
    #[arg(long, env = "ISSUEBRIDGE_SINK_KEY", hide_env_values = true)]
    sink_key: String,

    /// Timeout for tracker API calls, in seconds
    #[arg(long, default_value_t = 30)]
    http_timeout: u64,

    /// Hours a queued event waits between retry attempts
    #[arg(long, default_value_t = 12)]
    retry_interval: i64,

    /// Days to keep retrying a queued event before dropping it
    #[arg(long, default_value_t = 7)]
    max_retry_age: i64,
}

impl TrackerArgs {
    fn settings(&self, rules: &PathBuf, store: &PathBuf) -> Settings {
        Settings {
            rules_path: rules.clone(),
            store_path: store.clone(),
            source_base_url: self.source_url.clone(),
            source_api_key: self.source_key.clone(),
            sink_base_url: self.sink_url.clone(),
            sink_api_key: self.sink_key.clone(),
            http_timeout_secs: self.http_timeout,
            retry_interval_hours: self.retry_interval,
            max_retry_age_days: self.max_retry_age,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook server
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,

        /// API key required in X-Api-Key on inbound calls
        #[arg(long, env = "ISSUEBRIDGE_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Do not run the periodic in-process retry pass
        #[arg(long)]
        no_retry_loop: bool,

        #[command(flatten)]
        trackers: TrackerArgs,
    },

    /// Run one dead-letter retry pass and exit
    Retry {
        #[command(flatten)]
        trackers: TrackerArgs,
    },

    /// Validate the rules file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Inspect the dead-letter queue
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } | Commands::Retry { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Serve {
            port,
            api_key,
            no_retry_loop,
            trackers,
        } => cmd::serve::run(
            trackers.settings(&cli.rules, &cli.store),
            port,
            api_key,
            !no_retry_loop,
        ),
        Commands::Retry { trackers } => {
            cmd::retry::run(&trackers.settings(&cli.rules, &cli.store), cli.json)
        }
        Commands::Config { subcommand } => cmd::config::run(&cli.rules, subcommand, cli.json),
        Commands::Queue { subcommand } => cmd::queue::run(&cli.store, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
