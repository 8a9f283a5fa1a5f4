#[cfg(feature = "cli")]
use agent_memory::{config::Config, memory_db::PatternType, memory_engine::PatternQuery, metrics, telemetry, SharedState};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "agent-memory", version, about = "Inspect and maintain the shared agent memory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Row counts, vector index state and process metrics
    Stats,
    /// Semantic search across sessions, tasks, projects and patterns
    Search {
        query: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        min_similarity: Option<f32>,
    },
    /// List patterns, ranked by confidence or by similarity to --query
    Patterns {
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long = "type")]
        pattern_type: Option<PatternType>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        include_retired: bool,
    },
    /// Pending handoffs addressed to an agent
    Pending { agent: String },
    /// Embed entities stored without a vector
    Backfill {
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// Retire low-confidence patterns once
    Prune,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let cfg = Config::from_env()?;
    cfg.print_config();
    let state = SharedState::new(cfg)?;

    match cli.command {
        Command::Stats => {
            let stats = state.database.get_stats()?;
            let index = state.database.embeddings.get_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            println!("{}", serde_json::to_string_pretty(&index)?);
            print!("{}", metrics::render());
        }
        Command::Search { query, limit, min_similarity } => {
            let limit = limit.unwrap_or(state.config.search_default_limit);
            let min_similarity = min_similarity.unwrap_or(state.config.search_min_similarity);
            let response = state.search.search(&query, limit, min_similarity).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Patterns { query, domain, pattern_type, limit, include_retired } => {
            let found = state
                .patterns
                .find(PatternQuery { query, domain, pattern_type, limit, include_retired })
                .await?;
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
        Command::Pending { agent } => {
            let pending = state.handoffs.list_pending(&agent).await?;
            println!("{}", serde_json::to_string_pretty(&pending)?);
        }
        Command::Backfill { limit } => {
            let report = state.indexer.backfill(limit).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Prune => {
            let retired = state
                .patterns
                .retire_low_confidence(state.config.prune_min_observations, state.config.prune_confidence_threshold)
                .await?;
            println!("Retired {} pattern(s)", retired.len());
            for id in retired {
                println!("  {}", id);
            }
        }
    }

    state.shutdown().await;
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
