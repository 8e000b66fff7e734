//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use serde::Serialize;
use tracing::{info, warn};

use strata_core::{KnowledgePipeline, SearchFilters, SearchOptions};
use strata_shared::{
    AppConfig, EventBusError, PipelineEvent, PredictionType, init_config, load_config,
    load_config_from,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// strata: a continuous knowledge pipeline.
#[derive(Parser)]
#[command(
    name = "strata",
    version,
    about = "Ingest, enrich, search and learn from a stream of external sources.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to the per-user config path).
    #[arg(long, env = "STRATA_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline until interrupted (Ctrl-C).
    Run,

    /// Run one ingest pass over every source, or just one.
    Ingest {
        /// Only ingest this source.
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Search stored knowledge.
    Search {
        query: String,

        /// Fuse semantic and keyword scores.
        #[arg(long)]
        hybrid: bool,

        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Drop results scoring below this.
        #[arg(long, default_value = "0.3")]
        min_score: f64,

        /// Only these sources (repeatable).
        #[arg(long = "from")]
        sources: Vec<String>,

        /// Require any of these topics (repeatable).
        #[arg(long = "topic")]
        topics: Vec<String>,

        /// Keep raw similarity order.
        #[arg(long)]
        no_rerank: bool,
    },

    /// Items most similar to a stored item.
    Similar {
        id: String,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Newest items.
    Recent {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Newest items about a topic.
    Topic {
        topic: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List learned patterns.
    Patterns {
        /// Mine the knowledge base before listing.
        #[arg(long)]
        analyze: bool,
    },

    /// Make predictions: market, content, product or agent.
    Predict {
        kind: PredictionType,

        #[arg(short, long, default_value = "3")]
        count: usize,
    },

    /// List stored predictions, newest first.
    Predictions,

    /// Score every expired prediction.
    Evaluate,

    /// Ingestion, processing, storage and learning counters.
    Stats,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so stdout stays JSON.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "strata=info",
        1 => "strata=debug",
        _ => "strata=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(cli.config.as_ref()),
        };
    }

    let config = resolve_config(cli.config.as_ref())?;
    let pipeline = KnowledgePipeline::from_config(&config)?;
    pipeline.init().await?;

    let outcome = dispatch(&pipeline, cli.command).await;
    if let Err(e) = pipeline.stop().await {
        warn!(error = %e, "failed to shut down cleanly");
    }
    outcome
}

async fn dispatch(pipeline: &KnowledgePipeline, command: Command) -> Result<()> {
    match command {
        Command::Run => cmd_run(pipeline).await,
        Command::Ingest { source } => match source {
            Some(name) => print_json(&pipeline.ingest_source(&name).await?),
            None => print_json(&pipeline.ingest_all().await?),
        },
        Command::Search {
            query,
            hybrid,
            limit,
            min_score,
            sources,
            topics,
            no_rerank,
        } => {
            let options = SearchOptions {
                limit,
                min_score,
                filters: SearchFilters {
                    sources: (!sources.is_empty()).then_some(sources),
                    topics: (!topics.is_empty()).then_some(topics),
                    ..Default::default()
                },
                rerank: !no_rerank,
            };
            let retrieval = pipeline.retrieval();
            let results = if hybrid {
                retrieval.hybrid_search(&query, &options).await?
            } else {
                retrieval.search(&query, &options).await?
            };
            print_json(&results)
        }
        Command::Similar { id, limit } => {
            print_json(&pipeline.retrieval().get_similar(&id, limit).await?)
        }
        Command::Recent { limit } => print_json(&pipeline.retrieval().get_recent(limit).await?),
        Command::Topic { topic, limit } => {
            print_json(&pipeline.retrieval().get_by_topic(&topic, limit).await?)
        }
        Command::Patterns { analyze } => {
            if analyze {
                let report = pipeline.learning().analyze_patterns().await?;
                info!(analyzed = report.analyzed, "pattern analysis finished");
            }
            print_json(&pipeline.learning().patterns().await?)
        }
        Command::Predict { kind, count } => {
            print_json(&pipeline.predictions().predict(kind, count).await?)
        }
        Command::Predictions => print_json(&pipeline.predictions().predictions().await?),
        Command::Evaluate => print_json(&pipeline.predictions().evaluate_predictions().await?),
        Command::Stats => print_json(&pipeline.stats().await?),
        Command::Config { .. } => Err(eyre!("config is handled before the pipeline opens")),
    }
}

fn resolve_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(pipeline: &KnowledgePipeline) -> Result<()> {
    let mut events = pipeline.events().subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PipelineEvent::ItemIngested(_)) => {}
                Ok(PipelineEvent::BatchComplete { source, count }) => {
                    info!(%source, count, "batch complete");
                }
                Ok(PipelineEvent::Error { source, error }) => {
                    warn!(%source, %error, "source error");
                }
                Ok(PipelineEvent::KnowledgeAdded(item)) => {
                    tracing::debug!(id = %item.id, source = %item.source.name, "knowledge added");
                }
                Ok(PipelineEvent::PatternDiscovered(pattern)) => {
                    info!(id = %pattern.id, name = %pattern.name, "pattern discovered");
                }
                Ok(PipelineEvent::PredictionMade(prediction)) => {
                    info!(id = %prediction.id, outcome = %prediction.prediction.outcome, "prediction made");
                }
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });

    let summary = pipeline.start().await?;
    info!(
        sources = summary.sources,
        items = summary.items,
        errors = summary.errors,
        "initial ingest finished, running until Ctrl-C"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("failed to listen for Ctrl-C: {e}"))?;
    info!("interrupt received, shutting down");
    watcher.abort();
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&PathBuf>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
