use clap::{Parser, Subcommand};
use engine::{
    applicable_metrics, AgentClient, ClientCredentialsExchange, DatasetItem, EngineConfig,
    EvalType, HttpAgentRuntime, JsonDatasetSource, JsonFileRunStore, JudgeBackend, Metric,
    MetricJudge, Run, RunOrchestrator, RunStatus, TokenProvider,
};
use model::{JudgeClient, ModelProvider, OllamaProvider, OpenAiProvider};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "engine")]
#[command(about = "Evaluate a conversational agent against a dataset with LLM judges")]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an evaluation over a dataset file
    Run {
        /// Dataset JSON file
        #[arg(short, long)]
        dataset: PathBuf,
        /// Name recorded on the run
        #[arg(short, long)]
        name: Option<String>,
        /// Comma-separated metrics to score (default: all applicable)
        #[arg(short, long, value_delimiter = ',')]
        metrics: Vec<Metric>,
        /// Items processed at once
        #[arg(long)]
        concurrency: Option<usize>,
        /// Directory for run snapshots
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Acquire an agent token to test identity settings
    CheckAuth,
    /// Send one message to the agent and print the reply
    Ping {
        #[arg(short, long, default_value = "Hello")]
        message: String,
    },
    /// Check that the judge model backend is reachable
    JudgeHealth,
    /// List the available metrics
    Metrics,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            dataset,
            name,
            metrics,
            concurrency,
            output_dir,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if !metrics.is_empty() {
                config.run.metrics = metrics;
            }
            if let Some(concurrency) = concurrency {
                config.run.concurrency = concurrency;
            }
            if let Some(output_dir) = output_dir {
                config.run.output_dir = output_dir;
            }
            run_dataset(&config, &dataset, name).await?;
        }
        Commands::CheckAuth => {
            let config = load_config(cli.config.as_deref())?;
            check_auth(&config).await?;
        }
        Commands::Ping { message } => {
            let config = load_config(cli.config.as_deref())?;
            ping(&config, &message).await?;
        }
        Commands::JudgeHealth => {
            let config = load_config(cli.config.as_deref())?;
            judge_health(&config).await?;
        }
        Commands::Metrics => list_metrics(),
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    Ok(config.apply_env()?)
}

fn token_provider(
    config: &EngineConfig,
) -> Result<Arc<TokenProvider>, Box<dyn std::error::Error>> {
    config.identity.validate()?;
    let exchange = ClientCredentialsExchange::new(&config.identity)?;
    Ok(Arc::new(TokenProvider::new(
        Arc::new(exchange),
        config.identity.token_skew(),
    )))
}

fn agent_client(config: &EngineConfig) -> Result<Arc<AgentClient>, Box<dyn std::error::Error>> {
    config.agent.validate()?;
    let settings = config.agent.settings();
    let runtime = HttpAgentRuntime::new(&config.agent.endpoint, settings.turn_timeout)?;
    Ok(Arc::new(AgentClient::new(
        Arc::new(runtime),
        token_provider(config)?,
        settings,
    )))
}

fn judge_provider(
    config: &EngineConfig,
) -> Result<Arc<dyn ModelProvider>, Box<dyn std::error::Error>> {
    config.judge.validate()?;
    let provider: Arc<dyn ModelProvider> = match config.judge.backend {
        JudgeBackend::OpenAi => Arc::new(OpenAiProvider::new(config.judge.openai())?),
        JudgeBackend::Ollama => Arc::new(OllamaProvider::new(config.judge.ollama())?),
    };
    Ok(provider)
}

async fn run_dataset(
    config: &EngineConfig,
    dataset: &Path,
    name: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    let run_config = config.run.run_config();
    let judge = MetricJudge::new(
        JudgeClient::new(judge_provider(config)?, config.judge.judge_config()),
        run_config.thresholds.clone(),
    );
    let (datasets, dataset_id) = JsonDatasetSource::for_file(dataset);
    let store = JsonFileRunStore::new(&config.run.output_dir);
    let snapshot_dir = store.dir().to_path_buf();

    let orchestrator = RunOrchestrator::new(
        agent_client(config)?,
        judge,
        Arc::new(datasets),
        Arc::new(store),
        run_config,
    );

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation requested; waiting for in-flight items");
            on_ctrl_c.cancel();
        }
    });

    let run = orchestrator.execute(&dataset_id, name, cancel).await?;
    print_summary(&run);
    println!(
        "Snapshot: {}",
        snapshot_dir.join(format!("{}.json", run.id)).display()
    );

    if run.status == RunStatus::Failed {
        let reason = run
            .summary
            .as_ref()
            .and_then(|s| s.failure.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(format!("Run {} failed: {}", run.id, reason).into());
    }
    Ok(())
}

fn print_summary(run: &Run) {
    println!();
    println!("=== Run {} ===", run.id);
    println!("Dataset: {}", run.dataset_id);
    if let Some(name) = &run.name {
        println!("Name: {}", name);
    }
    println!("Status: {}", run.status);

    let Some(summary) = &run.summary else {
        return;
    };

    println!(
        "Items: {} total, {} completed, {} failed, {} pending",
        summary.total_items, summary.completed_items, summary.failed_items, summary.pending_items
    );
    println!(
        "Passed: {} ({:.1}%), item success rate {:.1}%",
        summary.passed_items,
        summary.pass_rate * 100.0,
        summary.item_success_rate * 100.0
    );
    if let Some(mean) = summary.mean_score {
        println!("Mean score: {:.3}", mean);
    }

    if !summary.metrics.is_empty() {
        println!();
        println!(
            "{:<28} {:>6} {:>9} {:>7} {:>8}",
            "metric", "mean", "pass rate", "scored", "errored"
        );
        for (metric, m) in &summary.metrics {
            println!(
                "{:<28} {:>6.3} {:>8.1}% {:>7} {:>8}",
                metric.name(),
                m.mean,
                m.pass_rate * 100.0,
                m.scored,
                m.errored
            );
        }
    }

    let failures: Vec<_> = run.items.iter().filter(|i| i.error.is_some()).collect();
    if !failures.is_empty() {
        println!();
        println!("Failed items:");
        for item in failures {
            if let Some(error) = &item.error {
                println!(
                    "  #{} {}: {}",
                    item.index,
                    item.item_id.as_deref().unwrap_or("-"),
                    error
                );
            }
        }
    }
}

async fn check_auth(config: &EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("Requesting token for {}...", config.identity.scope);
    let tokens = token_provider(config)?;

    match tokens.acquire().await {
        Ok(token) => {
            println!(
                "✓ Token acquired ({} chars), expires {}",
                token.value().len(),
                token.expires_at()
            );
            info!("Credential check successful");
            Ok(())
        }
        Err(e) => {
            println!("✗ Token request failed: {}", e);
            error!("Credential check failed: {}", e);
            Err(e.into())
        }
    }
}

async fn ping(config: &EngineConfig, message: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = agent_client(config)?;
    let transcript = client.converse(&DatasetItem::single_turn(message)).await?;

    println!("You: {}", message);
    println!("Agent: {}", transcript.actual_output);
    println!(
        "({} activities, {} ms)",
        transcript.activities.len(),
        transcript.duration_ms
    );
    Ok(())
}

async fn judge_health(config: &EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("Performing judge health check...");
    let provider = judge_provider(config)?;

    match provider.health_check().await {
        Ok(()) => {
            println!(
                "✓ Health check passed. {} judge '{}' is reachable.",
                provider.provider_name(),
                config.judge.model
            );
            info!("Judge health check successful");
            Ok(())
        }
        Err(e) => {
            println!("✗ Health check failed: {}", e);
            error!("Judge health check failed: {}", e);
            Err(e.into())
        }
    }
}

fn list_metrics() {
    println!("Available metrics:");
    let all_types = [EvalType::SingleTurn, EvalType::MultiTurn, EvalType::Autonomous];
    for metric in Metric::ALL {
        let eval_types: Vec<&str> = all_types
            .into_iter()
            .filter(|t| applicable_metrics(*t).contains(&metric))
            .map(|t| t.as_str())
            .collect();
        println!(
            "  - {} ({:?}; {}): {}",
            metric.name(),
            metric.kind(),
            eval_types.join(", "),
            metric.description()
        );
    }
}
