//! Binary entry point: `serve` runs the database behind the REST boundary
//! under the lifecycle coordinator, `bench` drives the benchmark harness
//! against an in-process store, `stats` dumps store stats as JSON (§10.5).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mantisdb_bench::{run_workload, score, summarize, KeyDistribution, Operation, WorkloadSpec};
use mantisdb_core::MantisConfig;
use mantisdb_lifecycle::{run_until_signal, Coordinator, LifecycleStep};
use mantisdb_store::MultiModelStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mantisdb")]
#[command(about = "Multi-model embedded/server database")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the database and REST boundary, running until a shutdown signal.
    Serve,
    /// Run a benchmark workload (or the built-in suite) and print a scored report.
    Bench {
        /// Path to a JSON file holding a `WorkloadSpec` array. Runs the
        /// built-in suite when omitted.
        #[arg(long)]
        workload: Option<PathBuf>,
    },
    /// Print current store statistics as JSON and exit.
    Stats,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = MantisConfig::load().await.context("loading configuration")?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Bench { workload } => bench(config, workload).await,
        Command::Stats => stats(config).await,
    }
}

fn build_store(config: &MantisConfig) -> Arc<MultiModelStore> {
    Arc::new(MultiModelStore::new(
        config.database.cache_size,
        Some(config.database.query_timeout),
    ))
}

async fn serve(config: MantisConfig) -> Result<()> {
    info!("starting mantisdb");
    let store = build_store(&config);

    let mut coordinator = Coordinator::new();

    {
        let store = Arc::clone(&store);
        coordinator.register(LifecycleStep::new(
            "storage",
            0,
            Arc::new(move || {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let _ = store.storage_stats();
                    Ok(())
                })
            }),
            Arc::new(|| Box::pin(async { Ok(()) })),
        ));
    }

    {
        let store = Arc::clone(&store);
        coordinator.register(LifecycleStep::new(
            "cache",
            10,
            Arc::new(move || {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let _ = store.cache_stats();
                    Ok(())
                })
            }),
            Arc::new(|| Box::pin(async { Ok(()) })),
        ));
    }

    let api_task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>> =
        Arc::new(tokio::sync::Mutex::new(None));
    {
        let store = Arc::clone(&store);
        let config = config.clone();
        let task_for_start = Arc::clone(&api_task);
        let task_for_stop = Arc::clone(&api_task);
        coordinator.register(LifecycleStep::new(
            "api",
            20,
            Arc::new(move || {
                let store = Arc::clone(&store);
                let config = config.clone();
                let task = Arc::clone(&task_for_start);
                Box::pin(async move {
                    let handle = tokio::spawn(async move {
                        if let Err(e) = mantisdb_api::serve(&config, store).await {
                            error!(error = %e, "REST API terminated with an error");
                        }
                    });
                    *task.lock().await = Some(handle);
                    Ok(())
                })
            }),
            Arc::new(move || {
                let task = Arc::clone(&task_for_stop);
                Box::pin(async move {
                    if let Some(handle) = task.lock().await.take() {
                        handle.abort();
                    }
                    Ok(())
                })
            }),
        ));
    }

    let coordinator = Arc::new(coordinator);
    if let Err(e) = coordinator.start().await {
        error!(failed_step = %e.failed_step, cause = %e.cause, "startup failed");
        return Err(anyhow::anyhow!("startup failed at step `{}`: {}", e.failed_step, e.cause));
    }
    info!(steps = ?coordinator.step_names(), "all lifecycle steps started");

    let shutdown_errors = run_until_signal(coordinator).await;
    for (step, err) in &shutdown_errors {
        warn!(step = %step, error = %err, "shutdown step reported an error");
    }
    info!("mantisdb stopped");
    Ok(())
}

async fn stats(config: MantisConfig) -> Result<()> {
    let store = build_store(&config);
    let body = serde_json::json!({
        "database_stats": store.storage_stats(),
        "cache": store.cache_stats(),
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn bench(config: MantisConfig, workload_path: Option<PathBuf>) -> Result<()> {
    let store = build_store(&config);

    let specs: Vec<WorkloadSpec> = match workload_path {
        Some(path) => {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading workload file {}", path.display()))?;
            serde_json::from_str(&content).context("parsing workload file")?
        }
        None => built_in_workloads(),
    };

    let mut scorecards = Vec::with_capacity(specs.len());
    for spec in specs {
        info!(workload = %spec.name, operations = spec.operations, concurrency = spec.concurrency, "running workload");
        let result = run_workload(Arc::clone(&store), spec).await;
        let card = score(&result);
        println!(
            "{:<24} ops/sec={:>10.1} p50={:>7.2}ms p99={:>7.2}ms errors={:>5.2}% grade={}",
            card.name, result.ops_per_sec, result.latency.p50_ms, result.latency.p99_ms,
            result.error_rate_percent, card.grade
        );
        scorecards.push(card);
    }

    let summary = summarize(&scorecards);
    println!("\noverall score: {:.1}/100", summary.overall_score);
    for (category, category_score) in &summary.category_scores {
        println!("  {category}: {category_score:.1}");
    }
    println!("\nrecommendations:");
    for rec in &summary.recommendations {
        println!("  - {rec}");
    }

    Ok(())
}

fn built_in_workloads() -> Vec<WorkloadSpec> {
    vec![
        WorkloadSpec {
            name: "SequentialWrite".to_string(),
            operation: Operation::Put,
            key_distribution: KeyDistribution::Sequential,
            value_size: 256,
            operations: 20_000,
            concurrency: 4,
            rate_limit: None,
            keyspace: 20_000,
        },
        WorkloadSpec {
            name: "RandomRead".to_string(),
            operation: Operation::Get,
            key_distribution: KeyDistribution::Random,
            value_size: 256,
            operations: 20_000,
            concurrency: 8,
            rate_limit: None,
            keyspace: 20_000,
        },
        WorkloadSpec {
            name: "ConcurrentMixed".to_string(),
            operation: Operation::Mixed,
            key_distribution: KeyDistribution::Zipf { exponent: 1.1 },
            value_size: 512,
            operations: 20_000,
            concurrency: 16,
            rate_limit: None,
            keyspace: 5_000,
        },
        WorkloadSpec {
            name: "ThroughputCapped".to_string(),
            operation: Operation::Put,
            key_distribution: KeyDistribution::Random,
            value_size: 128,
            operations: 5_000,
            concurrency: 4,
            rate_limit: Some(2_000.0),
            keyspace: 5_000,
        },
    ]
}
