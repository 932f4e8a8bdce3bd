//! Scout CLI: run the worker loop, the HTTP facade, or a one-shot pipeline
//! cycle.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scout_runtime::api::{self, ApiState};
use scout_runtime::{
    LlmGateway, Pipeline, PipelineTask, RuntimeConfig, SourceRegistry, SqliteStore, TaskWorker,
    WorkerConfig,
};

#[derive(Parser)]
#[command(name = "scout", version, about = "Autonomous research assistant")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler/worker loop against the task queue.
    Worker,
    /// Serve the REST facade.
    Api {
        /// Bind host; defaults to API_HOST or 127.0.0.1.
        #[arg(long)]
        host: Option<String>,
        /// Bind port; defaults to API_PORT or 8080.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one pipeline cycle synchronously and print the result.
    Run {
        /// Free-text research task.
        query: String,
        /// Optional category constraints, e.g. cs.AI (repeatable).
        #[arg(long)]
        category: Vec<String>,
        #[arg(long, default_value_t = 5)]
        max_queries: usize,
        #[arg(long, default_value_t = 20)]
        bm25_top_k: usize,
        #[arg(long, default_value_t = 10)]
        max_analyze: usize,
        #[arg(long, default_value_t = 50.0)]
        min_relevance: f64,
        /// Emit the full structured output as JSON instead of the report.
        #[arg(long)]
        json: bool,
    },
}

fn build_pipeline(config: &RuntimeConfig) -> Arc<Pipeline> {
    let registry = Arc::new(SourceRegistry::with_defaults(config.github_token.clone()));
    let gateway = Arc::new(LlmGateway::from_env(config.max_concurrent_analysis));
    Arc::new(Pipeline::new(registry, gateway, config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig::from_env();

    match cli.command {
        Commands::Worker => {
            let store = Arc::new(
                SqliteStore::open(&config.database_path).context("failed to open store")?,
            );
            let pipeline = build_pipeline(&config);
            let worker = Arc::new(TaskWorker::new(
                store,
                pipeline,
                WorkerConfig::from(&config),
            ));

            let shutdown_worker = worker.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Received shutdown signal");
                    shutdown_worker.shutdown();
                }
            });

            worker.run().await.context("worker loop failed")?;
        }
        Commands::Api { host, port } => {
            let pipeline = build_pipeline(&config);
            let state = Arc::new(ApiState { pipeline });
            let host = host.unwrap_or(config.api_host);
            let port = port.unwrap_or(config.api_port);
            api::serve(state, &host, port)
                .await
                .context("API server failed")?;
        }
        Commands::Run {
            query,
            category,
            max_queries,
            bm25_top_k,
            max_analyze,
            min_relevance,
            json,
        } => {
            let pipeline = build_pipeline(&config);
            let mut task = PipelineTask::new(query);
            if !category.is_empty() {
                task.categories = Some(category);
            }
            task.max_queries = max_queries;
            task.bm25_top_k = bm25_top_k;
            task.max_analyze = max_analyze;
            task.min_relevance = min_relevance;

            let output = pipeline.run(&task).await.context("pipeline failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else if let Some(report) = output.report_text.as_deref() {
                println!("{report}");
            } else {
                println!(
                    "No items above the relevance threshold ({} analyzed).",
                    output.analyzed.len()
                );
            }
        }
    }

    Ok(())
}
