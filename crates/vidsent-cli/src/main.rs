use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vidsent_adapters::YouTubeDataApi;
use vidsent_core::ShutdownFlag;
use vidsent_storage::{build_http_client, HttpClientConfig};
use vidsent_stream::{CommentBatchConsumer, CommentPublisher};
use vidsent_sync::{
    AnalyticsStore, EnrichmentStage, Loader, NoopAnalyzer, PipelineCoordinator, SyncConfig,
    VideoRegistry,
};

#[derive(Debug, Parser)]
#[command(name = "vidsent-cli")]
#[command(about = "Video comment ingestion and sentiment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch new comments for every registry video, merge snapshots, and
    /// stream discoveries to the raw-comment topic.
    Harvest,
    /// Drain the raw-comment topic into the analytical table until stopped.
    Load,
    /// Fill missing sentiment fields for one video.
    Enrich { video_id: String },
    /// Create the analytical schema if it does not exist yet.
    InitDb,
    /// Harvest, then enrich each video. The loader runs as its own process;
    /// enrichment covers whatever rows it has landed so far.
    Pipeline,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let shutdown = ShutdownFlag::new();
    {
        let flag = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received, finishing current unit of work");
                flag.trigger();
            }
        });
    }

    match cli.command {
        Commands::Harvest => {
            run_harvest(&config, None, &shutdown).await?;
        }
        Commands::Pipeline => {
            let store = AnalyticsStore::connect(&config.database_url)
                .await
                .context("connecting analytical store")?;
            store.init_schema().await?;
            let stage = EnrichmentStage::new(store, Box::new(NoopAnalyzer));
            run_harvest(&config, Some(&stage), &shutdown).await?;
        }
        Commands::Load => {
            let store = AnalyticsStore::connect(&config.database_url)
                .await
                .context("connecting analytical store")?;
            store.init_schema().await?;
            let consumer = CommentBatchConsumer::connect(config.consumer_config())
                .context("connecting kafka consumer")?;
            let loader = Loader::new(store, consumer);
            let stats = loader.run(&shutdown).await?;
            println!(
                "loader stopped: {} comments in {} batches ({} malformed skipped)",
                stats.comments_loaded, stats.batches_committed, stats.malformed_skipped
            );
        }
        Commands::Enrich { video_id } => {
            let store = AnalyticsStore::connect(&config.database_url)
                .await
                .context("connecting analytical store")?;
            store.init_schema().await?;
            let stage = EnrichmentStage::new(store, Box::new(NoopAnalyzer));
            let outcome = stage.run_for_video(&video_id).await?;
            println!(
                "enriched {} comments for {} (sentiment {:?})",
                outcome.processed, outcome.video_id, outcome.distribution
            );
        }
        Commands::InitDb => {
            let store = AnalyticsStore::connect(&config.database_url)
                .await
                .context("connecting analytical store")?;
            store.init_schema().await?;
            println!("analytical schema ready");
        }
    }

    Ok(())
}

async fn run_harvest(
    config: &SyncConfig,
    enrichment: Option<&EnrichmentStage>,
    shutdown: &ShutdownFlag,
) -> Result<()> {
    if config.api_key.is_empty() {
        bail!("YOUTUBE_API_KEY is not set");
    }

    let registry = VideoRegistry::load(&config.videos_file).await?;
    let client = build_http_client(&HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let source = YouTubeDataApi::new(client, config.api_key.clone());
    let publisher = Arc::new(CommentPublisher::connect(config.publisher_config()));
    let coordinator = PipelineCoordinator::new(config);

    let report = coordinator
        .run(&source, publisher, &registry, enrichment, shutdown)
        .await;
    println!("{}", report.render());
    Ok(())
}
