use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use radar_core::RunTrigger;
use radar_engine::{Engine, EngineOptions};
use radar_source::{BiliWebConfig, BiliWebSource, FixtureSource, VideoSource};
use radar_storage::{HttpClientConfig, HttpFetcher, MemoryStore, PgStore, Repository};
use radar_web::{AppState, ServerConfig};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod app_config;

use app_config::{AppConfig, SourceKind};

#[derive(Debug, Parser)]
#[command(name = "radar-cli")]
#[command(about = "Bilibili hot-video radar")]
struct Cli {
    /// Config file; defaults to ./radar.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// API server plus the scheduler tick.
    Serve,
    /// Run one task now and wait for it to finish.
    Run {
        #[arg(long)]
        task: Uuid,
    },
    DryRun {
        #[arg(long)]
        task: Uuid,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// One scheduler pass at the current time.
    Tick,
    Migrate,
    SeedTemplates {
        /// Extra templates to import (YAML with a top-level `templates:` list).
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging.level);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Run { task } => {
            let engine = bootstrap(&config).await?;
            let run = engine
                .executor
                .run_to_completion(task, RunTrigger::Manual)
                .await?;
            print_json(&run)?;
        }
        Commands::DryRun { task, limit } => {
            let engine = bootstrap(&config).await?;
            let report = engine.executor.dry_run(task, limit).await?;
            print_json(&report)?;
        }
        Commands::Tick => {
            let engine = bootstrap(&config).await?;
            let report = engine.scheduler.tick(Utc::now()).await?;
            for run_id in &report.started {
                wait_for_run(&engine, *run_id).await?;
            }
            print_json(&report)?;
        }
        Commands::Migrate => {
            let url = config
                .database
                .url
                .as_deref()
                .context("database.url (or RADAR__DATABASE__URL) is required to migrate")?;
            let store = PgStore::connect(url, config.database.max_connections)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::SeedTemplates { file } => {
            let engine = bootstrap(&config).await?;
            let seeded = engine.templates.seed_presets().await?;
            let imported = match file {
                Some(path) => engine.templates.import_yaml(&path).await?,
                None => 0,
            };
            println!("templates seeded={seeded} imported={imported}");
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},sqlx=warn,hyper=warn,reqwest=warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn serve(config: AppConfig) -> Result<()> {
    let engine = bootstrap(&config).await?;

    let mut scheduler = None;
    if config.scheduler.enabled {
        let sched = engine.scheduler.cron(&config.scheduler.tick_cron).await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.scheduler.tick_cron, "scheduler started");
        scheduler = Some(sched);
    }

    let server = ServerConfig {
        bind: config.bind_addr()?,
        cors_origins: config.http.cors_origins.clone(),
    };
    radar_web::serve(server, AppState::new(engine), shutdown_signal()).await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn bootstrap(config: &AppConfig) -> Result<Engine> {
    let repo = open_repository(config).await?;
    let source = build_source(config)?;
    let options = EngineOptions {
        default_tz: config.default_tz()?,
        recover_orphaned_runs: config.database.recover_orphaned_runs,
        seed_templates: config.scheduler.seed_templates,
    };
    Engine::bootstrap(repo, source, options)
        .await
        .context("bootstrapping engine")
}

async fn open_repository(config: &AppConfig) -> Result<Arc<dyn Repository>> {
    match &config.database.url {
        Some(url) => {
            let store = PgStore::connect(url, config.database.max_connections)
                .await
                .context("connecting to postgres")?;
            if config.database.auto_migrate {
                store.migrate().await.context("running migrations")?;
            }
            Ok(Arc::new(store))
        }
        None => {
            warn!("no database url configured; state lives in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn build_source(config: &AppConfig) -> Result<Arc<dyn VideoSource>> {
    let source = &config.source;
    match source.kind {
        SourceKind::Bilibili => {
            let mut headers = HashMap::new();
            if let Some(referer) = &source.referer {
                headers.insert("referer".to_string(), referer.clone());
            }
            if let Some(cookie) = &source.cookie {
                headers.insert("cookie".to_string(), cookie.clone());
            }
            let fetcher = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(source.request_timeout_secs),
                user_agent: Some(source.user_agent.clone()),
                headers,
                global_concurrency: source.max_concurrency,
                ..HttpClientConfig::default()
            })?;
            let defaults = BiliWebConfig::default();
            let web = BiliWebConfig {
                api_base: source.api_base.clone().unwrap_or(defaults.api_base),
                search_base: source.search_base.clone().unwrap_or(defaults.search_base),
            };
            Ok(Arc::new(BiliWebSource::new(Arc::new(fetcher), web)))
        }
        SourceKind::Fixture => {
            let path = source
                .fixture_path
                .as_ref()
                .context("source.fixture_path is required for the fixture source")?;
            let fixture = FixtureSource::load(path)?;
            info!(videos = fixture.len(), path = %path.display(), "fixture source loaded");
            Ok(Arc::new(fixture))
        }
        SourceKind::None => {
            warn!("no video source configured; searches return nothing");
            Ok(Arc::new(FixtureSource::default()))
        }
    }
}

async fn wait_for_run(engine: &Engine, run_id: Uuid) -> Result<()> {
    loop {
        let run = engine.tasks.get_run(run_id).await?;
        if run.status.is_terminal() {
            info!(%run_id, status = run.status.as_str(), "run finished");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
