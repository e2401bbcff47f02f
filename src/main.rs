use anyhow::{Context, Result};
use axum::http::Request;
use chrono::Utc;
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use url::Url;

use feedsieve::api::{router, AppState};
use feedsieve::config::Config;
use feedsieve::feed::Fetcher;
use feedsieve::retention::{RetentionSweeper, SweepOutcome};
use feedsieve::service::{AggregationService, ServiceSettings};
use feedsieve::storage::{Database, DatabaseError};

#[derive(Parser, Debug)]
#[command(
    name = "feedsieve",
    version,
    about = "Merged, regex-filtered RSS/Atom feeds per subscriber"
)]
struct Args {
    /// TOML config file
    #[arg(long, value_name = "FILE", default_value = "feedsieve.toml")]
    config: PathBuf,

    /// Directory holding the database (overrides `data_dir`)
    #[arg(short = 'o', long = "out", value_name = "DIR")]
    out: Option<PathBuf>,

    /// Listen port (overrides `port`)
    #[arg(short, long)]
    port: Option<u16>,

    /// Verbose logging
    #[arg(long)]
    dev: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Create a subscriber and print its access key
    AddSubscriber {
        /// Use this key instead of generating one
        #[arg(long)]
        key: Option<String>,
    },
    /// Print every registered source
    ListSources,
    /// Register a source with optional title patterns
    RegisterSource {
        url: String,
        patterns: Vec<String>,
    },
    /// Replace the title patterns of a source
    SetPatterns { id: i64, patterns: Vec<String> },
    /// Delete a source with its patterns and subscriptions
    RemoveSource { id: i64 },
    /// Run one retention sweep and exit
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.dev { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(out) = args.out {
        config.data_dir = out;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    tracing::debug!(config = ?config, "Effective configuration");

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!(
            "Failed to create data directory '{}'",
            config.data_dir.display()
        )
    })?;

    let db_path = config.database_path();
    let db_path = db_path
        .to_str()
        .context("Database path is not valid UTF-8")?;
    let db = match Database::open(db_path).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: The database is locked by another process. Stop it and try again.");
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let sweeper = Arc::new(RetentionSweeper::new(db.clone(), config.retention_window()));
    let fetcher = Fetcher::new(config.fetch_timeout(), config.allow_private_sources)
        .context("Failed to build HTTP client")?;
    let service = Arc::new(AggregationService::new(
        db,
        fetcher,
        Arc::clone(&sweeper),
        ServiceSettings::from_config(&config),
    ));

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, service, sweeper).await,
        Command::AddSubscriber { key } => {
            let (id, key) = service.add_subscriber(key.as_deref()).await?;
            println!("Subscriber {id}");
            println!("Access key: {key}");
            println!("Feed: {}/api/{key}/feeds", config.base_url());
            Ok(())
        }
        Command::ListSources => {
            for source in service.list_sources().await? {
                println!("{}\t{}", source.id, source.url);
                for pattern in &source.patterns {
                    println!("\t  {pattern}");
                }
            }
            Ok(())
        }
        Command::RegisterSource { url, patterns } => {
            let id = service.register_source(&url, &patterns).await?;
            println!("Registered source {id}");
            Ok(())
        }
        Command::SetPatterns { id, patterns } => {
            service.database().replace_patterns(id, &patterns).await?;
            let stored = service
                .database()
                .get_source(id)
                .await?
                .map_or(0, |source| source.patterns.len());
            println!("Source {id} now has {stored} pattern(s)");
            Ok(())
        }
        Command::RemoveSource { id } => {
            if service.database().remove_source(id).await? {
                println!("Removed source {id}");
            } else {
                println!("No source with id {id}");
            }
            Ok(())
        }
        Command::Sweep => {
            match sweeper.sweep(Utc::now()).await? {
                SweepOutcome::Completed(report) => {
                    println!("Removed {} source(s)", report.removed.len());
                }
                SweepOutcome::Skipped => println!("A sweep is already running"),
            }
            Ok(())
        }
    }
}

async fn serve(
    config: Config,
    service: Arc<AggregationService>,
    sweeper: Arc<RetentionSweeper>,
) -> Result<()> {
    let base_url = Url::parse(&config.base_url())
        .with_context(|| format!("Invalid public base URL '{}'", config.base_url()))?;
    let admin_token = config.admin_token.clone().map(SecretString::from);
    if admin_token.is_none() {
        tracing::warn!("No admin_token configured, source registry is open to anyone");
    }

    let sweep_task = config
        .sweep_interval()
        .map(|every| sweeper.spawn_periodic(every));

    let state = AppState::new(service, base_url, admin_token);
    let app = router(state).layer(TraceLayer::new_for_http().make_span_with(
        |request: &Request<_>| {
            // The access key is a credential; keep it out of the logs
            let path = request.uri().path();
            let path = if path.starts_with("/api/") { "/api/{key}/.." } else { path };
            tracing::span!(
                Level::INFO,
                "http_request",
                method = %request.method(),
                path = %path,
            )
        },
    ));

    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "Starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(task) = sweep_task {
        task.abort();
    }
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
