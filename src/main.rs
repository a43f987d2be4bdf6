//! Polystore Binary Entry Point
//!
//! Operational commands over the engines described by a configuration file:
//! health checks, schema migrations, and a long-running supervisor.
//! Core functionality is provided by the `polystore` library crate.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use polystore::{
    config::{AppConfig, parse_duration},
    migrate::allow_no_change,
    storage::{Context, EngineType, StorageError, StoreManager},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Polystore - Unified Storage Operations
#[derive(Parser, Debug)]
#[command(name = "polystore", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "POLYSTORE_CONFIG"
    )]
    config: PathBuf,

    /// Migrations base directory (overrides config file)
    #[arg(long, env = "POLYSTORE_MIGRATIONS_PATH")]
    migrations_path: Option<PathBuf>,

    /// Deadline for each command
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    timeout: Duration,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect every configured engine and report its health
    Health,

    /// Manage schema migrations
    Migrate {
        /// Restrict to one engine (relational or time-series)
        #[arg(long, global = true)]
        engine: Option<EngineType>,

        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Connect, optionally migrate, then health-check until interrupted
    Run {
        /// Interval between health checks
        #[arg(long, default_value = "30s", value_parser = parse_duration)]
        interval: Duration,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Revert one migration
    Down,
    /// Apply (positive) or revert (negative) N migrations
    Steps {
        #[arg(allow_hyphen_values = true)]
        n: i64,
    },
    /// Migrate up or down to an exact version
    To { version: u64 },
    /// Mark a version clean without running it
    Force { version: u64 },
    /// Print the version and dirty flag of each engine
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,polystore=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tracing::info!(path = %cli.config.display(), "Loading configuration");
    let mut config = AppConfig::load(&cli.config)?;

    // CLI > ENV > config file
    if let Some(path) = cli.migrations_path {
        config.migrations.path = path;
    }

    tracing::info!(
        primary = %config.database.primary.display_url(),
        kind = %config.database.primary.kind,
        cache = config.database.cache.is_some(),
        document = config.database.document.is_some(),
        timeseries = config.database.timeseries.is_some(),
        migrations = %config.migrations.path.display(),
        "Configuration loaded"
    );

    let mut store = StoreManager::from_app_config(&config);
    let ctx = Context::background().with_timeout(cli.timeout);

    let result = match cli.command {
        Command::Health => health(&mut store, &ctx).await,
        Command::Migrate { engine, action } => {
            migrate(&mut store, &ctx, &config, engine, action).await
        }
        Command::Run { interval } => run(&mut store, &ctx, &config, cli.timeout, interval).await,
    };

    if let Err(e) = store.close().await {
        tracing::error!(error = %e, "Failed to close store");
    }
    result.map_err(Into::into)
}

async fn health(store: &mut StoreManager, ctx: &Context) -> Result<(), StorageError> {
    store.connect(ctx).await?;
    for warning in store.warnings() {
        println!("degraded: {warning}");
    }

    let result = store.health(ctx).await;
    for engine in store.connected_engines() {
        println!("connected: {engine}");
    }
    match &result {
        Ok(()) => println!("healthy"),
        Err(e) => println!("unhealthy: {e}"),
    }
    result
}

async fn migrate(
    store: &mut StoreManager,
    ctx: &Context,
    config: &AppConfig,
    engine: Option<EngineType>,
    action: MigrateAction,
) -> Result<(), StorageError> {
    store.connect(ctx).await?;
    store.setup_migrations(ctx, &config.migrations.path).await?;
    let migrations = store.migrations();

    let engines = match engine {
        Some(engine) => {
            if migrations.migrator(engine).is_none() {
                return Err(StorageError::NotFound(format!("no migrator for {engine}")));
            }
            vec![engine]
        }
        None => migrations.engines(),
    };

    match action {
        MigrateAction::Up if engine.is_none() => migrations.run_migrations(ctx).await?,
        MigrateAction::Down if engine.is_none() => migrations.rollback_migrations(ctx).await?,
        MigrateAction::Status => {
            let statuses = migrations.status(ctx).await;
            let json = serde_json::to_string_pretty(&statuses)
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            println!("{json}");
            return Ok(());
        }
        MigrateAction::Force { version } => {
            let engine = engine.unwrap_or(EngineType::Relational);
            migrations.force(ctx, engine, version).await?;
        }
        action => {
            for engine in &engines {
                let Some(migrator) = migrations.migrator(*engine) else {
                    continue;
                };
                let result = match action {
                    MigrateAction::Up => migrator.up(ctx).await,
                    MigrateAction::Down => migrator.steps(ctx, -1).await,
                    MigrateAction::Steps { n } => migrator.steps(ctx, n).await,
                    MigrateAction::To { version } => migrator.migrate_to(ctx, version).await,
                    MigrateAction::Force { .. } | MigrateAction::Status => Ok(()),
                };
                let changed =
                    allow_no_change(result).map_err(|e| StorageError::engine(*engine, e))?;
                tracing::info!(engine = %engine, changed, "Migration command finished");
            }
        }
    }

    for engine in engines {
        if let Some(migrator) = migrations.migrator(engine) {
            println!("{engine}: {}", migrator.version(ctx).await?);
        }
    }
    Ok(())
}

async fn run(
    store: &mut StoreManager,
    ctx: &Context,
    config: &AppConfig,
    timeout: Duration,
    interval: Duration,
) -> Result<(), StorageError> {
    store.connect(ctx).await?;
    for warning in store.warnings() {
        tracing::warn!(warning = %warning, "Running degraded");
    }

    if config.migrations.run_on_startup {
        store.setup_migrations(ctx, &config.migrations.path).await?;
        store.migrations().run_migrations(ctx).await?;
    }

    tracing::info!(engines = ?store.connected_engines(), "Store ready");
    tracing::info!("Press Ctrl+C to shutdown");

    let mut ticker = tokio::time::interval(interval);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let ctx = Context::background().with_timeout(timeout);
                match store.health(&ctx).await {
                    Ok(()) => tracing::debug!("Health check passed"),
                    Err(e) => tracing::warn!(error = %e, "Health check failed"),
                }
            }
        }
    }

    tracing::info!("Shutting down storage...");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
