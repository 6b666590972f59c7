//! vault-migrate CLI - VOSpace node tree migration from MSSQL to PostgreSQL.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use vault_migrate::{Config, MigrateError, MigrateOptions, MigrationResult, Migrator, ReplayResult};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code for a run that finished with failed jobs.
const EXIT_JOBS_FAILED: u8 = 4;

/// Exit code for a run stopped by a signal.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "vault-migrate")]
#[command(about = "Migrate a VOSpace node tree from MSSQL to PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for jobs to stop after SIGINT/SIGTERM before exiting
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate top-level nodes, optionally with their subtrees
    Run {
        /// Read and translate every node but write nothing
        #[arg(long)]
        dry_run: bool,

        /// Also migrate everything below each top-level container
        #[arg(short, long)]
        recursive: bool,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Top-level node names to migrate [default: all children of the root]
        #[arg(value_name = "NODE")]
        nodes: Vec<String>,
    },

    /// Apply the source deletion log to the destination
    ReplayDeletions {
        /// Log the events that would be applied without deleting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = load_config(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;

    match cli.command {
        Commands::Run {
            dry_run,
            recursive,
            workers,
            nodes,
        } => {
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }

            let migrator = Migrator::connect(config).await?;
            let options = MigrateOptions {
                nodes,
                recursive,
                dry_run,
                workers,
            };
            let result = migrator.run(options, cancel_token).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_migration(&result);
            }

            Ok(match result.status.as_str() {
                "failed" => ExitCode::from(EXIT_JOBS_FAILED),
                "cancelled" => ExitCode::from(EXIT_CANCELLED),
                _ => ExitCode::SUCCESS,
            })
        }

        Commands::ReplayDeletions { dry_run } => {
            let migrator = Migrator::connect(config).await?;
            let result = migrator.replay_deletions(dry_run, cancel_token).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_replay(&result);
            }

            Ok(if result.status == "cancelled" {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::SUCCESS
            })
        }

        Commands::HealthCheck => {
            let migrator = Migrator::connect(config).await?;
            let result = migrator.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source ({}): {} ({}ms)",
                    result.source_type,
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target ({}): {} ({}ms)",
                    result.target_type,
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Load the configuration; an unreadable file is a configuration error.
fn load_config(path: &Path) -> Result<Config, MigrateError> {
    Config::load(path).map_err(|e| match e {
        MigrateError::Io(io) => {
            MigrateError::Config(format!("cannot read config file {:?}: {}", path, io))
        }
        other => other,
    })
}

fn print_migration(result: &MigrationResult) {
    println!("\nMigration {} ({})", result.status, result.run_id);
    if result.dry_run {
        println!("  Dry run: nothing was written");
    }
    println!("  Top-level nodes: {}", result.top_level_nodes);
    println!(
        "  Subtree jobs: {} total, {} ok, {} failed, {} cancelled",
        result.jobs_total, result.jobs_succeeded, result.jobs_failed, result.jobs_cancelled
    );
    println!("  Nodes migrated: {}", result.nodes_migrated);
    println!("  Skipped items: {}", result.skipped_items);
    println!(
        "  Duration: {:.2}s ({:.1} nodes/sec)",
        result.duration_seconds, result.nodes_per_second
    );
    let ws = &result.write_stats;
    if ws.count > 0 {
        println!(
            "  Put latency: min {:?} avg {:?} max {:?}",
            ws.min(),
            ws.avg(),
            ws.max()
        );
    }
    for path in &result.failed_jobs {
        println!("  FAILED: {}", path);
    }
}

fn print_replay(result: &ReplayResult) {
    println!("\nDeletion replay {} ({})", result.status, result.job_name);
    if result.dry_run {
        println!("  Dry run: nothing was deleted");
    }
    println!("  Events seen: {}", result.events_seen);
    println!("  Events applied: {}", result.events_applied);
    match (result.cursor_last_modified, result.cursor_id) {
        (Some(ts), Some(id)) => println!("  Checkpoint: {} {}", ts, id),
        _ => println!("  Checkpoint: none"),
    }
    println!("  Duration: {:.2}s", result.duration_seconds);
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}' (expected text or json)", other)),
    }

    Ok(())
}

/// Force the process down if jobs have not stopped within `timeout_secs`.
fn spawn_shutdown_deadline(timeout_secs: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        error!("jobs still running after {}s, exiting", timeout_secs);
        std::process::exit(EXIT_CANCELLED as i32);
    });
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
        spawn_shutdown_deadline(shutdown_timeout);
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl-C: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
        token.cancel();
        spawn_shutdown_deadline(shutdown_timeout);
    });

    Ok(cancel_token)
}
