//! data-migrate CLI - enterprise data migration engine.

use clap::{Parser, Subcommand};
use data_migrate::{
    Config, MigrateError, Migration, MigrationHandle, MigrationRequest, MigrationStatus,
    Orchestrator,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use uuid::Uuid;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "data-migrate")]
#[command(about = "Phase-based data migration with validation and rollback")]
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

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a migration from a request file and wait for it to finish
    Run {
        /// Path to the YAML migration request
        request: PathBuf,
    },

    /// Show status and progress of a migration
    Status {
        /// Migration id
        id: Uuid,
    },

    /// Pause a running migration at its next batch boundary
    Pause {
        /// Migration id
        id: Uuid,
    },

    /// Resume a paused migration and wait for it to finish
    Resume {
        /// Migration id
        id: Uuid,
    },

    /// Cancel a migration, rolling back its work when enabled
    Cancel {
        /// Migration id
        id: Uuid,
    },

    /// Test connectivity of every configured data source
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    config.executor.await_termination_seconds = Some(cli.shutdown_timeout);
    info!("Loaded configuration from {:?}", cli.config);

    let orchestrator = Orchestrator::from_config(config).await?;
    let result = dispatch(&cli, &orchestrator).await;
    if !orchestrator.shutdown().await {
        warn!("Orchestrator shut down with migrations still running");
    }
    result
}

async fn dispatch(cli: &Cli, orchestrator: &Orchestrator) -> Result<(), MigrateError> {
    match &cli.command {
        Commands::Run { request } => {
            let request = MigrationRequest::load(request)?;
            let (migration, handle) = orchestrator.initiate(request).await?;
            if !cli.output_json {
                println!("Migration started");
                println!("  Id: {}", migration.id);
                println!("  Project code: {}", migration.project_code);
            }
            let shutdown = setup_signal_handler(cli.shutdown_timeout)?;
            let finished =
                wait_for(orchestrator, migration.id, handle, shutdown, cli.shutdown_timeout).await;
            finish(orchestrator, migration.id, finished, cli.output_json).await
        }

        Commands::Resume { id } => {
            let handle = orchestrator.resume(*id).await?;
            let shutdown = setup_signal_handler(cli.shutdown_timeout)?;
            let finished = wait_for(orchestrator, *id, handle, shutdown, cli.shutdown_timeout).await;
            finish(orchestrator, *id, finished, cli.output_json).await
        }

        Commands::Status { id } => {
            let migration = orchestrator.get(*id).await?;
            let progress = orchestrator.progress(*id).await?;
            if cli.output_json {
                let report = serde_json::json!({
                    "migration": migration,
                    "progress": progress,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&migration);
                println!(
                    "  Progress: {:.1}% ({}/{} records)",
                    progress.percentage, progress.processed_records, progress.total_records
                );
                println!("  Throughput: {:.0} records/sec", progress.records_per_second);
                if progress.estimated_remaining_seconds > 0.0 {
                    println!("  Remaining: ~{:.0}s", progress.estimated_remaining_seconds);
                }
            }
            Ok(())
        }

        Commands::Pause { id } => {
            let migration = orchestrator.pause(*id).await?;
            report_transition(&migration, cli.output_json)
        }

        Commands::Cancel { id } => {
            let migration = orchestrator.cancel(*id).await?;
            report_transition(&migration, cli.output_json)
        }

        Commands::HealthCheck => {
            let sources = orchestrator.health_check().await;
            let pools = orchestrator.pool_health().await;
            let healthy = sources.iter().all(|s| s.healthy);

            if cli.output_json {
                let report = serde_json::json!({
                    "healthy": healthy,
                    "sources": sources,
                    "pools": pools,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Health Check Results:");
                for source in &sources {
                    println!(
                        "  {} ({}): {}",
                        source.data_source,
                        source.kind,
                        if source.healthy { "OK" } else { "FAILED" }
                    );
                    if let Some(ref err) = source.error {
                        println!("    Error: {}", err);
                    }
                }
                for pool in &pools {
                    println!(
                        "  Pool {} [{:?}]: {}/{} connections, {} idle, {} waiting",
                        pool.data_source, pool.role, pool.size, pool.max_size, pool.idle, pool.waiting
                    );
                }
                println!(
                    "\n  Overall: {}",
                    if healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
            Ok(())
        }
    }
}

/// Wait for a running migration. A shutdown signal pauses it and gives it
/// `timeout_secs` to reach a batch boundary.
async fn wait_for(
    orchestrator: &Orchestrator,
    id: Uuid,
    mut handle: MigrationHandle,
    shutdown: CancellationToken,
    timeout_secs: u64,
) -> Result<Migration, MigrateError> {
    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = shutdown.cancelled() => {
            match orchestrator.pause(id).await {
                Ok(m) => info!("Pausing migration {}", m.project_code),
                Err(e) => warn!("Could not pause migration {}: {}", id, e),
            }
            match tokio::time::timeout(Duration::from_secs(timeout_secs), &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(MigrateError::State(format!(
                        "migration {} did not stop within {}s",
                        id, timeout_secs
                    )));
                }
            }
        }
    };
    joined.map_err(|e| MigrateError::State(format!("migration task failed: {}", e)))?
}

/// Print the outcome of a finished run and map it to the process result.
async fn finish(
    orchestrator: &Orchestrator,
    id: Uuid,
    finished: Result<Migration, MigrateError>,
    output_json: bool,
) -> Result<(), MigrateError> {
    let migration = match finished {
        Ok(migration) => migration,
        Err(e) => {
            // The stored record carries rollback results for failed runs.
            if let Ok(migration) = orchestrator.get(id).await {
                report(&migration, output_json)?;
            }
            return Err(e);
        }
    };

    report(&migration, output_json)?;
    match migration.status {
        MigrationStatus::Completed => Ok(()),
        MigrationStatus::Paused => Err(MigrateError::Paused),
        MigrationStatus::Cancelled => Err(MigrateError::Cancelled),
        status => Err(MigrateError::State(format!(
            "migration {} ended in status {}",
            migration.project_code, status
        ))),
    }
}

fn report(migration: &Migration, output_json: bool) -> Result<(), MigrateError> {
    if output_json {
        println!("{}", serde_json::to_string_pretty(migration)?);
        return Ok(());
    }

    print_summary(migration);
    let metrics = &migration.metrics;
    println!("  Duration: {:.2}s", metrics.duration_ms as f64 / 1000.0);
    println!(
        "  Records: {} extracted, {} loaded, {} failed",
        metrics.extracted_records, metrics.loaded_records, metrics.failed_records
    );
    if let Some(ref validation) = migration.validation {
        println!(
            "  Validation: {} (score {})",
            if validation.passed { "passed" } else { "failed" },
            validation.score
        );
    }
    for check in &migration.verification {
        let expected = if check.expected_min == check.expected_max {
            check.expected_min.to_string()
        } else {
            format!("{}..={}", check.expected_min, check.expected_max)
        };
        println!(
            "  Verified {}: expected {}, found {}{}",
            check.table,
            expected,
            check.actual,
            if check.matched { "" } else { " (mismatch)" }
        );
    }
    for warning in &migration.rollback_warnings {
        println!("  Rollback warning: {}", warning);
    }
    Ok(())
}

fn print_summary(migration: &Migration) {
    println!("\nMigration {} ({})", migration.project_code, migration.name);
    println!("  Id: {}", migration.id);
    println!("  Status: {}", migration.status);
    println!("  Phase: {}", migration.current_phase);
    if let Some(ref error) = migration.error_message {
        println!("  Error: {}", error);
    }
    if let Some(ref error) = migration.rollback_error {
        println!("  Rollback error: {}", error);
    }
}

fn report_transition(migration: &Migration, output_json: bool) -> Result<(), MigrateError> {
    if output_json {
        println!("{}", serde_json::to_string_pretty(migration)?);
    } else {
        println!(
            "Migration {} is now {}",
            migration.project_code, migration.status
        );
    }
    Ok(())
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
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format {:?} (expected text or json)", other)),
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
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
            "\nReceived {}. Pausing at the next batch boundary (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\nReceived Ctrl-C. Pausing at the next batch boundary (timeout: {}s)...",
                shutdown_timeout
            );
            token.cancel();
        }
    });

    Ok(cancel_token)
}
