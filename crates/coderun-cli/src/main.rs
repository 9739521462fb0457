use clap::{Parser, Subcommand};
use colored::Colorize;
use coderun_core::config::{Config, LedgerKind};
use coderun_core::sandbox::LogLevel;
use coderun_core::{fingerprint, Error, ExecutionCoordinator};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Everything went fine
const EXIT_OK: i32 = 0;
/// A snippet faulted, the input was rejected, or a dependency is unhealthy
const EXIT_FAULT: i32 = 1;
/// Configuration or backend setup failed
const EXIT_ERROR: i32 = 2;

/// coderun: run JavaScript snippets in a sandbox with result caching
///
/// Evaluate snippets, inspect the execution history, and check backends.
#[derive(Parser)]
#[command(name = "coderun", version, about, long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Record executions in this SQLite file
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one or more snippets, in order, through one pipeline
    Execute {
        /// Snippet source
        code: Vec<String>,
        /// Read a snippet from a file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Wall-clock limit per snippet
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the fingerprint (SHA-256) of a snippet
    Hash {
        /// Snippet source
        code: String,
    },

    /// List recorded executions, most recent first
    History {
        /// Maximum number of records
        #[arg(long)]
        limit: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execution statistics over the configured window
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check cache and ledger connectivity
    Health,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coderun=info,coderun_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let command = match cli.command {
        Commands::Hash { code } => {
            println!("{}", fingerprint(code.as_bytes()));
            return EXIT_OK;
        }
        Commands::Version => {
            println!(
                "coderun {} (coderun-core {})",
                env!("CARGO_PKG_VERSION"),
                env!("CARGO_PKG_VERSION")
            );
            return EXIT_OK;
        }
        command => command,
    };

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return EXIT_ERROR;
        }
    };
    if let Some(path) = cli.ledger {
        config.ledger.backend = LedgerKind::Sqlite;
        config.ledger.sqlite_path = path;
    }
    if let Commands::Execute {
        timeout_ms: Some(ms),
        ..
    } = &command
    {
        config.sandbox.timeout_ms = *ms;
    }
    if let Err(e) = config.validate() {
        eprintln!("{} {}", "error:".red().bold(), e);
        return EXIT_ERROR;
    }
    tracing::debug!(
        cache = %config.cache.backend,
        ledger = %config.ledger.backend,
        timeout_ms = config.sandbox.timeout_ms,
        "configuration loaded"
    );
    let coordinator = match config.build_coordinator() {
        Ok(coordinator) => coordinator,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return EXIT_ERROR;
        }
    };

    match command {
        Commands::Execute {
            code, file, json, ..
        } => execute(&coordinator, code, file, json).await,
        Commands::History { limit, json } => {
            let limit = limit.unwrap_or(coordinator.recent_limit());
            history(&coordinator, limit, json).await
        }
        Commands::Stats { json } => stats(&coordinator, json).await,
        Commands::Health => health(&coordinator).await,
        Commands::Hash { .. } | Commands::Version => EXIT_OK,
    }
}

async fn execute(
    coordinator: &ExecutionCoordinator,
    mut snippets: Vec<String>,
    file: Option<PathBuf>,
    json: bool,
) -> i32 {
    if let Some(path) = file {
        match std::fs::read_to_string(&path) {
            Ok(source) => snippets.push(source),
            Err(e) => {
                eprintln!(
                    "{} cannot read {}: {}",
                    "error:".red().bold(),
                    path.display(),
                    e
                );
                return EXIT_ERROR;
            }
        }
    }
    if snippets.is_empty() {
        eprintln!("{} no snippet given", "error:".red().bold());
        return EXIT_ERROR;
    }

    let mut exit_code = EXIT_OK;
    for code in &snippets {
        match coordinator.execute(code).await {
            Ok(outcome) if json => {
                println!(
                    "{}",
                    json!({ "result": outcome.result, "cached": outcome.cached })
                );
            }
            Ok(outcome) => {
                for line in &outcome.console {
                    let prefix = format!("[{}]", line.level);
                    let prefix = match line.level {
                        LogLevel::Error => prefix.red(),
                        LogLevel::Warn => prefix.yellow(),
                        _ => prefix.dimmed(),
                    };
                    println!("{} {}", prefix, line.text);
                }
                let tag = if outcome.cached {
                    "(cached)".cyan()
                } else {
                    "(executed)".dimmed()
                };
                println!("{} {} {}", "✓".green(), outcome.result, tag);
            }
            Err(e) => {
                if json {
                    println!("{}", json!({ "error": e.to_string() }));
                } else {
                    println!("{} {}", "✗".red(), e);
                }
                let code = match e {
                    Error::Input(_) | Error::Execution(_) => EXIT_FAULT,
                    _ => EXIT_ERROR,
                };
                exit_code = exit_code.max(code);
            }
        }
    }
    exit_code
}

async fn history(coordinator: &ExecutionCoordinator, limit: usize, json: bool) -> i32 {
    let records = match coordinator.recent_executions(limit).await {
        Ok(records) => records,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return EXIT_ERROR;
        }
    };
    if json {
        println!("{}", json!({ "executions": records }));
        return EXIT_OK;
    }
    if records.is_empty() {
        println!("{}", "No executions recorded".dimmed());
        return EXIT_OK;
    }
    for record in &records {
        let outcome = match (&record.result, &record.error) {
            (Some(result), _) => format!("{} {}", "✓".green(), result),
            (None, Some(error)) => format!("{} {}", "✗".red(), error),
            (None, None) => String::new(),
        };
        let code = record.code.lines().next().unwrap_or_default();
        println!(
            "#{:<5} {} {:>5}ms  {}  {}",
            record.id,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.execution_time_ms,
            code.bold(),
            outcome
        );
    }
    EXIT_OK
}

async fn stats(coordinator: &ExecutionCoordinator, json: bool) -> i32 {
    let stats = match coordinator.stats().await {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return EXIT_ERROR;
        }
    };
    if json {
        println!("{}", json!({ "stats": stats }));
        return EXIT_OK;
    }
    let or_dash = |value: Option<String>| value.unwrap_or_else(|| "-".into());
    println!("{}", "Execution statistics".bold());
    println!("  executions: {}", stats.total_executions);
    println!("  errors:     {}", stats.error_count);
    println!(
        "  error rate: {}",
        or_dash(stats.error_rate().map(|rate| format!("{:.1}%", rate * 100.0)))
    );
    println!(
        "  avg time:   {}",
        or_dash(stats.avg_time_ms.map(|t| format!("{:.1}ms", t)))
    );
    println!(
        "  min time:   {}",
        or_dash(stats.min_time_ms.map(|t| format!("{}ms", t)))
    );
    println!(
        "  max time:   {}",
        or_dash(stats.max_time_ms.map(|t| format!("{}ms", t)))
    );
    EXIT_OK
}

async fn health(coordinator: &ExecutionCoordinator) -> i32 {
    let report = coordinator.health().await;
    let mark = |ok: bool| if ok { "ok".green() } else { "down".red() };
    println!("cache  ({}): {}", report.cache_backend, mark(report.cache_ok));
    println!(
        "ledger ({}): {}",
        report.ledger_backend,
        mark(report.ledger_ok && !report.ledger_degraded)
    );
    if report.is_healthy() {
        println!("{}", "healthy".green().bold());
        EXIT_OK
    } else {
        println!("{}", "unhealthy".red().bold());
        EXIT_FAULT
    }
}
