use clap::{Parser, Subcommand};
use keypool::{build_manager, render_history, render_summary, SelectedKey};
use kp_config::{ConfigPaths, PoolConfig};
use kp_quota::{spawn_reset_task, QuotaError};
use std::path::PathBuf;

/// Exit status for `select` when no key can serve the request before the
/// next reset.
const EXIT_POOL_EXHAUSTED: i32 = 2;

#[derive(Parser)]
#[command(
    name = "keypool",
    version = keypool::VERSION,
    about = "API key quota manager"
)]
struct Cli {
    /// Directory holding config.toml and the default quota database
    #[arg(long, global = true, env = "KEYPOOL_HOME")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show today's usage for every key
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Pick the key to use for the next call
    Select {
        /// Only consider keys with at least this many units left today
        #[arg(long)]
        min_remaining: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Report the cost and outcome of a call made with a key
    Charge {
        /// Index of the key that was used
        #[arg(long)]
        key: u32,
        /// Units the call cost
        #[arg(long, default_value_t = 1)]
        cost: u64,
        /// The call failed
        #[arg(long)]
        failed: bool,
        /// Error message returned by the API
        #[arg(long)]
        error: Option<String>,
    },
    /// Roll every key forward to today's quota date
    ResetCheck,
    /// Show stored daily records for a key
    History {
        #[arg(long)]
        key: u32,
        #[arg(long, default_value_t = 7)]
        days: usize,
        #[arg(long)]
        json: bool,
    },
    /// Keep rolling keys over at day boundaries and log pool status
    Watch {
        /// Seconds between checks
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
    /// Print version
    Version,
}

fn load_config(config_dir: Option<PathBuf>) -> anyhow::Result<PoolConfig> {
    PoolConfig::load_from(&ConfigPaths::resolve(config_dir)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keypool=info,kp_quota=info".into()),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("keypool {}", keypool::VERSION);
        return Ok(());
    }

    let config = load_config(cli.config_dir)?;
    let manager = build_manager(&config)?;

    match cli.command {
        Commands::Status { json } => {
            let summary = manager.summary();
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", render_summary(&summary));
            }
        }
        Commands::Select {
            min_remaining,
            json,
        } => match manager.select(min_remaining) {
            Ok(cred) => {
                let selected = SelectedKey::from(&cred);
                if json {
                    println!("{}", serde_json::to_string(&selected)?);
                } else {
                    println!("#{} {}", selected.index, selected.hash);
                }
            }
            Err(e @ QuotaError::PoolExhausted { .. }) => {
                eprintln!("{}", e);
                std::process::exit(EXIT_POOL_EXHAUSTED);
            }
            Err(e) => return Err(e.into()),
        },
        Commands::Charge {
            key,
            cost,
            failed,
            error,
        } => {
            let cred = manager.credential_by_index(key)?;
            let record = match manager.charge_units(&cred, cost, !failed, error.as_deref()) {
                Ok(record) => record,
                Err(QuotaError::DegradedPersistence { record, source, .. }) => {
                    tracing::warn!("Charge kept in memory only, not persisted: {}", source);
                    *record
                }
                Err(e) => return Err(e.into()),
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::ResetCheck => {
            let report = manager.force_reset_check();
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.failed.is_empty() {
                anyhow::bail!("{} key(s) could not be persisted", report.failed.len());
            }
        }
        Commands::History { key, days, json } => {
            let cred = manager.credential_by_index(key)?;
            let records = manager.history(&cred, days)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print!("{}", render_history(&records));
            }
        }
        Commands::Watch { interval } => {
            let period = std::time::Duration::from_secs(interval.max(1));
            let reset_task = spawn_reset_task(manager.ledger().clone(), period);
            let mut ticker = tokio::time::interval(period);
            tracing::info!("Watching {} keys every {:?}", manager.snapshot().len(), period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = manager.summary();
                        tracing::info!(
                            quota_date = %summary.quota_date,
                            available = summary.available_keys,
                            exhausted = summary.exhausted_keys,
                            next_reset = %summary.next_reset,
                            "Pool status"
                        );
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Shutting down...");
                        break;
                    }
                }
            }
            reset_task.abort();
        }
        Commands::Version => {}
    }

    Ok(())
}
