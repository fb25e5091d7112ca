//! Ledger Bridge CLI - drive the accounting sync engine from a terminal

use std::io::{self, BufRead, Write};

use clap::{Parser, Subcommand};
use env_logger::Env;
use ledger_bridge::config::EngineConfig;
use ledger_bridge::monitor::{run_status_monitor, MonitorConfig, RandomJitter, StatusMonitor};
use ledger_bridge::sync::{
    AttemptStatus, EntityKind, ResolutionPolicy, SyncDirection, SyncLogFilter, DEFAULT_DUPLICATE_THRESHOLD,
};
use ledger_bridge::{BridgeError, LedgerBridge};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "ledger-bridge")]
#[command(about = "Keep local contacts, invoices and payments in sync with the accounting provider")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the accounting connection status
    Status {
        /// Keep watching and print every connect/disconnect transition
        #[arg(long)]
        watch: bool,
    },
    /// Connect to the accounting provider (OAuth2 authorization code flow)
    #[command(alias = "authorize-url")]
    Authorize,
    /// Deactivate the current connection
    Disconnect,
    /// Synchronize one entity kind, or all of them in dependency order
    Sync {
        /// contact, invoice or payment (all kinds when omitted)
        #[arg(long, value_parser = EntityKind::from_str)]
        kind: Option<EntityKind>,
        /// push, pull or bidirectional
        #[arg(long, value_parser = SyncDirection::from_str, default_value = "bidirectional")]
        direction: SyncDirection,
    },
    /// List unresolved conflicts
    Conflicts,
    /// Resolve a conflict
    ResolveConflict {
        id: i64,
        /// use_local, use_remote or manual
        #[arg(value_parser = ResolutionPolicy::from_str)]
        policy: ResolutionPolicy,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Report likely duplicate contacts
    Duplicates {
        #[arg(long, default_value_t = DEFAULT_DUPLICATE_THRESHOLD)]
        threshold: f64,
    },
    /// Show the sync error log
    Errors {
        /// Include resolved entries
        #[arg(long)]
        all: bool,
        /// Only entries from the last N hours
        #[arg(long)]
        hours: Option<i64>,
        /// SUCCESS, FAILED or SKIPPED
        #[arg(long, value_parser = AttemptStatus::from_str)]
        status: Option<AttemptStatus>,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Group counts by sync type and status
        #[arg(long)]
        summary: bool,
    },
    /// Mark a sync error log entry resolved
    ResolveError {
        id: i64,
        #[arg(long, default_value = "cli")]
        by: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Raise and list reminders for invoices that never synced
    Reminders,
    /// Run the background scheduler until interrupted
    Schedule {
        /// Minutes between runs (1-1440)
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        log::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<(), BridgeError> {
    let config = EngineConfig::from_env()?;
    let bridge = LedgerBridge::open(&config)?;

    match command {
        Commands::Status { watch } => {
            print_json(&bridge.get_connection_status().await?);
            if watch {
                watch_status(&bridge).await?;
            }
        }
        Commands::Authorize => {
            let auth = bridge.begin_authorization().await?;
            println!("Open this URL to authorize:\n\n  {}\n", auth.url);
            let code = prompt("Authorization code: ")?;
            let state = match prompt(&format!("State [{}]: ", auth.state))? {
                s if s.is_empty() => auth.state.clone(),
                s => s,
            };
            print_json(&bridge.complete_authorization(&code, &state).await?);
        }
        Commands::Disconnect => {
            if bridge.disconnect()? {
                println!("Disconnected");
            } else {
                println!("No active connection");
            }
        }
        Commands::Sync { kind, direction } => match kind {
            Some(kind) => print_json(&bridge.sync_entities(kind, direction).await?),
            None => print_json(&bridge.sync_all(direction).await?),
        },
        Commands::Conflicts => print_json(&bridge.list_unresolved_conflicts()?),
        Commands::ResolveConflict { id, policy, by } => {
            print_json(&bridge.resolve_conflict(id, policy, &by).await?)
        }
        Commands::Duplicates { threshold } => print_json(&bridge.scan_duplicates(threshold)?),
        Commands::Errors {
            all,
            hours,
            status,
            limit,
            summary,
        } => {
            let filter = SyncLogFilter {
                unresolved_only: !all,
                since: hours.map(|h| chrono::Utc::now() - chrono::Duration::hours(h)),
                sync_type: None,
                status,
                limit,
            };
            if summary {
                print_json(&bridge.summarize_sync_errors(&filter)?);
            } else {
                print_json(&bridge.list_sync_errors(&filter)?);
            }
        }
        Commands::ResolveError { id, by, notes } => {
            if bridge.resolve_sync_error(id, &by, notes.as_deref())? {
                println!("Resolved sync error {}", id);
            } else {
                println!("Sync error {} was already resolved", id);
            }
        }
        Commands::Reminders => print_json(&bridge.scan_reminders()?),
        Commands::Schedule { interval } => {
            let scheduler = bridge.scheduler();
            scheduler.load_config().await?;
            let interval = match interval {
                Some(minutes) => minutes,
                None => scheduler.get_config().await.interval_minutes,
            };
            scheduler.update_config(true, interval).await?;

            if tokio::signal::ctrl_c().await.is_err() {
                log::warn!("Failed to listen for Ctrl-C, stopping scheduler");
            }
            scheduler.stop().await?;
        }
    }

    Ok(())
}

async fn watch_status(bridge: &LedgerBridge) -> Result<(), BridgeError> {
    let source = bridge.status_source()?;
    let cancel = CancellationToken::new();
    // No visibility signals from a terminal; keep the sender alive so the channel stays open
    let (_signals_tx, signals_rx) = mpsc::channel(1);

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        interrupt.cancel();
    });

    let monitor = StatusMonitor::new(MonitorConfig::default(), RandomJitter);
    run_status_monitor(monitor, source, signals_rx, cancel, |connected| {
        let at = chrono::Utc::now().to_rfc3339();
        if connected {
            println!("{} connected", at);
        } else {
            println!("{} disconnected", at);
        }
    })
    .await;

    Ok(())
}

fn prompt(label: &str) -> Result<String, BridgeError> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to render output: {}", e),
    }
}
