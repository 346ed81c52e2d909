use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use leadwatch_engine::{EngineConfig, LeadWatchEngine, RetryPolicy};
use leadwatch_storage::{LedgerStore, RegisteredUser, UserRole};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod config;
mod locked_file;
mod logging;
mod outbox;
mod scheduler;
mod sheet_file;

use config::{CliOverrides, DaemonConfig};
use outbox::OutboxFile;
use scheduler::{JobContext, Scheduler};
use sheet_file::SheetFile;

#[derive(Parser)]
#[command(name = "leadwatch")]
#[command(about = "Lead lifecycle reminders and change detection", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ledger database file
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Lead sheet (JSON array of rows)
    #[arg(long, global = true)]
    leads: Option<PathBuf>,
    /// Outgoing notification queue (JSON lines)
    #[arg(long, global = true)]
    outbox: Option<PathBuf>,
    /// Seconds between detection and reminder passes
    #[arg(long, global = true)]
    poll_interval: Option<u64>,
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler (default)
    Run,
    /// Run one detection and reminder pass
    Pass,
    /// Send an aggregate report to administrators now
    Report {
        #[command(subcommand)]
        period: ReportCommands,
    },
    /// Manage the seller and administrator registry
    User {
        #[command(subcommand)]
        action: UserCommands,
    },
    /// Inspect the reminder ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerCommands,
    },
}

#[derive(Subcommand)]
enum ReportCommands {
    Daily,
    Weekly,
}

#[derive(Subcommand)]
enum UserCommands {
    Add {
        #[arg(long)]
        telegram_id: i64,
        #[arg(long)]
        role: UserRole,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        full_name: Option<String>,
    },
    List,
}

#[derive(Subcommand)]
enum LedgerCommands {
    /// Reminders claimed but never marked as delivered
    Pending,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = CliOverrides {
        config: cli.config,
        database: cli.database,
        leads: cli.leads,
        outbox: cli.outbox,
        poll_interval_secs: cli.poll_interval,
        log_dir: cli.log_dir,
        debug: cli.debug,
    };
    let config = DaemonConfig::load(&overrides).context("Failed to load configuration")?;
    let _log_guard = logging::init_logging(&config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_scheduler(&config),
        Commands::Pass => {
            let store = open_store(&config)?;
            let report = build_engine(&config)
                .run_pass(&store, Utc::now())
                .context("Pass failed")?;
            println!("Leads fetched:      {}", report.leads_fetched);
            println!("New leads:          {}", report.changes.new_leads);
            println!("Status changes:     {}", report.changes.status_changes);
            println!("Reminders sent:     {}", report.reminders.reminders_sent);
            println!("Reminders skipped:  {}", report.reminders.reminders_skipped);
            println!("Reminders dropped:  {}", report.reminders.reminders_dropped);
            println!(
                "Lead errors:        {}",
                report.changes.lead_errors + report.reminders.lead_errors
            );
            Ok(())
        }
        Commands::Report { period } => {
            let store = open_store(&config)?;
            let engine = build_engine(&config);
            let delivery = match period {
                ReportCommands::Daily => engine.send_daily_report(&store, Utc::now()),
                ReportCommands::Weekly => engine.send_weekly_report(&store, Utc::now()),
            }
            .context("Failed to send report")?;
            println!(
                "Report delivered to {} of {} administrators",
                delivery.delivered, delivery.recipients
            );
            Ok(())
        }
        Commands::User { action } => {
            let store = open_store(&config)?;
            match action {
                UserCommands::Add {
                    telegram_id,
                    role,
                    username,
                    full_name,
                } => {
                    let now = Utc::now();
                    store
                        .upsert_user(&RegisteredUser {
                            telegram_id,
                            username,
                            full_name,
                            role,
                            created_at: now,
                            updated_at: now,
                        })
                        .context("Failed to register user")?;
                    println!("Registered {telegram_id} as {role}");
                }
                UserCommands::List => {
                    let users = store.users().context("Failed to list users")?;
                    if users.is_empty() {
                        println!("No registered users");
                    }
                    for user in users {
                        println!(
                            "{:>12}  {:<6}  {:<20}  {}",
                            user.telegram_id,
                            user.role,
                            user.username.as_deref().unwrap_or("-"),
                            user.full_name.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Ledger { action } => match action {
            LedgerCommands::Pending => {
                let store = open_store(&config)?;
                let pending = store
                    .undelivered_reminders()
                    .context("Failed to read the reminder ledger")?;
                println!("Found {} undelivered reminders:", pending.len());
                for entry in pending {
                    println!(
                        "- [{}] {} at {} (claimed {})",
                        entry.lead_id,
                        entry.kind.as_str(),
                        entry.scheduled_time,
                        entry.created_at.to_rfc3339()
                    );
                }
                Ok(())
            }
        },
    }
}

fn open_store(config: &DaemonConfig) -> Result<LedgerStore> {
    if let Some(parent) = config
        .database_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    LedgerStore::open(&config.database_path).with_context(|| {
        format!(
            "Failed to open ledger {}",
            config.database_path.display()
        )
    })
}

fn build_engine(config: &DaemonConfig) -> LeadWatchEngine {
    LeadWatchEngine::new(
        Arc::new(SheetFile::new(&config.leads_path)),
        Arc::new(OutboxFile::new(&config.outbox_path)),
        EngineConfig {
            static_admins: config.admin_ids.clone(),
            retry: RetryPolicy::new(config.retry_attempts, config.retry_delay),
            ..EngineConfig::default()
        },
    )
}

fn run_scheduler(config: &DaemonConfig) -> Result<()> {
    // Migrate once up front so a bad database fails the start, not every job.
    drop(open_store(config)?);

    let context = JobContext::new(Arc::new(build_engine(config)), config.database_path.clone());
    let scheduler = Scheduler::new(context, config.poll_interval, config.report_hour);
    info!(
        event = "leadwatch_start",
        database = %config.database_path.display(),
        leads = %config.leads_path.display(),
        outbox = %config.outbox_path.display()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(scheduler.run_until_shutdown());
    info!(event = "leadwatch_stop");
    Ok(())
}
