use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use netbksd::config::{AppConfig, EngineType};
use netbksd::core::backup_engine::get_engine;
use netbksd::core::credentials::EnvSecretResolver;
use netbksd::core::notifications::create_notifier;
use netbksd::core::{CronExpr, JobStatus, JobType, Orchestrator, Scheduler, StaticInventory};
use netbksd::logging::{self, LogConfig};
use netbksd::{adapters, context, db};
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "netbksd")]
#[command(about = "Network device backup scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default /etc/netbksd/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    simulation: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Daemon(ServerArgs),
    /// Back up a device, or one of its shares, and wait for the result
    Run(RunArgs),
    /// Show recent backup history for a device
    History {
        #[arg(long)]
        device: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a stored job and its log
    Job { job_id: String },
    /// Normalize a cron expression and list its next fire times
    CheckCron {
        expression: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize, Default, Clone)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    repository: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    engine: Option<EngineType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrent_backups: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(skip)]
    simulation: Option<bool>,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    device: String,

    #[arg(long)]
    share: Option<String>,

    #[command(flatten)]
    server: ServerArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = match cli.command {
        Commands::Daemon(ref args) => Some(args),
        Commands::Run(ref args) => Some(&args.server),
        _ => None,
    };
    let overrides = ServerArgs {
        simulation: cli.simulation,
        ..overrides.cloned().unwrap_or_default()
    };
    let config = AppConfig::new(cli.config.as_deref(), Some(&overrides))?;

    match cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Daemon failed")?,
        Commands::Run(args) => run_backup(config, &args.device, args.share.as_deref())
            .await
            .context("Backup failed")?,
        Commands::History { device, limit } => show_history(&config, device, limit).await?,
        Commands::Job { job_id } => show_job(&config, job_id).await?,
        Commands::CheckCron { expression, count } => check_cron(&expression, count)?,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config).context("Failed to render config")?)
        }
    }

    Ok(())
}

async fn build_orchestrator(config: AppConfig) -> Result<Orchestrator> {
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let db_conn = db::init(&config.database_path).await?;
    let inventory = StaticInventory::from_file(&config.inventory_path)
        .with_context(|| format!("Failed to load inventory {}", config.inventory_path.display()))?;
    let plugins = adapters::build_registry(&config, Arc::new(EnvSecretResolver));
    let engine = get_engine(&config);
    let notifier = create_notifier(&config.notifications);

    let ctx = context::AppContext::new(config, db_conn);
    Ok(Orchestrator::new(
        ctx,
        Arc::new(inventory),
        plugins,
        engine,
        notifier,
    ))
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let tick = Duration::from_millis(config.scheduler.tick_interval_ms.max(1));
    let shutdown_timeout = config.shutdown_timeout();
    let orchestrator = build_orchestrator(config).await?;
    let scheduler = Scheduler::new(orchestrator.clone(), tick);

    scheduler.start().await?;
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    scheduler.stop().await;
    orchestrator.shutdown(shutdown_timeout).await;
    Ok(())
}

async fn run_backup(config: AppConfig, device_id: &str, share_id: Option<&str>) -> Result<()> {
    let shutdown_timeout = config.shutdown_timeout();
    let orchestrator = build_orchestrator(config).await?;

    let jobs = match share_id {
        Some(share_id) => vec![
            orchestrator
                .execute_share_backup(device_id, share_id, JobType::Manual)
                .await?,
        ],
        None => {
            orchestrator
                .execute_device_backup(device_id, JobType::Manual)
                .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&jobs)?);
    // Lets pending notifications go out before the process exits
    orchestrator.shutdown(shutdown_timeout).await;

    let unfinished = jobs
        .iter()
        .filter(|job| job.status != JobStatus::Completed)
        .count();
    if unfinished > 0 {
        anyhow::bail!("{} of {} jobs did not complete", unfinished, jobs.len());
    }
    Ok(())
}

async fn show_history(config: &AppConfig, device_id: String, limit: usize) -> Result<()> {
    let db_conn = db::init(&config.database_path).await?;
    let jobs = db::jobs::list_for_device(&db_conn, device_id, limit).await?;

    for job in jobs {
        println!(
            "{}  {:<20} {:<19} {:<7} files={} added={}B",
            job.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            job.target().to_string(),
            job.status.as_str(),
            job.job_type.as_str(),
            job.files_processed,
            job.bytes_added,
        );
    }
    Ok(())
}

async fn show_job(config: &AppConfig, job_id: String) -> Result<()> {
    let db_conn = db::init(&config.database_path).await?;
    let job = db::jobs::get(&db_conn, job_id.clone())
        .await?
        .with_context(|| format!("No job with id {}", job_id))?;
    let entries = db::jobs::log_entries(&db_conn, job_id).await?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    for entry in entries {
        println!("[{}] {}", entry.level, entry.message);
    }
    Ok(())
}

fn check_cron(expression: &str, count: usize) -> Result<()> {
    let normalized = netbksd::core::normalize_cron(expression)?;
    let expr = CronExpr::parse(&normalized)?;

    println!("{}", normalized);
    for at in expr.upcoming(&Local::now(), count) {
        println!("  {}", at.format("%Y-%m-%d %H:%M:%S %Z"));
    }
    Ok(())
}
