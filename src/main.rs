use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use runwarden::config::{AppConfig, LoggingConfig};
use runwarden::healing::{FailureContext, FailureReport, HealingService, HealingStore};
use runwarden::scheduler::{
    BrowserMode, ExecutionOptions, ExecutionOptionsOverride, ExecutionStrategy, NewSchedule,
    RunLedger, ScheduleFilter, ScheduleStatus, ScheduleStore,
};
use runwarden::storage::{open_pool, Pool};
use runwarden::worker::{CommandExecutor, Dispatcher};

#[derive(Parser)]
#[command(
    name = "runwarden",
    about = "Test scheduling, execution orchestration and selector healing",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + worker + healing queue)
    Serve {
        /// Bind address, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage scheduled test runs
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Selector healing
    Heal {
        #[command(subcommand)]
        action: HealAction,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List schedules
    List {
        /// Only schedules in this status
        #[arg(long)]
        status: Option<ScheduleStatus>,

        /// Only schedules for this suite
        #[arg(long)]
        suite: Option<String>,
    },

    /// Add a schedule
    Add {
        /// Suite to run
        #[arg(long)]
        suite: String,

        /// Display name (defaults to the suite id)
        #[arg(long)]
        name: Option<String>,

        /// Local wall-clock time, e.g. 2026-11-02T09:30
        #[arg(long)]
        at: String,

        /// IANA time zone the time is given in
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// Higher runs first when several are due
        #[arg(long, default_value = "0")]
        priority: i64,

        /// Retries after a failed attempt
        #[arg(long, default_value = "0")]
        retries: i32,

        /// Run the suite's tests in parallel
        #[arg(long)]
        parallel: bool,

        /// Run headed instead of headless
        #[arg(long)]
        headed: bool,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Cancel a waiting schedule
    Cancel { id: String },

    /// Run a schedule now and wait for it to finish
    RunNow {
        id: String,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Move a finished schedule to a new time
    Reschedule {
        id: String,

        #[arg(long)]
        at: String,

        #[arg(long, default_value = "UTC")]
        timezone: String,
    },

    /// Show the run history of a schedule
    Runs {
        id: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Summary counts across schedules and runs
    Summary,
}

#[derive(Subcommand)]
enum HealAction {
    /// Rank replacement selectors for a failed locator against a saved DOM
    Analyze {
        /// The selector that failed
        #[arg(long)]
        selector: String,

        /// HTML snapshot of the page at the time of failure
        #[arg(long)]
        dom_file: PathBuf,

        #[arg(long)]
        url: Option<String>,

        /// Action that failed (click, fill, ...)
        #[arg(long)]
        action: Option<String>,

        #[arg(long, default_value = "element not found")]
        error: String,
    },

    /// Healing record counts and acceptance rate
    Stats,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open(config: &AppConfig) -> Result<Pool> {
    open_pool(&config.server.db_path)
        .with_context(|| format!("failed to open database {}", config.server.db_path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "starting runwarden daemon");
            runwarden::serve(config).await?;
        }
        Commands::Schedule { action } => schedule(&config, action).await?,
        Commands::Heal { action } => heal(&config, action)?,
        Commands::Config { action: ConfigAction::Show } => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn schedule(config: &AppConfig, action: ScheduleAction) -> Result<()> {
    let pool = open(config)?;
    let store = ScheduleStore::new(pool.clone(), config.worker.max_retries);
    let ledger = RunLedger::new(pool);
    let now = Utc::now();

    match action {
        ScheduleAction::List { status, suite } => {
            let list = store.list(&ScheduleFilter {
                status,
                suite_id: suite,
                limit: None,
            })?;
            if list.is_empty() {
                println!("No schedules found.");
            } else {
                println!(
                    "{:<36} | {:<20} | {:<10} | {:<28} | In (min)",
                    "Id", "Suite", "Status", "Runs at (local)"
                );
                println!("{:-<36}-|-{:-<20}-|-{:-<10}-|-{:-<28}-|-{:-<8}", "", "", "", "", "");
                for s in list {
                    let view = s.view(now);
                    println!(
                        "{:<36} | {:<20} | {:<10} | {:<28} | {}",
                        s.id, s.suite_name, s.status, view.run_at_local, view.minutes_until_run
                    );
                }
            }
        }
        ScheduleAction::Add {
            suite,
            name,
            at,
            timezone,
            priority,
            retries,
            parallel,
            headed,
            notes,
        } => {
            let options = ExecutionOptions {
                mode: if headed { BrowserMode::Headed } else { BrowserMode::Headless },
                execution: if parallel {
                    ExecutionStrategy::Parallel
                } else {
                    ExecutionStrategy::Sequential
                },
                retries,
                ..Default::default()
            };
            let schedule = store.create(
                NewSchedule {
                    suite_id: suite,
                    suite_name: name,
                    run_at: at,
                    timezone,
                    notes,
                    priority,
                    execution_options: options,
                },
                now,
            )?;
            let view = schedule.view(now);
            println!(
                "Schedule {} added: {} (UTC {}, in {} min).",
                schedule.id,
                view.run_at_local,
                schedule.run_at_utc.to_rfc3339(),
                view.minutes_until_run
            );
        }
        ScheduleAction::Cancel { id } => {
            store.cancel(&id, now)?;
            println!("Schedule {id} cancelled.");
        }
        ScheduleAction::RunNow { id, notes } => {
            let executor = Arc::new(CommandExecutor::new(config.executor.clone()));
            let dispatcher = Dispatcher::new(
                store.clone(),
                ledger.clone(),
                executor,
                config.worker.clone(),
                None,
            );
            let started = dispatcher
                .run_now(&id, &ExecutionOptionsOverride::default(), notes, now)
                .await?;
            println!("Run {} started for schedule {id}; waiting...", started.run.id);
            dispatcher.wait_idle().await;

            for run in ledger.list_by_schedule(&id, None)?.iter().rev() {
                if run.started_at < started.run.started_at {
                    continue;
                }
                println!(
                    "  attempt {}: {} ({}/{} passed){}",
                    run.retry_index,
                    run.status,
                    run.tests_passed,
                    run.tests_total,
                    run.error_message
                        .as_deref()
                        .map(|e| format!(" -- {e}"))
                        .unwrap_or_default()
                );
            }
        }
        ScheduleAction::Reschedule { id, at, timezone } => {
            let schedule = store.reschedule(&id, &at, &timezone, now)?;
            println!("Schedule {id} now runs at {}.", schedule.view(now).run_at_local);
        }
        ScheduleAction::Runs { id, limit } => {
            store.get(&id)?;
            let runs = ledger.list_by_schedule(&id, Some(limit))?;
            if runs.is_empty() {
                println!("No runs recorded for {id}.");
            } else {
                println!("{:<36} | {:<9} | {:<5} | {:<25} | Tests", "Run", "Status", "Try", "Started");
                println!("{:-<36}-|-{:-<9}-|-{:-<5}-|-{:-<25}-|-{:-<9}", "", "", "", "", "");
                for run in runs {
                    println!(
                        "{:<36} | {:<9} | {:<5} | {:<25} | {}/{}",
                        run.id,
                        run.status,
                        run.retry_index,
                        run.started_at.to_rfc3339(),
                        run.tests_passed,
                        run.tests_total
                    );
                }
            }
        }
        ScheduleAction::Summary => {
            let summary = ledger.stats_summary(now)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

fn heal(config: &AppConfig, action: HealAction) -> Result<()> {
    let pool = open(config)?;
    let service = HealingService::new(HealingStore::new(pool), config.healing.clone());

    match action {
        HealAction::Analyze {
            selector,
            dom_file,
            url,
            action,
            error,
        } => {
            let dom = std::fs::read_to_string(&dom_file)
                .with_context(|| format!("failed to read {}", dom_file.display()))?;
            let result = service.analyze(
                &FailureReport {
                    error,
                    context: FailureContext {
                        selector,
                        url,
                        action_type: action,
                        dom: Some(dom),
                        ..Default::default()
                    },
                },
                Utc::now(),
            )?;

            let record = &result.record;
            println!("Healing record {} ({})", record.id, record.outcome);
            if record.candidates.is_empty() {
                println!("No replacement candidates found.");
            }
            for (rank, c) in record.candidates.iter().enumerate() {
                println!("{:>2}. {:.2}  {}", rank + 1, c.confidence, c.selector);
            }
            if let Some(warning) = &result.low_confidence {
                println!("warning: {warning}");
            }
        }
        HealAction::Stats => {
            println!("{}", serde_json::to_string_pretty(&service.stats()?)?);
        }
    }
    Ok(())
}
