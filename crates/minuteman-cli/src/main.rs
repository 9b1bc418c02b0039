use std::{io::Read, sync::Arc};

use anyhow::Context;
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use minuteman_core::{MinutemanConfig, Work};
use minuteman_scheduler::{
    schedule::parse_datetime, DetachedJob, ExecEnv, HandlerRegistry, Job, ProcessDispatcher,
    ScanReport, Schedule, ScheduleChecker, Scheduler, TaskDispatcher,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "minuteman")]
#[command(version)]
#[command(about = "Runs scheduled jobs without letting them overlap")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (defaults to $MINUTEMAN_CONFIG, then ~/.minuteman/minuteman.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan once and start every due job
    Run {
        /// Run due jobs in this process and wait for all of them
        #[arg(long)]
        wait: bool,
    },

    /// Print the registered jobs
    List,

    /// Evaluate a schedule expression
    Check {
        expression: String,

        /// Reference time as `YYYY-MM-DD HH:MM[:SS]` (defaults to now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Run one detached job read from stdin
    #[command(hide = true)]
    ExecJob,
}

/// Handlers available to `handler = "..."` jobs started by this binary.
fn handlers() -> HandlerRegistry {
    HandlerRegistry::new()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "minuteman=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { wait } => run(cli.config.as_deref(), wait).await,
        Commands::List => list(cli.config.as_deref()),
        Commands::Check { expression, at } => check(&expression, at.as_deref()),
        Commands::ExecJob => exec_job().await,
    }
}

async fn run(config_path: Option<&str>, wait: bool) -> anyhow::Result<()> {
    let config = MinutemanConfig::load(config_path)?;

    if wait {
        let dispatcher = Arc::new(TaskDispatcher::new(ExecEnv::new(handlers())));
        let scheduler = Scheduler::from_config(&config, dispatcher.clone())?;
        log_report(&scheduler.run());
        for (job, outcome) in dispatcher.join().await {
            info!(%job, %outcome, "job finished");
        }
    } else {
        let dispatcher = Arc::new(ProcessDispatcher::current_exe()?);
        let scheduler = Scheduler::from_config(&config, dispatcher)?;
        log_report(&scheduler.run());
    }
    Ok(())
}

fn log_report(report: &ScanReport) {
    info!(
        dispatched = report.dispatched.len(),
        not_due = report.not_due.len(),
        errors = report.errors.len(),
        "scan finished"
    );
    for (job, error) in &report.errors {
        warn!(%job, %error, "job not started");
    }
}

fn list(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = MinutemanConfig::load(config_path)?;
    let scheduler = Scheduler::from_config(&config, Arc::new(TaskDispatcher::new(ExecEnv::default())))?;
    let handlers = handlers();
    for job in scheduler.jobs() {
        println!("{}", describe_job(job, &handlers));
    }
    Ok(())
}

/// One `list` line: name, schedule, work and any reason it cannot run.
fn describe_job(job: &Job, handlers: &HandlerRegistry) -> String {
    let mut line = format!("{}\t{}\t{}", job.name, job.schedule, job.config.work);
    if !job.config.enabled {
        line.push_str(" (disabled)");
    }
    if let Work::Handler(name) = &job.config.work {
        if !handlers.contains(name) {
            line.push_str(" (unknown handler)");
        }
    }
    line
}

fn check(expression: &str, at: Option<&str>) -> anyhow::Result<()> {
    let reference: NaiveDateTime = match at {
        Some(raw) => parse_datetime(raw)
            .with_context(|| format!("invalid --at value '{raw}', expected YYYY-MM-DD HH:MM[:SS]"))?,
        None => ScheduleChecker::now().reference(),
    };
    let due = ScheduleChecker::new(reference).is_due(&Schedule::expression(expression))?;
    println!(
        "'{expression}' is {}due at {}",
        if due { "" } else { "not " },
        reference.format("%Y-%m-%d %H:%M")
    );
    Ok(())
}

async fn exec_job() -> anyhow::Result<()> {
    let mut payload = String::new();
    std::io::stdin()
        .read_to_string(&mut payload)
        .context("reading job payload from stdin")?;
    let job = DetachedJob::from_json(&payload)?;
    let name = job.name.clone();
    let outcome = job.execute(ExecEnv::new(handlers())).await;
    info!(job = %name, %outcome, "detached job finished");
    Ok(())
}
