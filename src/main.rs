mod cli;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use photojobs::config::{EngineConfig, FailurePolicy};
use photojobs::jobs::ImportJob;
use photojobs::ui::{JobProgress, resolver_for};
use photojobs::{Job, JobCommand, JobListener, JobManager, JobState};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::load()?,
    };
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_filter.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Import {
            sources,
            target,
            policy,
            step_delay_ms,
            rollback_after_ms,
            summary,
        } => {
            let policy = match policy {
                Some(name) => FailurePolicy::parse(&name)?,
                None => config.policy()?,
            };
            let delay = Duration::from_millis(step_delay_ms.unwrap_or(config.step_delay_ms));
            let state = run_import(
                &config,
                ImportJob::new(sources, target).with_step_delay(delay),
                policy,
                rollback_after_ms.map(Duration::from_millis),
                summary,
            )?;
            Ok(if state == JobState::Finished {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::States => {
            print_transition_table();
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_import(
    config: &EngineConfig,
    task: ImportJob,
    policy: FailurePolicy,
    rollback_after: Option<Duration>,
    summary: bool,
) -> Result<JobState> {
    let manager = JobManager::with_worker_prefix(config.worker_name_prefix.clone());
    let job = Job::with_manager("import", task, &manager);

    let progress = Arc::new(JobProgress::new(&job.job_name()));
    let bar = progress.bar();
    job.add_job_listener(Arc::clone(&progress) as Arc<dyn JobListener>);
    job.add_job_listener(resolver_for(policy, Some(bar)));

    job.start()?;

    let state = match rollback_after {
        Some(after) => match job.wait_until_final(after) {
            Some(state) => state,
            None => {
                if let Err(e) = job.rollback() {
                    tracing::warn!(error = %e, "rollback request refused");
                }
                wait_forever(&job)
            }
        },
        None => wait_forever(&job),
    };
    job.join();

    if summary {
        progress.print_summary(&job.summary());
    }
    println!("{}", job.job_description());

    manager.clear_finished_jobs();
    manager.shutdown()?;
    Ok(state)
}

fn wait_forever(job: &Job) -> JobState {
    loop {
        if let Some(state) = job.wait_until_final(Duration::from_secs(3600)) {
            return state;
        }
    }
}

fn print_transition_table() {
    println!("{:<14} {:<16} {}", "FROM", "COMMAND", "TO");
    for state in JobState::ALL {
        for command in JobCommand::ALL {
            if let Ok(next) = state.apply(command) {
                println!("{:<14} {:<16} {next}", state.to_string(), command.to_string());
            }
        }
    }
}
