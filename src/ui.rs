//! Terminal front end for running jobs.
//!
//! [`JobProgress`] renders a job's progress with `indicatif` and colors state
//! changes with `console`. [`PolicyResolver`] and [`PromptResolver`] answer
//! the failure handshake automatically or interactively.

use std::sync::Arc;

use console::{Style, Term};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::FailurePolicy;
use crate::state_machine::{
    Job, JobCommand, JobFailureDescription, JobFailureOption, JobListener, JobState, JobSummary,
};

/// Progress bar that follows one job.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    pub fn new(job_name: &str) -> Self {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_prefix(job_name.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn bar(&self) -> ProgressBar {
        self.pb.clone()
    }

    fn style_for(&self, state: JobState) -> &Style {
        match state {
            JobState::Finished => &self.green,
            JobState::Aborted | JobState::Failure | JobState::UndoFailure => &self.red,
            _ => &self.yellow,
        }
    }

    /// Prints the job summary as pretty JSON.
    pub fn print_summary(&self, summary: &JobSummary) {
        println!();
        println!(
            "{}",
            self.style_for(summary.state).apply_to("─── Job Summary ───")
        );
        println!(
            "{}",
            serde_json::to_string_pretty(summary).unwrap_or_default()
        );
    }
}

impl JobListener for JobProgress {
    fn state_changed(&self, _job: &Job, old: JobState, new: JobState, command: JobCommand) {
        if new.is_final() {
            let mark = match new {
                JobState::Finished => self.green.apply_to("✓"),
                JobState::Reverted => self.yellow.apply_to("↺"),
                _ => self.red.apply_to("✗"),
            };
            self.pb.finish_and_clear();
            println!("  {mark} {}", self.style_for(new).apply_to(new));
            return;
        }
        if old != JobState::Preparing {
            self.pb.println(format!(
                "  {} {old} → {new} ({command})",
                self.yellow.apply_to("•")
            ));
        }
    }

    fn progress_changed(&self, _job: &Job, percentage: i32) {
        if let Ok(pos) = u64::try_from(percentage) {
            self.pb.set_position(pos.min(100));
        }
    }

    fn description_changed(&self, _job: &Job, description: &str) {
        self.pb.set_message(description.to_string());
    }

    fn failer_emerged(&self, _job: &Job, failure: &Arc<JobFailureDescription>) {
        self.pb
            .println(format!("  {} {failure}", self.red.apply_to("!")));
    }
}

/// Picks the answer for `failure` under `preferred`: the preferred option if
/// offered, else `Cancel` if offered, else the description's default.
pub fn choose_option(failure: &JobFailureDescription, preferred: JobFailureOption) -> JobFailureOption {
    if failure.offers(preferred) {
        preferred
    } else if failure.offers(JobFailureOption::Cancel) {
        JobFailureOption::Cancel
    } else {
        failure.respond()
    }
}

/// Resolves every failure with a fixed option.
pub struct PolicyResolver {
    option: JobFailureOption,
}

impl PolicyResolver {
    pub fn new(option: JobFailureOption) -> Self {
        Self { option }
    }
}

impl JobListener for PolicyResolver {
    fn failer_emerged(&self, job: &Job, failure: &Arc<JobFailureDescription>) {
        // Fire-and-continue reports do not block the worker.
        if !job.state().is_failure() {
            return;
        }
        let option = choose_option(failure, self.option);
        tracing::info!(job = %job.id(), %option, "resolving failure by policy");
        if let Err(e) = job.resolve_failure(option) {
            tracing::warn!(job = %job.id(), error = %e, "could not resolve failure");
        }
    }
}

/// Asks on the terminal which option to take.
pub struct PromptResolver {
    term: Term,
    bar: Option<ProgressBar>,
}

impl PromptResolver {
    pub fn new(bar: Option<ProgressBar>) -> Self {
        Self {
            term: Term::stderr(),
            bar,
        }
    }

    fn ask(&self, failure: &JobFailureDescription) -> JobFailureOption {
        let options = failure.options();
        let _ = self.term.write_line(&format!("{failure}"));
        for (i, option) in options.iter().enumerate() {
            let _ = self.term.write_line(&format!("  [{}] {option}", i + 1));
        }
        loop {
            let _ = self.term.write_str("choice: ");
            let line = match self.term.read_line() {
                Ok(line) => line,
                Err(_) => return choose_option(failure, JobFailureOption::Cancel),
            };
            let picked = line
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| options.get(i).copied())
                .or_else(|| JobFailureOption::parse(&line).filter(|o| failure.offers(*o)));
            if let Some(option) = picked {
                return option;
            }
        }
    }
}

impl JobListener for PromptResolver {
    fn failer_emerged(&self, job: &Job, failure: &Arc<JobFailureDescription>) {
        if !job.state().is_failure() {
            return;
        }
        let option = match &self.bar {
            Some(bar) => bar.suspend(|| self.ask(failure)),
            None => self.ask(failure),
        };
        if let Err(e) = job.resolve_failure(option) {
            tracing::warn!(job = %job.id(), error = %e, "could not resolve failure");
        }
    }
}

/// Builds the failure resolver for `policy`.
pub fn resolver_for(policy: FailurePolicy, bar: Option<ProgressBar>) -> Arc<dyn JobListener> {
    match policy {
        FailurePolicy::Ask => Arc::new(PromptResolver::new(bar)),
        FailurePolicy::Auto(option) => Arc::new(PolicyResolver::new(option)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_prefers_offered_option() {
        let failure = JobFailureDescription::new(
            "missing",
            vec![JobFailureOption::Retry, JobFailureOption::Ignore, JobFailureOption::Cancel],
        );
        assert_eq!(choose_option(&failure, JobFailureOption::Ignore), JobFailureOption::Ignore);
    }

    #[test]
    fn choose_falls_back_to_cancel_then_default() {
        let failure = JobFailureDescription::new(
            "missing",
            vec![JobFailureOption::Retry, JobFailureOption::Cancel],
        );
        assert_eq!(
            choose_option(&failure, JobFailureOption::Rollback),
            JobFailureOption::Cancel
        );

        let failure = JobFailureDescription::new("missing", vec![JobFailureOption::Retry]);
        assert_eq!(
            choose_option(&failure, JobFailureOption::IgnoreAll),
            JobFailureOption::Retry
        );
    }
}
