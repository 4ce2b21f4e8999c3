//! Engine configuration loaded from `photojobs.toml`.
//!
//! [`EngineConfig`] holds the tunable parameters. Missing keys use sensible
//! defaults and a missing file means all defaults. `PHOTOJOBS_LOG` takes
//! precedence over the file's `log_filter`.

use std::path::Path;

use serde::Deserialize;

use crate::error::JobError;
use crate::state_machine::JobFailureOption;

pub const CONFIG_FILE: &str = "photojobs.toml";
pub const LOG_ENV: &str = "PHOTOJOBS_LOG";

/// How failures raised by a job are resolved when running from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Ask on the terminal.
    Ask,
    /// Always answer with this option.
    Auto(JobFailureOption),
}

impl FailurePolicy {
    pub fn parse(name: &str) -> Result<Self, JobError> {
        if name.trim().eq_ignore_ascii_case("ask") {
            return Ok(Self::Ask);
        }
        JobFailureOption::parse(name)
            .map(Self::Auto)
            .ok_or_else(|| JobError::Config(format!("unknown failure policy: {name}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Name prefix for worker threads.
    #[serde(default = "default_worker_name_prefix")]
    pub worker_name_prefix: String,

    /// `tracing` filter directive, e.g. `info` or `photojobs=debug`.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Pause between import steps in milliseconds; makes suspend/cancel
    /// observable on small inputs.
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    /// One of `ask`, `retry`, `ignore`, `ignore-all`, `rollback`, `cancel`.
    #[serde(default = "default_failure_policy")]
    pub failure_policy: String,
}

fn default_worker_name_prefix() -> String {
    "job".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_step_delay_ms() -> u64 {
    50
}

fn default_failure_policy() -> String {
    "ask".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_name_prefix: default_worker_name_prefix(),
            log_filter: default_log_filter(),
            step_delay_ms: default_step_delay_ms(),
            failure_policy: default_failure_policy(),
        }
    }
}

impl EngineConfig {
    /// Loads `photojobs.toml` from the working directory, falling back to
    /// defaults when it does not exist.
    pub fn load() -> Result<Self, JobError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self, JobError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<EngineConfig>(&contents)?
        } else {
            Self::default()
        };

        if let Ok(filter) = std::env::var(LOG_ENV)
            && !filter.trim().is_empty()
        {
            config.log_filter = filter;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.worker_name_prefix.trim().is_empty() {
            return Err(JobError::Config("worker_name_prefix must not be empty".into()));
        }
        self.policy()?;
        Ok(())
    }

    pub fn policy(&self) -> Result<FailurePolicy, JobError> {
        FailurePolicy::parse(&self.failure_policy)
    }
}
