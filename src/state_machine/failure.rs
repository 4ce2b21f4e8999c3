use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// A response the resolver of a failure may choose.
///
/// The engine never interprets these; the task that raised the failure
/// branches on whichever option was written before it was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobFailureOption {
    Retry,
    Ignore,
    IgnoreAll,
    Rollback,
    Cancel,
}

impl JobFailureOption {
    /// Parses the kebab-case name used in configuration and on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "retry" => Some(Self::Retry),
            "ignore" => Some(Self::Ignore),
            "ignore-all" | "ignoreall" => Some(Self::IgnoreAll),
            "rollback" => Some(Self::Rollback),
            "cancel" => Some(Self::Cancel),
            _ => None,
        }
    }
}

impl fmt::Display for JobFailureOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobFailureOption::Retry => "Retry",
            JobFailureOption::Ignore => "Ignore",
            JobFailureOption::IgnoreAll => "Ignore All",
            JobFailureOption::Rollback => "Rollback",
            JobFailureOption::Cancel => "Cancel",
        };
        f.write_str(name)
    }
}

/// Describes a recoverable failure and carries the resolver's answer back to
/// the worker.
///
/// Created by a task, shared as `Arc<JobFailureDescription>` with listeners,
/// written once by whoever resolves the failure and read by the worker after
/// it has been resumed.
pub struct JobFailureDescription {
    cause: Option<Arc<anyhow::Error>>,
    description: String,
    options: Vec<JobFailureOption>,
    respond: Mutex<JobFailureOption>,
}

impl JobFailureDescription {
    /// Creates a description offering `options`; the first one is the default
    /// response. An empty list falls back to offering `Cancel` only.
    pub fn new(description: impl Into<String>, options: Vec<JobFailureOption>) -> Self {
        let options = if options.is_empty() {
            vec![JobFailureOption::Cancel]
        } else {
            options
        };
        Self {
            cause: None,
            description: description.into(),
            respond: Mutex::new(options[0]),
            options,
        }
    }

    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Sets the default response without checking it against the options.
    pub fn with_default(self, option: JobFailureOption) -> Self {
        *self.respond.lock().unwrap_or_else(|e| e.into_inner()) = option;
        self
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn options(&self) -> &[JobFailureOption] {
        &self.options
    }

    pub fn offers(&self, option: JobFailureOption) -> bool {
        self.options.contains(&option)
    }

    pub fn respond(&self) -> JobFailureOption {
        *self.respond.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the resolver's answer. Options that were not offered are rejected.
    pub fn set_respond(&self, option: JobFailureOption) -> Result<(), JobError> {
        if !self.offers(option) {
            return Err(JobError::OptionNotOffered(option));
        }
        *self.respond.lock().unwrap_or_else(|e| e.into_inner()) = option;
        Ok(())
    }
}

impl fmt::Debug for JobFailureDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobFailureDescription")
            .field("description", &self.description)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .field("options", &self.options)
            .field("respond", &self.respond())
            .finish()
    }
}

impl fmt::Display for JobFailureDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {cause}", self.description),
            None => f.write_str(&self.description),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_option_is_default_response() {
        let desc = JobFailureDescription::new(
            "missing file",
            vec![JobFailureOption::Retry, JobFailureOption::Cancel],
        );
        assert_eq!(desc.respond(), JobFailureOption::Retry);
    }

    #[test]
    fn empty_options_fall_back_to_cancel() {
        let desc = JobFailureDescription::new("broken", Vec::new());
        assert_eq!(desc.options(), &[JobFailureOption::Cancel]);
        assert_eq!(desc.respond(), JobFailureOption::Cancel);
    }

    #[test]
    fn set_respond_rejects_options_not_offered() {
        let desc = JobFailureDescription::new("disk full", vec![JobFailureOption::Retry]);
        let err = desc.set_respond(JobFailureOption::Rollback).unwrap_err();
        assert!(matches!(err, JobError::OptionNotOffered(JobFailureOption::Rollback)));
        assert_eq!(desc.respond(), JobFailureOption::Retry);
    }

    #[test]
    fn set_respond_overwrites_default() {
        let desc = JobFailureDescription::new(
            "missing file",
            vec![JobFailureOption::Retry, JobFailureOption::IgnoreAll],
        );
        desc.set_respond(JobFailureOption::IgnoreAll).unwrap();
        assert_eq!(desc.respond(), JobFailureOption::IgnoreAll);
    }

    #[test]
    fn display_includes_cause() {
        let desc = JobFailureDescription::new("copy failed", vec![JobFailureOption::Cancel])
            .with_cause(anyhow::anyhow!("permission denied"));
        assert_eq!(desc.to_string(), "copy failed: permission denied");
        assert!(desc.cause().is_some());
    }

    #[test]
    fn option_parse_accepts_kebab_case() {
        assert_eq!(JobFailureOption::parse("ignore-all"), Some(JobFailureOption::IgnoreAll));
        assert_eq!(JobFailureOption::parse(" Retry "), Some(JobFailureOption::Retry));
        assert_eq!(JobFailureOption::parse("explode"), None);
    }
}
