//! Copies image files into a catalog directory, one file per step.
//!
//! Missing sources and copy errors go through the failure handshake; the
//! resolver picks one of `Retry`, `Ignore`, `IgnoreAll`, `Rollback` or
//! `Cancel`. Rollback deletes the copies newest-first.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::state_machine::{
    JobContext, JobFailureDescription, JobFailureOption, JobState, JobTask,
};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 20;

/// What to do with the current file after a failure was resolved.
enum Resolution {
    /// Try the same file again on the next step.
    Retry,
    /// Move on to the next file.
    Skip,
    /// The job was redirected (cancelled or rolling back).
    Stop,
}

pub struct ImportJob {
    sources: Vec<PathBuf>,
    target: PathBuf,
    step_delay: Duration,
    max_attempts: u32,
    next: usize,
    imported: Vec<PathBuf>,
    skipped: usize,
    ignore_all: bool,
    undo_total: Option<usize>,
    removed: usize,
}

impl ImportJob {
    pub fn new(sources: Vec<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            target: target.into(),
            step_delay: Duration::ZERO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next: 0,
            imported: Vec::new(),
            skipped: 0,
            ignore_all: false,
            undo_total: None,
            removed: 0,
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Attempts per file for transient I/O errors before escalating.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    fn total(&self) -> usize {
        self.sources.len()
    }

    fn resolve(
        &mut self,
        ctx: &JobContext,
        failure: JobFailureDescription,
    ) -> Result<Resolution> {
        let failure = Arc::new(failure);
        let state = ctx.request_failure_handling(&failure)?;
        if state != JobState::Running {
            return Ok(Resolution::Stop);
        }
        let resolution = match failure.respond() {
            JobFailureOption::Retry => Resolution::Retry,
            JobFailureOption::Ignore => Resolution::Skip,
            JobFailureOption::IgnoreAll => {
                self.ignore_all = true;
                Resolution::Skip
            }
            JobFailureOption::Rollback => {
                ctx.job().rollback()?;
                Resolution::Stop
            }
            JobFailureOption::Cancel => {
                ctx.job().cancel()?;
                Resolution::Stop
            }
        };
        Ok(resolution)
    }

    fn forward_options(&self) -> Vec<JobFailureOption> {
        vec![
            JobFailureOption::Retry,
            JobFailureOption::Ignore,
            JobFailureOption::IgnoreAll,
            JobFailureOption::Rollback,
            JobFailureOption::Cancel,
        ]
    }

    fn copy_with_retry(&self, source: &Path, dest: &Path) -> std::io::Result<()> {
        let mut attempt = 1;
        loop {
            match std::fs::copy(source, dest) {
                Ok(_) => return Ok(()),
                Err(e) if is_transient(e.kind()) && attempt < self.max_attempts => {
                    tracing::debug!(source = %source.display(), attempt, error = %e, "transient copy error, retrying");
                    std::thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt)));
                    attempt += 1;
                }
                Err(e) => {
                    // `dest` was free before the copy; drop whatever got written.
                    let _ = std::fs::remove_file(dest);
                    return Err(e);
                }
            }
        }
    }

    fn skip_current(&mut self) {
        self.skipped += 1;
        self.next += 1;
    }
}

impl JobTask for ImportJob {
    fn pre_execution(&mut self, ctx: &JobContext) -> Result<()> {
        std::fs::create_dir_all(&self.target)
            .with_context(|| format!("creating {}", self.target.display()))?;
        ctx.set_job_description(format!("Preparing import of {} file(s)", self.total()));
        Ok(())
    }

    fn next_step(&mut self, ctx: &JobContext) -> Result<bool> {
        let Some(source) = self.sources.get(self.next).cloned() else {
            return Ok(true);
        };
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());
        ctx.set_job_description(format!(
            "Importing {file_name} ({}/{})",
            self.next + 1,
            self.total()
        ));

        if !source.is_file() {
            if self.ignore_all {
                self.skip_current();
                return Ok(self.next >= self.total());
            }
            let failure = JobFailureDescription::new(
                format!("Source file not found: {}", source.display()),
                self.forward_options(),
            );
            match self.resolve(ctx, failure)? {
                Resolution::Skip => self.skip_current(),
                Resolution::Retry | Resolution::Stop => {}
            }
            return Ok(self.next >= self.total());
        }

        let dest = unique_destination(&self.target, &file_name);
        match self.copy_with_retry(&source, &dest) {
            Ok(()) => {
                self.imported.push(dest);
                self.next += 1;
            }
            Err(e) if self.ignore_all => {
                tracing::warn!(source = %source.display(), error = %e, "copy failed, ignored");
                self.skip_current();
            }
            Err(e) => {
                let failure = JobFailureDescription::new(
                    format!("Could not copy {}", source.display()),
                    self.forward_options(),
                )
                .with_cause(e.into());
                match self.resolve(ctx, failure)? {
                    Resolution::Skip => self.skip_current(),
                    Resolution::Retry | Resolution::Stop => {}
                }
            }
        }

        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        Ok(self.next >= self.total())
    }

    fn next_rollback_step(&mut self, ctx: &JobContext) -> Result<bool> {
        let total = *self.undo_total.get_or_insert(self.imported.len());
        let Some(copy) = self.imported.pop() else {
            return Ok(true);
        };
        ctx.set_job_description(format!(
            "Removing {} ({}/{total})",
            copy.display(),
            self.removed + 1
        ));

        match std::fs::remove_file(&copy) {
            Ok(()) => self.removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => self.removed += 1,
            Err(e) => {
                let failure = Arc::new(
                    JobFailureDescription::new(
                        format!("Could not remove {}", copy.display()),
                        vec![
                            JobFailureOption::Retry,
                            JobFailureOption::Ignore,
                            JobFailureOption::Cancel,
                        ],
                    )
                    .with_cause(e.into()),
                );
                let state = ctx.request_failure_handling(&failure)?;
                if state == JobState::Undoing {
                    match failure.respond() {
                        JobFailureOption::Retry => self.imported.push(copy),
                        JobFailureOption::Cancel => ctx.job().cancel()?,
                        _ => {}
                    }
                }
            }
        }

        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        Ok(self.imported.is_empty())
    }

    fn post_execution(&mut self, ctx: &JobContext) {
        let message = match ctx.check_state() {
            JobState::Finished => format!(
                "Imported {} of {} file(s), {} skipped",
                self.imported.len(),
                self.total(),
                self.skipped
            ),
            JobState::Reverted => format!("Import reverted, removed {} file(s)", self.removed),
            JobState::Aborted => format!(
                "Import cancelled after {} file(s)",
                self.imported.len()
            ),
            other => format!("Import stopped in state {other}"),
        };
        ctx.set_job_description(message);
    }

    fn percentage(&self) -> i32 {
        match self.undo_total {
            Some(0) => 100,
            Some(total) => ((total - self.imported.len().min(total)) * 100 / total) as i32,
            None if self.total() == 0 => 100,
            None => (self.next * 100 / self.total()) as i32,
        }
    }

    fn supports_rollback(&self) -> bool {
        true
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

/// Picks `name`, or `stem-N.ext` if that already exists in `dir`.
fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    (1..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{stem}-{n}.{ext}")),
            None => dir.join(format!("{stem}-{n}")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
