//! Completion polling on a mirrored progress log.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use relay_core::{wait_until, WaitPolicy};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const COMPLETE_MARKER: &str = "100% complete.";
pub const PROGRESS_MARKER: &str = "% complete. Max time remaining: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStatus {
    Completed,
    /// Newest progress line, if any.
    Running(Option<String>),
}

/// Scans a log newest line first and stops at the first line that says
/// anything: a completion marker completes, a progress line means the engine
/// is still running no matter what older lines claim.
pub fn scan_log(text: &str) -> LogStatus {
    for line in text.lines().rev() {
        if line.contains(COMPLETE_MARKER) {
            return LogStatus::Completed;
        }
        if line.contains(PROGRESS_MARKER) {
            return LogStatus::Running(Some(line.trim().to_string()));
        }
    }
    LogStatus::Running(None)
}

#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub path: PathBuf,
    pub polls: u64,
}

pub struct CompletionPoller<'a> {
    policy: WaitPolicy,
    cancel: &'a CancellationToken,
    last_reported: Option<String>,
}

impl<'a> CompletionPoller<'a> {
    pub fn new(policy: WaitPolicy, cancel: &'a CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            last_reported: None,
        }
    }

    pub fn last_reported(&self) -> Option<&str> {
        self.last_reported.as_deref()
    }

    /// Blocks until the log reports completion. Read failures of any kind
    /// are retried after the poll interval.
    pub fn wait(&mut self, path: &Path) -> Result<Completed> {
        let mut polls = 0u64;
        let last_reported = &mut self.last_reported;
        wait_until(
            "waiting for the progress log to report completion",
            &self.policy,
            self.cancel,
            || {
                polls += 1;
                let bytes = match fs::read(path) {
                    Ok(bytes) => bytes,
                    Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
                    Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                        warn!(path = %path.display(), "progress log is not readable yet");
                        return Ok(None);
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "reading progress log failed");
                        return Ok(None);
                    }
                };
                match scan_log(&String::from_utf8_lossy(&bytes)) {
                    LogStatus::Completed => Ok(Some(())),
                    LogStatus::Running(Some(line)) => {
                        if last_reported.as_deref() != Some(line.as_str()) {
                            info!(path = %path.display(), progress = %line, "simulation running");
                            *last_reported = Some(line);
                        }
                        Ok(None)
                    }
                    LogStatus::Running(None) => {
                        debug!(path = %path.display(), "no progress reported yet");
                        Ok(None)
                    }
                }
            },
        )?;
        info!(path = %path.display(), polls, "simulation completed");
        Ok(Completed {
            path: path.to_path_buf(),
            polls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::RelayError;
    use std::time::Duration;

    const HALF: &str = "50% complete. Max time remaining: 3 mins, 10 secs.";

    fn policy() -> WaitPolicy {
        WaitPolicy::fixed(Duration::from_millis(5))
    }

    #[test]
    fn newest_progress_line_wins() {
        let log = "10% complete. Max time remaining: 9 mins.\nnoise\n".to_string() + HALF + "\n";
        assert_eq!(scan_log(&log), LogStatus::Running(Some(HALF.to_string())));
        assert_eq!(scan_log("starting engine\n"), LogStatus::Running(None));
    }

    #[test]
    fn completion_after_progress_completes() {
        let log = format!("{}\n100% complete.\n{}\n", HALF, "writing results");
        assert_eq!(scan_log(&log), LogStatus::Completed);
    }

    #[test]
    fn progress_after_an_older_completion_is_still_running() {
        let retry = "30% complete. Max time remaining: 5 mins";
        let log = format!("100% complete.\n{}\n", retry);
        assert_eq!(scan_log(&log), LogStatus::Running(Some(retry.to_string())));
    }

    #[test]
    fn half_then_full_completes_after_reporting_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("optimizationg3_1_p0.log");
        fs::write(&path, format!("{}\n", HALF)).expect("write");
        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            fs::write(&writer_path, format!("{}\n100% complete.\n", HALF)).expect("write");
        });
        let cancel = CancellationToken::new();
        let mut poller = CompletionPoller::new(policy(), &cancel);
        let done = poller.wait(&path).expect("completed");
        writer.join().expect("join");
        assert_eq!(done.path, path);
        assert!(done.polls >= 2);
        assert_eq!(poller.last_reported(), Some(HALF));
    }

    #[test]
    fn missing_file_is_retried_silently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("late_p0.log");
        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            fs::write(&writer_path, "100% complete.\n").expect("write");
        });
        let cancel = CancellationToken::new();
        let done = CompletionPoller::new(policy(), &cancel)
            .wait(&path)
            .expect("completed");
        writer.join().expect("join");
        assert!(done.polls > 1);
    }

    #[test]
    fn progress_alone_never_completes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stuck_p0.log");
        fs::write(&path, format!("{}\n", HALF)).expect("write");
        let cancel = CancellationToken::new();
        let bounded = policy().with_deadline(Some(Duration::from_millis(30)));
        let err = CompletionPoller::new(bounded, &cancel)
            .wait(&path)
            .expect_err("deadline");
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::DeadlineExceeded { .. })
        ));
    }
}
