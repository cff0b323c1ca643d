//! File names of the job directory protocol.
//!
//! Both sides agree on these names and nothing else: the agent and the
//! cluster scripts create files, the orchestrator watches for them. Remote
//! names are relative to the remote work folder.

use std::path::{Path, PathBuf};

pub const CONTROL_SCRIPT: &str = "relay_session.ahk";
pub const SESSION_STARTED: &str = "session-started.txt";
pub const ALL_UPLOADED: &str = "all-uploaded.txt";
pub const ALL_DOWNLOADED: &str = "all-downloaded.txt";
pub const MANIFEST: &str = "runtime/session.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    pub job_dir: PathBuf,
    stem: String,
    extension: String,
}

impl JobLayout {
    pub fn new(job_dir: &Path, stem: &str, extension: &str) -> Self {
        Self {
            job_dir: job_dir.to_path_buf(),
            stem: stem.to_string(),
            extension: extension.to_string(),
        }
    }

    pub fn local(&self, name: &str) -> PathBuf {
        self.job_dir.join(name)
    }

    pub fn control_script(&self) -> PathBuf {
        self.local(CONTROL_SCRIPT)
    }

    pub fn session_started(&self) -> PathBuf {
        self.local(SESSION_STARTED)
    }

    pub fn all_uploaded(&self) -> PathBuf {
        self.local(ALL_UPLOADED)
    }

    pub fn all_downloaded(&self) -> PathBuf {
        self.local(ALL_DOWNLOADED)
    }

    pub fn manifest(&self) -> PathBuf {
        self.local(MANIFEST)
    }

    pub fn command_file(&self, name: &str) -> PathBuf {
        self.local(&format!("{}.bat", name))
    }

    /// Slot name for one (queue, partition) pair, e.g. `ct5600`.
    pub fn slot(queue: &str, partition: usize) -> String {
        format!("{}{}", queue, partition)
    }

    pub fn batch_script_name(&self, queue: &str, partition: usize) -> String {
        format!("{}_{}.sh", self.stem, Self::slot(queue, partition))
    }

    pub fn batch_script(&self, queue: &str, partition: usize) -> PathBuf {
        self.local(&self.batch_script_name(queue, partition))
    }

    pub fn submission_record_name(queue: &str, partition: usize) -> String {
        format!("{}.txt", Self::slot(queue, partition))
    }

    pub fn submission_record(&self, queue: &str, partition: usize) -> PathBuf {
        self.local(&Self::submission_record_name(queue, partition))
    }

    pub fn queue_log_name(queue: &str) -> String {
        format!("{}.log", queue)
    }

    pub fn queue_log(&self, queue: &str) -> PathBuf {
        self.local(&Self::queue_log_name(queue))
    }

    pub fn work_dir_name(partition: usize) -> String {
        format!("d{}", partition)
    }

    pub fn completion_name(partition: usize) -> String {
        format!("completed-{}.log", partition)
    }

    pub fn completion(&self, partition: usize) -> PathBuf {
        self.local(&Self::completion_name(partition))
    }

    /// Result marker shares the project extension so the result download
    /// glob brings it back with the results, and sorts after them so it lands
    /// last.
    pub fn result_marker_name(&self, partition: usize) -> String {
        format!("zall-downloaded-{}.{}", partition, self.extension)
    }

    pub fn result_marker(&self, partition: usize) -> PathBuf {
        self.local(&self.result_marker_name(partition))
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn all_results_present(&self, partitions: usize) -> bool {
        (0..partitions).all(|d| self.result_marker(d).exists())
    }
}
