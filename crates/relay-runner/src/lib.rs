pub mod batch;
pub mod control;
pub mod inprocess;
pub mod jobid;
pub mod layout;
pub mod otp;
pub mod partition;
pub mod poller;
pub mod session;
pub mod template;

use std::path::PathBuf;

use anyhow::Result;
use relay_core::{append_sentinel, JobConfig};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use batch::{plan_batch_scripts, BatchPlan, BatchScript};
pub use control::{plan_control_script, ControlPlan, Thresholds};
pub use inprocess::{InProcessDriver, OpenSshShell, RemoteShell};
pub use jobid::{parse_job_id, JobId};
pub use layout::JobLayout;
pub use otp::{CodeLedger, CodeSource, CommandCodeSource, OneTimeCode};
pub use partition::{partition_particles, Partition};
pub use poller::{scan_log, Completed, CompletionPoller, LogStatus};
pub use session::{AgentDriver, SessionContext, SessionDriver, SessionGuard, SessionOutcome};
pub use template::{parse_template, JobDescriptor, ProjectName};

/// A job resolved from its template, with nothing written yet.
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub job: JobDescriptor,
    pub layout: JobLayout,
    pub batch: BatchPlan,
}

impl PreparedJob {
    pub fn partitions(&self) -> &[Partition] {
        &self.batch.partitions
    }

    pub fn is_lead(&self) -> bool {
        self.job.name.is_lead()
    }

    pub fn control_plan(&self, config: &JobConfig) -> ControlPlan {
        plan_control_script(&self.job, config, &self.layout, self.partitions())
    }
}

/// Resolves the template and renders every batch script in memory. All
/// configuration errors surface here, before anything touches disk.
pub fn prepare(config: &JobConfig, template: &[String]) -> Result<PreparedJob> {
    let job = JobDescriptor::from_template(template, config)?;
    let layout = JobLayout::new(&job.job_dir, &job.name.stem, job.extension());
    let batch = plan_batch_scripts(&job, config, &layout)?;
    Ok(PreparedJob { job, layout, batch })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not the lead particle; another invocation runs the session.
    Follower,
    /// Every result was already downloaded by an earlier run.
    Skipped,
    Driven,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Follower => "follower",
            SessionState::Skipped => "skipped",
            SessionState::Driven => "driven",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub basename: String,
    pub job_dir: PathBuf,
    pub lead: bool,
    pub scripts: Vec<PathBuf>,
    pub session: SessionState,
    pub outcome: Option<SessionOutcome>,
    pub completed: Completed,
}

pub fn run(
    config: &JobConfig,
    template: &[String],
    driver: &mut dyn SessionDriver,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let prepared = prepare(config, template)?;
    run_prepared(config, &prepared, driver, cancel)
}

/// Runs a prepared job end to end. Safe to call again after a crash: every
/// step checks its sentinel before doing remote work.
pub fn run_prepared(
    config: &JobConfig,
    prepared: &PreparedJob,
    driver: &mut dyn SessionDriver,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let job = &prepared.job;
    let layout = &prepared.layout;
    info!(
        basename = %job.basename(),
        generation = job.name.generation,
        particle = job.name.particle,
        remote = %job.remote_dir,
        "relay job"
    );

    let mut scripts = Vec::new();
    let mut outcome = None;
    let session = if !prepared.is_lead() {
        SessionState::Follower
    } else {
        scripts = prepared.batch.write()?;
        let partitions = prepared.partitions();
        if layout.all_downloaded().exists() || layout.all_results_present(partitions.len()) {
            info!(job_dir = %layout.job_dir.display(), "results already present; skipping session");
            if !layout.all_downloaded().exists() {
                append_sentinel(&layout.all_downloaded(), "All tasks completed")?;
            }
            SessionState::Skipped
        } else {
            let mut guard = SessionGuard::start(&layout.manifest(), driver.name())?;
            let ctx = SessionContext {
                job,
                config,
                layout,
                partitions,
                cancel,
            };
            let result = driver.drive(&ctx)?;
            guard.complete(&result)?;
            outcome = Some(result);
            SessionState::Driven
        }
    };

    let completed = CompletionPoller::new(config.progress_policy(), cancel).wait(&job.progress_log())?;
    Ok(RunReport {
        basename: job.basename().to_string(),
        job_dir: layout.job_dir.clone(),
        lead: prepared.is_lead(),
        scripts,
        session,
        outcome,
        completed,
    })
}
