//! Interactive cluster sessions.
//!
//! A [`SessionDriver`] takes a job from "scripts written" to "every result
//! marker downloaded". [`AgentDriver`] hands the work to the external
//! terminal-automation agent and only watches sentinels; the in-process
//! driver lives in [`crate::inprocess`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use relay_core::{atomic_write_json_pretty, wait_until, JobConfig, WaitPolicy};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::plan_control_script;
use crate::jobid::{parse_job_id, JobId};
use crate::layout::JobLayout;
use crate::partition::Partition;
use crate::template::JobDescriptor;

pub struct SessionContext<'a> {
    pub job: &'a JobDescriptor,
    pub config: &'a JobConfig,
    pub layout: &'a JobLayout,
    pub partitions: &'a [Partition],
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionOutcome {
    pub driver: String,
    /// Keyed by slot name, e.g. `ct5600`.
    pub job_ids: BTreeMap<String, JobId>,
    pub winner: Option<String>,
    pub agent_launches: u32,
    pub control_digest: Option<String>,
}

pub trait SessionDriver {
    fn name(&self) -> &'static str;
    fn drive(&mut self, ctx: &SessionContext<'_>) -> Result<SessionOutcome>;
}

/// Job ids already recorded in local submission records. Records that do
/// not parse yet are left out.
pub fn read_job_ids(
    config: &JobConfig,
    layout: &JobLayout,
    partitions: &[Partition],
) -> BTreeMap<String, JobId> {
    let mut ids = BTreeMap::new();
    for queue in &config.queues {
        for p in partitions {
            let path = layout.submission_record(&queue.name, p.index);
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            match parse_job_id(&text) {
                Ok(id) => {
                    ids.insert(JobLayout::slot(&queue.name, p.index), id);
                }
                Err(err) => debug!(path = %path.display(), error = %err, "submission record not usable yet"),
            }
        }
    }
    ids
}

/// Lowest-indexed queue whose start log has been mirrored locally.
pub fn race_winner(config: &JobConfig, layout: &JobLayout) -> Option<String> {
    config
        .queues
        .iter()
        .find(|q| layout.queue_log(&q.name).exists())
        .map(|q| q.name.clone())
}

pub fn write_session_manifest(
    path: &Path,
    driver: &str,
    status: &str,
    outcome: Option<&SessionOutcome>,
) -> Result<()> {
    let payload = json!({
        "schema_version": "relay_session_v1",
        "driver": driver,
        "status": status,
        "control_digest": outcome.and_then(|o| o.control_digest.clone()),
        "job_ids": outcome.map(|o| &o.job_ids),
        "winner": outcome.and_then(|o| o.winner.clone()),
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(path, &payload)
}

/// Marks the session manifest `failed` unless completed explicitly.
pub struct SessionGuard {
    path: PathBuf,
    driver: String,
    done: bool,
}

impl SessionGuard {
    pub fn start(path: &Path, driver: &str) -> Result<Self> {
        write_session_manifest(path, driver, "running", None)?;
        Ok(Self {
            path: path.to_path_buf(),
            driver: driver.to_string(),
            done: false,
        })
    }

    pub fn complete(&mut self, outcome: &SessionOutcome) -> Result<()> {
        write_session_manifest(&self.path, &self.driver, "completed", Some(outcome))?;
        self.done = true;
        Ok(())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_session_manifest(&self.path, &self.driver, "failed", None);
        }
    }
}

fn sentinel_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Running agent process; killed on drop if it is still alive.
struct AgentProcess {
    child: Child,
    started: Instant,
}

impl AgentProcess {
    fn spawn(executable: &Path, script: &Path) -> Result<Self> {
        let child = Command::new(executable)
            .arg(script)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("launching agent {}", executable.display()))?;
        Ok(Self {
            child,
            started: Instant::now(),
        })
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        if !self.has_exited() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Drives the session through the external automation agent.
#[derive(Debug, Default)]
pub struct AgentDriver {
    launches: u32,
}

impl AgentDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn launch(&mut self, executable: &Path, script: &Path) -> Result<AgentProcess> {
        self.launches += 1;
        info!(attempt = self.launches, agent = %executable.display(), "launching agent");
        AgentProcess::spawn(executable, script)
    }
}

impl SessionDriver for AgentDriver {
    fn name(&self) -> &'static str {
        "agent"
    }

    fn drive(&mut self, ctx: &SessionContext<'_>) -> Result<SessionOutcome> {
        let plan = plan_control_script(ctx.job, ctx.config, ctx.layout, ctx.partitions);
        plan.write()?;
        let executable = ctx.config.agent.executable.as_path();
        let script = plan.script_path.as_path();
        let attach = Duration::from_millis(ctx.config.timing.agent_attach_ms);
        let policy = ctx.config.sentinel_policy();

        // The sentinel is append-only and may hold lines from an agent that
        // died with an earlier run; only growth past this point counts.
        let started_before = sentinel_len(&ctx.layout.session_started());
        let mut agent: Option<AgentProcess> = None;
        wait_until(
            "waiting for the agent to start a session",
            &policy,
            ctx.cancel,
            || {
                if sentinel_len(&ctx.layout.session_started()) > started_before {
                    return Ok(Some(()));
                }
                let relaunch = match agent.as_mut() {
                    None => true,
                    Some(running) => {
                        if running.has_exited() {
                            warn!("agent exited before starting a session");
                            true
                        } else if running.started.elapsed() >= attach {
                            warn!(after = ?attach, "agent did not start a session in time");
                            true
                        } else {
                            false
                        }
                    }
                };
                if relaunch {
                    if let Some(mut old) = agent.take() {
                        old.kill();
                    }
                    agent = Some(self.launch(executable, script)?);
                }
                Ok(None)
            },
        )?;
        info!(path = %ctx.layout.session_started().display(), "agent session started");

        let mut exit_reported = false;
        wait_until(
            "waiting for all results to download",
            &policy,
            ctx.cancel,
            || {
                if ctx.layout.all_downloaded().exists() {
                    return Ok(Some(()));
                }
                if !exit_reported && agent.as_mut().map_or(true, |a| a.has_exited()) {
                    warn!("agent is no longer running; still waiting for downloads");
                    exit_reported = true;
                }
                Ok(None)
            },
        )?;
        info!(path = %ctx.layout.all_downloaded().display(), "all results downloaded");

        // Let the agent close its terminal before the guard kills it.
        if let Some(running) = agent.as_mut() {
            let settle = WaitPolicy::fixed(policy.interval).with_deadline(Some(attach));
            let _ = wait_until("waiting for the agent to exit", &settle, ctx.cancel, || {
                Ok(running.has_exited().then_some(()))
            });
        }

        Ok(SessionOutcome {
            driver: self.name().to_string(),
            job_ids: read_job_ids(ctx.config, ctx.layout, ctx.partitions),
            winner: if ctx.config.is_racing() {
                race_winner(ctx.config, ctx.layout)
            } else {
                None
            },
            agent_launches: self.launches,
            control_digest: Some(plan.digest()),
        })
    }
}
