//! In-process session driver.
//!
//! Runs the same state machine as the generated control script, but from
//! this process over a [`RemoteShell`]. Local sentinels are written exactly
//! where the agent would write them, so a run can switch drivers after a
//! crash without losing progress.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use relay_core::{
    append_sentinel, atomic_write_bytes, sleep_cancellable, wait_until, JobConfig, WaitPolicy,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::control::Thresholds;
use crate::jobid::{parse_job_id, JobId};
use crate::layout::JobLayout;
use crate::otp::{CodeLedger, CodeSource, OneTimeCode};
use crate::session::{race_winner, read_job_ids, SessionContext, SessionDriver, SessionOutcome};

/// Remote side of an interactive session.
pub trait RemoteShell {
    fn login(&mut self, code: &OneTimeCode) -> Result<()>;
    /// Runs `command` in the remote shell and returns its stdout.
    fn exec(&mut self, command: &str) -> Result<String>;
    fn upload(&mut self, files: &[PathBuf], remote_dir: &str) -> Result<()>;
    fn download(&mut self, remote_glob: &str, local_dir: &Path) -> Result<()>;
    fn logout(&mut self) -> Result<()>;
}

pub struct InProcessDriver<S, C> {
    shell: S,
    codes: C,
    ledger: CodeLedger,
}

impl<S: RemoteShell, C: CodeSource> InProcessDriver<S, C> {
    pub fn new(shell: S, codes: C) -> Self {
        Self {
            shell,
            codes,
            ledger: CodeLedger::new(),
        }
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    fn login(&mut self, ctx: &SessionContext<'_>) -> Result<()> {
        let retry = Duration::from_millis(ctx.config.timing.code_retry_ms);
        let code = self.ledger.next_fresh(&mut self.codes, retry, ctx.cancel)?;
        self.shell.login(&code)?;
        info!(host = %ctx.config.cluster.login_host, "logged in");
        Ok(())
    }

    fn prepare_remote(&mut self, ctx: &SessionContext<'_>) -> Result<()> {
        let dir = ctx.job.remote_dir.as_str();
        self.shell.exec(&format!("rm -rf {}", dir))?;
        self.shell.exec(&format!("rm -rf {}_*", dir))?;
        self.shell.exec(&format!("mkdir -p {}", dir))?;
        Ok(())
    }

    fn upload_all(&mut self, ctx: &SessionContext<'_>) -> Result<()> {
        let files = upload_set(&ctx.layout.job_dir, ctx.job.extension())?;
        let remote_dir = ctx.job.remote_dir.clone();
        let policy = WaitPolicy::fixed(Duration::from_millis(ctx.config.timing.upload_tick_ms))
            .with_deadline(ctx.config.deadline());
        let mut attempts = 0u32;
        wait_until("uploading job files", &policy, ctx.cancel, || {
            attempts += 1;
            match self.shell.upload(&files, &remote_dir) {
                Ok(()) => Ok(Some(())),
                Err(err) => {
                    warn!(attempts, error = %err, "upload failed; retrying");
                    Ok(None)
                }
            }
        })?;
        append_sentinel(&ctx.layout.all_uploaded(), "Uploaded all files")?;
        info!(files = files.len(), attempts, "upload complete");
        Ok(())
    }

    fn submit_all(
        &mut self,
        ctx: &SessionContext<'_>,
        ids: &mut BTreeMap<String, JobId>,
    ) -> Result<()> {
        let dir = ctx.job.remote_dir.clone();
        let submit = ctx.config.scheduler.submit_command.clone();
        let settle = Duration::from_millis(ctx.config.timing.submit_settle_ms);
        let policy = WaitPolicy::fixed(Duration::from_millis(ctx.config.timing.fetch_settle_ms))
            .with_deadline(ctx.config.deadline());
        let slots: Vec<(String, String, String)> = ctx
            .config
            .queues
            .iter()
            .flat_map(|q| {
                ctx.partitions.iter().map(move |p| {
                    (
                        JobLayout::slot(&q.name, p.index),
                        ctx.layout.batch_script_name(&q.name, p.index),
                        JobLayout::submission_record_name(&q.name, p.index),
                    )
                })
            })
            .collect();

        wait_until("submitting batch scripts", &policy, ctx.cancel, || {
            for (slot, script, record) in &slots {
                if ids.contains_key(slot) {
                    continue;
                }
                let command = format!("cd {} && {} {} >> {}", dir, submit, script, record);
                if let Err(err) = self.shell.exec(&command) {
                    warn!(slot = %slot, error = %err, "submission failed; retrying");
                }
                sleep_cancellable(settle, ctx.cancel, "submitting batch scripts")?;
            }
            for (slot, _, record) in &slots {
                if ids.contains_key(slot) {
                    continue;
                }
                let text = match self.shell.exec(&format!("cat {}/{}", dir, record)) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(slot = %slot, error = %err, "could not read submission record");
                        continue;
                    }
                };
                atomic_write_bytes(&ctx.layout.local(record), text.as_bytes())?;
                match parse_job_id(&text) {
                    Ok(id) => {
                        info!(slot = %slot, job_id = %id, "job submitted");
                        ids.insert(slot.clone(), id);
                    }
                    Err(err) => warn!(slot = %slot, error = %err, "submission not accepted yet"),
                }
            }
            Ok((ids.len() == slots.len()).then_some(()))
        })
    }

    fn cancel_losers(
        &mut self,
        ctx: &SessionContext<'_>,
        winner: &str,
        ids: &BTreeMap<String, JobId>,
    ) -> Result<()> {
        let settle = Duration::from_millis(ctx.config.timing.cancel_settle_ms);
        let cancel_cmd = ctx.config.scheduler.cancel_command.clone();
        for queue in ctx.config.queues.iter().filter(|q| q.name != winner) {
            for p in ctx.partitions {
                let Some(id) = ids.get(&JobLayout::slot(&queue.name, p.index)) else {
                    continue;
                };
                for _ in 0..2 {
                    if let Err(err) = self.shell.exec(&format!("{} {}", cancel_cmd, id)) {
                        debug!(job_id = %id, error = %err, "cancel not acknowledged");
                    }
                    sleep_cancellable(settle, ctx.cancel, "cancelling losing jobs")?;
                }
                info!(queue = %queue.name, job_id = %id, "cancelled job");
            }
        }
        Ok(())
    }

    fn download_all(
        &mut self,
        ctx: &SessionContext<'_>,
        ids: &BTreeMap<String, JobId>,
    ) -> Result<Option<String>> {
        let thresholds = Thresholds::for_config(ctx.config);
        let dir = ctx.job.remote_dir.clone();
        let local = ctx.layout.job_dir.clone();
        let ext = ctx.job.extension().to_string();
        let policy = WaitPolicy::fixed(Duration::from_millis(ctx.config.timing.download_tick_ms))
            .with_deadline(ctx.config.deadline());
        let n = ctx.partitions.len();
        let mut idle = vec![true; n];
        let mut stall = vec![0u64; n];
        let mut winner: Option<String> = None;

        wait_until("downloading results", &policy, ctx.cancel, || {
            if ctx.layout.all_results_present(n) {
                return Ok(Some(()));
            }
            if let Err(err) = self.shell.download(&format!("{}/*.log", dir), &local) {
                warn!(error = %err, "log download failed");
            }
            if ctx.config.is_racing() && winner.is_none() {
                if let Some(name) = race_winner(ctx.config, ctx.layout) {
                    info!(queue = %name, "queue started first");
                    self.login(ctx)?;
                    self.cancel_losers(ctx, &name, ids)?;
                    self.shell.logout()?;
                    winner = Some(name);
                }
            }
            for (k, p) in ctx.partitions.iter().enumerate() {
                if ctx.layout.completion(p.index).exists() && idle[k] {
                    info!(partition = p.index, "downloading results");
                    let glob = format!("{}/{}/*.{}", dir, JobLayout::work_dir_name(p.index), ext);
                    if let Err(err) = self.shell.download(&glob, &local) {
                        warn!(partition = p.index, error = %err, "result download failed");
                    }
                    idle[k] = false;
                }
                if !ctx.layout.result_marker(p.index).exists() && !idle[k] {
                    stall[k] += 1;
                    if stall[k] > thresholds.download_reset {
                        debug!(partition = p.index, "result download stalled; re-arming");
                        stall[k] = 0;
                        idle[k] = true;
                    }
                }
            }
            Ok(ctx.layout.all_results_present(n).then_some(()))
        })?;
        Ok(winner)
    }
}

impl<S: RemoteShell, C: CodeSource> SessionDriver for InProcessDriver<S, C> {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn drive(&mut self, ctx: &SessionContext<'_>) -> Result<SessionOutcome> {
        append_sentinel(&ctx.layout.session_started(), "Session started")?;
        let mut ids = read_job_ids(ctx.config, ctx.layout, ctx.partitions);
        let mut winner = None;
        let results_done = ctx.layout.all_results_present(ctx.partitions.len());
        if !results_done {
            self.login(ctx)?;
            if ctx.layout.all_uploaded().exists() {
                info!("files already uploaded; skipping remote setup");
            } else {
                self.prepare_remote(ctx)?;
                self.upload_all(ctx)?;
            }
            self.submit_all(ctx, &mut ids)?;
            self.shell.logout()?;
            winner = self.download_all(ctx, &ids)?;
        }
        append_sentinel(&ctx.layout.all_downloaded(), "All tasks completed")?;
        Ok(SessionOutcome {
            driver: self.name().to_string(),
            job_ids: ids,
            winner,
            agent_launches: 0,
            control_digest: None,
        })
    }
}

/// Project files and batch scripts in the job directory, in name order.
pub fn upload_set(job_dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(job_dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("listing {}", job_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if ext == extension || ext == "sh" {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

/// OpenSSH client with a multiplexed master connection.
///
/// Login authenticates the master once through an askpass helper that reads
/// `RELAY_PASSWORD` and `RELAY_OTP`; every later command reuses it. Transfers
/// go to the transfer host with the configured key.
#[derive(Debug, Clone)]
pub struct OpenSshShell {
    login_target: String,
    transfer_target: String,
    key: PathBuf,
    control_path: PathBuf,
    askpass: Option<PathBuf>,
    password_env: String,
}

impl OpenSshShell {
    pub fn from_config(config: &JobConfig, runtime_dir: &Path) -> Self {
        let cluster = &config.cluster;
        Self {
            login_target: cluster.login_target(),
            transfer_target: cluster.transfer_target(),
            key: cluster.transfer_key.clone(),
            control_path: cluster
                .control_path
                .clone()
                .unwrap_or_else(|| runtime_dir.join("ssh-control")),
            askpass: cluster.askpass.clone(),
            password_env: cluster.password_env.clone(),
        }
    }

    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        cmd
    }

    fn login_command(&self, password: &str, code: &OneTimeCode) -> Result<Command> {
        let askpass = self
            .askpass
            .as_ref()
            .ok_or_else(|| anyhow!("cluster.askpass is required for in-process login"))?;
        let mut cmd = self.ssh();
        cmd.args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes", "-f", "-N"])
            .arg(&self.login_target)
            .env("SSH_ASKPASS", askpass)
            .env("SSH_ASKPASS_REQUIRE", "force")
            .env("RELAY_PASSWORD", password)
            .env("RELAY_OTP", code.as_str())
            .stdin(Stdio::null());
        Ok(cmd)
    }

    fn exec_command(&self, command: &str) -> Command {
        let mut cmd = self.ssh();
        cmd.arg(&self.login_target).arg(command);
        cmd
    }

    fn scp(&self) -> Command {
        let mut cmd = Command::new("scp");
        cmd.arg("-i").arg(&self.key);
        cmd
    }
}

fn checked(what: &str, output: Output) -> Result<String> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "{} failed with {}: {}",
            what,
            output.status,
            stderr.trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl RemoteShell for OpenSshShell {
    fn login(&mut self, code: &OneTimeCode) -> Result<()> {
        let password = std::env::var(&self.password_env)
            .with_context(|| format!("password variable {} is not set", self.password_env))?;
        let output = self.login_command(&password, code)?.output()?;
        checked("ssh login", output).map(|_| ())
    }

    fn exec(&mut self, command: &str) -> Result<String> {
        let output = self.exec_command(command).output()?;
        checked(&format!("remote command `{}`", command), output)
    }

    fn upload(&mut self, files: &[PathBuf], remote_dir: &str) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let output = self
            .scp()
            .args(files)
            .arg(format!("{}:{}", self.transfer_target, remote_dir))
            .output()?;
        checked("upload", output).map(|_| ())
    }

    fn download(&mut self, remote_glob: &str, local_dir: &Path) -> Result<()> {
        let output = self
            .scp()
            .arg(format!("{}:{}", self.transfer_target, remote_glob))
            .arg(local_dir)
            .output()?;
        checked("download", output).map(|_| ())
    }

    fn logout(&mut self) -> Result<()> {
        let output = self
            .ssh()
            .args(["-O", "exit"])
            .arg(&self.login_target)
            .output()?;
        checked("ssh logout", output).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn shell() -> OpenSshShell {
        OpenSshShell {
            login_target: "alice@login".to_string(),
            transfer_target: "alice@xfer".to_string(),
            key: PathBuf::from("/keys/id_ecdsa"),
            control_path: PathBuf::from("/run/relay/ssh-control"),
            askpass: Some(PathBuf::from("/usr/local/bin/relay-askpass")),
            password_env: "RELAY_PASSWORD".to_string(),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn login_opens_a_master_connection_with_askpass() {
        let cmd = shell()
            .login_command("pw", &OneTimeCode::new("123456"))
            .expect("command");
        assert_eq!(
            args(&cmd),
            vec![
                "-o",
                "ControlPath=/run/relay/ssh-control",
                "-o",
                "ControlMaster=yes",
                "-o",
                "ControlPersist=yes",
                "-f",
                "-N",
                "alice@login"
            ]
        );
        let envs: Vec<(String, String)> = cmd
            .get_envs()
            .filter_map(|(k, v)| {
                Some((k.to_string_lossy().into_owned(), v?.to_string_lossy().into_owned()))
            })
            .collect();
        assert!(envs.contains(&("RELAY_OTP".to_string(), "123456".to_string())));
        assert!(envs.contains(&("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string())));
    }

    #[test]
    fn login_without_askpass_is_refused() {
        let mut s = shell();
        s.askpass = None;
        assert!(s.login_command("pw", &OneTimeCode::new("1")).is_err());
    }

    #[test]
    fn exec_reuses_the_master() {
        let cmd = shell().exec_command("sbatch job.sh");
        assert_eq!(
            args(&cmd),
            vec![
                "-o",
                "ControlPath=/run/relay/ssh-control",
                "alice@login",
                "sbatch job.sh"
            ]
        );
    }

    #[test]
    fn upload_set_picks_projects_and_scripts_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.fsp", "a.fsp", "run_ct5600.sh", "notes.txt", "old.lms"] {
            fs::write(dir.path().join(name), "x").expect("write");
        }
        fs::create_dir(dir.path().join("nested.fsp")).expect("mkdir");
        let files = upload_set(dir.path(), "fsp").expect("set");
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.fsp", "b.fsp", "run_ct5600.sh"]);
    }
}
