//! Run configuration.
//!
//! One `JobConfig` is loaded and validated per run and then passed by
//! reference to every component; nothing reads process-wide settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::paths::PathTranslator;
use crate::wait::WaitPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub particles: u64,
    /// Inner sweep count per particle; 0 disables the sweep loop.
    #[serde(default)]
    pub sweeps: u64,
    pub division: u64,
    pub queues: Vec<QueueSpec>,
    #[serde(default)]
    pub wall_time_max: Option<String>,
    pub engine_path: String,
    pub path_translation: PathTranslator,
    pub cluster: ClusterAccess,
    pub scheduler: SchedulerSpec,
    #[serde(default)]
    pub agent: AgentSpec,
    #[serde(default)]
    pub timing: Timing,
    /// Upper bound for every wait loop. Unset means waits are unbounded.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub nodes: u32,
    #[serde(default)]
    pub wall_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAccess {
    pub user: String,
    pub login_host: String,
    /// Data-transfer node; unset or empty means the login host.
    #[serde(default)]
    pub transfer_host: Option<String>,
    pub transfer_key: PathBuf,
    /// Name of the environment variable holding the login password.
    pub password_env: String,
    pub otp_command: PathBuf,
    #[serde(default)]
    pub askpass: Option<PathBuf>,
    #[serde(default)]
    pub control_path: Option<PathBuf>,
}

impl ClusterAccess {
    pub fn login_target(&self) -> String {
        format!("{}@{}", self.user, self.login_host)
    }

    pub fn transfer_target(&self) -> String {
        let host = self
            .transfer_host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(&self.login_host);
        format!("{}@{}", self.user, host)
    }

    pub fn password(&self) -> Result<String> {
        std::env::var(&self.password_env)
            .with_context(|| format!("password variable {} is not set", self.password_env))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSpec {
    pub account: String,
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_cores_per_node")]
    pub cores_per_node: u32,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default = "default_launcher")]
    pub launcher: String,
    #[serde(default = "default_submit_command")]
    pub submit_command: String,
    #[serde(default = "default_cancel_command")]
    pub cancel_command: String,
}

fn default_cores_per_node() -> u32 {
    56
}

fn default_launcher() -> String {
    "mpiexec.hydra".to_string()
}

fn default_submit_command() -> String {
    "sbatch".to_string()
}

fn default_cancel_command() -> String {
    "scancel".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub executable: PathBuf,
    pub terminal: String,
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(r"C:\Program Files\AutoHotkey\AutoHotkeyU64.exe"),
            terminal: r"C:\Windows\System32\cmd.exe".to_string(),
        }
    }
}

/// Delays used by the control script and the local wait loops, in
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub upload_tick_ms: u64,
    pub download_tick_ms: u64,
    pub transfer_kick_ms: u64,
    pub submit_settle_ms: u64,
    pub fetch_settle_ms: u64,
    pub login_step_ms: u64,
    pub password_settle_ms: u64,
    pub login_settle_ms: u64,
    pub code_retry_ms: u64,
    pub cancel_settle_ms: u64,
    pub command_gap_ms: u64,
    pub key_delay_ms: u64,
    pub agent_attach_ms: u64,
    pub sentinel_poll_ms: u64,
    pub progress_poll_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            upload_tick_ms: 1_000,
            download_tick_ms: 11_000,
            transfer_kick_ms: 5_000,
            submit_settle_ms: 3_600,
            fetch_settle_ms: 2_500,
            login_step_ms: 1_000,
            password_settle_ms: 1_500,
            login_settle_ms: 3_000,
            code_retry_ms: 2_000,
            cancel_settle_ms: 1_000,
            command_gap_ms: 800,
            key_delay_ms: 35,
            agent_attach_ms: 20_000,
            sentinel_poll_ms: 3_000,
            progress_poll_ms: 5_000,
        }
    }
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config: JobConfig = if is_yaml {
            serde_yaml::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        } else {
            serde_json::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: JobConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.division == 0 {
            return Err(RelayError::config("division must be greater than zero"));
        }
        if self.particles == 0 {
            return Err(RelayError::config("particles must be greater than zero"));
        }
        if self.division > self.particles {
            return Err(RelayError::config(format!(
                "division {} exceeds particle count {}; partitions would be empty",
                self.division, self.particles
            )));
        }
        if self.queues.is_empty() {
            return Err(RelayError::config("at least one queue is required"));
        }
        for queue in &self.queues {
            if queue.name.is_empty()
                || !queue
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(RelayError::config(format!(
                    "queue name '{}' must be non-empty and use [A-Za-z0-9_] only",
                    queue.name
                )));
            }
            if queue.nodes == 0 {
                return Err(RelayError::config(format!(
                    "queue '{}' needs at least one node",
                    queue.name
                )));
            }
        }
        let mut names: Vec<&str> = self.queues.iter().map(|q| q.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.queues.len() {
            return Err(RelayError::config("queue names must be unique"));
        }
        if self.engine_path.trim().is_empty() {
            return Err(RelayError::config("engine_path is empty"));
        }
        if self.scheduler.cores_per_node == 0 {
            return Err(RelayError::config("cores_per_node must be greater than zero"));
        }
        if self.cluster.password_env.trim().is_empty() {
            return Err(RelayError::config("cluster.password_env is empty"));
        }
        Ok(())
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.path_translation
    }

    /// Sweep-only runs have as many particles as sweeps and no optimiser
    /// generations.
    pub fn is_sweep_only(&self) -> bool {
        self.sweeps == self.particles
    }

    pub fn is_racing(&self) -> bool {
        self.queues.len() > 1
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    pub fn sentinel_policy(&self) -> WaitPolicy {
        WaitPolicy::fixed(Duration::from_millis(self.timing.sentinel_poll_ms))
            .with_deadline(self.deadline())
    }

    pub fn progress_policy(&self) -> WaitPolicy {
        WaitPolicy::fixed(Duration::from_millis(self.timing.progress_poll_ms))
            .with_deadline(self.deadline())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
particles: 10
sweeps: 0
division: 4
queues:
  - name: ct560
    nodes: 10
  - name: ctest
    nodes: 2
    wall_time: "00:30:00"
wall_time_max: "01:00:00"
engine_path: /home/alice/tools/fdtd/bin/fdtd-engine-impi-lcl
path_translation:
  local_prefix: 'J:\Cluster\Simulation'
  remote_prefix: /work/alice/Work
cluster:
  user: alice
  login_host: login.cluster.example
  transfer_host: xfer.cluster.example
  transfer_key: 'H:\keys\id_ecdsa'
  password_env: RELAY_PASSWORD
  otp_command: 'H:\keys\otp.exe'
scheduler:
  account: MST000000
  job_name: bend
  email: alice@example.org
  modules: [compiler/intel/2020u4, IntelMPI/2020]
"#;

    #[test]
    fn yaml_config_loads_with_defaults() {
        let cfg = JobConfig::from_yaml_str(SAMPLE).expect("config");
        assert_eq!(cfg.queues.len(), 2);
        assert_eq!(cfg.scheduler.cores_per_node, 56);
        assert_eq!(cfg.scheduler.submit_command, "sbatch");
        assert_eq!(cfg.scheduler.cancel_command, "scancel");
        assert_eq!(cfg.timing, Timing::default());
        assert_eq!(cfg.cluster.transfer_target(), "alice@xfer.cluster.example");
        assert_eq!(cfg.cluster.login_target(), "alice@login.cluster.example");
        assert!(cfg.is_racing());
        assert!(!cfg.is_sweep_only());
        assert!(cfg.deadline().is_none());
    }

    #[test]
    fn empty_transfer_host_falls_back_to_login_host() {
        let text = SAMPLE.replace("transfer_host: xfer.cluster.example", "transfer_host: ''");
        let cfg = JobConfig::from_yaml_str(&text).expect("config");
        assert_eq!(cfg.cluster.transfer_target(), "alice@login.cluster.example");

        let text = SAMPLE.replace("  transfer_host: xfer.cluster.example\n", "");
        let cfg = JobConfig::from_yaml_str(&text).expect("config");
        assert_eq!(cfg.cluster.transfer_target(), "alice@login.cluster.example");
    }

    #[test]
    fn zero_division_is_rejected() {
        let text = SAMPLE.replace("division: 4", "division: 0");
        let err = JobConfig::from_yaml_str(&text).expect_err("invalid");
        assert!(err.to_string().contains("division"), "{}", err);
    }

    #[test]
    fn division_larger_than_particles_is_rejected() {
        let text = SAMPLE.replace("division: 4", "division: 11");
        assert!(JobConfig::from_yaml_str(&text).is_err());
    }

    #[test]
    fn queue_names_must_be_identifier_like() {
        let text = SAMPLE.replace("name: ctest", "name: c-test");
        let err = JobConfig::from_yaml_str(&text).expect_err("invalid");
        assert!(err.to_string().contains("c-test"), "{}", err);
    }

    #[test]
    fn duplicate_queues_are_rejected() {
        let text = SAMPLE.replace("name: ctest", "name: ct560");
        assert!(JobConfig::from_yaml_str(&text).is_err());
    }
}
