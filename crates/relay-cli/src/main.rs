use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use relay_core::{JobConfig, WaitPolicy};
use relay_runner::{
    AgentDriver, CommandCodeSource, CompletionPoller, InProcessDriver, OpenSshShell,
    SessionDriver,
};
use serde_json::{json, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay", version, about = "Cluster job relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DriverArg {
    #[value(name = "agent")]
    Agent,
    #[value(name = "in-process")]
    InProcess,
}

#[derive(Subcommand)]
enum Commands {
    /// Build scripts, drive the session if this is the lead particle, then
    /// wait for this particle's progress log to report completion.
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Job template; read from stdin when omitted.
        #[arg(long)]
        template: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "agent")]
        driver: DriverArg,
        #[arg(long)]
        json: bool,
    },
    /// Write the batch scripts for a template without starting a session.
    Scripts {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        template: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Write the agent control script and its command files.
    Control {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        template: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Poll a mirrored progress log until it reports completion.
    Wait {
        log: PathBuf,
        #[arg(long, default_value_t = 5000)]
        interval_ms: u64,
        #[arg(long)]
        timeout_seconds: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Show how particles are split across partitions.
    Partitions {
        #[arg(long)]
        particles: u64,
        #[arg(long)]
        division: u64,
        #[arg(long)]
        json: bool,
    },
    /// Write a starter configuration file.
    Init {
        #[arg(long, default_value = "relay.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let cancel = CancellationToken::new();
    install_shutdown_handler(cancel.clone());

    let result = tokio::task::spawn_blocking(move || run_command(cli.command, &cancel))
        .await
        .map_err(|err| anyhow!("command task failed: {}", err))?;
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn install_shutdown_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current step");
            cancel.cancel();
        }
    });
}

fn run_command(command: Commands, cancel: &CancellationToken) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            template,
            driver,
            json,
        } => {
            let config = JobConfig::load(&config)?;
            let lines = read_template(template.as_deref())?;
            let prepared = relay_runner::prepare(&config, &lines)?;
            let mut driver: Box<dyn SessionDriver> = match driver {
                DriverArg::Agent => Box::new(AgentDriver::new()),
                DriverArg::InProcess => Box::new(InProcessDriver::new(
                    OpenSshShell::from_config(&config, &prepared.layout.local("runtime")),
                    CommandCodeSource::new(&config.cluster.otp_command),
                )),
            };
            let report = relay_runner::run_prepared(&config, &prepared, driver.as_mut(), cancel)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": serde_json::to_value(&report)?,
                })));
            }
            println!("basename: {}", report.basename);
            println!("job_dir: {}", report.job_dir.display());
            println!("lead: {}", report.lead);
            println!("session: {}", report.session.as_str());
            println!("scripts: {}", report.scripts.len());
            if let Some(outcome) = &report.outcome {
                println!("driver: {}", outcome.driver);
                for (slot, id) in &outcome.job_ids {
                    println!("job_id.{}: {}", slot, id);
                }
                if let Some(winner) = &outcome.winner {
                    println!("winner: {}", winner);
                }
            }
            println!("completed: {}", report.completed.path.display());
        }
        Commands::Scripts {
            config,
            template,
            json,
        } => {
            let config = JobConfig::load(&config)?;
            let lines = read_template(template.as_deref())?;
            let prepared = relay_runner::prepare(&config, &lines)?;
            let written = prepared.batch.write()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "scripts",
                    "lead": prepared.is_lead(),
                    "partitions": prepared.partitions(),
                    "scripts": written.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                })));
            }
            println!("lead: {}", prepared.is_lead());
            for path in &written {
                println!("script: {}", path.display());
            }
        }
        Commands::Control {
            config,
            template,
            json,
        } => {
            let config = JobConfig::load(&config)?;
            let lines = read_template(template.as_deref())?;
            let prepared = relay_runner::prepare(&config, &lines)?;
            let plan = prepared.control_plan(&config);
            plan.write()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "control",
                    "script": plan.script_path.display().to_string(),
                    "digest": plan.digest(),
                    "commands": plan.commands.iter().map(|c| c.path.display().to_string()).collect::<Vec<_>>(),
                    "upload_reset": plan.thresholds.upload_reset,
                    "download_reset": plan.thresholds.download_reset,
                })));
            }
            println!("script: {}", plan.script_path.display());
            println!("digest: {}", plan.digest());
            println!("upload_reset: {}", plan.thresholds.upload_reset);
            println!("download_reset: {}", plan.thresholds.download_reset);
            for command in &plan.commands {
                println!("command: {}", command.path.display());
            }
        }
        Commands::Wait {
            log,
            interval_ms,
            timeout_seconds,
            json,
        } => {
            let policy = WaitPolicy::fixed(Duration::from_millis(interval_ms))
                .with_deadline(timeout_seconds.map(Duration::from_secs));
            let done = CompletionPoller::new(policy, cancel).wait(&log)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "wait",
                    "completed": done,
                })));
            }
            println!("completed: {}", done.path.display());
            println!("polls: {}", done.polls);
        }
        Commands::Partitions {
            particles,
            division,
            json,
        } => {
            let parts = relay_runner::partition_particles(particles, division)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "partitions",
                    "partitions": parts,
                })));
            }
            for p in &parts {
                println!("d{}: {}..{} ({})", p.index, p.first, p.last, p.size());
            }
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow!(
                    "init file already exists (use --force): {}",
                    path.display()
                ));
            }
            relay_core::atomic_write_bytes(&path, STARTER_CONFIG.as_bytes())?;
            println!("config: {}", path.display());
        }
    }
    Ok(None)
}

fn read_template(path: Option<&Path>) -> Result<Vec<String>> {
    let text = match path {
        Some(p) => std::fs::read_to_string(p)
            .with_context(|| format!("reading template {}", p.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading template from stdin")?;
            buf
        }
    };
    Ok(text.lines().map(str::to_string).collect())
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<relay_core::RelayError>() {
        Some(relay_core::RelayError::Config(_)) => "configuration_error",
        Some(relay_core::RelayError::MalformedName { .. }) => "malformed_name",
        Some(relay_core::RelayError::MalformedJobId(_)) => "malformed_job_id",
        Some(relay_core::RelayError::Cancelled(_)) => "cancelled",
        Some(relay_core::RelayError::DeadlineExceeded { .. }) => "deadline_exceeded",
        None => "command_failed",
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Scripts { json, .. }
        | Commands::Control { json, .. }
        | Commands::Wait { json, .. }
        | Commands::Partitions { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

const STARTER_CONFIG: &str = "\
particles: 10                         # REQUIRED: particles per generation
sweeps: 0                             # inner sweeps per particle; 0 disables
division: 1                           # REQUIRED: partitions per generation (<= particles)
queues:                               # REQUIRED: at least one; several queues race
  - name: ''
    nodes: 1
wall_time_max: '01:00:00'
engine_path: ''                       # REQUIRED: solver binary on the cluster
path_translation:
  local_prefix: ''                    # REQUIRED: shared volume as seen locally
  remote_prefix: ''                   # REQUIRED: same volume on the cluster
cluster:
  user: ''
  login_host: ''
  # transfer_host: ''                 # data-transfer node; defaults to login_host
  transfer_key: ''
  password_env: RELAY_PASSWORD        # environment variable holding the password
  otp_command: ''                     # prints one one-time code per run
scheduler:
  account: ''
  job_name: ''
  modules: []
timing: {}                            # millisecond overrides of the default delays
";
