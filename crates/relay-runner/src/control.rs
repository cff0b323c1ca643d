//! Control script for the terminal-automation agent.
//!
//! The script is an AutoHotkey program that drives one interactive terminal
//! through login, remote setup, upload, submission, the multi-queue race and
//! the per-partition downloads. It talks to the orchestrator only through the
//! sentinel files named in [`crate::layout`]; every transfer runs from a
//! one-line command file so the terminal stays free for the remote shell.

use std::path::{Path, PathBuf};

use anyhow::Result;
use relay_core::{sha256_bytes, write_dos_text, JobConfig};
use tracing::info;

use crate::layout::{JobLayout, ALL_UPLOADED};
use crate::partition::Partition;
use crate::template::JobDescriptor;

pub const UPLOAD_STALL_FACTOR: u64 = 3;
pub const DOWNLOAD_STALL_FACTOR: u64 = 7;

pub const CMD_SESSION_STARTED: &str = "session-started";
pub const CMD_UPLOAD: &str = "upload";
pub const CMD_FETCH_IDS: &str = "fetch-ids";
pub const CMD_FETCH_LOGS: &str = "fetch-logs";
pub const CMD_ALL_DOWNLOADED: &str = "all-downloaded";

pub fn fetch_results_command(partition: usize) -> String {
    format!("fetch-results-{}", partition)
}

/// Stall ceilings, counted in loop ticks, after which a transfer is fired
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub upload_reset: u64,
    pub download_reset: u64,
}

impl Thresholds {
    pub fn for_config(config: &JobConfig) -> Self {
        let n = config.particles;
        let s = config.sweeps;
        let d = config.division.max(1);
        if config.is_sweep_only() {
            Self {
                upload_reset: UPLOAD_STALL_FACTOR * s,
                download_reset: DOWNLOAD_STALL_FACTOR * s / d,
            }
        } else if s != 0 {
            Self {
                upload_reset: UPLOAD_STALL_FACTOR * n * s,
                download_reset: (DOWNLOAD_STALL_FACTOR * n / d) * s,
            }
        } else {
            Self {
                upload_reset: UPLOAD_STALL_FACTOR * n,
                download_reset: DOWNLOAD_STALL_FACTOR * n / d,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFile {
    pub name: String,
    pub path: PathBuf,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlan {
    pub script_path: PathBuf,
    pub script: Vec<String>,
    pub commands: Vec<CommandFile>,
    pub thresholds: Thresholds,
}

impl ControlPlan {
    pub fn command(&self, name: &str) -> Option<&CommandFile> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn digest(&self) -> String {
        sha256_bytes(self.script.join("\r\n").as_bytes())
    }

    pub fn write(&self) -> Result<()> {
        for command in &self.commands {
            write_dos_text(&command.path, &command.lines)?;
        }
        write_dos_text(&self.script_path, &self.script)?;
        info!(
            path = %self.script_path.display(),
            commands = self.commands.len(),
            upload_reset = self.thresholds.upload_reset,
            download_reset = self.thresholds.download_reset,
            "wrote control script"
        );
        Ok(())
    }
}

/// Windows form of a local path, as the agent and `cmd.exe` see it.
pub fn windows_path(path: &Path) -> String {
    path.to_string_lossy().replace('/', "\\")
}

/// Escapes text placed in a legacy command argument (`ControlSend`).
fn ahk_arg(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '`' | '%' | ',' | ';' => {
                out.push('`');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Escapes text placed inside a double-quoted expression string.
fn ahk_str(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\"\""),
            '`' | ';' => {
                out.push('`');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn exists(path: &Path) -> String {
    format!("FileExist({})", ahk_str(&windows_path(path)))
}

#[derive(Default)]
struct Emitter {
    lines: Vec<String>,
    depth: usize,
}

impl Emitter {
    fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if text.is_empty() {
            self.lines.push(String::new());
        } else {
            self.lines.push(format!("{}{}", "    ".repeat(self.depth), text));
        }
    }

    fn open(&mut self, header: impl AsRef<str>) {
        self.line(format!("{} {{", header.as_ref()));
        self.depth += 1;
    }

    /// Brace on its own line, for commands that cannot take one inline.
    fn block(&mut self) {
        self.line("{");
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.line("}");
    }

    fn send(&mut self, keys: &str) {
        self.line(format!("ControlSend, , {}{{Enter}}, ahk_pid %PID%", ahk_arg(keys)));
    }

    fn double(&mut self, command: &str) {
        self.line(format!("DoubleCmd(PID, {})", ahk_str(command)));
    }

    fn sleep(&mut self, ms: u64) {
        self.line(format!("Sleep {}", ms));
    }

    fn run(&mut self, command: &CommandFile, show: &str) {
        self.line(format!("Run, {},, {}", windows_path(&command.path), show));
    }
}

struct Slot {
    var: String,
    record: PathBuf,
    record_name: String,
    script_name: String,
}

/// Renders the control script and its command files without writing them.
pub fn plan_control_script(
    job: &JobDescriptor,
    config: &JobConfig,
    layout: &JobLayout,
    partitions: &[Partition],
) -> ControlPlan {
    let thresholds = Thresholds::for_config(config);
    let commands = plan_command_files(job, config, layout, partitions);
    let find = |name: &str| {
        commands
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .unwrap_or_else(|| CommandFile {
                name: name.to_string(),
                path: layout.command_file(name),
                lines: Vec::new(),
            })
    };
    let t = &config.timing;
    let remote_dir = job.remote_dir.as_str();

    let slots: Vec<Slot> = config
        .queues
        .iter()
        .flat_map(|q| partitions.iter().map(move |p| (q.name.clone(), p.index)))
        .map(|(queue, k)| Slot {
            var: JobLayout::slot(&queue, k),
            record: layout.submission_record(&queue, k),
            record_name: JobLayout::submission_record_name(&queue, k),
            script_name: layout.batch_script_name(&queue, k),
        })
        .collect();
    let markers: Vec<String> = partitions
        .iter()
        .map(|p| exists(&layout.result_marker(p.index)))
        .collect();

    let mut e = Emitter::default();
    e.line("#NoEnv");
    e.line("#SingleInstance Force");
    e.line("SendMode Input");
    e.line("SetWorkingDir %A_ScriptDir%");
    e.line("");
    e.line(format!("SetKeyDelay, 0, {}", t.key_delay_ms));
    e.line(format!("EnvGet, RelayPassword, {}", config.cluster.password_env));
    e.line(format!("Run, {}, , Min, PID", config.agent.terminal));
    e.line("WinWait, ahk_pid %PID%");
    e.run(&find(CMD_SESSION_STARTED), "Hide");
    e.sleep(t.login_step_ms);
    e.open(format!("if ({})", markers.join(" and ")));
    e.line("Goto, Finish");
    e.close();
    e.line("");

    e.line("OTP1 := Login(PID)");
    e.open(format!("if not {}", exists(&layout.all_uploaded())));
    e.double(&format!("rm -rf {}", remote_dir));
    e.double(&format!("rm -rf {}_*", remote_dir));
    e.double(&format!("mkdir -p {}", remote_dir));
    e.close();
    e.double(&format!("cd; cd {}", remote_dir));
    e.line("fired := 0");
    e.line("stall := 0");
    e.open(format!("While not {}", exists(&layout.all_uploaded())));
    e.double(&format!(
        "echo Uploading all files @ $(date) >> ./{}",
        ALL_UPLOADED
    ));
    e.sleep(t.upload_tick_ms);
    e.open("if (fired = 0)");
    e.run(&find(CMD_UPLOAD), "Min");
    e.sleep(t.transfer_kick_ms);
    e.line("fired := 1");
    e.close();
    e.open("if (fired = 1)");
    e.line("stall += 1");
    e.send(&format!("cd; cd {}", remote_dir));
    e.open(format!("if (stall > {})", thresholds.upload_reset));
    e.line("stall := 0");
    e.line("fired := 0");
    e.close();
    e.close();
    e.close();
    e.line("");

    for slot in &slots {
        e.line(format!(
            "{} := ExtractJobID({})",
            slot.var,
            ahk_str(&windows_path(&slot.record))
        ));
    }
    let all_ids = slots
        .iter()
        .map(|s| format!("{} != \"\"", s.var))
        .collect::<Vec<_>>()
        .join(" and ");
    e.open("Loop");
    e.open(format!("if ({})", all_ids));
    e.line("break");
    e.close();
    for slot in &slots {
        e.open(format!("if ({} = \"\")", slot.var));
        e.send(&format!(
            "{} {} >> {}",
            config.scheduler.submit_command, slot.script_name, slot.record_name
        ));
        e.sleep(t.submit_settle_ms);
        e.close();
    }
    e.run(&find(CMD_FETCH_IDS), "Hide");
    e.sleep(t.fetch_settle_ms);
    for slot in &slots {
        e.open(format!("if ({} = \"\")", slot.var));
        e.line(format!(
            "{} := ExtractJobID({})",
            slot.var,
            ahk_str(&windows_path(&slot.record))
        ));
        e.close();
    }
    e.close();
    e.send("exit");
    e.line("");

    e.line(format!("t := {}", t.download_tick_ms));
    if config.is_racing() {
        e.line("raced := 0");
    }
    for p in partitions {
        e.line(format!("idle{} := 1", p.index));
        e.line(format!("stall{} := 0", p.index));
    }
    e.open("Loop");
    e.open(format!("if ({})", markers.join(" and ")));
    e.line("break");
    e.close();
    e.run(&find(CMD_FETCH_LOGS), "Hide");
    e.line("Sleep %t%");
    if config.is_racing() {
        let started = config
            .queues
            .iter()
            .map(|q| exists(&layout.queue_log(&q.name)))
            .collect::<Vec<_>>()
            .join(" or ");
        e.open(format!("if (raced = 0 and ({}))", started));
        e.line("raced := 1");
        e.line("OTP2 := Login(PID, OTP1)");
        for (winner_idx, winner) in config.queues.iter().enumerate() {
            let header = format!("if {}", exists(&layout.queue_log(&winner.name)));
            if winner_idx == 0 {
                e.open(header);
            } else {
                e.open(format!("else {}", header));
            }
            for (loser_idx, loser) in config.queues.iter().enumerate() {
                if loser_idx == winner_idx {
                    continue;
                }
                for p in partitions {
                    e.line(format!(
                        "CancelJob(PID, {})",
                        JobLayout::slot(&loser.name, p.index)
                    ));
                }
            }
            e.close();
        }
        e.send("exit");
        e.close();
    }
    for p in partitions {
        let k = p.index;
        e.open(format!(
            "if ({} and idle{} = 1)",
            exists(&layout.completion(k)),
            k
        ));
        e.send(&format!(
            "echo Downloading results part {} of {} @ %date%:%time%",
            k + 1,
            partitions.len()
        ));
        e.run(&find(&fetch_results_command(k)), "Min");
        e.line(format!("idle{} := 0", k));
        e.close();
        e.open(format!(
            "if (not {} and idle{} = 0)",
            exists(&layout.result_marker(k)),
            k
        ));
        e.line(format!("stall{} += 1", k));
        e.open(format!("if (stall{} > {})", k, thresholds.download_reset));
        e.line(format!("stall{} := 0", k));
        e.line(format!("idle{} := 1", k));
        e.close();
        e.close();
    }
    e.close();
    e.line("");
    e.line("Finish:");
    e.run(&find(CMD_ALL_DOWNLOADED), "Hide");
    e.sleep(t.login_step_ms);
    e.send("exit");
    e.line("ExitApp");
    e.line("");

    e.open("DoubleCmd(PID, cmd)");
    e.line("ControlSend, , %cmd%{Enter}, ahk_pid %PID%");
    e.sleep(t.command_gap_ms);
    e.line("ControlSend, , %cmd%{Enter}, ahk_pid %PID%");
    e.sleep(t.login_step_ms);
    e.close();
    e.line("");

    e.open("Login(PID, oldOTP := \"\")");
    e.line("global RelayPassword");
    e.send(&format!("ssh {}", config.cluster.login_target()));
    e.sleep(t.login_step_ms);
    e.line("ControlSend, , {Raw}%RelayPassword%, ahk_pid %PID%");
    e.line("ControlSend, , {Enter}, ahk_pid %PID%");
    e.sleep(t.password_settle_ms);
    e.line("newOTP := ExtractOTP()");
    e.open("While (newOTP = oldOTP or newOTP = \"\")");
    e.sleep(t.code_retry_ms);
    e.line("newOTP := ExtractOTP()");
    e.close();
    e.line("ControlSend, , %newOTP%{Enter}, ahk_pid %PID%");
    e.sleep(t.login_settle_ms);
    e.line("return newOTP");
    e.close();
    e.line("");

    e.open("CancelJob(PID, id)");
    e.open("if (id = \"\")");
    e.line("return");
    e.close();
    for _ in 0..2 {
        e.line(format!(
            "ControlSend, , {} %id%{{Enter}}, ahk_pid %PID%",
            ahk_arg(&config.scheduler.cancel_command)
        ));
        e.sleep(t.cancel_settle_ms);
    }
    e.close();
    e.line("");

    e.open("ExtractOTP()");
    e.line(format!(
        "out := ComObjCreate(\"WScript.Shell\").Exec({}).StdOut.ReadAll()",
        ahk_str(&windows_path(&config.cluster.otp_command))
    ));
    e.line("return Trim(out, \" `t`r`n\")");
    e.close();
    e.line("");

    // Mirrors `jobid::parse_job_id`.
    e.open("ExtractJobID(fname)");
    e.open("if not FileExist(fname)");
    e.line("return \"\"");
    e.close();
    e.line("FileRead, content, %fname%");
    e.line("last := \"\"");
    e.line("Loop, Parse, content, `n, `r");
    e.block();
    e.line("line := Trim(A_LoopField)");
    e.open("if (line != \"\")");
    e.line("last := line");
    e.close();
    e.close();
    e.line("fields := StrSplit(RegExReplace(last, \"\\s+\", \" \"), \" \")");
    e.open("if (fields.Length() >= 4 and fields[1] == \"Submitted\" and fields[2] == \"batch\" and fields[3] == \"job\")");
    e.line("id := fields[4]");
    e.close();
    e.open("else if (fields.Length() = 1 and RegExMatch(fields[1], \"^\\d+$\"))");
    e.line("id := fields[1]");
    e.close();
    e.open("else if (fields.Length() >= 2)");
    e.line("id := fields[2]");
    e.close();
    e.open("else");
    e.line("return \"\"");
    e.close();
    e.open("if not RegExMatch(id, \"^[A-Za-z0-9._-]+$\")");
    e.line("return \"\"");
    e.close();
    e.line("return id");
    e.close();

    ControlPlan {
        script_path: layout.control_script(),
        script: e.lines,
        commands,
        thresholds,
    }
}

fn plan_command_files(
    job: &JobDescriptor,
    config: &JobConfig,
    layout: &JobLayout,
    partitions: &[Partition],
) -> Vec<CommandFile> {
    let key = windows_path(&config.cluster.transfer_key);
    let target = config.cluster.transfer_target();
    let local = windows_path(&layout.job_dir);
    let remote = job.remote_dir.as_str();
    let put = |pattern: &str| {
        format!(
            "scp -i \"{}\" \"{}\\{}\" {}:{}",
            key, local, pattern, target, remote
        )
    };
    let get = |pattern: &str| {
        format!(
            "scp -i \"{}\" {}:{}/{} \"{}\"",
            key, target, remote, pattern, local
        )
    };
    let stamp = |path: &Path, what: &str| {
        format!(
            "echo {} @ %date%:%time% >> \"{}\"",
            what,
            windows_path(path)
        )
    };
    let file = |name: String, lines: Vec<String>| CommandFile {
        path: layout.command_file(&name),
        name,
        lines,
    };

    let mut out = vec![
        file(
            CMD_SESSION_STARTED.to_string(),
            vec![stamp(&layout.session_started(), "Session started")],
        ),
        file(
            CMD_UPLOAD.to_string(),
            vec![
                put(&format!("*.{}", job.extension())),
                put("*.sh"),
                get("*.txt"),
            ],
        ),
        file(CMD_FETCH_IDS.to_string(), vec![get("*.txt")]),
        file(CMD_FETCH_LOGS.to_string(), vec![get("*.log")]),
    ];
    for p in partitions {
        out.push(file(
            fetch_results_command(p.index),
            vec![get(&format!(
                "{}/*.{}",
                JobLayout::work_dir_name(p.index),
                job.extension()
            ))],
        ));
    }
    out.push(file(
        CMD_ALL_DOWNLOADED.to_string(),
        vec![stamp(&layout.all_downloaded(), "All tasks completed")],
    ));
    out
}
