//! Scheduler batch scripts, one per (queue, partition) pair.

use std::path::PathBuf;

use anyhow::Result;
use relay_core::{write_unix_text, JobConfig, QueueSpec, RelayError};
use tracing::info;

use crate::layout::JobLayout;
use crate::partition::{partition_particles, Partition};
use crate::template::JobDescriptor;

/// Markers the engine prints when it cannot check out a licence.
pub const LICENSE_FAILURE_MARKERS: [&str; 2] =
    ["FlexNet Licensing error", "failure with the license"];
pub const LICENSE_RETRY_LIMIT: u32 = 12;
const LICENSE_RETRY_SLEEP_SECS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchScript {
    pub queue: String,
    pub partition: Partition,
    pub path: PathBuf,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub partitions: Vec<Partition>,
    pub scripts: Vec<BatchScript>,
}

impl BatchPlan {
    pub fn write(&self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(self.scripts.len());
        for script in &self.scripts {
            write_unix_text(&script.path, &script.lines)?;
            info!(path = %script.path.display(), "wrote batch script");
            written.push(script.path.clone());
        }
        Ok(written)
    }
}

/// Renders every batch script without touching the filesystem.
pub fn plan_batch_scripts(
    job: &JobDescriptor,
    config: &JobConfig,
    layout: &JobLayout,
) -> Result<BatchPlan, RelayError> {
    let partitions = partition_particles(config.particles, config.division)?;
    let mut scripts = Vec::with_capacity(partitions.len() * config.queues.len());
    for queue in &config.queues {
        for partition in &partitions {
            let lines = render_batch_script(job, config, queue, partition);
            scripts.push(BatchScript {
                queue: queue.name.clone(),
                partition: *partition,
                path: layout.batch_script(&queue.name, partition.index),
                lines,
            });
        }
    }
    Ok(BatchPlan {
        partitions,
        scripts,
    })
}

/// What one invocation of the engine runs on, expressed in shell variables
/// `i` (particle) and optionally `j` (sweep).
struct Invocation {
    project: String,
    log: String,
    failure_log: String,
}

impl Invocation {
    fn new(job: &JobDescriptor, with_sweep: bool, particle: &str, sweep: &str) -> Self {
        let series = &job.name.series;
        let base = if with_sweep {
            format!("{}{}sweep_{}", series, particle, sweep)
        } else {
            format!("{}{}", series, particle)
        };
        Self {
            project: format!("{}.{}", base, job.extension()),
            log: format!("{}_p0.log", base),
            failure_log: format!("{}_p0failure.log", base),
        }
    }
}

fn render_batch_script(
    job: &JobDescriptor,
    config: &JobConfig,
    queue: &QueueSpec,
    partition: &Partition,
) -> Vec<String> {
    let g = job.name.generation;
    let d = partition.index;
    let division = config.division;
    let sched = &config.scheduler;
    let with_sweep = config.sweeps * u64::from(g) > 0;
    let work = format!("${{WORKFOLDER}}/{}", JobLayout::work_dir_name(d));
    let launch = format!("{} $ENGINE", sched.launcher);

    let mut lines = vec![
        "#!/bin/bash".to_string(),
        format!("#SBATCH -A {}", sched.account),
        format!("#SBATCH -J {}g{}d{}/{}", sched.job_name, g, d + 1, division),
        format!("#SBATCH -p {}", queue.name),
        format!(
            "#SBATCH -n {}",
            u64::from(sched.cores_per_node) * u64::from(queue.nodes)
        ),
    ];
    if let Some(wall) = queue.wall_time.as_ref().or(config.wall_time_max.as_ref()) {
        lines.push(format!("#SBATCH --time={}", wall));
    }
    lines.push("#SBATCH -c 1".to_string());
    lines.push(format!("#SBATCH -N {}", queue.nodes));
    if let Some(email) = &sched.email {
        lines.push("#SBATCH --mail-type BEGIN,END".to_string());
        lines.push(format!("#SBATCH --mail-user {}", email));
    }
    lines.push("#SBATCH -o %j.out".to_string());
    lines.push("#SBATCH -e %j.err".to_string());
    lines.push(String::new());
    lines.push(format!("ENGINE={}", config.engine_path));
    lines.push(format!("WORKFOLDER={}", job.remote_dir));
    lines.push(String::new());
    lines.push(format!(
        "echo Simulation g{}d{}/{} started @ $(date) >> ${{WORKFOLDER}}/{}",
        g,
        d + 1,
        division,
        JobLayout::queue_log_name(&queue.name)
    ));
    // One cleanup per generation, owned by partition 0 of the first queue.
    if d == 0 && config.queues.first() == Some(queue) {
        if let Some(previous) = job.name.previous_generation_dir(&job.remote_dir) {
            lines.push(format!(
                "if [ -d {prev} ]; then rm -r {prev}; fi",
                prev = previous
            ));
        }
    }
    lines.push(format!("mkdir -p {}", work));
    lines.push(String::new());
    if !sched.modules.is_empty() {
        lines.push(format!("module load {}", sched.modules.join(" ")));
        lines.push(String::new());
    }

    let inv = Invocation::new(job, with_sweep, "${i}", "${j}");
    let indent = if with_sweep { "        " } else { "    " };
    let exec = format!("{} {}/{}", launch, work, inv.project);
    lines.push(format!("for i in {{{}..{}}}", partition.first, partition.last));
    lines.push("do".to_string());
    if with_sweep {
        lines.push(format!("    for j in {{1..{}}}", config.sweeps));
        lines.push("    do".to_string());
    }
    lines.push(format!(
        "{}cp ${{WORKFOLDER}}/{} {}; {}",
        indent, inv.project, work, exec
    ));
    lines.extend(license_retry_block(indent, &work, &inv, &exec));
    lines.push(format!("{}cp {}/*.log $WORKFOLDER", indent, work));
    if with_sweep {
        lines.push("    done".to_string());
    }
    lines.push("done".to_string());

    if d == 0 && config.is_racing() {
        let lead = Invocation::new(job, with_sweep, "1", "1");
        let lead_dir = format!("${{WORKFOLDER}}/{}", JobLayout::work_dir_name(0));
        lines.push(format!(
            "rm -f {dir}/{log}; {launch} {dir}/{project}; cp {dir}/*.log $WORKFOLDER",
            dir = lead_dir,
            log = lead.log,
            launch = launch,
            project = lead.project
        ));
    }

    lines.push(format!(
        "echo All simulations completed @ $(date) >> ${{WORKFOLDER}}/{}",
        JobLayout::completion_name(d)
    ));
    lines.push(format!(
        "echo Results of partition {} ready @ $(date) >> {}/zall-downloaded-{}.{}",
        d,
        work,
        d,
        job.extension()
    ));
    lines
}

fn license_retry_block(indent: &str, work: &str, inv: &Invocation, exec: &str) -> Vec<String> {
    let log = format!("{}/{}", work, inv.log);
    let grep = LICENSE_FAILURE_MARKERS
        .iter()
        .map(|m| format!("grep -q \"{}\" \"$logfname\"", m))
        .collect::<Vec<_>>()
        .join(" || ");
    vec![
        format!("{}logfname={}", indent, log),
        format!("{}for k in {{1..{}}}", indent, LICENSE_RETRY_LIMIT),
        format!("{}do", indent),
        format!("{}    if {}; then", indent, grep),
        format!(
            "{}        echo license failure @ $(date) >> {}/{}",
            indent, work, inv.failure_log
        ),
        format!("{}        sleep {}", indent, LICENSE_RETRY_SLEEP_SECS),
        format!("{}        {}", indent, exec),
        format!("{}    else", indent),
        format!("{}        break", indent),
        format!("{}    fi", indent),
        format!("{}done", indent),
    ]
}
