//! Job template parsing.
//!
//! A template is the scheduler submission text handed to us by the
//! simulation front-end. It must quote exactly one project file; that path is
//! rewritten to the cluster mount and everything else passes through.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use relay_core::{JobConfig, PathTranslator, RelayError};
use tracing::debug;

pub const PROJECT_EXTENSIONS: [&str; 4] = [".fsp", ".icp", ".lms", ".ldev"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTemplate {
    /// Template lines with the project path rewritten to its remote form.
    pub lines: Vec<String>,
    /// Project path exactly as quoted in the template.
    pub local_path: String,
    pub filename: String,
    pub basename: String,
    /// Extension without the dot, e.g. `fsp`.
    pub extension: String,
    pub line_index: usize,
}

fn quoted_args(line: &str) -> Vec<&str> {
    let parts: Vec<&str> = line.split('"').collect();
    // Odd segments sit between quotes; the last one is only quoted if a
    // closing quote follows it.
    parts
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 2 == 1 && *i + 1 < parts.len())
        .map(|(_, s)| *s)
        .collect()
}

fn project_extension(arg: &str) -> Option<&'static str> {
    PROJECT_EXTENSIONS.iter().copied().find(|ext| arg.ends_with(ext))
}

fn split_filename(path: &str) -> (&str, &str) {
    match path.rfind(['/', '\\']) {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

pub fn parse_template(
    lines: &[String],
    translator: &PathTranslator,
) -> Result<ParsedTemplate, RelayError> {
    let mut found: Vec<(usize, String, &'static str)> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        for arg in quoted_args(line) {
            if let Some(ext) = project_extension(arg) {
                found.push((idx, arg.to_string(), ext));
            }
        }
    }
    let (line_index, local_path, ext) = match found.len() {
        0 => {
            return Err(RelayError::config(format!(
                "no quoted project file ({}) found in the job template",
                PROJECT_EXTENSIONS.join(", ")
            )))
        }
        1 => found.remove(0),
        n => {
            return Err(RelayError::config(format!(
                "job template references {} project files ({}); expected exactly one",
                n,
                found
                    .iter()
                    .map(|(_, p, _)| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    };

    let (_, filename) = split_filename(&local_path);
    let basename = filename[..filename.len() - ext.len()].to_string();
    if basename.is_empty() {
        return Err(RelayError::config(format!(
            "project file '{}' has an empty name",
            local_path
        )));
    }
    let remote = translator.to_remote(&local_path);
    let mut rewritten = lines.to_vec();
    rewritten[line_index] = lines[line_index].replace(&local_path, &remote);
    debug!(line = line_index, local = %local_path, remote = %remote, "rewrote project path");

    Ok(ParsedTemplate {
        lines: rewritten,
        filename: filename.to_string(),
        basename,
        extension: ext.trim_start_matches('.').to_string(),
        local_path,
        line_index,
    })
}

static OPTIMIZATION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"optimizationg(\d+)_(\d+)(?:sweep_(\d+))?$").expect("static regex")
});
static INDEXED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(\d+)$").expect("static regex"));

/// Indices encoded in a project basename.
///
/// `optimizationg5_3sweep_2` is generation 5, particle 3, sweep 2;
/// `optimizationg5_3` has no sweep; `sweep_4` is generation 0, particle 4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectName {
    /// Prefix used for generated script names (text before the first `_`).
    pub stem: String,
    /// Basename up to the particle index, e.g. `optimizationg5_` or `sweep_`.
    pub series: String,
    pub generation: u32,
    pub particle: u64,
    pub sweep: Option<u64>,
}

impl ProjectName {
    pub fn parse(basename: &str) -> Result<Self, RelayError> {
        let malformed = |reason: &str| RelayError::MalformedName {
            name: basename.to_string(),
            reason: reason.to_string(),
        };
        let stem = basename.split('_').next().unwrap_or(basename).to_string();
        if let Some(caps) = OPTIMIZATION_NAME.captures(basename) {
            let generation = caps[1]
                .parse::<u32>()
                .map_err(|_| malformed("generation index out of range"))?;
            let particle = caps[2]
                .parse::<u64>()
                .map_err(|_| malformed("particle index out of range"))?;
            let sweep = match caps.get(3) {
                Some(m) => Some(
                    m.as_str()
                        .parse::<u64>()
                        .map_err(|_| malformed("sweep index out of range"))?,
                ),
                None => None,
            };
            let series = basename[..caps.get(2).map_or(0, |m| m.start())].to_string();
            return Ok(Self {
                stem,
                series,
                generation,
                particle,
                sweep,
            });
        }
        if basename.contains("optimizationg") {
            return Err(malformed(
                "expected optimizationg<generation>_<particle>[sweep_<n>]",
            ));
        }
        if let Some(caps) = INDEXED_NAME.captures(basename) {
            let particle = caps[1]
                .parse::<u64>()
                .map_err(|_| malformed("particle index out of range"))?;
            let series = basename[..caps.get(1).map_or(0, |m| m.start())].to_string();
            return Ok(Self {
                stem,
                series,
                generation: 0,
                particle,
                sweep: None,
            });
        }
        Err(malformed("no trailing _<index>"))
    }

    /// The lead project file is the one whose invocation drives the whole
    /// generation; every other particle only waits for its own log.
    pub fn is_lead(&self) -> bool {
        self.particle == 1 && self.sweep.map_or(true, |s| s == 1)
    }

    pub fn is_sweep_only(&self) -> bool {
        self.generation == 0
    }

    /// Remote directory of the preceding generation, for `g > 1`.
    pub fn previous_generation_dir(&self, remote_dir: &str) -> Option<String> {
        if self.generation <= 1 {
            return None;
        }
        let current = format!("optimizationg{}", self.generation);
        let previous = format!("optimizationg{}", self.generation - 1);
        let mut out = String::with_capacity(remote_dir.len());
        let mut last = 0;
        let mut replaced = false;
        for (idx, _) in remote_dir.match_indices(&current) {
            let end = idx + current.len();
            let followed_by_digit = remote_dir[end..]
                .chars()
                .next()
                .map_or(false, |c| c.is_ascii_digit());
            if followed_by_digit {
                continue;
            }
            out.push_str(&remote_dir[last..idx]);
            out.push_str(&previous);
            last = end;
            replaced = true;
        }
        if !replaced {
            return None;
        }
        out.push_str(&remote_dir[last..]);
        Some(out)
    }
}

/// Everything the builder and the drivers need to know about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub template: ParsedTemplate,
    pub name: ProjectName,
    pub local_path: PathBuf,
    pub job_dir: PathBuf,
    pub remote_path: String,
    pub remote_dir: String,
}

impl JobDescriptor {
    pub fn from_template(lines: &[String], config: &JobConfig) -> Result<Self, RelayError> {
        let translator = config.translator();
        let template = parse_template(lines, translator)?;
        let name = ProjectName::parse(&template.basename)?;
        // Remote cleanup runs `rm -rf` on the remote directory, so an
        // untranslated or empty path must never get that far.
        if !translator.covers(&template.local_path) {
            return Err(RelayError::config(format!(
                "project file '{}' is outside path_translation.local_prefix '{}'",
                template.local_path, translator.local_prefix
            )));
        }
        let (dir, _) = split_filename(&template.local_path);
        let remote_path = translator.to_remote(&template.local_path);
        let remote_dir = translator.to_remote(dir);
        if remote_dir.trim_end_matches('/').is_empty() {
            return Err(RelayError::config(format!(
                "project file '{}' maps to an empty remote directory",
                template.local_path
            )));
        }
        Ok(Self {
            local_path: PathBuf::from(&template.local_path),
            job_dir: PathBuf::from(if dir.is_empty() { "." } else { dir }),
            remote_path,
            remote_dir,
            name,
            template,
        })
    }

    pub fn basename(&self) -> &str {
        &self.template.basename
    }

    pub fn extension(&self) -> &str {
        &self.template.extension
    }

    /// Progress log the engine writes next to the project file.
    pub fn progress_log(&self) -> PathBuf {
        self.job_dir.join(format!("{}_p0.log", self.basename()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn translator() -> PathTranslator {
        PathTranslator::new("H:/Cluster/Simulation", "/work/alice/Work")
    }

    #[test]
    fn parse_rewrites_the_single_project_line() {
        let input = lines(&[
            "#!/bin/bash",
            "#PBS -N test",
            r#"mpiexec.hydra /opt/engine "H:/Cluster/Simulation/y110/bend_optimizationg5/optimizationg5_1sweep_1.fsp""#,
        ]);
        let parsed = parse_template(&input, &translator()).expect("parsed");
        assert_eq!(parsed.line_index, 2);
        assert_eq!(parsed.filename, "optimizationg5_1sweep_1.fsp");
        assert_eq!(parsed.basename, "optimizationg5_1sweep_1");
        assert_eq!(parsed.extension, "fsp");
        assert_eq!(parsed.lines[0], "#!/bin/bash");
        assert_eq!(
            parsed.lines[2],
            r#"mpiexec.hydra /opt/engine "/work/alice/Work/y110/bend_optimizationg5/optimizationg5_1sweep_1.fsp""#
        );
    }

    #[test]
    fn every_recognised_extension_is_accepted() {
        for ext in PROJECT_EXTENSIONS {
            let input = vec![format!("run \"H:/Cluster/Simulation/a/sweep_1{}\"", ext)];
            let parsed = parse_template(&input, &translator()).expect("parsed");
            assert_eq!(format!(".{}", parsed.extension), ext);
        }
    }

    #[test]
    fn missing_project_reference_is_a_configuration_error() {
        let input = lines(&["#!/bin/bash", r#"echo "not a project.txt""#, "run unquoted.fsp"]);
        let err = parse_template(&input, &translator()).expect_err("no project");
        assert!(err.is_config(), "{}", err);
    }

    #[test]
    fn two_project_references_are_a_configuration_error() {
        let input = lines(&[r#"run "a/sweep_1.fsp""#, r#"run "b/sweep_2.lms""#]);
        let err = parse_template(&input, &translator()).expect_err("ambiguous");
        assert!(err.is_config());
        assert!(err.to_string().contains("2 project files"), "{}", err);
    }

    #[test]
    fn unterminated_quote_is_not_a_reference() {
        let input = lines(&[r#"run "a/sweep_1.fsp"#]);
        assert!(parse_template(&input, &translator()).is_err());
    }

    #[test]
    fn project_name_parses_generation_particle_and_sweep() {
        let name = ProjectName::parse("optimizationg26_3sweep_7").expect("name");
        assert_eq!(name.stem, "optimizationg26");
        assert_eq!(name.series, "optimizationg26_");
        assert_eq!(name.generation, 26);
        assert_eq!(name.particle, 3);
        assert_eq!(name.sweep, Some(7));
        assert!(!name.is_lead());

        let lead = ProjectName::parse("bend_optimizationg4_1").expect("name");
        assert_eq!(lead.stem, "bend");
        assert_eq!(lead.series, "bend_optimizationg4_");
        assert_eq!(lead.sweep, None);
        assert!(lead.is_lead());

        let sweep = ProjectName::parse("sweep_1").expect("name");
        assert_eq!(sweep.generation, 0);
        assert_eq!(sweep.stem, "sweep");
        assert_eq!(sweep.series, "sweep_");
        assert!(sweep.is_lead());
        assert!(sweep.is_sweep_only());
    }

    #[test]
    fn project_name_rejects_malformed_input() {
        assert!(matches!(
            ProjectName::parse("optimizationgX_1"),
            Err(RelayError::MalformedName { .. })
        ));
        assert!(ProjectName::parse("device").is_err());
    }

    #[test]
    fn previous_generation_dir_only_touches_whole_indices() {
        let name = ProjectName::parse("optimizationg2_1").expect("name");
        assert_eq!(
            name.previous_generation_dir("/work/a/optimizationg26/bend_optimizationg2"),
            Some("/work/a/optimizationg26/bend_optimizationg1".to_string())
        );
        let first = ProjectName::parse("optimizationg1_1").expect("name");
        assert_eq!(first.previous_generation_dir("/work/a/optimizationg1"), None);
    }

    #[test]
    fn project_outside_the_shared_volume_is_rejected() {
        let cfg = JobConfig::from_yaml_str(include_str!("../tests/fixtures/relay.yaml"))
            .expect("config");
        for quoted in ["sweep_1.fsp", "D:/Other/run/sweep_1.fsp", "H:/Cluster/Sim/sweep_1.fsp"] {
            let input = vec![format!("run \"{}\"", quoted)];
            let err = JobDescriptor::from_template(&input, &cfg).expect_err(quoted);
            assert!(err.is_config(), "{}", err);
        }
    }

    #[test]
    fn empty_remote_prefix_is_rejected() {
        let text = include_str!("../tests/fixtures/relay.yaml")
            .replace("remote_prefix: /work/alice/Work", "remote_prefix: ''");
        let cfg = JobConfig::from_yaml_str(&text).expect("config");
        let input = lines(&[r#"run "H:/Cluster/Simulation/sweep_1.fsp""#]);
        let err = JobDescriptor::from_template(&input, &cfg).expect_err("empty");
        assert!(err.to_string().contains("empty remote directory"), "{}", err);
    }

    #[test]
    fn descriptor_derives_job_and_remote_directories() {
        let cfg_text = include_str!("../tests/fixtures/relay.yaml");
        let cfg = JobConfig::from_yaml_str(cfg_text).expect("config");
        let input = lines(&[r#"engine "H:/Cluster/Simulation/run/optimizationg3_1.fsp""#]);
        let job = JobDescriptor::from_template(&input, &cfg).expect("job");
        assert_eq!(job.job_dir, PathBuf::from("H:/Cluster/Simulation/run"));
        assert_eq!(job.remote_dir, "/work/alice/Work/run");
        assert_eq!(job.remote_path, "/work/alice/Work/run/optimizationg3_1.fsp");
        assert_eq!(
            job.progress_log(),
            PathBuf::from("H:/Cluster/Simulation/run").join("optimizationg3_1_p0.log")
        );
    }
}
