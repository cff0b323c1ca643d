use std::fmt;

use relay_core::RelayError;
use serde::Serialize;

/// Scheduler job identifier as printed by the submit command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_id_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Parses submission output into a job id.
///
/// Only the last non-empty line counts. `Submitted batch job 1234` yields the
/// fourth field; any other line with two or more fields yields the second;
/// a lone all-digit token is taken as the id itself.
pub fn parse_job_id(output: &str) -> Result<JobId, RelayError> {
    let malformed = || RelayError::MalformedJobId(output.to_string());
    let line = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .ok_or_else(malformed)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let token = match fields.as_slice() {
        ["Submitted", "batch", "job", id, ..] => *id,
        [only] if only.chars().all(|c| c.is_ascii_digit()) => *only,
        [_, second, ..] => *second,
        _ => return Err(malformed()),
    };
    if !is_id_token(token) {
        return Err(malformed());
    }
    Ok(JobId(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slurm_submission_line() {
        let id = parse_job_id("Submitted batch job 4412873\n").expect("id");
        assert_eq!(id.as_str(), "4412873");
    }

    #[test]
    fn last_non_empty_line_wins() {
        let out = "sbatch: notice: using default partition\r\nJob 99817 queued\r\n\r\n";
        assert_eq!(parse_job_id(out).expect("id").to_string(), "99817");
    }

    #[test]
    fn bare_numeric_id() {
        assert_eq!(parse_job_id("  7731\n").expect("id").as_str(), "7731");
    }

    #[test]
    fn empty_or_unusable_output_is_malformed() {
        for bad in ["", "\n\n", "error", "job \"quoted\""] {
            assert!(
                matches!(parse_job_id(bad), Err(RelayError::MalformedJobId(_))),
                "{:?}",
                bad
            );
        }
    }
}
