//! One-time authentication codes.
//!
//! A code source may keep returning the same value until its time step rolls
//! over. The ledger remembers the last code it handed out and keeps asking
//! until it sees a different one, so no two consecutive logins in a run reuse
//! a code.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use relay_core::sleep_cancellable;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, PartialEq, Eq)]
pub struct OneTimeCode(String);

impl OneTimeCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OneTimeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OneTimeCode(***)")
    }
}

pub trait CodeSource {
    fn fetch(&mut self) -> Result<OneTimeCode>;
}

/// Runs an external generator and takes its trimmed stdout as the code.
#[derive(Debug, Clone)]
pub struct CommandCodeSource {
    program: PathBuf,
}

impl CommandCodeSource {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CodeSource for CommandCodeSource {
    fn fetch(&mut self) -> Result<OneTimeCode> {
        let output = Command::new(&self.program)
            .output()
            .with_context(|| format!("running code generator {}", self.program.display()))?;
        if !output.status.success() {
            return Err(anyhow!(
                "code generator {} exited with {}",
                self.program.display(),
                output.status
            ));
        }
        let code = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(OneTimeCode(code))
    }
}

#[derive(Debug, Default)]
pub struct CodeLedger {
    last: Option<OneTimeCode>,
}

impl CodeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches until the source yields a non-empty code different from the
    /// previous one, sleeping `retry` between attempts.
    pub fn next_fresh(
        &mut self,
        source: &mut dyn CodeSource,
        retry: Duration,
        cancel: &CancellationToken,
    ) -> Result<OneTimeCode> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match source.fetch() {
                Ok(code) if code.as_str().is_empty() => {
                    debug!(attempts, "code generator returned nothing");
                }
                Ok(code) if self.last.as_ref() == Some(&code) => {
                    debug!(attempts, "code unchanged since last login");
                }
                Ok(code) => {
                    self.last = Some(code.clone());
                    return Ok(code);
                }
                Err(err) => warn!(attempts, error = %err, "code generator failed"),
            }
            sleep_cancellable(retry, cancel, "waiting for a fresh one-time code")?;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out scripted codes, repeating the last one when exhausted.
    pub(crate) struct ScriptedCodes {
        pub codes: VecDeque<&'static str>,
        pub calls: usize,
    }

    impl ScriptedCodes {
        pub(crate) fn new(codes: &[&'static str]) -> Self {
            Self {
                codes: codes.iter().copied().collect(),
                calls: 0,
            }
        }
    }

    impl CodeSource for ScriptedCodes {
        fn fetch(&mut self) -> Result<OneTimeCode> {
            self.calls += 1;
            let code = if self.codes.len() > 1 {
                self.codes.pop_front()
            } else {
                self.codes.front().copied()
            };
            code.map(OneTimeCode::new)
                .ok_or_else(|| anyhow!("no codes scripted"))
        }
    }

    #[test]
    fn consecutive_codes_are_never_reused() {
        let mut source = ScriptedCodes::new(&["111111", "111111", "111111", "222222"]);
        let mut ledger = CodeLedger::new();
        let cancel = CancellationToken::new();
        let first = ledger
            .next_fresh(&mut source, Duration::ZERO, &cancel)
            .expect("first");
        let second = ledger
            .next_fresh(&mut source, Duration::ZERO, &cancel)
            .expect("second");
        assert_eq!(first.as_str(), "111111");
        assert_eq!(second.as_str(), "222222");
        assert_eq!(source.calls, 4);
    }

    #[test]
    fn empty_codes_and_errors_are_retried() {
        let mut source = ScriptedCodes::new(&["", "", "424242"]);
        let mut ledger = CodeLedger::new();
        let code = ledger
            .next_fresh(&mut source, Duration::ZERO, &CancellationToken::new())
            .expect("code");
        assert_eq!(code.as_str(), "424242");
    }

    #[test]
    fn cancellation_stops_a_stuck_source() {
        let mut source = ScriptedCodes::new(&["999999"]);
        let mut ledger = CodeLedger::new();
        let cancel = CancellationToken::new();
        ledger
            .next_fresh(&mut source, Duration::ZERO, &cancel)
            .expect("first");
        cancel.cancel();
        let err = ledger
            .next_fresh(&mut source, Duration::from_millis(5), &cancel)
            .expect_err("cancelled");
        assert!(err.to_string().contains("cancelled"), "{}", err);
    }

    #[test]
    fn debug_output_hides_the_code() {
        assert_eq!(format!("{:?}", OneTimeCode::new("123456")), "OneTimeCode(***)");
    }
}
