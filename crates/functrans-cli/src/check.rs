//! # `functrans check`
//!
//! Executes a script and fails if any step errors or layers are left on
//! the stack at the end.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::runner::{Report, ScriptRunner};
use crate::script::{Script, ScriptError};

/// Arguments for `functrans check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Script to check.
    pub script: PathBuf,
}

/// Problems found by [`check`].
pub fn check(report: &Report) -> Vec<String> {
    let mut problems = Vec::new();
    if let Some(err) = &report.failure {
        problems.push(err.to_string());
    }
    if report.final_depth > 0 {
        problems.push(
            ScriptError::Leaked {
                depth: report.final_depth,
            }
            .to_string(),
        );
    }
    problems
}

/// Execute the check subcommand.
pub fn run_check(args: &CheckArgs) -> Result<u8> {
    let script = Script::load(&args.script)?;
    let report = ScriptRunner::execute(&script);
    let problems = check(&report);

    if problems.is_empty() {
        println!(
            "OK: {} ({} steps)",
            args.script.display(),
            report.records.len()
        );
        return Ok(0);
    }
    for problem in &problems {
        tracing::error!(script = %args.script.display(), "{problem}");
        println!("FAIL: {problem}");
    }
    Ok(1)
}
