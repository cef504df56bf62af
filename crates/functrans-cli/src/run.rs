//! # `functrans run`
//!
//! Executes a script and prints one record per step.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, ValueEnum};

use crate::runner::ScriptRunner;
use crate::script::Script;

/// Output format for step records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One aligned line per step.
    #[default]
    Text,
    /// A single JSON document.
    Json,
}

/// Arguments for `functrans run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Script to execute (YAML, or JSON with a `.json` extension).
    pub script: PathBuf,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Execute the run subcommand. Exits 1 if a step failed.
pub fn run_script(args: &RunArgs) -> Result<u8> {
    let script = Script::load(&args.script)?;
    tracing::info!(script = %args.script.display(), steps = script.steps.len(), "running script");
    let report = ScriptRunner::execute(&script);

    match args.format {
        OutputFormat::Text => {
            for record in &report.records {
                println!("{record}");
            }
            if let Some(err) = &report.failure {
                println!("error: {err}");
            }
            println!("final depth: {}", report.final_depth);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report.to_json())?);
        }
    }

    Ok(u8::from(!report.succeeded()))
}
