//! # functrans-cli: Scripted Layer Stack Driver
//!
//! Provides the `functrans` command-line interface for exercising the
//! dynamic layer stack without a tensor library attached.
//!
//! ## Subcommands
//!
//! - `functrans run <script> [--format text|json]`: execute a script and
//!   print one record per step.
//! - `functrans check <script>`: execute a script and fail on any step
//!   error or on layers left on the stack.
//!
//! ```bash
//! functrans run scripts/vmap_of_grad.yaml
//! RUST_LOG=functrans_layers=debug functrans check scripts/leak.json
//! ```
//!
//! ## Crate Policy
//!
//! - Argument parsing lives in `main.rs`; handlers return an exit code.
//! - Stack semantics come from `functrans-layers`; nothing is reimplemented
//!   here.

pub mod check;
pub mod run;
pub mod runner;
pub mod script;

pub use runner::{Report, ScriptRunner, StepRecord};
pub use script::{Script, ScriptError, Step};
