//! # Script Runner
//!
//! Executes a [`Script`] against a fresh [`LayerStack`] and records one
//! [`StepRecord`] per step. Execution stops at the first failing step.

use std::collections::BTreeMap;

use serde::Serialize;

use functrans_core::{TransformError, TransformKind};
use functrans_layers::{AmbientState, GradInterpreterPtr, JvpInterpreterPtr, LayerStack};
use functrans_tensor::{
    dump_tensor, get_unwrapped, maybe_get_bdim, maybe_get_level, unwrap_for_grad,
    unwrap_if_dead, Tensor,
};

use crate::script::{Script, ScriptError, Step};

/// Outcome of one successful step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    /// Zero-based step index.
    pub index: usize,
    /// The step's `op` tag.
    pub op: &'static str,
    /// Stack depth after the step.
    pub depth: usize,
    /// Human-readable result.
    pub detail: String,
}

impl std::fmt::Display for StepRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:>3}  {:<17} depth={}  {}",
            self.index, self.op, self.depth, self.detail
        )
    }
}

/// Everything a script run produced.
#[derive(Debug)]
pub struct Report {
    /// Records of the steps that succeeded, in order.
    pub records: Vec<StepRecord>,
    /// The step failure that stopped execution, if any.
    pub failure: Option<ScriptError>,
    /// Stack depth when execution stopped.
    pub final_depth: usize,
    /// Ambient state when execution stopped.
    pub ambient: AmbientState,
}

impl Report {
    /// Whether every step succeeded.
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// JSON form for `--format json`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "records": self.records,
            "error": self.failure.as_ref().map(ToString::to_string),
            "final_depth": self.final_depth,
            "ambient": self.ambient,
        })
    }
}

/// Stack plus the named tensors a script has bound so far.
#[derive(Debug, Default)]
pub struct ScriptRunner {
    stack: LayerStack,
    tensors: BTreeMap<String, Tensor>,
}

impl ScriptRunner {
    /// A runner over a fresh stack with the given ambient state.
    pub fn new(ambient: AmbientState) -> Self {
        Self {
            stack: LayerStack::with_ambient(ambient),
            tensors: BTreeMap::new(),
        }
    }

    /// The runner's stack.
    pub fn stack(&self) -> &LayerStack {
        &self.stack
    }

    /// A tensor bound by an earlier step.
    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Run `script` to completion or to its first failing step.
    pub fn execute(script: &Script) -> Report {
        let mut runner = Self::new(script.ambient);
        let mut records = Vec::with_capacity(script.steps.len());
        let mut failure = None;
        for (index, step) in script.steps.iter().enumerate() {
            match runner.step(index, step) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(step = index, op = step.op(), error = %err, "script step failed");
                    failure = Some(err);
                    break;
                }
            }
        }
        Report {
            records,
            failure,
            final_depth: runner.stack.depth(),
            ambient: runner.stack.ambient(),
        }
    }

    /// Run one step.
    pub fn step(&mut self, index: usize, step: &Step) -> Result<StepRecord, ScriptError> {
        let op = step.op();
        let transform = move |source: TransformError| ScriptError::Transform {
            step: index,
            op,
            source,
        };
        tracing::debug!(step = index, op, "running script step");

        let detail = match step {
            Step::Push(spec) => {
                self.stack.push(*spec).map_err(transform)?;
                let top = self.stack.top().map_err(transform)?;
                format!("pushed {top}")
            }
            Step::Pop => {
                let layer = self.stack.pop().map_err(transform)?;
                format!("popped {layer}")
            }
            Step::PopToDepth { depth } => {
                let popped = self.stack.pop_to_depth(*depth).map_err(transform)?;
                format!("popped {} layer(s)", popped.len())
            }
            Step::Peek => self.stack.peek().map_err(transform)?.to_string(),
            Step::Tensor { name, shape } => self.bind(name, Tensor::new(shape)),
            Step::WrapForGrad {
                tensor,
                bind,
                level,
            } => {
                let input = self.lookup(index, op, tensor)?;
                let out = self.stack.wrap_for_grad(&input, *level).map_err(transform)?;
                self.bind(bind, out)
            }
            Step::WrapFunctional {
                tensor,
                bind,
                level,
            } => {
                let input = self.lookup(index, op, tensor)?;
                let out = self
                    .stack
                    .wrap_functional_tensor(&input, *level)
                    .map_err(transform)?;
                self.bind(bind, out)
            }
            Step::AddBatchDim {
                tensor,
                bind,
                level,
                bdim,
            } => {
                let input = self.lookup(index, op, tensor)?;
                let out = self
                    .stack
                    .add_batch_dim(&input, *bdim, *level)
                    .map_err(transform)?;
                self.bind(bind, out)
            }
            Step::Lift { tensor, bind } => {
                let input = self.lookup(index, op, tensor)?;
                let out = self.lift(&input).map_err(transform)?;
                self.bind(bind, out)
            }
            Step::UnwrapForGrad {
                tensor,
                bind,
                level,
            } => {
                let input = self.lookup(index, op, tensor)?;
                self.bind(bind, unwrap_for_grad(&input, *level))
            }
            Step::UnwrapIfDead { tensor, bind } => {
                let input = self.lookup(index, op, tensor)?;
                self.bind(bind, unwrap_if_dead(&input))
            }
            Step::GetUnwrapped { tensor, bind } => {
                let input = self.lookup(index, op, tensor)?;
                let out = get_unwrapped(&input).map_err(transform)?;
                self.bind(bind, out)
            }
            Step::Inspect { tensor } => {
                let input = self.lookup(index, op, tensor)?;
                let level = maybe_get_level(&input).map_or_else(|| "-".to_owned(), |l| l.get().to_string());
                let bdim = maybe_get_bdim(&input).map_or_else(|| "-".to_owned(), |d| d.to_string());
                format!(
                    "{tensor}: {} (level={level}, bdim={bdim}, shape={:?})",
                    dump_tensor(&input),
                    input.shape()
                )
            }
            Step::SetGradEnabled { enabled } => {
                self.stack.set_grad_enabled(*enabled);
                format!("grad_enabled = {enabled}")
            }
            Step::SetKeysIncluded { included } => {
                self.stack.set_dynamic_layer_keys_included(*included);
                format!("dynamic_layer_keys_included = {included}")
            }
        };

        Ok(StepRecord {
            index,
            op,
            depth: self.stack.depth(),
            detail,
        })
    }

    /// Lift into the top layer through its grad or jvp view.
    fn lift(&self, tensor: &Tensor) -> Result<Tensor, TransformError> {
        let top = self.stack.top()?;
        match top.key() {
            TransformKind::Jvp => JvpInterpreterPtr::try_from(top)?.lift(tensor),
            _ => GradInterpreterPtr::try_from(top)?.lift(tensor),
        }
    }

    fn lookup(&self, step: usize, op: &'static str, name: &str) -> Result<Tensor, ScriptError> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::UnknownTensor {
                step,
                op,
                name: name.to_owned(),
            })
    }

    fn bind(&mut self, name: &str, tensor: Tensor) -> String {
        let detail = format!("{name} = {}", dump_tensor(&tensor));
        self.tensors.insert(name.to_owned(), tensor);
        detail
    }
}
