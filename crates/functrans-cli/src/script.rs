//! # Transform Scripts
//!
//! A script is a starting ambient state plus a list of steps, each one a
//! layer-stack or tensor operation. Scripts are YAML by default, or JSON
//! when the file ends in `.json`.
//!
//! ```yaml
//! ambient:
//!   grad_enabled: false
//! steps:
//!   - op: push
//!     transform: grad
//!   - op: tensor
//!     name: x
//!     shape: [3]
//!   - op: lift
//!     tensor: x
//!     as: gx
//!   - op: pop
//!   - op: unwrap_if_dead
//!     tensor: gx
//!     as: y
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use functrans_core::{Level, TransformError};
use functrans_layers::{AmbientState, LayerSpec};

/// A parsed script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    /// Ambient state of the fresh stack the script runs against.
    #[serde(default)]
    pub ambient: AmbientState,
    /// Steps, run in order.
    pub steps: Vec<Step>,
}

/// One script step.
///
/// Steps that produce a tensor bind it under the `as` name; steps that
/// consume one look it up by the `tensor` name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Step {
    /// Push a layer.
    Push(LayerSpec),
    /// Pop the top layer.
    Pop,
    /// Pop until `depth` layers remain.
    PopToDepth { depth: usize },
    /// Report the top interpreter.
    Peek,
    /// Create a plain tensor.
    Tensor { name: String, shape: Vec<usize> },
    /// Grad-wrap a tensor for the layer at `level`.
    WrapForGrad {
        tensor: String,
        #[serde(rename = "as")]
        bind: String,
        level: Level,
    },
    /// Functional-wrap a tensor for the layer at `level`.
    WrapFunctional {
        tensor: String,
        #[serde(rename = "as")]
        bind: String,
        level: Level,
    },
    /// Batch a tensor along `bdim` for the layer at `level`.
    AddBatchDim {
        tensor: String,
        #[serde(rename = "as")]
        bind: String,
        level: Level,
        #[serde(default)]
        bdim: usize,
    },
    /// Lift a tensor into the top layer, which must be grad or jvp.
    Lift {
        tensor: String,
        #[serde(rename = "as")]
        bind: String,
    },
    /// Strip a grad wrapper at exactly `level`.
    UnwrapForGrad {
        tensor: String,
        #[serde(rename = "as")]
        bind: String,
        level: Level,
    },
    /// Peel dead wrappers.
    UnwrapIfDead {
        tensor: String,
        #[serde(rename = "as")]
        bind: String,
    },
    /// Strip one wrapper of any kind.
    GetUnwrapped {
        tensor: String,
        #[serde(rename = "as")]
        bind: String,
    },
    /// Describe a tensor's wrap chain.
    Inspect { tensor: String },
    /// Set the ambient grad mode.
    SetGradEnabled { enabled: bool },
    /// Include or exclude the dynamic-layer dispatch keys.
    SetKeysIncluded { included: bool },
}

impl Step {
    /// The `op` tag of this step.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Push(_) => "push",
            Self::Pop => "pop",
            Self::PopToDepth { .. } => "pop_to_depth",
            Self::Peek => "peek",
            Self::Tensor { .. } => "tensor",
            Self::WrapForGrad { .. } => "wrap_for_grad",
            Self::WrapFunctional { .. } => "wrap_functional",
            Self::AddBatchDim { .. } => "add_batch_dim",
            Self::Lift { .. } => "lift",
            Self::UnwrapForGrad { .. } => "unwrap_for_grad",
            Self::UnwrapIfDead { .. } => "unwrap_if_dead",
            Self::GetUnwrapped { .. } => "get_unwrapped",
            Self::Inspect { .. } => "inspect",
            Self::SetGradEnabled { .. } => "set_grad_enabled",
            Self::SetKeysIncluded { .. } => "set_keys_included",
        }
    }
}

impl Script {
    /// Parse a YAML script.
    pub fn from_yaml_str(source: &str) -> Result<Self, ScriptError> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Parse a JSON script.
    pub fn from_json_str(source: &str) -> Result<Self, ScriptError> {
        Ok(serde_json::from_str(source)?)
    }

    /// Read and parse a script file, choosing the format by extension.
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let source = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&source)
        } else {
            Self::from_yaml_str(&source)
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

/// Script-level failures.
#[derive(Error, Debug)]
pub enum ScriptError {
    /// The script file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML script: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON script: {0}")]
    Json(#[from] serde_json::Error),

    /// A step named a tensor no earlier step bound.
    #[error("step {step} ({op}): unknown tensor `{name}`")]
    UnknownTensor {
        step: usize,
        op: &'static str,
        name: String,
    },

    /// A step's stack or tensor operation failed.
    #[error("step {step} ({op}): {source}")]
    Transform {
        step: usize,
        op: &'static str,
        #[source]
        source: TransformError,
    },

    /// The script finished with layers still pushed.
    #[error("{depth} layer(s) left on the stack at end of script")]
    Leaked { depth: usize },
}
