//! # Transform Kinds: Single Source of Truth
//!
//! Defines [`TransformKind`], the one enum naming every composable
//! transform, and [`RandomnessType`], the randomness policy a vmap layer
//! carries. Every `match` on `TransformKind` is exhaustive: adding a
//! transform forces every consumer to handle it.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The kind of transform an interpreter implements.
///
/// `Torch` is the base case: no transform is active and operations run
/// on plain tensors. It names the bottom of dispatch and is never pushed
/// as a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// No active transform.
    Torch,
    /// Vectorizing map: operations see one batch element at a time.
    Vmap,
    /// Reverse-mode differentiation.
    Grad,
    /// Forward-mode differentiation (Jacobian-vector product).
    Jvp,
    /// Mutation removal: in-place operations become out-of-place.
    Functionalize,
}

impl TransformKind {
    /// All transform kinds, `Torch` first.
    pub fn all() -> &'static [TransformKind] {
        &[
            Self::Torch,
            Self::Vmap,
            Self::Grad,
            Self::Jvp,
            Self::Functionalize,
        ]
    }

    /// The lowercase name (`"vmap"`, `"grad"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Torch => "torch",
            Self::Vmap => "vmap",
            Self::Grad => "grad",
            Self::Jvp => "jvp",
            Self::Functionalize => "functionalize",
        }
    }
}

impl std::fmt::Display for TransformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "torch" => Ok(Self::Torch),
            "vmap" => Ok(Self::Vmap),
            "grad" => Ok(Self::Grad),
            "jvp" => Ok(Self::Jvp),
            "functionalize" => Ok(Self::Functionalize),
            other => Err(format!("unknown transform kind: {other:?}")),
        }
    }
}

/// How random operations behave under vmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomnessType {
    /// Random operations inside vmap are an error.
    #[default]
    Error,
    /// Every batch element draws the same randomness.
    Same,
    /// Every batch element draws independent randomness.
    Different,
}

impl RandomnessType {
    /// The lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Same => "same",
            Self::Different => "different",
        }
    }
}

impl std::fmt::Display for RandomnessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RandomnessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Self::Error),
            "same" => Ok(Self::Same),
            "different" => Ok(Self::Different),
            other => Err(format!("unknown randomness type: {other:?}")),
        }
    }
}
