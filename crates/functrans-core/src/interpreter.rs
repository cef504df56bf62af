//! # Interpreter Identity
//!
//! An [`Interpreter`] is the immutable identity of one transform
//! invocation: its kind and its nesting level. It is created when a
//! dynamic layer is pushed and is attached (through its level) to every
//! tensor that layer wraps.
//!
//! Interpreters are plain `Copy` values. Transform-specific state (batch
//! size, captured grad mode) lives on the dynamic layer that owns the
//! interpreter, not here.

use serde::{Deserialize, Serialize};

use crate::level::Level;
use crate::transform::TransformKind;

/// Identity of an active transform invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interpreter {
    key: TransformKind,
    level: Level,
}

impl Interpreter {
    /// Create an interpreter identity.
    pub fn new(key: TransformKind, level: Level) -> Self {
        Self { key, level }
    }

    /// The transform kind.
    pub fn key(&self) -> TransformKind {
        self.key
    }

    /// The nesting level.
    pub fn level(&self) -> Level {
        self.level
    }
}

impl std::fmt::Display for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.key, self.level.get())
    }
}
