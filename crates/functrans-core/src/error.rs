//! # Error Types: Structured Error Hierarchy
//!
//! Defines the error type shared by every functrans crate. All errors use
//! `thiserror` for derive-based `Display` and `Error` implementations.
//!
//! ## Design
//!
//! - Stack errors name the operation that hit the empty stack.
//! - Cast errors carry both the expected and the actual transform kind.
//! - Invariant violations describe the corrupted bookkeeping and are
//!   reported as fatal through [`TransformError::is_fatal`].
//!
//! Every operation in the core is an in-memory state transition, so none of
//! these errors is transient. There is nothing to retry.

use thiserror::Error;

use crate::level::Level;
use crate::transform::TransformKind;

/// Top-level error type for functrans.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// `pop`/`peek` (or an equivalent) on an empty layer stack.
    #[error("dynamic layer stack underflow: {operation} on an empty stack")]
    StackUnderflow {
        /// The operation that found the stack empty.
        operation: &'static str,
    },

    /// A transform-specific accessor was called on a layer of another kind.
    #[error("invalid cast: expected a {expected} interpreter, got {actual}")]
    InvalidCast {
        /// The kind the accessor requires.
        expected: TransformKind,
        /// The kind the layer actually has.
        actual: TransformKind,
    },

    /// An unwrap operation was applied to a tensor with no matching wrapper.
    #[error("{operation}: tensor is not a functorch wrapped tensor")]
    NotWrapped {
        /// The unwrap operation that was attempted.
        operation: &'static str,
    },

    /// No live layer exists at the requested level.
    #[error("no live dynamic layer at {level}")]
    LevelNotFound {
        /// The requested level.
        level: Level,
    },

    /// Batch dimension is out of range for the tensor's logical rank.
    #[error("batch dimension {bdim} is out of range for a tensor of rank {rank}")]
    InvalidBatchDim {
        /// The requested batch dimension.
        bdim: usize,
        /// The tensor's logical rank.
        rank: usize,
    },

    /// The size of the batch dimension does not match the vmap layer.
    #[error("batch dimension has size {actual} but the vmap layer expects {expected}")]
    BatchSizeMismatch {
        /// Batch size bound by the vmap layer.
        expected: usize,
        /// Size of the tensor along the batch dimension.
        actual: usize,
    },

    /// Levels start at 1.
    #[error("invalid level {0}: levels start at 1")]
    InvalidLevel(u64),

    /// Internal bookkeeping of the layer stack is corrupted.
    ///
    /// Level collisions and non-LIFO pops end up here. Callers must not
    /// swallow this error.
    #[error("dynamic layer stack invariant violated: {0}")]
    InvariantViolation(String),
}

impl TransformError {
    /// Whether the error indicates corrupted stack bookkeeping.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T, E = TransformError> = std::result::Result<T, E>;
