//! # functrans-core: Foundational Types for functrans
//!
//! This crate is the leaf of the functrans workspace. It defines the
//! identities every other crate agrees on when composing tensor transforms
//! (vmap, grad, jvp, functionalize) through a stack of dynamic layers.
//!
//! ## Key Design Principles
//!
//! 1. **One `TransformKind` enum.** Exhaustive `match` everywhere. `Torch`
//!    is the "no transform" base case and is never pushed.
//!
//! 2. **`Level` newtype.** Levels start at 1 and are validated at
//!    construction. No bare integers for nesting positions.
//!
//! 3. **`Interpreter` is identity only.** Kind plus level, `Copy`,
//!    immutable. Transform-specific state lives on the dynamic layer.
//!
//! 4. **Liveness by handle, not by level.** Levels are reused after a pop;
//!    `LifeHandle` is how a wrapped tensor learns its layer is gone.
//!
//! ## Crate Policy
//!
//! - No dependencies on other `functrans-*` crates.
//! - No `unsafe` code.
//! - No `panic!()` or `.unwrap()` outside tests.

pub mod error;
pub mod interpreter;
pub mod level;
pub mod life;
pub mod transform;

// Re-export primary types for ergonomic imports.
pub use error::{Result, TransformError};
pub use interpreter::Interpreter;
pub use level::Level;
pub use life::LifeHandle;
pub use transform::{RandomnessType, TransformKind};
