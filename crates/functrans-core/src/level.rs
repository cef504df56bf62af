//! # Nesting Levels
//!
//! A [`Level`] identifies the nesting position of a transform invocation.
//! Level 1 is the outermost transform; every push assigns `depth + 1`.
//!
//! ## Invariant
//!
//! Levels on a live stack are strictly increasing from bottom to top. A
//! level value is unique while its layer is live, but the same value is
//! handed out again once that layer has been popped. Code that needs to
//! know whether a particular layer is still live must use its
//! [`LifeHandle`](crate::LifeHandle), never the level value alone.

use serde::{Deserialize, Serialize};

use crate::error::TransformError;

/// Nesting level of a transform. Always `>= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Level(u64);

impl Level {
    /// The level assigned to the outermost transform.
    pub const FIRST: Level = Level(1);

    /// Build a level, rejecting 0.
    pub fn new(value: u64) -> Result<Self, TransformError> {
        if value == 0 {
            return Err(TransformError::InvalidLevel(value));
        }
        Ok(Self(value))
    }

    /// The level a push onto a stack of `depth` layers receives.
    pub fn for_depth(depth: usize) -> Self {
        Self(depth as u64 + 1)
    }

    /// The raw level value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// The level directly above this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Stack depth at which this level sits on top.
    pub fn depth(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u64> for Level {
    type Error = TransformError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Level> for u64 {
    fn from(level: Level) -> Self {
        level.0
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "level {}", self.0)
    }
}
