//! # Layer Liveness
//!
//! A [`LifeHandle`] is the shared flag that tells a wrapped tensor whether
//! the layer that wrapped it is still on the stack. The layer keeps one
//! clone; every wrapper created at that layer's level keeps another.
//! Popping the layer kills the flag, and each wrapper observes that lazily
//! the next time it is inspected.
//!
//! ## Invariant
//!
//! A handle starts alive and can only go from alive to dead. Level values
//! are reused after a pop, so two handles at the same level are told apart
//! by identity ([`LifeHandle::ptr_eq`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared liveness flag of one dynamic layer.
#[derive(Clone)]
pub struct LifeHandle(Arc<AtomicBool>);

impl LifeHandle {
    /// A fresh, live handle.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Whether the owning layer is still live.
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Mark the owning layer as popped. Irreversible.
    pub fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether both handles belong to the same layer.
    pub fn ptr_eq(&self, other: &LifeHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for LifeHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_alive() { "alive" } else { "dead" })
    }
}
