//! # Wrapped-Tensor Predicates and Unwrap Operations
//!
//! Pure queries and transitions over a tensor's wrap chain. None of these
//! needs the layer stack: liveness is read from each wrapper's
//! [`LifeHandle`](functrans_core::LifeHandle), and level comparisons only
//! involve the level recorded on the wrapper.
//!
//! Predicates look at the outermost wrap only. A batched tensor that
//! wraps a grad-tracking tensor is batched, not grad-tracking, until it is
//! unwrapped one level.
//!
//! Wrapping into a transform needs the live layer at the target level and
//! lives on the layer stack (`functrans-layers`).

use functrans_core::{Level, TransformError};

use crate::tensor::{Tensor, WrapperKind};

// ─── Predicates ──────────────────────────────────────────────────────

/// Whether the outermost wrap is a vmap wrapper.
pub fn is_batched_tensor(tensor: &Tensor) -> bool {
    matches!(
        tensor.wrapper().map(|w| w.kind()),
        Some(WrapperKind::Batched { .. })
    )
}

/// Whether the outermost wrap is a grad/jvp wrapper.
pub fn is_gradtracking_tensor(tensor: &Tensor) -> bool {
    matches!(
        tensor.wrapper().map(|w| w.kind()),
        Some(WrapperKind::GradTracking)
    )
}

/// Whether the outermost wrap is a functionalize wrapper.
pub fn is_functional_tensor(tensor: &Tensor) -> bool {
    matches!(
        tensor.wrapper().map(|w| w.kind()),
        Some(WrapperKind::Functional)
    )
}

/// Whether any of the specific predicates holds.
pub fn is_functorch_wrapped_tensor(tensor: &Tensor) -> bool {
    is_batched_tensor(tensor) || is_gradtracking_tensor(tensor) || is_functional_tensor(tensor)
}

/// Batch dimension of a batched tensor; `None` for anything else.
pub fn maybe_get_bdim(tensor: &Tensor) -> Option<usize> {
    tensor.wrapper().and_then(|w| w.bdim())
}

/// Level of the outermost wrap; `None` for a plain tensor.
pub fn maybe_get_level(tensor: &Tensor) -> Option<Level> {
    tensor.wrapper().map(|w| w.level())
}

// ─── Unwrapping ──────────────────────────────────────────────────────

/// The tensor one wrap layer down.
///
/// # Errors
///
/// `NotWrapped` when `tensor` is plain.
pub fn get_unwrapped(tensor: &Tensor) -> Result<Tensor, TransformError> {
    tensor
        .wrapper()
        .map(|w| w.value().clone())
        .ok_or(TransformError::NotWrapped {
            operation: "get_unwrapped",
        })
}

/// Strip wrap layers whose transform has already returned.
///
/// Peels from the outside while the outermost wrapper is dead and stops at
/// the first live wrapper or at the plain tensor. Inner wrappers belong to
/// outer transforms, which may well still be running, so a live inner wrap
/// is kept. The result never starts with a dead wrapper, which makes the
/// operation idempotent.
pub fn unwrap_if_dead(tensor: &Tensor) -> Tensor {
    let mut current = tensor;
    while let Some(w) = current.wrapper() {
        if w.is_alive() {
            break;
        }
        current = w.value();
    }
    current.clone()
}

/// [`unwrap_if_dead`] over a list of inputs.
pub fn unwrap_dead_wrappers(tensors: &[Tensor]) -> Vec<Tensor> {
    tensors.iter().map(unwrap_if_dead).collect()
}

/// Remove a grad-tracking wrap created at exactly `level`.
///
/// Any other tensor, including one grad-wrapped at a different level, is
/// returned unchanged: nested transforms routinely see tensors that belong
/// to another level.
pub fn unwrap_for_grad(tensor: &Tensor, level: Level) -> Tensor {
    match tensor.wrapper() {
        Some(w) if w.kind() == WrapperKind::GradTracking && w.level() == level => w.value().clone(),
        _ => tensor.clone(),
    }
}

/// Remove the outermost functional wrap.
///
/// # Errors
///
/// `NotWrapped` unless the outermost wrap is a functional wrapper.
pub fn unwrap_functional_tensor(tensor: &Tensor) -> Result<Tensor, TransformError> {
    match tensor.wrapper() {
        Some(w) if w.kind() == WrapperKind::Functional => Ok(w.value().clone()),
        _ => Err(TransformError::NotWrapped {
            operation: "unwrap_functional_tensor",
        }),
    }
}

/// Remove a batched wrap created at exactly `level`.
///
/// Returns the inner tensor and its batch dimension, or the tensor itself
/// and `None` when it is not batched at `level`; the caller then treats it
/// as unbatched for that vmap.
pub fn remove_batch_dim(tensor: &Tensor, level: Level) -> (Tensor, Option<usize>) {
    match tensor.wrapper() {
        Some(w) if w.level() == level => match w.bdim() {
            Some(bdim) => (w.value().clone(), Some(bdim)),
            None => (tensor.clone(), None),
        },
        _ => (tensor.clone(), None),
    }
}

// ─── Debugging ───────────────────────────────────────────────────────

/// One-line description of the wrap chain, outermost first.
///
/// `Batched[lvl=2, bdim=0, alive] -> GradTracking[lvl=1, dead] -> Tensor#7[3, 4]`
pub fn dump_tensor(tensor: &Tensor) -> String {
    let mut parts = Vec::with_capacity(tensor.depth() + 1);
    let mut current = tensor;
    while let Some(w) = current.wrapper() {
        let state = if w.is_alive() { "alive" } else { "dead" };
        let part = match w.bdim() {
            Some(bdim) => format!("{}[lvl={}, bdim={bdim}, {state}]", w.kind(), w.level().get()),
            None => format!("{}[lvl={}, {state}]", w.kind(), w.level().get()),
        };
        parts.push(part);
        current = w.value();
    }
    parts.push(format!("{}{:?}", current.id(), current.shape()));
    parts.join(" -> ")
}

// ─── Tests ───────────────────────────────────────────────────────────
