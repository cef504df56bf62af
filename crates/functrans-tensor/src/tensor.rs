//! # Wrapped Tensor Model
//!
//! A [`Tensor`] is either a plain tensor (identity plus shape) or a wrapper
//! around another tensor, tagged with the level of the transform that
//! wrapped it. Wrappers nest like onion skins: a tensor seen by
//! `vmap(grad(f))` is a batched wrapper around a grad-tracking wrapper
//! around the caller's plain tensor.
//!
//! Storage is out of scope. Plain tensors carry only an identity and a
//! logical shape, which is what the layer stack needs to validate batch
//! dimensions.
//!
//! ## Invariant
//!
//! Every wrapper keeps the [`LifeHandle`] of the layer that created it, so
//! it can tell on demand whether that layer has been popped. Nothing is
//! invalidated eagerly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use functrans_core::{Level, LifeHandle, TransformError};
use serde::{Deserialize, Serialize};

use crate::wrapped::dump_tensor;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a plain tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TensorId(u64);

impl TensorId {
    fn fresh() -> Self {
        Self(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identifier.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tensor#{}", self.0)
    }
}

/// The kind of wrap a transform applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum WrapperKind {
    /// Vmap wrapper. `bdim` indexes the inner tensor's logical shape.
    Batched {
        /// Batch dimension of the wrapped value.
        bdim: usize,
    },
    /// Grad or jvp wrapper.
    GradTracking,
    /// Functionalize wrapper.
    Functional,
}

impl std::fmt::Display for WrapperKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batched { .. } => f.write_str("Batched"),
            Self::GradTracking => f.write_str("GradTracking"),
            Self::Functional => f.write_str("Functional"),
        }
    }
}

/// One wrap layer around a tensor.
#[derive(Debug, Clone)]
pub struct Wrapper {
    kind: WrapperKind,
    value: Tensor,
    level: Level,
    life: LifeHandle,
}

impl Wrapper {
    /// The kind of wrap.
    pub fn kind(&self) -> WrapperKind {
        self.kind
    }

    /// The tensor one layer down.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Level of the transform that created this wrap.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Liveness handle of the creating layer.
    pub fn life(&self) -> &LifeHandle {
        &self.life
    }

    /// Whether the creating layer is still on its stack.
    pub fn is_alive(&self) -> bool {
        self.life.is_alive()
    }

    /// Batch dimension, for batched wrappers.
    pub fn bdim(&self) -> Option<usize> {
        match self.kind {
            WrapperKind::Batched { bdim } => Some(bdim),
            _ => None,
        }
    }
}

enum Node {
    Plain { id: TensorId, shape: Vec<usize> },
    Wrapped(Wrapper),
}

/// Cheap-clone tensor handle with identity equality.
///
/// Two `Tensor`s compare equal when they are the same node, the way two
/// Python references to one tensor object are.
#[derive(Clone)]
pub struct Tensor(Arc<Node>);

impl Tensor {
    /// A fresh plain tensor of the given shape.
    pub fn new(shape: &[usize]) -> Self {
        Self(Arc::new(Node::Plain {
            id: TensorId::fresh(),
            shape: shape.to_vec(),
        }))
    }

    /// A fresh 0-dimensional plain tensor.
    pub fn scalar() -> Self {
        Self::new(&[])
    }

    /// Wrap `value` in a batched wrapper at `level`.
    ///
    /// # Errors
    ///
    /// `InvalidBatchDim` if `bdim` is not a dimension of `value`'s logical
    /// shape.
    pub fn batched(
        value: Tensor,
        bdim: usize,
        level: Level,
        life: LifeHandle,
    ) -> Result<Self, TransformError> {
        let rank = value.dim();
        if bdim >= rank {
            return Err(TransformError::InvalidBatchDim { bdim, rank });
        }
        Ok(Self::wrap(value, WrapperKind::Batched { bdim }, level, life))
    }

    /// Wrap `value` in a grad-tracking wrapper at `level`.
    pub fn grad_tracking(value: Tensor, level: Level, life: LifeHandle) -> Self {
        Self::wrap(value, WrapperKind::GradTracking, level, life)
    }

    /// Wrap `value` in a functional wrapper at `level`.
    pub fn functional(value: Tensor, level: Level, life: LifeHandle) -> Self {
        Self::wrap(value, WrapperKind::Functional, level, life)
    }

    fn wrap(value: Tensor, kind: WrapperKind, level: Level, life: LifeHandle) -> Self {
        tracing::trace!(%kind, level = level.get(), "wrapping tensor");
        Self(Arc::new(Node::Wrapped(Wrapper {
            kind,
            value,
            level,
            life,
        })))
    }

    /// The outermost wrap layer, if any.
    pub fn wrapper(&self) -> Option<&Wrapper> {
        match &*self.0 {
            Node::Wrapped(w) => Some(w),
            Node::Plain { .. } => None,
        }
    }

    /// Whether this tensor carries at least one wrap layer.
    pub fn is_wrapped(&self) -> bool {
        self.wrapper().is_some()
    }

    /// Identity of the innermost plain tensor.
    pub fn id(&self) -> TensorId {
        let mut current = self;
        loop {
            match &*current.0 {
                Node::Plain { id, .. } => return *id,
                Node::Wrapped(w) => current = &w.value,
            }
        }
    }

    /// The shape the current transform sees.
    ///
    /// A batched wrapper hides its batch dimension; other wrappers are
    /// shape-transparent.
    pub fn shape(&self) -> Vec<usize> {
        match &*self.0 {
            Node::Plain { shape, .. } => shape.clone(),
            Node::Wrapped(w) => {
                let mut shape = w.value.shape();
                if let WrapperKind::Batched { bdim } = w.kind {
                    shape.remove(bdim);
                }
                shape
            }
        }
    }

    /// Logical rank.
    pub fn dim(&self) -> usize {
        self.shape().len()
    }

    /// Number of wrap layers.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(w) = current.wrapper() {
            depth += 1;
            current = &w.value;
        }
        depth
    }

    /// The innermost plain tensor.
    pub fn base(&self) -> Tensor {
        let mut current = self;
        while let Some(w) = current.wrapper() {
            current = &w.value;
        }
        current.clone()
    }

    /// Whether both handles refer to the same tensor node.
    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Tensor {}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&dump_tensor(self))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
