//! # Dynamic Layers
//!
//! A [`DynamicLayer`] is one frame of the layer stack: an [`Interpreter`]
//! (kind and level), the transform-specific payload, and the
//! [`LifeHandle`] shared with every tensor the layer wraps.
//!
//! ## Payloads
//!
//! ```text
//! Vmap          { batch_size, randomness }
//! Grad          { prev_grad_mode }        restored on pop
//! Jvp           { prev_fwd_grad_mode }    restored on pop
//! Functionalize { add_back_views }
//! ```
//!
//! ## Design Decision
//!
//! The payload is a tagged union rather than a trait object. Accessors for
//! one kind (`batch_size`, `prev_grad_mode`, ...) return
//! `TransformError::InvalidCast` on any other kind instead of relying on
//! an unchecked downcast. Layers are only constructed by the stack, which
//! keeps the interpreter's kind and the payload variant in agreement.

use serde::{Deserialize, Serialize};

use functrans_core::{Interpreter, Level, LifeHandle, RandomnessType, TransformError, TransformKind};
use functrans_tensor::{Tensor, WrapperKind};

// ─── Push Requests ───────────────────────────────────────────────────

/// What a transform asks for when it pushes a layer.
///
/// Ambient values such as the previous grad mode are captured by the
/// stack at push time and are not part of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "transform")]
pub enum LayerSpec {
    /// Enter a vmap over `batch_size` elements.
    Vmap {
        /// Size of the mapped dimension.
        batch_size: usize,
        /// Randomness policy inside the vmap.
        #[serde(default)]
        randomness: RandomnessType,
    },
    /// Enter a grad transform.
    Grad,
    /// Enter a jvp transform.
    Jvp,
    /// Enter a functionalize transform.
    Functionalize {
        /// Whether view operations are re-applied on the way out.
        #[serde(default)]
        add_back_views: bool,
    },
}

impl LayerSpec {
    /// Vmap request with the default randomness policy.
    pub fn vmap(batch_size: usize) -> Self {
        Self::Vmap {
            batch_size,
            randomness: RandomnessType::default(),
        }
    }

    /// Functionalize request.
    pub fn functionalize(add_back_views: bool) -> Self {
        Self::Functionalize { add_back_views }
    }

    /// The transform kind this request pushes.
    pub fn kind(&self) -> TransformKind {
        match self {
            Self::Vmap { .. } => TransformKind::Vmap,
            Self::Grad => TransformKind::Grad,
            Self::Jvp => TransformKind::Jvp,
            Self::Functionalize { .. } => TransformKind::Functionalize,
        }
    }
}

// ─── Payloads ────────────────────────────────────────────────────────

/// Transform-specific state held by a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "transform")]
pub enum LayerPayload {
    /// Vmap state.
    Vmap {
        /// Size of the mapped dimension.
        batch_size: usize,
        /// Randomness policy.
        randomness: RandomnessType,
    },
    /// Grad state.
    Grad {
        /// Grad mode in effect before the push.
        prev_grad_mode: bool,
    },
    /// Jvp state.
    Jvp {
        /// Forward-grad mode in effect before the push.
        prev_fwd_grad_mode: bool,
    },
    /// Functionalize state.
    Functionalize {
        /// Whether view operations are re-applied on the way out.
        add_back_views: bool,
    },
}

impl LayerPayload {
    /// The transform kind of this payload.
    pub fn kind(&self) -> TransformKind {
        match self {
            Self::Vmap { .. } => TransformKind::Vmap,
            Self::Grad { .. } => TransformKind::Grad,
            Self::Jvp { .. } => TransformKind::Jvp,
            Self::Functionalize { .. } => TransformKind::Functionalize,
        }
    }
}

// ─── The Layer ───────────────────────────────────────────────────────

/// One frame of the dynamic layer stack.
///
/// Not `Clone`: a layer and its life handle exist once. A popped layer is
/// handed back to the caller for inspection only.
#[derive(Debug)]
pub struct DynamicLayer {
    interpreter: Interpreter,
    payload: LayerPayload,
    life: LifeHandle,
}

impl DynamicLayer {
    pub(crate) fn new(level: Level, payload: LayerPayload) -> Self {
        Self {
            interpreter: Interpreter::new(payload.kind(), level),
            payload,
            life: LifeHandle::new(),
        }
    }

    /// The layer's interpreter identity.
    pub fn interpreter(&self) -> Interpreter {
        self.interpreter
    }

    /// Shorthand for `interpreter().key()`.
    pub fn key(&self) -> TransformKind {
        self.interpreter.key()
    }

    /// Shorthand for `interpreter().level()`.
    pub fn level(&self) -> Level {
        self.interpreter.level()
    }

    /// The transform-specific payload.
    pub fn payload(&self) -> &LayerPayload {
        &self.payload
    }

    /// Liveness handle shared with tensors wrapped by this layer.
    pub fn life(&self) -> &LifeHandle {
        &self.life
    }

    /// Whether the layer is still on its stack.
    pub fn is_alive(&self) -> bool {
        self.life.is_alive()
    }

    /// Batch size of a vmap layer.
    ///
    /// # Errors
    ///
    /// `InvalidCast` on any other kind.
    pub fn batch_size(&self) -> Result<usize, TransformError> {
        match self.payload {
            LayerPayload::Vmap { batch_size, .. } => Ok(batch_size),
            _ => Err(self.cast_error(TransformKind::Vmap)),
        }
    }

    /// Randomness policy of a vmap layer.
    pub fn randomness(&self) -> Result<RandomnessType, TransformError> {
        match self.payload {
            LayerPayload::Vmap { randomness, .. } => Ok(randomness),
            _ => Err(self.cast_error(TransformKind::Vmap)),
        }
    }

    /// Grad mode captured when this grad layer was pushed.
    ///
    /// # Errors
    ///
    /// `InvalidCast` on any other kind.
    pub fn prev_grad_mode(&self) -> Result<bool, TransformError> {
        match self.payload {
            LayerPayload::Grad { prev_grad_mode } => Ok(prev_grad_mode),
            _ => Err(self.cast_error(TransformKind::Grad)),
        }
    }

    /// Forward-grad mode captured when this jvp layer was pushed.
    pub fn prev_fwd_grad_mode(&self) -> Result<bool, TransformError> {
        match self.payload {
            LayerPayload::Jvp { prev_fwd_grad_mode } => Ok(prev_fwd_grad_mode),
            _ => Err(self.cast_error(TransformKind::Jvp)),
        }
    }

    /// View re-application flag of a functionalize layer.
    pub fn add_back_views(&self) -> Result<bool, TransformError> {
        match self.payload {
            LayerPayload::Functionalize { add_back_views } => Ok(add_back_views),
            _ => Err(self.cast_error(TransformKind::Functionalize)),
        }
    }

    pub(crate) fn cast_error(&self, expected: TransformKind) -> TransformError {
        TransformError::InvalidCast {
            expected,
            actual: self.key(),
        }
    }

    /// Whether `tensor`'s outermost wrap is a `kind` wrap made by this very
    /// layer (same level and same life handle).
    fn owns_outer_wrap(&self, tensor: &Tensor, kind: WrapperKind) -> bool {
        tensor.wrapper().is_some_and(|w| {
            w.kind() == kind && w.level() == self.level() && w.life().ptr_eq(&self.life)
        })
    }

    /// Grad-tracking wrap at this layer's level; no-op if already wrapped
    /// by this layer.
    pub(crate) fn wrap_grad_tracking(&self, tensor: &Tensor) -> Tensor {
        if self.owns_outer_wrap(tensor, WrapperKind::GradTracking) {
            return tensor.clone();
        }
        Tensor::grad_tracking(tensor.clone(), self.level(), self.life.clone())
    }

    /// Functional wrap at this layer's level; no-op if already wrapped by
    /// this layer.
    pub(crate) fn wrap_functional(&self, tensor: &Tensor) -> Tensor {
        if self.owns_outer_wrap(tensor, WrapperKind::Functional) {
            return tensor.clone();
        }
        Tensor::functional(tensor.clone(), self.level(), self.life.clone())
    }
}

impl std::fmt::Display for DynamicLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.payload {
            LayerPayload::Vmap {
                batch_size,
                randomness,
            } => write!(
                f,
                "{} (batch_size={batch_size}, randomness={randomness})",
                self.interpreter
            ),
            LayerPayload::Grad { prev_grad_mode } => {
                write!(f, "{} (prev_grad_mode={prev_grad_mode})", self.interpreter)
            }
            LayerPayload::Jvp { prev_fwd_grad_mode } => write!(
                f,
                "{} (prev_fwd_grad_mode={prev_fwd_grad_mode})",
                self.interpreter
            ),
            LayerPayload::Functionalize { add_back_views } => {
                write!(f, "{} (add_back_views={add_back_views})", self.interpreter)
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
