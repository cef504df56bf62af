//! # Typed Interpreter Views
//!
//! Borrowed, kind-checked views of a [`DynamicLayer`]. Building a view is
//! the cast: `VmapInterpreterPtr::try_from(layer)` fails with
//! `TransformError::InvalidCast` unless the layer is a vmap layer, and the
//! view's accessors are then infallible.
//!
//! ```
//! use functrans_layers::{LayerSpec, LayerStack, VmapInterpreterPtr};
//!
//! let mut stack = LayerStack::new();
//! stack.push(LayerSpec::vmap(8)).unwrap();
//! let layer = stack.resolve(stack.peek().unwrap()).unwrap();
//! assert_eq!(VmapInterpreterPtr::try_from(layer).unwrap().batch_size(), 8);
//! ```

use functrans_core::{Interpreter, Level, RandomnessType, TransformError, TransformKind};
use functrans_tensor::Tensor;

use crate::layer::{DynamicLayer, LayerPayload};

/// Accessors every view shares.
macro_rules! impl_view_common {
    ($view:ident) => {
        impl<'a> $view<'a> {
            /// The viewed layer.
            pub fn layer(&self) -> &'a DynamicLayer {
                self.layer
            }

            /// The layer's interpreter identity.
            pub fn interpreter(&self) -> Interpreter {
                self.layer.interpreter()
            }

            /// The layer's level.
            pub fn level(&self) -> Level {
                self.layer.level()
            }
        }
    };
}

// ─── Vmap ────────────────────────────────────────────────────────────

/// View of a vmap layer.
#[derive(Debug, Clone, Copy)]
pub struct VmapInterpreterPtr<'a> {
    layer: &'a DynamicLayer,
    batch_size: usize,
    randomness: RandomnessType,
}

impl<'a> TryFrom<&'a DynamicLayer> for VmapInterpreterPtr<'a> {
    type Error = TransformError;

    fn try_from(layer: &'a DynamicLayer) -> Result<Self, Self::Error> {
        match *layer.payload() {
            LayerPayload::Vmap {
                batch_size,
                randomness,
            } => Ok(Self {
                layer,
                batch_size,
                randomness,
            }),
            _ => Err(layer.cast_error(TransformKind::Vmap)),
        }
    }
}

impl_view_common!(VmapInterpreterPtr);

impl VmapInterpreterPtr<'_> {
    /// Size of the mapped dimension.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Randomness policy.
    pub fn randomness(&self) -> RandomnessType {
        self.randomness
    }
}

// ─── Grad ────────────────────────────────────────────────────────────

/// View of a grad layer.
#[derive(Debug, Clone, Copy)]
pub struct GradInterpreterPtr<'a> {
    layer: &'a DynamicLayer,
    prev_grad_mode: bool,
}

impl<'a> TryFrom<&'a DynamicLayer> for GradInterpreterPtr<'a> {
    type Error = TransformError;

    fn try_from(layer: &'a DynamicLayer) -> Result<Self, Self::Error> {
        match *layer.payload() {
            LayerPayload::Grad { prev_grad_mode } => Ok(Self {
                layer,
                prev_grad_mode,
            }),
            _ => Err(layer.cast_error(TransformKind::Grad)),
        }
    }
}

impl_view_common!(GradInterpreterPtr);

impl GradInterpreterPtr<'_> {
    /// Grad mode to restore when the layer is popped.
    pub fn prev_grad_mode(&self) -> bool {
        self.prev_grad_mode
    }

    /// Wrap `tensor` so this layer's autograd tracks it.
    ///
    /// A tensor this layer already wrapped comes back unchanged. Anything
    /// else, including a tensor wrapped at another level, gets a new
    /// grad-tracking wrap at this layer's level.
    ///
    /// # Errors
    ///
    /// `LevelNotFound` if the layer has been popped.
    pub fn lift(&self, tensor: &Tensor) -> Result<Tensor, TransformError> {
        lift_into(self.layer, tensor)
    }
}

// ─── Jvp ─────────────────────────────────────────────────────────────

/// View of a jvp layer.
#[derive(Debug, Clone, Copy)]
pub struct JvpInterpreterPtr<'a> {
    layer: &'a DynamicLayer,
    prev_fwd_grad_mode: bool,
}

impl<'a> TryFrom<&'a DynamicLayer> for JvpInterpreterPtr<'a> {
    type Error = TransformError;

    fn try_from(layer: &'a DynamicLayer) -> Result<Self, Self::Error> {
        match *layer.payload() {
            LayerPayload::Jvp { prev_fwd_grad_mode } => Ok(Self {
                layer,
                prev_fwd_grad_mode,
            }),
            _ => Err(layer.cast_error(TransformKind::Jvp)),
        }
    }
}

impl_view_common!(JvpInterpreterPtr);

impl JvpInterpreterPtr<'_> {
    /// Forward-grad mode to restore when the layer is popped.
    pub fn prev_fwd_grad_mode(&self) -> bool {
        self.prev_fwd_grad_mode
    }

    /// Wrap `tensor` so this layer's forward AD tracks it.
    ///
    /// Same rules as [`GradInterpreterPtr::lift`].
    pub fn lift(&self, tensor: &Tensor) -> Result<Tensor, TransformError> {
        lift_into(self.layer, tensor)
    }
}

fn lift_into(layer: &DynamicLayer, tensor: &Tensor) -> Result<Tensor, TransformError> {
    if !layer.is_alive() {
        return Err(TransformError::LevelNotFound {
            level: layer.level(),
        });
    }
    Ok(layer.wrap_grad_tracking(tensor))
}

// ─── Functionalize ───────────────────────────────────────────────────

/// View of a functionalize layer.
#[derive(Debug, Clone, Copy)]
pub struct FunctionalizeInterpreterPtr<'a> {
    layer: &'a DynamicLayer,
    add_back_views: bool,
}

impl<'a> TryFrom<&'a DynamicLayer> for FunctionalizeInterpreterPtr<'a> {
    type Error = TransformError;

    fn try_from(layer: &'a DynamicLayer) -> Result<Self, Self::Error> {
        match *layer.payload() {
            LayerPayload::Functionalize { add_back_views } => Ok(Self {
                layer,
                add_back_views,
            }),
            _ => Err(layer.cast_error(TransformKind::Functionalize)),
        }
    }
}

impl_view_common!(FunctionalizeInterpreterPtr);

impl FunctionalizeInterpreterPtr<'_> {
    /// Whether view operations are re-applied on the way out.
    pub fn add_back_views(&self) -> bool {
        self.add_back_views
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LayerSpec, LayerStack};
    use functrans_tensor::{is_gradtracking_tensor, maybe_get_level};

    #[test]
    fn test_vmap_view_from_vmap_layer() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::vmap(8)).unwrap();
        let view = VmapInterpreterPtr::try_from(stack.top().unwrap()).unwrap();
        assert_eq!(view.batch_size(), 8);
        assert_eq!(view.randomness(), RandomnessType::Error);
        assert_eq!(view.level(), Level::FIRST);
    }

    #[test]
    fn test_vmap_view_from_grad_layer_fails() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::Grad).unwrap();
        let err = VmapInterpreterPtr::try_from(stack.top().unwrap()).unwrap_err();
        assert_eq!(
            err,
            TransformError::InvalidCast {
                expected: TransformKind::Vmap,
                actual: TransformKind::Grad,
            }
        );
    }

    #[test]
    fn test_grad_view_exposes_captured_mode() {
        let mut stack = LayerStack::new();
        stack.set_grad_enabled(false);
        stack.push(LayerSpec::Grad).unwrap();
        let view = GradInterpreterPtr::try_from(stack.top().unwrap()).unwrap();
        assert!(!view.prev_grad_mode());
        assert!(GradInterpreterPtr::try_from(stack.top().unwrap())
            .unwrap()
            .interpreter()
            .key()
            == TransformKind::Grad);
    }

    #[test]
    fn test_grad_lift_same_level_is_noop() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::Grad).unwrap();
        let view = GradInterpreterPtr::try_from(stack.top().unwrap()).unwrap();
        let t = Tensor::new(&[3]);
        let lifted = view.lift(&t).unwrap();
        assert!(is_gradtracking_tensor(&lifted));
        assert_eq!(maybe_get_level(&lifted), Some(Level::FIRST));
        assert_eq!(view.lift(&lifted).unwrap(), lifted);
    }

    #[test]
    fn test_grad_lift_at_other_level_adds_wrap() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::Grad).unwrap();
        let outer = GradInterpreterPtr::try_from(stack.top().unwrap())
            .unwrap()
            .lift(&Tensor::scalar())
            .unwrap();
        stack.push(LayerSpec::Grad).unwrap();
        let inner_view = GradInterpreterPtr::try_from(stack.top().unwrap()).unwrap();
        let lifted = inner_view.lift(&outer).unwrap();
        assert_eq!(lifted.depth(), 2);
        assert_eq!(maybe_get_level(&lifted).map(Level::get), Some(2));
    }

    #[test]
    fn test_jvp_view_and_lift() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::Jvp).unwrap();
        let view = JvpInterpreterPtr::try_from(stack.top().unwrap()).unwrap();
        assert!(view.prev_fwd_grad_mode());
        assert!(is_gradtracking_tensor(&view.lift(&Tensor::scalar()).unwrap()));
        assert!(GradInterpreterPtr::try_from(stack.top().unwrap()).is_err());
    }

    #[test]
    fn test_lift_through_popped_layer_fails() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::Grad).unwrap();
        let grad = stack.pop().unwrap();
        let err = GradInterpreterPtr::try_from(&grad)
            .unwrap()
            .lift(&Tensor::scalar())
            .unwrap_err();
        assert_eq!(err, TransformError::LevelNotFound { level: Level::FIRST });

        stack.push(LayerSpec::Jvp).unwrap();
        let jvp = stack.pop().unwrap();
        assert!(JvpInterpreterPtr::try_from(&jvp)
            .unwrap()
            .lift(&Tensor::scalar())
            .is_err());
    }

    #[test]
    fn test_functionalize_view() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::functionalize(true)).unwrap();
        let view = FunctionalizeInterpreterPtr::try_from(stack.top().unwrap()).unwrap();
        assert!(view.add_back_views());
        assert!(JvpInterpreterPtr::try_from(view.layer()).is_err());
    }
}
