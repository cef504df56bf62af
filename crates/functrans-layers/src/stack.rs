//! # Layer Stack
//!
//! The ordered sequence of active dynamic layers plus the ambient state the
//! layers save and restore. A `LayerStack` is an explicit context object:
//! every transform entry point pushes through one, and tests build
//! independent stacks instead of sharing process state. The thread-confined
//! default stack lives in [`crate::context`].
//!
//! ## State Machine
//!
//! ```text
//! EMPTY --push--> NONEMPTY(1) --push--> NONEMPTY(2) ...
//!       <--pop---              <--pop---
//! ```
//!
//! - The first push includes the dynamic-layer dispatch keys; the pop that
//!   empties the stack excludes them.
//! - A grad push captures `grad_enabled` and enables grad; its pop puts
//!   the captured value back. Jvp does the same with `fwd_grad_enabled`.
//! - Every pop kills the layer's `LifeHandle`, so wrappers made by that
//!   layer report dead from then on.
//!
//! ## Levels
//!
//! A push onto a stack of `d` layers receives level `d + 1`. Levels are
//! therefore strictly increasing bottom to top, and a popped level is
//! handed out again by the next push.

use tracing::{debug, error, warn};

use functrans_core::{
    Interpreter, Level, LifeHandle, RandomnessType, Result, TransformError, TransformKind,
};
use functrans_tensor::Tensor;

use crate::ambient::AmbientState;
use crate::layer::{DynamicLayer, LayerPayload, LayerSpec};

/// Stack of active dynamic layers, bottom (outermost) first.
#[derive(Debug, Default)]
pub struct LayerStack {
    layers: Vec<DynamicLayer>,
    ambient: AmbientState,
}

impl LayerStack {
    /// An empty stack over a fresh-process ambient state.
    pub const fn new() -> Self {
        Self::with_ambient(AmbientState::new())
    }

    /// An empty stack over the given ambient state.
    pub const fn with_ambient(ambient: AmbientState) -> Self {
        Self {
            layers: Vec::new(),
            ambient,
        }
    }

    /// Current ambient state.
    pub fn ambient(&self) -> AmbientState {
        self.ambient
    }

    // ── Push / Pop ──────────────────────────────────────────────────

    /// Push a layer for `spec` and return its level.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` if the new level would not sit directly above
    /// the current top.
    pub fn push(&mut self, spec: LayerSpec) -> Result<Level> {
        let level = Level::for_depth(self.layers.len());
        if let Some(top) = self.layers.last() {
            if top.level().next() != level {
                error!(
                    top = %top.interpreter(),
                    new_level = level.get(),
                    "level collision on push"
                );
                return Err(TransformError::InvariantViolation(format!(
                    "push at {level} does not sit directly above top layer {}",
                    top.interpreter()
                )));
            }
        }

        let payload = match spec {
            LayerSpec::Vmap {
                batch_size,
                randomness,
            } => LayerPayload::Vmap {
                batch_size,
                randomness,
            },
            LayerSpec::Grad => {
                let prev_grad_mode = self.ambient.grad_enabled;
                self.ambient.grad_enabled = true;
                LayerPayload::Grad { prev_grad_mode }
            }
            LayerSpec::Jvp => {
                let prev_fwd_grad_mode = self.ambient.fwd_grad_enabled;
                self.ambient.fwd_grad_enabled = true;
                LayerPayload::Jvp { prev_fwd_grad_mode }
            }
            LayerSpec::Functionalize { add_back_views } => {
                LayerPayload::Functionalize { add_back_views }
            }
        };

        if self.layers.is_empty() {
            self.ambient.dynamic_layer_keys_included = true;
        }
        self.layers.push(DynamicLayer::new(level, payload));
        debug!(
            kind = %spec.kind(),
            level = level.get(),
            depth = self.layers.len(),
            "pushed dynamic layer"
        );
        Ok(level)
    }

    /// Pop the top layer, restoring the ambient state it captured.
    ///
    /// # Errors
    ///
    /// `StackUnderflow` on an empty stack.
    pub fn pop(&mut self) -> Result<DynamicLayer> {
        let layer = self
            .layers
            .pop()
            .ok_or(TransformError::StackUnderflow { operation: "pop" })?;
        self.retire(&layer);
        Ok(layer)
    }

    /// Pop layers (with restore) until `depth` remain. Returns them in pop
    /// order, top first.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` if `depth` is above the current depth.
    pub fn pop_to_depth(&mut self, depth: usize) -> Result<Vec<DynamicLayer>> {
        if depth > self.layers.len() {
            error!(
                target_depth = depth,
                depth = self.layers.len(),
                "pop_to_depth above current depth"
            );
            return Err(TransformError::InvariantViolation(format!(
                "cannot pop to depth {depth}: stack holds {} layers",
                self.layers.len()
            )));
        }
        let mut popped = Vec::with_capacity(self.layers.len() - depth);
        while self.layers.len() > depth {
            popped.push(self.pop()?);
        }
        Ok(popped)
    }

    /// Undo the effects of a popped layer on the ambient state.
    fn retire(&mut self, layer: &DynamicLayer) {
        match *layer.payload() {
            LayerPayload::Grad { prev_grad_mode } => self.ambient.grad_enabled = prev_grad_mode,
            LayerPayload::Jvp { prev_fwd_grad_mode } => {
                self.ambient.fwd_grad_enabled = prev_fwd_grad_mode;
            }
            LayerPayload::Vmap { .. } | LayerPayload::Functionalize { .. } => {}
        }
        layer.life().kill();
        if self.layers.is_empty() {
            self.ambient.dynamic_layer_keys_included = false;
        }
        debug!(
            kind = %layer.key(),
            level = layer.level().get(),
            depth = self.layers.len(),
            "popped dynamic layer"
        );
    }

    /// Detach the top layer without restoring or killing it.
    pub(crate) fn detach_top(&mut self) -> Option<DynamicLayer> {
        self.layers.pop()
    }

    /// Re-attach a layer removed by [`detach_top`](Self::detach_top).
    ///
    /// `keys_included` is the dispatch-key flag as it was at detach time.
    /// Pops below the detached layer may have cleared it.
    pub(crate) fn reattach(&mut self, layer: DynamicLayer, keys_included: bool) {
        self.layers.push(layer);
        self.ambient.dynamic_layer_keys_included = keys_included;
    }

    /// Kill a detached layer that can no longer be re-attached.
    ///
    /// `popped_below` are the layers under it that were popped while it
    /// was detached. They sat below it, so a flag any of them captured
    /// overrides the one the detached layer captured.
    pub(crate) fn discard_detached(&mut self, layer: DynamicLayer, popped_below: &[Interpreter]) {
        if popped_below.iter().any(|below| below.key() == layer.key()) {
            layer.life().kill();
            debug!(
                kind = %layer.key(),
                level = layer.level().get(),
                depth = self.layers.len(),
                "discarded detached layer without restore"
            );
        } else {
            self.retire(&layer);
        }
    }

    /// Pop the layer owning `life`, and any layers left above it.
    ///
    /// Returns the scope's own layer. Leaked layers are popped with
    /// restore, then reported as an `InvariantViolation`; so is a scope
    /// whose layer is no longer on the stack.
    pub(crate) fn close_scope(
        &mut self,
        interpreter: Interpreter,
        life: &LifeHandle,
    ) -> Result<DynamicLayer> {
        let Some(position) = self.layers.iter().rposition(|l| l.life().ptr_eq(life)) else {
            error!(scope = %interpreter, depth = self.layers.len(), "scope layer missing");
            return Err(TransformError::InvariantViolation(format!(
                "{interpreter} was popped out from under its scope"
            )));
        };
        let leaked = self.layers.len() - position - 1;
        if leaked > 0 {
            warn!(scope = %interpreter, leaked, "popping layers leaked by an inner transform");
            self.pop_to_depth(position + 1)?;
        }
        let layer = self.pop()?;
        if leaked > 0 {
            return Err(TransformError::InvariantViolation(format!(
                "{leaked} layer(s) leaked inside {interpreter}"
            )));
        }
        Ok(layer)
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Interpreter of the top layer.
    ///
    /// # Errors
    ///
    /// `StackUnderflow` on an empty stack.
    pub fn peek(&self) -> Result<Interpreter> {
        self.layers
            .last()
            .map(DynamicLayer::interpreter)
            .ok_or(TransformError::StackUnderflow { operation: "peek" })
    }

    /// The top layer.
    pub fn top(&self) -> Result<&DynamicLayer> {
        self.layers
            .last()
            .ok_or(TransformError::StackUnderflow { operation: "top" })
    }

    /// The live layer whose interpreter is exactly `interpreter`.
    ///
    /// # Errors
    ///
    /// `LevelNotFound` if no layer at that level has that kind.
    pub fn resolve(&self, interpreter: Interpreter) -> Result<&DynamicLayer> {
        self.layer_at(interpreter.level())
            .filter(|layer| layer.interpreter() == interpreter)
            .ok_or(TransformError::LevelNotFound {
                level: interpreter.level(),
            })
    }

    /// The layer at `level`, if one is on the stack.
    pub fn layer_at(&self, level: Level) -> Option<&DynamicLayer> {
        self.layers
            .get(level.depth() - 1)
            .filter(|layer| layer.level() == level)
    }

    fn live_layer(&self, level: Level) -> Result<&DynamicLayer> {
        self.layer_at(level)
            .filter(|layer| layer.is_alive())
            .ok_or(TransformError::LevelNotFound { level })
    }

    /// Number of layers.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Whether no layer is active.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Level of the top layer.
    pub fn current_level(&self) -> Option<Level> {
        self.layers.last().map(DynamicLayer::level)
    }

    /// Interpreters bottom to top.
    pub fn interpreter_stack(&self) -> Vec<Interpreter> {
        self.layers.iter().map(DynamicLayer::interpreter).collect()
    }

    /// Layers bottom to top.
    pub fn layers(&self) -> impl Iterator<Item = &DynamicLayer> {
        self.layers.iter()
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Whether the dispatcher routes through the stack.
    pub fn dynamic_layer_keys_included(&self) -> bool {
        self.ambient.dynamic_layer_keys_included
    }

    /// Include or exclude the dynamic-layer dispatch keys.
    pub fn set_dynamic_layer_keys_included(&mut self, included: bool) {
        self.ambient.dynamic_layer_keys_included = included;
    }

    /// The interpreter the dispatcher hands the next operation to, or
    /// `None` when it should run the plain kernel.
    pub fn dispatch_interpreter(&self) -> Option<Interpreter> {
        if !self.ambient.dynamic_layer_keys_included {
            return None;
        }
        self.layers.last().map(DynamicLayer::interpreter)
    }

    /// Kind of [`dispatch_interpreter`](Self::dispatch_interpreter);
    /// `Torch` when there is none.
    pub fn dispatch_key(&self) -> TransformKind {
        self.dispatch_interpreter()
            .map_or(TransformKind::Torch, |i| i.key())
    }

    // ── Ambient Flags ───────────────────────────────────────────────

    pub fn is_grad_enabled(&self) -> bool {
        self.ambient.grad_enabled
    }

    pub fn set_grad_enabled(&mut self, enabled: bool) {
        self.ambient.grad_enabled = enabled;
    }

    pub fn is_fwd_grad_enabled(&self) -> bool {
        self.ambient.fwd_grad_enabled
    }

    pub fn set_fwd_grad_enabled(&mut self, enabled: bool) {
        self.ambient.fwd_grad_enabled = enabled;
    }

    pub fn inplace_requires_grad_allowed(&self) -> bool {
        self.ambient.inplace_requires_grad_allowed
    }

    pub fn set_inplace_requires_grad_allowed(&mut self, allowed: bool) {
        self.ambient.inplace_requires_grad_allowed = allowed;
    }

    // ── Nesting Helpers ─────────────────────────────────────────────

    /// Enter a vmap over `batch_size` elements.
    pub fn vmap_increment_nesting(
        &mut self,
        batch_size: usize,
        randomness: RandomnessType,
    ) -> Result<Level> {
        self.push(LayerSpec::Vmap {
            batch_size,
            randomness,
        })
    }

    /// Leave the innermost vmap.
    ///
    /// # Errors
    ///
    /// `InvalidCast` if the top layer is not a vmap layer; the stack is
    /// left untouched.
    pub fn vmap_decrement_nesting(&mut self) -> Result<Level> {
        self.pop_expecting(TransformKind::Vmap)
    }

    pub fn grad_increment_nesting(&mut self) -> Result<Level> {
        self.push(LayerSpec::Grad)
    }

    pub fn grad_decrement_nesting(&mut self) -> Result<Level> {
        self.pop_expecting(TransformKind::Grad)
    }

    pub fn jvp_increment_nesting(&mut self) -> Result<Level> {
        self.push(LayerSpec::Jvp)
    }

    pub fn jvp_decrement_nesting(&mut self) -> Result<Level> {
        self.pop_expecting(TransformKind::Jvp)
    }

    pub fn func_increment_nesting(&mut self, add_back_views: bool) -> Result<Level> {
        self.push(LayerSpec::functionalize(add_back_views))
    }

    pub fn func_decrement_nesting(&mut self) -> Result<Level> {
        self.pop_expecting(TransformKind::Functionalize)
    }

    fn pop_expecting(&mut self, kind: TransformKind) -> Result<Level> {
        let top = self
            .layers
            .last()
            .ok_or(TransformError::StackUnderflow { operation: "pop" })?;
        if top.key() != kind {
            return Err(top.cast_error(kind));
        }
        Ok(self.pop()?.level())
    }

    // ── Wrapping ────────────────────────────────────────────────────

    /// Wrap `tensor` for the grad layer at `level`.
    ///
    /// A tensor already grad-wrapped by that layer comes back unchanged.
    ///
    /// # Errors
    ///
    /// `LevelNotFound` if no live layer sits at `level`.
    pub fn wrap_for_grad(&self, tensor: &Tensor, level: Level) -> Result<Tensor> {
        Ok(self.live_layer(level)?.wrap_grad_tracking(tensor))
    }

    /// Wrap `tensor` for the functionalize layer at `level`.
    pub fn wrap_functional_tensor(&self, tensor: &Tensor, level: Level) -> Result<Tensor> {
        Ok(self.live_layer(level)?.wrap_functional(tensor))
    }

    /// Move dimension `bdim` of `tensor` into a batched wrapper at `level`.
    ///
    /// # Errors
    ///
    /// - `LevelNotFound` if no live layer sits at `level`.
    /// - `InvalidBatchDim` if `bdim` is not below the tensor's logical rank.
    /// - `BatchSizeMismatch` if the layer is a vmap layer and the
    ///   dimension's size differs from its batch size.
    pub fn add_batch_dim(&self, tensor: &Tensor, bdim: usize, level: Level) -> Result<Tensor> {
        let layer = self.live_layer(level)?;
        let shape = tensor.shape();
        let actual = *shape.get(bdim).ok_or(TransformError::InvalidBatchDim {
            bdim,
            rank: shape.len(),
        })?;
        if let LayerPayload::Vmap { batch_size, .. } = *layer.payload() {
            if actual != batch_size {
                return Err(TransformError::BatchSizeMismatch {
                    expected: batch_size,
                    actual,
                });
            }
        }
        Tensor::batched(tensor.clone(), bdim, level, layer.life().clone())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn layer_spec() -> impl Strategy<Value = LayerSpec> {
        prop_oneof![
            (1usize..16).prop_map(LayerSpec::vmap),
            Just(LayerSpec::Grad),
            Just(LayerSpec::Jvp),
            any::<bool>().prop_map(LayerSpec::functionalize),
        ]
    }

    fn ambient_state() -> impl Strategy<Value = AmbientState> {
        (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(grad, fwd, inplace)| {
            AmbientState {
                grad_enabled: grad,
                fwd_grad_enabled: fwd,
                dynamic_layer_keys_included: false,
                inplace_requires_grad_allowed: inplace,
            }
        })
    }

    proptest! {
        /// Pushing then popping everything restores the starting state.
        #[test]
        fn push_pop_restores_ambient(
            ambient in ambient_state(),
            specs in prop::collection::vec(layer_spec(), 0..12),
        ) {
            let mut stack = LayerStack::with_ambient(ambient);
            let mut snapshots = Vec::new();
            for spec in &specs {
                snapshots.push(stack.ambient());
                stack.push(*spec).unwrap();
            }
            while let Some(expected) = snapshots.pop() {
                stack.pop().unwrap();
                prop_assert_eq!(stack.ambient().grad_enabled, expected.grad_enabled);
                prop_assert_eq!(stack.ambient().fwd_grad_enabled, expected.fwd_grad_enabled);
            }
            prop_assert!(stack.is_empty());
            prop_assert_eq!(stack.ambient(), ambient);
        }

        /// Levels on the stack are 1..=depth, bottom to top.
        #[test]
        fn levels_strictly_increase(specs in prop::collection::vec(layer_spec(), 1..12)) {
            let mut stack = LayerStack::new();
            for spec in &specs {
                stack.push(*spec).unwrap();
            }
            let levels: Vec<u64> = stack.interpreter_stack().iter().map(|i| i.level().get()).collect();
            let expected: Vec<u64> = (1..=specs.len() as u64).collect();
            prop_assert_eq!(levels, expected);
        }

        /// Every popped layer is dead; every remaining layer is live.
        #[test]
        fn pop_to_depth_kills_exactly_popped(
            specs in prop::collection::vec(layer_spec(), 1..10),
            keep in 0usize..10,
        ) {
            let mut stack = LayerStack::new();
            for spec in &specs {
                stack.push(*spec).unwrap();
            }
            let keep = keep.min(specs.len());
            let popped = stack.pop_to_depth(keep).unwrap();
            prop_assert_eq!(popped.len(), specs.len() - keep);
            prop_assert!(popped.iter().all(|layer| !layer.is_alive()));
            prop_assert!(stack.layers().all(DynamicLayer::is_alive));
            prop_assert_eq!(stack.dynamic_layer_keys_included(), keep > 0);
        }
    }
}
