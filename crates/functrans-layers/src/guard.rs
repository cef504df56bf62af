//! # Scoped Acquisition
//!
//! RAII wrappers around the stack's push/pop and flag toggles.
//!
//! - [`LayerGuard`]: pushes on [`LayerStack::enter`], pops on drop. The
//!   guard derefs to the stack, so a nested transform enters through the
//!   outer guard and the borrow checker keeps the nesting LIFO.
//! - [`DispatchKeysGuard`]: saves the dispatch-key flag, sets it, restores
//!   it on drop.
//! - [`LayerStack::with_top_popped`]: runs a closure with the top layer
//!   temporarily detached (neither restored nor killed), then re-attaches
//!   it with the dispatch-key flag it was detached under.
//!
//! Drop cannot return an error. A guard that finds the stack corrupted on
//! drop panics, unless the thread is already unwinding, in which case the
//! stack is repaired as far as possible and the original panic proceeds.
//! Callers that want the error instead use [`LayerGuard::exit`].

use std::ops::{Deref, DerefMut};

use tracing::{error, trace};

use functrans_core::{Interpreter, Level, LifeHandle, Result, TransformError};

use crate::layer::{DynamicLayer, LayerSpec};
use crate::stack::LayerStack;

// ─── Layer Guard ─────────────────────────────────────────────────────

/// A pushed layer that pops itself when dropped.
#[must_use = "dropping the guard pops the layer immediately"]
#[derive(Debug)]
pub struct LayerGuard<'s> {
    stack: &'s mut LayerStack,
    interpreter: Interpreter,
    life: LifeHandle,
    armed: bool,
}

impl LayerGuard<'_> {
    /// Interpreter of the guarded layer.
    pub fn interpreter(&self) -> Interpreter {
        self.interpreter
    }

    /// Level of the guarded layer.
    pub fn level(&self) -> Level {
        self.interpreter.level()
    }

    /// Pop the guarded layer and return it.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` if layers pushed inside the scope were left on
    /// the stack (they are popped first), or if the guarded layer is no
    /// longer on the stack.
    pub fn exit(mut self) -> Result<DynamicLayer> {
        self.armed = false;
        self.stack.close_scope(self.interpreter, &self.life)
    }
}

impl Deref for LayerGuard<'_> {
    type Target = LayerStack;

    fn deref(&self) -> &LayerStack {
        self.stack
    }
}

impl DerefMut for LayerGuard<'_> {
    fn deref_mut(&mut self) -> &mut LayerStack {
        self.stack
    }
}

impl Drop for LayerGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.stack.close_scope(self.interpreter, &self.life) {
            if !std::thread::panicking() {
                panic!("{err}");
            }
        }
    }
}

impl LayerStack {
    /// Push a layer for `spec` and return a guard that pops it.
    ///
    /// # Errors
    ///
    /// Whatever [`push`](LayerStack::push) returns.
    pub fn enter(&mut self, spec: LayerSpec) -> Result<LayerGuard<'_>> {
        self.push(spec)?;
        let top = self.top()?;
        let interpreter = top.interpreter();
        let life = top.life().clone();
        Ok(LayerGuard {
            stack: self,
            interpreter,
            life,
            armed: true,
        })
    }

    /// Run `f` inside a layer for `spec`.
    ///
    /// The layer is popped however `f` exits, unwinding included. `f`
    /// receives the stack and the new layer's interpreter.
    ///
    /// # Errors
    ///
    /// Push failures, and `InvariantViolation` if `f` leaves extra layers
    /// on the stack or pops the scope's own layer.
    pub fn scoped<R>(
        &mut self,
        spec: LayerSpec,
        f: impl FnOnce(&mut LayerStack, Interpreter) -> R,
    ) -> Result<R> {
        let mut guard = self.enter(spec)?;
        let interpreter = guard.interpreter();
        let out = f(&mut *guard, interpreter);
        guard.exit()?;
        Ok(out)
    }

    /// Run `f` with the top layer detached.
    ///
    /// The detached layer keeps its life and its captured ambient state.
    /// Operations inside `f` see the next layer down as the top. On
    /// re-attach the dispatch-key flag goes back to its detach-time value.
    ///
    /// # Errors
    ///
    /// - `StackUnderflow` on an empty stack.
    /// - `InvariantViolation` if `f` changes the stack depth. Extra layers
    ///   are popped before the detached layer is re-attached. If `f` popped
    ///   below the detached layer's position, the detached layer is killed
    ///   and its captured flag is restored only when no popped layer below
    ///   it captured the same one.
    pub fn with_top_popped<R>(&mut self, f: impl FnOnce(&mut LayerStack) -> R) -> Result<R> {
        let layer = self.detach_top().ok_or(TransformError::StackUnderflow {
            operation: "with_top_popped",
        })?;
        trace!(layer = %layer.interpreter(), "temporarily popped top layer");
        let mut guard = TopPoppedGuard {
            depth: self.depth(),
            below: self.interpreter_stack(),
            keys_included: self.dynamic_layer_keys_included(),
            stack: self,
            detached: Some(layer),
        };
        let out = f(&mut *guard.stack);
        guard.finish()?;
        Ok(out)
    }

    /// Exclude the dynamic-layer dispatch keys until the guard drops.
    pub fn exclude_dynamic_layer_keys(&mut self) -> DispatchKeysGuard<'_> {
        DispatchKeysGuard::set(self, false)
    }

    /// Include the dynamic-layer dispatch keys until the guard drops.
    pub fn include_dynamic_layer_keys(&mut self) -> DispatchKeysGuard<'_> {
        DispatchKeysGuard::set(self, true)
    }
}

// ─── Temporary Pop ───────────────────────────────────────────────────

struct TopPoppedGuard<'s> {
    stack: &'s mut LayerStack,
    detached: Option<DynamicLayer>,
    depth: usize,
    /// Interpreters under the detached layer, bottom first.
    below: Vec<Interpreter>,
    /// Dispatch-key flag at detach time.
    keys_included: bool,
}

impl TopPoppedGuard<'_> {
    fn finish(mut self) -> Result<()> {
        match self.detached.take() {
            Some(layer) => self.restore(layer),
            None => Ok(()),
        }
    }

    fn restore(&mut self, layer: DynamicLayer) -> Result<()> {
        let interpreter = layer.interpreter();
        let current = self.stack.depth();
        if current == self.depth {
            self.stack.reattach(layer, self.keys_included);
            trace!(layer = %interpreter, "re-pushed temporarily popped layer");
            return Ok(());
        }

        error!(
            layer = %interpreter,
            expected_depth = self.depth,
            depth = current,
            "stack depth changed while top layer was popped"
        );
        if current > self.depth {
            self.stack.pop_to_depth(self.depth)?;
            self.stack.reattach(layer, self.keys_included);
        } else {
            let popped_below = self.below.get(current..).unwrap_or_default();
            self.stack.discard_detached(layer, popped_below);
        }
        Err(TransformError::InvariantViolation(format!(
            "stack depth changed from {} to {current} while {interpreter} was popped",
            self.depth
        )))
    }
}

impl Drop for TopPoppedGuard<'_> {
    fn drop(&mut self) {
        // Only reached with a layer still detached when `f` unwound.
        if let Some(layer) = self.detached.take() {
            let _ = self.restore(layer);
        }
    }
}

// ─── Dispatch Keys ───────────────────────────────────────────────────

/// Saved dispatch-key flag, restored on drop.
#[must_use = "dropping the guard restores the previous flag immediately"]
#[derive(Debug)]
pub struct DispatchKeysGuard<'s> {
    stack: &'s mut LayerStack,
    saved: bool,
}

impl<'s> DispatchKeysGuard<'s> {
    fn set(stack: &'s mut LayerStack, included: bool) -> Self {
        let saved = stack.dynamic_layer_keys_included();
        stack.set_dynamic_layer_keys_included(included);
        Self { stack, saved }
    }

    /// The flag that will be restored.
    pub fn saved(&self) -> bool {
        self.saved
    }
}

impl Deref for DispatchKeysGuard<'_> {
    type Target = LayerStack;

    fn deref(&self) -> &LayerStack {
        self.stack
    }
}

impl DerefMut for DispatchKeysGuard<'_> {
    fn deref_mut(&mut self) -> &mut LayerStack {
        self.stack
    }
}

impl Drop for DispatchKeysGuard<'_> {
    fn drop(&mut self) {
        self.stack.set_dynamic_layer_keys_included(self.saved);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use functrans_core::TransformKind;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    // ── LayerGuard ──────────────────────────────────────────────────

    #[test]
    fn test_guard_pops_on_drop() {
        let mut stack = LayerStack::new();
        stack.set_grad_enabled(false);
        {
            let guard = stack.enter(LayerSpec::Grad).unwrap();
            assert_eq!(guard.depth(), 1);
            assert!(guard.is_grad_enabled());
        }
        assert!(stack.is_empty());
        assert!(!stack.is_grad_enabled());
    }

    #[test]
    fn test_nested_guards() {
        let mut stack = LayerStack::new();
        {
            let mut outer = stack.enter(LayerSpec::Grad).unwrap();
            {
                let inner = outer.enter(LayerSpec::vmap(4)).unwrap();
                assert_eq!(inner.level().get(), 2);
                assert_eq!(inner.peek().unwrap().key(), TransformKind::Vmap);
            }
            assert_eq!(outer.depth(), 1);
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn test_exit_returns_layer() {
        let mut stack = LayerStack::new();
        let guard = stack.enter(LayerSpec::Jvp).unwrap();
        let layer = guard.exit().unwrap();
        assert_eq!(layer.key(), TransformKind::Jvp);
        assert!(!layer.is_alive());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_exit_reports_and_repairs_leak() {
        let mut stack = LayerStack::new();
        let mut guard = stack.enter(LayerSpec::Grad).unwrap();
        guard.push(LayerSpec::vmap(2)).unwrap();
        let err = guard.exit().unwrap_err();
        assert!(err.is_fatal());
        assert!(stack.is_empty());
        assert!(!stack.dynamic_layer_keys_included());
    }

    #[test]
    fn test_exit_reports_missing_own_layer() {
        let mut stack = LayerStack::new();
        let mut guard = stack.enter(LayerSpec::Grad).unwrap();
        guard.pop().unwrap();
        assert!(guard.exit().unwrap_err().is_fatal());
    }

    #[test]
    fn test_drop_with_leak_panics() {
        let mut stack = LayerStack::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut guard = stack.enter(LayerSpec::Grad).unwrap();
            guard.push(LayerSpec::Jvp).unwrap();
        }));
        assert!(result.is_err());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_drop_during_unwind_does_not_double_panic() {
        let mut stack = LayerStack::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut guard = stack.enter(LayerSpec::Grad).unwrap();
            guard.push(LayerSpec::vmap(3)).unwrap();
            panic!("transform body failed");
        }));
        assert!(result.is_err());
        assert!(stack.is_empty());
    }

    // ── scoped ──────────────────────────────────────────────────────

    #[test]
    fn test_scoped_returns_closure_result() {
        let mut stack = LayerStack::new();
        let level = stack
            .scoped(LayerSpec::vmap(8), |inner, interp| {
                assert_eq!(inner.peek().unwrap(), interp);
                interp.level()
            })
            .unwrap();
        assert_eq!(level.get(), 1);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_scoped_pops_on_panic() {
        let mut stack = LayerStack::new();
        stack.set_grad_enabled(false);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = stack.scoped(LayerSpec::Grad, |_, _| panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(stack.is_empty());
        assert!(!stack.is_grad_enabled());
    }

    #[test]
    fn test_scoped_nested() {
        let mut stack = LayerStack::new();
        let depth = stack
            .scoped(LayerSpec::Grad, |s, _| {
                s.scoped(LayerSpec::vmap(2), |s, _| s.depth()).unwrap()
            })
            .unwrap();
        assert_eq!(depth, 2);
        assert!(stack.is_empty());
    }

    // ── with_top_popped ─────────────────────────────────────────────

    #[test]
    fn test_with_top_popped_exposes_next_layer() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::Grad).unwrap();
        stack.push(LayerSpec::vmap(4)).unwrap();
        let top_life = stack.top().unwrap().life().clone();
        let seen = stack.with_top_popped(|s| s.peek().unwrap().key()).unwrap();
        assert_eq!(seen, TransformKind::Grad);
        assert_eq!(stack.depth(), 2);
        assert!(top_life.is_alive());
        assert!(top_life.ptr_eq(stack.top().unwrap().life()));
    }

    #[test]
    fn test_with_top_popped_keeps_ambient_state() {
        let mut stack = LayerStack::new();
        stack.set_grad_enabled(false);
        stack.push(LayerSpec::Grad).unwrap();
        let (grad, keys) = stack
            .with_top_popped(|s| (s.is_grad_enabled(), s.dynamic_layer_keys_included()))
            .unwrap();
        assert!(grad);
        assert!(keys);
    }

    #[test]
    fn test_with_top_popped_on_empty_stack() {
        let mut stack = LayerStack::new();
        assert_eq!(
            stack.with_top_popped(|_| ()).unwrap_err(),
            TransformError::StackUnderflow {
                operation: "with_top_popped"
            }
        );
    }

    #[test]
    fn test_with_top_popped_detects_leak() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::Grad).unwrap();
        stack.push(LayerSpec::vmap(2)).unwrap();
        let err = stack
            .with_top_popped(|s| {
                s.push(LayerSpec::Jvp).unwrap();
            })
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.peek().unwrap().key(), TransformKind::Vmap);
    }

    #[test]
    fn test_with_top_popped_restores_on_panic() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::vmap(2)).unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = stack.with_top_popped(|_| panic!("inner"));
        }));
        assert!(result.is_err());
        assert_eq!(stack.depth(), 1);
        assert!(stack.top().unwrap().is_alive());
    }

    #[test]
    fn test_with_top_popped_nested_scope_keeps_keys_on_sole_layer() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::vmap(2)).unwrap();
        stack
            .with_top_popped(|s| s.scoped(LayerSpec::Grad, |_, _| ()).unwrap())
            .unwrap();
        assert_eq!(stack.depth(), 1);
        assert!(stack.dynamic_layer_keys_included());
        assert_eq!(stack.dispatch_key(), TransformKind::Vmap);
        assert_eq!(
            stack.dispatch_interpreter().map(|i| i.key()),
            Some(TransformKind::Vmap)
        );
    }

    #[test]
    fn test_with_top_popped_pop_below_restores_lowest_grad_mode() {
        let mut stack = LayerStack::new();
        stack.set_grad_enabled(false);
        stack.push(LayerSpec::Grad).unwrap();
        stack.push(LayerSpec::Grad).unwrap();
        let top_life = stack.top().unwrap().life().clone();
        let err = stack
            .with_top_popped(|s| {
                s.pop().unwrap();
            })
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(stack.is_empty());
        assert!(!stack.is_grad_enabled());
        assert!(!stack.dynamic_layer_keys_included());
        assert!(!top_life.is_alive());
    }

    #[test]
    fn test_with_top_popped_pop_below_other_kind_still_restores_detached() {
        let mut stack = LayerStack::new();
        stack.set_grad_enabled(false);
        stack.push(LayerSpec::vmap(3)).unwrap();
        stack.push(LayerSpec::Grad).unwrap();
        let err = stack
            .with_top_popped(|s| {
                s.pop().unwrap();
            })
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(stack.is_empty());
        assert!(!stack.is_grad_enabled());
    }

    // ── DispatchKeysGuard ───────────────────────────────────────────

    #[test]
    fn test_exclude_keys_restores() {
        let mut stack = LayerStack::new();
        stack.push(LayerSpec::vmap(2)).unwrap();
        {
            let guard = stack.exclude_dynamic_layer_keys();
            assert!(guard.saved());
            assert_eq!(guard.dispatch_interpreter(), None);
        }
        assert!(stack.dynamic_layer_keys_included());
    }

    #[test]
    fn test_include_keys_restores() {
        let mut stack = LayerStack::new();
        {
            let guard = stack.include_dynamic_layer_keys();
            assert!(guard.dynamic_layer_keys_included());
        }
        assert!(!stack.dynamic_layer_keys_included());
    }
}
