//! # Thread-Confined Default Stack
//!
//! The surface an external dispatcher consumes: one [`LayerStack`] per
//! thread, reached through free functions. Each function borrows the stack
//! only for its own duration, so user code run between calls (the body of
//! a transform) can push and pop nested layers freely.
//!
//! Code that owns its stack should use [`LayerStack`] directly. This module
//! exists for callers that cannot thread a stack through, such as a
//! dispatcher callback.

use std::cell::RefCell;
use std::marker::PhantomData;

use tracing::{error, warn};

use functrans_core::{Interpreter, Level, LifeHandle, Result, TransformError};

use crate::layer::{DynamicLayer, LayerSpec};
use crate::stack::LayerStack;

thread_local! {
    static LAYER_STACK: RefCell<LayerStack> = const { RefCell::new(LayerStack::new()) };
}

/// Run `f` against this thread's stack.
///
/// # Panics
///
/// If `f` calls back into this module; the stack is borrowed while `f`
/// runs.
pub fn with_layer_stack<R>(f: impl FnOnce(&mut LayerStack) -> R) -> R {
    LAYER_STACK.with(|cell| f(&mut *cell.borrow_mut()))
}

pub fn push_dynamic_layer(spec: LayerSpec) -> Result<Level> {
    with_layer_stack(|stack| stack.push(spec))
}

pub fn pop_dynamic_layer() -> Result<DynamicLayer> {
    with_layer_stack(LayerStack::pop)
}

/// Top interpreter of this thread's stack.
pub fn peek_interpreter_stack() -> Result<Interpreter> {
    with_layer_stack(|stack| stack.peek())
}

/// Interpreters of this thread's stack, bottom to top.
pub fn interpreter_stack() -> Vec<Interpreter> {
    with_layer_stack(|stack| stack.interpreter_stack())
}

pub fn current_level() -> Option<Level> {
    with_layer_stack(|stack| stack.current_level())
}

pub fn set_dynamic_layer_keys_included(included: bool) {
    with_layer_stack(|stack| stack.set_dynamic_layer_keys_included(included));
}

pub fn dynamic_layer_keys_included() -> bool {
    with_layer_stack(|stack| stack.dynamic_layer_keys_included())
}

pub fn is_grad_enabled() -> bool {
    with_layer_stack(|stack| stack.is_grad_enabled())
}

pub fn set_grad_enabled(enabled: bool) {
    with_layer_stack(|stack| stack.set_grad_enabled(enabled));
}

/// Replace this thread's stack with a fresh one.
///
/// Layers still on the old stack are popped, so their wrappers report
/// dead. Returns how many there were.
pub fn reset_layer_stack() -> usize {
    let mut old = LAYER_STACK.with(|cell| cell.replace(LayerStack::new()));
    let leaked = old.pop_to_depth(0).map_or(0, |layers| layers.len());
    if leaked > 0 {
        warn!(leaked, "reset discarded live dynamic layers");
    }
    leaked
}

// ─── Guard ───────────────────────────────────────────────────────────

/// A layer on this thread's stack that pops itself when dropped.
///
/// Not `Send`: the guard belongs to the thread whose stack it pushed onto.
#[must_use = "dropping the guard pops the layer immediately"]
#[derive(Debug)]
pub struct DynamicLayerGuard {
    interpreter: Interpreter,
    life: LifeHandle,
    armed: bool,
    _not_send: PhantomData<*const ()>,
}

impl DynamicLayerGuard {
    /// Push a layer for `spec` onto this thread's stack.
    pub fn new(spec: LayerSpec) -> Result<Self> {
        with_layer_stack(|stack| {
            stack.push(spec)?;
            let top = stack.top()?;
            Ok(Self {
                interpreter: top.interpreter(),
                life: top.life().clone(),
                armed: true,
                _not_send: PhantomData,
            })
        })
    }

    pub fn interpreter(&self) -> Interpreter {
        self.interpreter
    }

    pub fn level(&self) -> Level {
        self.interpreter.level()
    }

    /// Pop the guarded layer, reporting stack-discipline violations as
    /// `InvariantViolation` instead of panicking.
    pub fn exit(mut self) -> Result<DynamicLayer> {
        self.armed = false;
        close(self.interpreter, &self.life)
    }
}

impl Drop for DynamicLayerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = close(self.interpreter, &self.life) {
            if !std::thread::panicking() {
                panic!("{err}");
            }
        }
    }
}

fn close(interpreter: Interpreter, life: &LifeHandle) -> Result<DynamicLayer> {
    // The thread-local is gone during thread teardown.
    let outcome = LAYER_STACK.try_with(|cell| match cell.try_borrow_mut() {
        Ok(mut stack) => stack.close_scope(interpreter, life),
        Err(_) => {
            error!(scope = %interpreter, "layer stack borrowed while closing scope");
            Err(TransformError::InvariantViolation(format!(
                "{interpreter} closed while the layer stack was borrowed"
            )))
        }
    });
    outcome.unwrap_or_else(|_| {
        life.kill();
        Err(TransformError::InvariantViolation(format!(
            "{interpreter} outlived its thread's layer stack"
        )))
    })
}

/// Run `f` inside a layer for `spec` on this thread's stack.
///
/// The stack is not borrowed while `f` runs, so `f` may call any function
/// in this module, including `with_transform` itself.
pub fn with_transform<R>(spec: LayerSpec, f: impl FnOnce(Interpreter) -> R) -> Result<R> {
    let guard = DynamicLayerGuard::new(spec)?;
    let out = f(guard.interpreter());
    guard.exit()?;
    Ok(out)
}
