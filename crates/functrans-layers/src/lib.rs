//! # functrans-layers: The Dynamic Layer Stack
//!
//! Composable transforms (vmap, grad, jvp, functionalize) nest by pushing
//! one dynamic layer per active invocation. The dispatcher consults the top
//! layer to decide which transform handles the next operation.
//!
//! ## Modules
//!
//! - **Layer** (`layer.rs`): [`DynamicLayer`], its transform-specific
//!   payload, and the [`LayerSpec`] a transform pushes.
//!
//! - **Views** (`views.rs`): kind-checked borrowed views
//!   ([`VmapInterpreterPtr`], [`GradInterpreterPtr`], ...) with the
//!   `lift` operation for grad and jvp.
//!
//! - **Ambient** (`ambient.rs`): the grad-mode and dispatch-key flags that
//!   layers save on push and restore on pop.
//!
//! - **Stack** (`stack.rs`): [`LayerStack`], the explicit context object.
//!   Push, pop, queries, nesting helpers, and stack-aware wrapping.
//!
//! - **Guard** (`guard.rs`): scoped push/pop ([`LayerGuard`],
//!   [`LayerStack::scoped`]), temporary pop, dispatch-key save/restore.
//!
//! - **Context** (`context.rs`): the thread-confined default stack behind
//!   free functions, for callers that cannot pass a stack around.
//!
//! ## Stack Discipline
//!
//! Layers leave the stack in LIFO order. Guards detect layers leaked by an
//! inner scope, pop them with restore, and report the violation; see
//! [`guard`] for the panic policy on drop.

pub mod ambient;
pub mod context;
pub mod guard;
pub mod layer;
pub mod stack;
pub mod views;

pub use ambient::AmbientState;
pub use context::{
    current_level, dynamic_layer_keys_included, interpreter_stack, is_grad_enabled,
    peek_interpreter_stack, pop_dynamic_layer, push_dynamic_layer, reset_layer_stack,
    set_dynamic_layer_keys_included, set_grad_enabled, with_layer_stack, with_transform,
    DynamicLayerGuard,
};
pub use guard::{DispatchKeysGuard, LayerGuard};
pub use layer::{DynamicLayer, LayerPayload, LayerSpec};
pub use stack::LayerStack;
pub use views::{
    FunctionalizeInterpreterPtr, GradInterpreterPtr, JvpInterpreterPtr, VmapInterpreterPtr,
};
