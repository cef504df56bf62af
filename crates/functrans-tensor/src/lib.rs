//! # functrans-tensor: Wrapped Tensors
//!
//! The tensor side of the transform machinery:
//!
//! - **Tensor** (`tensor.rs`): a cheap-clone tensor handle that is either
//!   plain or wrapped by a transform at some level. Wrappers are batched
//!   (vmap), grad-tracking (grad, jvp) or functional (functionalize).
//!
//! - **Wrapped** (`wrapped.rs`): classification predicates, level and
//!   batch-dimension queries, one-level unwrapping, and the lazy
//!   "unwrap if dead" reclamation of wrappers whose transform has already
//!   returned.
//!
//! ## Dead Wrappers
//!
//! A wrapped tensor can outlive the transform call that wrapped it (it can
//! be returned, or captured by a closure). Its wrapper then refers to a
//! popped layer. Rather than invalidating every such tensor when a layer
//! is popped, each wrapper checks its layer's liveness at the point of
//! use, and [`unwrap_if_dead`] strips the stale layers.

pub mod tensor;
pub mod wrapped;

pub use tensor::{Tensor, TensorId, Wrapper, WrapperKind};
pub use wrapped::{
    dump_tensor, get_unwrapped, is_batched_tensor, is_functional_tensor,
    is_functorch_wrapped_tensor, is_gradtracking_tensor, maybe_get_bdim, maybe_get_level,
    remove_batch_dim, unwrap_dead_wrappers, unwrap_for_grad, unwrap_functional_tensor,
    unwrap_if_dead,
};
