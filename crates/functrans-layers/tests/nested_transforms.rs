//! # Integration Tests for functrans-layers
//!
//! Nested transform scenarios driven through an explicit `LayerStack`:
//! ambient grad-mode restoration, dead-wrapper reclamation after a
//! transform returns, and the interaction of lift, wrap and unwrap across
//! levels.

use functrans_core::{Level, TransformError, TransformKind};
use functrans_layers::{
    GradInterpreterPtr, LayerSpec, LayerStack, VmapInterpreterPtr,
};
use functrans_tensor::{
    get_unwrapped, is_batched_tensor, is_functorch_wrapped_tensor, is_gradtracking_tensor,
    maybe_get_bdim, maybe_get_level, remove_batch_dim, unwrap_dead_wrappers, unwrap_for_grad,
    unwrap_if_dead, Tensor,
};

fn level(n: u64) -> Level {
    Level::new(n).unwrap()
}

// -- Single Layer -------------------------------------------------------------

#[test]
fn test_vmap_push_peek_pop() {
    let mut stack = LayerStack::new();
    let lvl = stack.push(LayerSpec::vmap(8)).unwrap();
    assert_eq!(lvl, level(1));

    let top = stack.peek().unwrap();
    assert_eq!(top.level(), level(1));
    assert_eq!(top.key(), TransformKind::Vmap);

    let layer = stack.resolve(top).unwrap();
    assert_eq!(VmapInterpreterPtr::try_from(layer).unwrap().batch_size(), 8);

    stack.pop().unwrap();
    assert!(stack.is_empty());
    assert_eq!(stack.dispatch_key(), TransformKind::Torch);
}

#[test]
fn test_pop_and_peek_on_empty_stack() {
    let mut stack = LayerStack::new();
    assert!(matches!(
        stack.pop(),
        Err(TransformError::StackUnderflow { .. })
    ));
    assert!(matches!(
        stack.peek(),
        Err(TransformError::StackUnderflow { .. })
    ));
}

// -- Ambient Restoration ------------------------------------------------------

#[test]
fn test_grad_over_vmap_restores_grad_mode() {
    let mut stack = LayerStack::new();
    stack.set_grad_enabled(false);

    assert_eq!(stack.push(LayerSpec::Grad).unwrap(), level(1));
    assert!(stack.is_grad_enabled());
    assert_eq!(stack.push(LayerSpec::vmap(4)).unwrap(), level(2));

    assert_eq!(stack.pop().unwrap().key(), TransformKind::Vmap);
    assert!(stack.is_grad_enabled());
    assert_eq!(stack.pop().unwrap().key(), TransformKind::Grad);

    assert!(stack.is_empty());
    assert!(!stack.is_grad_enabled());
}

#[test]
fn test_jvp_inside_grad_restores_both_modes() {
    let mut stack = LayerStack::new();
    stack.set_grad_enabled(false);
    stack.set_fwd_grad_enabled(false);
    stack
        .scoped(LayerSpec::Grad, |stack, _| {
            stack
                .scoped(LayerSpec::Jvp, |stack, _| {
                    assert!(stack.is_grad_enabled());
                    assert!(stack.is_fwd_grad_enabled());
                })
                .unwrap();
            assert!(stack.is_grad_enabled());
            assert!(!stack.is_fwd_grad_enabled());
        })
        .unwrap();
    assert!(!stack.is_grad_enabled());
    assert!(!stack.is_fwd_grad_enabled());
}

// -- Dead Wrappers ------------------------------------------------------------

#[test]
fn test_wrapper_dies_with_its_layer() {
    let mut stack = LayerStack::new();
    stack.push(LayerSpec::vmap(3)).unwrap();
    let lvl = stack.push(LayerSpec::Grad).unwrap();
    assert_eq!(lvl, level(2));

    let base = Tensor::new(&[2, 2]);
    let wrapped = stack.wrap_for_grad(&base, lvl).unwrap();
    assert!(wrapped.wrapper().unwrap().is_alive());
    // While the layer is live, nothing is peeled.
    assert_eq!(unwrap_if_dead(&wrapped), wrapped);

    stack.pop().unwrap();
    assert_eq!(unwrap_if_dead(&wrapped), base);
    assert_eq!(unwrap_if_dead(&unwrap_if_dead(&wrapped)), base);
}

#[test]
fn test_escaped_tensor_keeps_live_outer_wrapper() {
    let mut stack = LayerStack::new();
    let outer = stack.push(LayerSpec::Grad).unwrap();
    let base = Tensor::new(&[4]);
    let x = stack.wrap_for_grad(&base, outer).unwrap();

    let inner = stack.push(LayerSpec::Grad).unwrap();
    let y = stack.wrap_for_grad(&x, inner).unwrap();
    stack.pop().unwrap();

    // The inner grad returned; its result is seen through the outer layer.
    let escaped = unwrap_if_dead(&y);
    assert_eq!(escaped, x);
    assert_eq!(maybe_get_level(&escaped), Some(outer));
}

#[test]
fn test_level_reuse_does_not_revive_old_wrappers() {
    let mut stack = LayerStack::new();
    let lvl = stack.push(LayerSpec::Grad).unwrap();
    let old = stack.wrap_for_grad(&Tensor::scalar(), lvl).unwrap();
    stack.pop().unwrap();

    let reused = stack.push(LayerSpec::Grad).unwrap();
    assert_eq!(reused, lvl);
    assert!(!old.wrapper().unwrap().is_alive());
    assert!(!is_functorch_wrapped_tensor(&unwrap_if_dead(&old)));
}

#[test]
fn test_unwrap_dead_wrappers_over_inputs() {
    let mut stack = LayerStack::new();
    let lvl = stack.push(LayerSpec::functionalize(false)).unwrap();
    let a = Tensor::new(&[1]);
    let b = Tensor::new(&[2]);
    let wa = stack.wrap_functional_tensor(&a, lvl).unwrap();
    stack.pop().unwrap();

    let out = unwrap_dead_wrappers(&[wa, b.clone()]);
    assert_eq!(out, vec![a, b]);
}

// -- Lift / Unwrap Across Levels ----------------------------------------------

#[test]
fn test_lift_then_unwrap_for_grad() {
    let mut stack = LayerStack::new();
    stack.push(LayerSpec::Grad).unwrap();
    let x = Tensor::new(&[3]);

    let lifted = {
        let view = GradInterpreterPtr::try_from(stack.top().unwrap()).unwrap();
        view.lift(&x).unwrap()
    };
    assert!(is_gradtracking_tensor(&lifted));
    assert_eq!(unwrap_for_grad(&lifted, level(1)), x);
    // Wrong level: left alone.
    assert_eq!(unwrap_for_grad(&lifted, level(2)), lifted);
}

#[test]
fn test_vmap_over_grad_batches_grad_wrapped_tensor() {
    let mut stack = LayerStack::new();
    let vmap = stack.push(LayerSpec::vmap(5)).unwrap();
    let grad = stack.push(LayerSpec::Grad).unwrap();

    let batched = stack.add_batch_dim(&Tensor::new(&[5, 2]), 0, vmap).unwrap();
    assert!(is_batched_tensor(&batched));
    assert_eq!(batched.shape(), vec![2]);

    let tracked = stack.wrap_for_grad(&batched, grad).unwrap();
    assert_eq!(tracked.depth(), 2);
    assert_eq!(get_unwrapped(&tracked).unwrap(), batched);

    let (inner, bdim) = remove_batch_dim(&get_unwrapped(&tracked).unwrap(), vmap);
    assert_eq!(bdim, Some(0));
    assert_eq!(inner.shape(), vec![5, 2]);
}

#[test]
fn test_batch_size_must_match_vmap_layer() {
    let mut stack = LayerStack::new();
    let lvl = stack.push(LayerSpec::vmap(5)).unwrap();
    let err = stack.add_batch_dim(&Tensor::new(&[4, 2]), 0, lvl).unwrap_err();
    assert_eq!(
        err,
        TransformError::BatchSizeMismatch {
            expected: 5,
            actual: 4
        }
    );
}

#[test]
fn test_never_wrapped_tensor_queries() {
    let t = Tensor::new(&[2, 3]);
    assert_eq!(maybe_get_level(&t), None);
    assert_eq!(maybe_get_bdim(&t), None);
    assert!(matches!(
        get_unwrapped(&t),
        Err(TransformError::NotWrapped { .. })
    ));
}

// -- Temporary Pop ------------------------------------------------------------

#[test]
fn test_with_top_popped_wraps_for_next_layer() {
    let mut stack = LayerStack::new();
    let outer = stack.push(LayerSpec::Grad).unwrap();
    stack.push(LayerSpec::vmap(2)).unwrap();

    let x = Tensor::scalar();
    let wrapped = stack
        .with_top_popped(|s| {
            let lvl = s.current_level().unwrap();
            s.wrap_for_grad(&x, lvl).unwrap()
        })
        .unwrap();
    assert_eq!(maybe_get_level(&wrapped), Some(outer));
    assert_eq!(stack.peek().unwrap().key(), TransformKind::Vmap);
}
