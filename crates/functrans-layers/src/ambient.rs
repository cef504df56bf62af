//! # Ambient State
//!
//! Process-level flags that transforms save on entry and restore on exit.
//! A [`LayerStack`](crate::LayerStack) owns one `AmbientState`; grad and jvp
//! layers capture the relevant flag at push time and put it back on pop.
//!
//! `AmbientState` doubles as runtime configuration: it deserializes with
//! per-field defaults, so a script or embedding can state only the flags it
//! wants to differ from a fresh process.

use serde::{Deserialize, Serialize};

/// Flags consulted by the dispatcher and by autograd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbientState {
    /// Whether autograd records operations.
    pub grad_enabled: bool,
    /// Whether forward-mode AD records tangents.
    pub fwd_grad_enabled: bool,
    /// Whether the dispatcher routes through the layer stack at all.
    pub dynamic_layer_keys_included: bool,
    /// Whether in-place `requires_grad_()` is permitted inside transforms.
    pub inplace_requires_grad_allowed: bool,
}

impl AmbientState {
    /// State of a fresh process: grad on, no transform interception.
    pub const fn new() -> Self {
        Self {
            grad_enabled: true,
            fwd_grad_enabled: true,
            dynamic_layer_keys_included: false,
            inplace_requires_grad_allowed: true,
        }
    }
}

impl Default for AmbientState {
    fn default() -> Self {
        Self::new()
    }
}
