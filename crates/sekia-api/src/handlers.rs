// SPDX-License-Identifier: MIT OR Apache-2.0
//! The registry `sekia.on` writes into and the engine dispatches from.

use std::sync::{Arc, Mutex};

/// One `sekia.on(pattern, callback)` registration.
pub struct HandlerEntry {
    /// The subscribed pattern (`*`/`>` wildcards per §3).
    pub pattern: String,
    /// The callback, kept alive in the interpreter's registry so it can be
    /// retrieved (bound to that call's `Lua` lifetime) for dispatch.
    pub key: mlua::RegistryKey,
}

/// Handlers registered by a single workflow's load-time pass.
///
/// Shared between the `sekia.on` host function (which appends to it) and
/// the engine (which reads it to wire subscriptions and to look up which
/// callback to invoke for an incoming message).
pub type HandlerRegistry = Arc<Mutex<Vec<HandlerEntry>>>;
