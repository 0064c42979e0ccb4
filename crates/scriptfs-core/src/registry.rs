// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation-handler registry

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::op::OpTag;
use crate::script::{HandlerResult, ScriptEnv};
use crate::value::Value;

/// A script-side operation handler. Handlers only ever run on the script
/// thread; the `Send + Sync` bound lets the reference travel with jobs.
pub trait Handler: Send + Sync {
    fn call(&self, env: &mut ScriptEnv, args: Vec<Value>) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&mut ScriptEnv, Vec<Value>) -> HandlerResult + Send + Sync,
{
    fn call(&self, env: &mut ScriptEnv, args: Vec<Value>) -> HandlerResult {
        self(env, args)
    }
}

pub type HandlerRef = Arc<dyn Handler>;

/// Map from operation tag to handler. Lookups hand out a cloned reference,
/// so a call already in flight keeps its handler alive across a
/// replacement or removal.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<OpTag, HandlerRef>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler`, returning the entry it replaced.
    pub fn register(&self, op: OpTag, handler: HandlerRef) -> Option<HandlerRef> {
        let previous = self.handlers.write().insert(op, handler);
        debug!(op = %op, replaced = previous.is_some(), "handler registered");
        previous
    }

    pub fn remove(&self, op: OpTag) -> Option<HandlerRef> {
        let previous = self.handlers.write().remove(&op);
        debug!(op = %op, existed = previous.is_some(), "handler removed");
        previous
    }

    pub fn has(&self, op: OpTag) -> bool {
        self.handlers.read().contains_key(&op)
    }

    pub fn lookup(&self, op: OpTag) -> Option<HandlerRef> {
        self.handlers.read().get(&op).cloned()
    }

    /// Whether `handler` is still the entry registered for `op`.
    pub fn is_current(&self, op: OpTag, handler: &HandlerRef) -> bool {
        self.handlers
            .read()
            .get(&op)
            .is_some_and(|h| Arc::ptr_eq(h, handler))
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn registered(&self) -> Vec<OpTag> {
        let mut ops: Vec<_> = self.handlers.read().keys().copied().collect();
        ops.sort();
        ops
    }
}
