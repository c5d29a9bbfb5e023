//! Cleanup hook registry.

use std::collections::BTreeMap;

use super::Environment;

pub type CleanupHook = Box<dyn FnOnce(&mut Environment) + 'static>;

/// Returned by [`Environment::add_cleanup_hook`], used to remove the hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CleanupHookId(u64);

/// Hooks keyed by insertion order.
#[derive(Default)]
pub(crate) struct CleanupHooks {
    hooks: BTreeMap<u64, CleanupHook>,
    next: u64,
}

impl CleanupHooks {
    pub(crate) fn add(&mut self, hook: CleanupHook) -> CleanupHookId {
        let id = self.next;
        self.next += 1;
        self.hooks.insert(id, hook);
        CleanupHookId(id)
    }

    pub(crate) fn remove(&mut self, id: CleanupHookId) -> bool {
        self.hooks.remove(&id.0).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.hooks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Ids currently registered, newest first.
    pub(crate) fn batch(&self) -> Vec<CleanupHookId> {
        self.hooks.keys().rev().map(|&id| CleanupHookId(id)).collect()
    }

    pub(crate) fn take(&mut self, id: CleanupHookId) -> Option<CleanupHook> {
        self.hooks.remove(&id.0)
    }
}
