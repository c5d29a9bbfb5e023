//! Async-id bookkeeping.
//!
//! Every entry into managed code runs under an (async id, trigger id) pair.
//! Entering pushes the pair that was current and installs the new one;
//! leaving checks that the id being left is the one on top and restores the
//! saved pair. A mismatch means a scope was leaked or closed out of order,
//! and nothing downstream can trust the ids any more, so it is fatal.

use crate::invariant::fatal_error;

pub type AsyncId = u64;

/// The ids a callback runs under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsyncContext {
    pub async_id: AsyncId,
    pub trigger_async_id: AsyncId,
}

impl AsyncContext {
    pub const fn new(async_id: AsyncId, trigger_async_id: AsyncId) -> Self {
        Self {
            async_id,
            trigger_async_id,
        }
    }
}

#[derive(Debug)]
pub struct AsyncHooks {
    execution_async_id: AsyncId,
    trigger_async_id: AsyncId,
    /// Saved (execution, trigger) pairs, innermost last
    stack: Vec<(AsyncId, AsyncId)>,
    id_counter: AsyncId,
}

impl Default for AsyncHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncHooks {
    pub fn new() -> Self {
        Self {
            execution_async_id: 0,
            trigger_async_id: 0,
            stack: Vec::new(),
            // 1 is reserved for the bootstrap scope
            id_counter: 1,
        }
    }

    pub fn execution_async_id(&self) -> AsyncId {
        self.execution_async_id
    }

    pub fn trigger_async_id(&self) -> AsyncId {
        self.trigger_async_id
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Snapshot of the saved pairs, for balance checks.
    pub fn stack(&self) -> &[(AsyncId, AsyncId)] {
        &self.stack
    }

    pub fn new_async_id(&mut self) -> AsyncId {
        self.id_counter += 1;
        self.id_counter
    }

    pub fn push_async_ids(&mut self, async_id: AsyncId, trigger_async_id: AsyncId) {
        self.stack
            .push((self.execution_async_id, self.trigger_async_id));
        self.execution_async_id = async_id;
        self.trigger_async_id = trigger_async_id;

        tracing::trace!(async_id, trigger_async_id, depth = self.stack.len(), "push async ids");
    }

    /// Leave `async_id`. Returns whether entries remain below it.
    ///
    /// Popping an empty stack is a no-op that returns false, which lets a
    /// scope close after [`clear_async_id_stack`](Self::clear_async_id_stack).
    pub fn pop_async_id(&mut self, async_id: AsyncId) -> bool {
        let Some(&(saved_execution, saved_trigger)) = self.stack.last() else {
            return false;
        };

        if self.execution_async_id != async_id {
            fatal_error(format!(
                "async hook stack has become corrupted (actual: {}, expected: {})",
                self.execution_async_id, async_id
            ));
        }

        self.stack.pop();
        self.execution_async_id = saved_execution;
        self.trigger_async_id = saved_trigger;

        tracing::trace!(async_id, depth = self.stack.len(), "pop async id");
        !self.stack.is_empty()
    }

    /// Drop every entry and reset the current ids. Used after a failed
    /// bootstrap, when the pushed entries can no longer be popped in order.
    pub fn clear_async_id_stack(&mut self) {
        self.execution_async_id = 0;
        self.trigger_async_id = 0;
        self.stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_restores_previous_ids() {
        let mut hooks = AsyncHooks::new();

        hooks.push_async_ids(1, 0);
        hooks.push_async_ids(5, 1);
        assert_eq!(hooks.execution_async_id(), 5);
        assert_eq!(hooks.trigger_async_id(), 1);

        assert!(hooks.pop_async_id(5));
        assert_eq!(hooks.execution_async_id(), 1);
        assert_eq!(hooks.trigger_async_id(), 0);

        assert!(!hooks.pop_async_id(1));
        assert_eq!(hooks.stack_depth(), 0);
        assert_eq!(hooks.execution_async_id(), 0);
    }

    #[test]
    #[should_panic(expected = "async hook stack has become corrupted")]
    fn test_mismatched_pop_is_fatal() {
        let mut hooks = AsyncHooks::new();
        hooks.push_async_ids(1, 0);
        hooks.push_async_ids(2, 1);
        hooks.pop_async_id(1);
    }

    #[test]
    fn test_pop_on_empty_stack_is_noop() {
        let mut hooks = AsyncHooks::new();
        assert!(!hooks.pop_async_id(42));
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut hooks = AsyncHooks::new();
        hooks.push_async_ids(1, 0);
        hooks.push_async_ids(3, 1);

        hooks.clear_async_id_stack();
        assert_eq!(hooks.stack_depth(), 0);
        assert_eq!(hooks.execution_async_id(), 0);
        assert!(!hooks.pop_async_id(3));
    }

    #[test]
    fn test_new_async_ids_start_after_bootstrap_id() {
        let mut hooks = AsyncHooks::new();
        assert_eq!(hooks.new_async_id(), 2);
        assert_eq!(hooks.new_async_id(), 3);
    }
}
