//! Scopes wrapping every entry from native code into managed code.
//!
//! A [`CallbackScope`] pushes the callback's async ids when it opens and pops
//! them exactly once when it closes, whether through [`CallbackScope::close`]
//! or on drop. Closing the outermost scope also flushes the microtask queue
//! and then the tick queue, unless the scope was marked failed.
//!
//! ```text
//!            close()                      close()
//!   Open ─────────────▶ ClosedOk    Open ─────────▶ ClosedFailed
//!                                     (mark_as_failed, or the flush threw)
//! ```

use std::ops::{Deref, DerefMut};

use crate::engine::Value;
use crate::env::{AsyncContext, Environment};
use crate::error::ScriptError;
use crate::invariant::fatal_error;

/// Whether a scope must be tied to a resource object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceExpectation {
    Require,
    AllowEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Open,
    ClosedOk,
    ClosedFailed,
}

/// Derefs to the environment, so code inside the scope uses the scope as
/// its `&mut Environment`.
pub struct CallbackScope<'a> {
    env: &'a mut Environment,
    async_context: AsyncContext,
    resource: Option<Value>,
    state: ScopeState,
    failed: bool,
    pushed_ids: bool,
}

impl<'a> CallbackScope<'a> {
    pub fn new(
        env: &'a mut Environment,
        resource: Option<Value>,
        async_context: AsyncContext,
        expect: ResourceExpectation,
    ) -> Self {
        if expect == ResourceExpectation::Require && resource.is_none() {
            fatal_error("callback scope requires a resource object");
        }

        env.enter_callback_scope();

        let mut scope = Self {
            env,
            async_context,
            resource,
            state: ScopeState::Open,
            failed: false,
            pushed_ids: false,
        };

        // After the exit notification nothing may enter managed code.
        if !scope.env.can_call_into_js() {
            scope.failed = true;
            return scope;
        }

        scope.env.async_hooks_mut().push_async_ids(
            async_context.async_id,
            async_context.trigger_async_id,
        );
        scope.pushed_ids = true;

        scope
    }

    /// A scope for a callback on `resource`.
    pub fn for_resource(env: &'a mut Environment, resource: Value, async_context: AsyncContext) -> Self {
        Self::new(env, Some(resource), async_context, ResourceExpectation::Require)
    }

    pub fn async_context(&self) -> AsyncContext {
        self.async_context
    }

    pub fn resource(&self) -> Option<&Value> {
        self.resource.as_ref()
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Close without flushing. The ids are still popped.
    pub fn mark_as_failed(&mut self) {
        self.failed = true;
    }

    pub fn close(&mut self) -> ScopeState {
        if self.state != ScopeState::Open {
            return self.state;
        }

        self.finish();
        self.env.leave_callback_scope();

        self.state = if self.failed {
            ScopeState::ClosedFailed
        } else {
            ScopeState::ClosedOk
        };

        self.state
    }

    fn finish(&mut self) {
        if self.pushed_ids {
            self.env
                .async_hooks_mut()
                .pop_async_id(self.async_context.async_id);
        }

        // Nested scopes leave the flush to the outermost one.
        if self.failed || self.env.callback_scope_depth() > 1 || !self.env.can_call_into_js() {
            return;
        }

        if !self.env.realm().has_tick_scheduled()
            && let Err(error) = self.env.realm_mut().perform_microtask_checkpoint()
        {
            self.fail_with(error);
            return;
        }

        if !self.env.realm().has_tick_scheduled() || !self.env.can_call_into_js() {
            return;
        }

        if let Err(error) = self.env.realm_mut().run_tick_callback() {
            self.fail_with(error);
        }
    }

    fn fail_with(&mut self, error: ScriptError) {
        self.failed = true;
        self.env.trigger_fatal_exception(&error);
    }
}

impl Deref for CallbackScope<'_> {
    type Target = Environment;

    fn deref(&self) -> &Environment {
        self.env
    }
}

impl DerefMut for CallbackScope<'_> {
    fn deref_mut(&mut self) -> &mut Environment {
        self.env
    }
}

impl Drop for CallbackScope<'_> {
    fn drop(&mut self) {
        if self.state != ScopeState::Open {
            return;
        }

        // Unwinding from a fatal error: keep the depth consistent, touch
        // nothing else.
        if std::thread::panicking() {
            self.env.leave_callback_scope();
            return;
        }

        self.close();
    }
}

/// Call `callback` on `resource` from native code.
///
/// Returns `None` if managed code may no longer run or if the callback
/// threw. A thrown exception is reported through
/// [`Environment::trigger_fatal_exception`] before returning.
pub fn make_callback(
    env: &mut Environment,
    resource: &Value,
    callback: &Value,
    args: &[Value],
    async_context: AsyncContext,
) -> Option<Value> {
    let mut scope = CallbackScope::for_resource(env, resource.clone(), async_context);

    if scope.failed() {
        return None;
    }

    match scope.realm_mut().call(callback, Some(resource), args) {
        Ok(value) => match scope.close() {
            ScopeState::ClosedOk => Some(value),
            _ => None,
        },
        Err(error) => {
            scope.mark_as_failed();
            scope.trigger_fatal_exception(&error);
            None
        }
    }
}
