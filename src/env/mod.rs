//! The runtime environment: one per realm, owned by the main thread.
//!
//! The environment owns the event loop, the async-id stack, the cleanup,
//! before-exit and at-exit callback lists, the exit code, and the realm it
//! was created with. Every mutation happens on the thread that created it.

mod async_hooks;
mod cleanup;

pub use async_hooks::{AsyncContext, AsyncHooks, AsyncId};
pub use cleanup::{CleanupHook, CleanupHookId};

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::engine::{Realm, RealmHost};
use crate::error::{
    EXIT_EXCEPTION_HANDLER_FAILED, EXIT_UNCAUGHT_EXCEPTION, ScriptError, StartupError,
};
use crate::event_loop::{EventLoop, LoopHandle, RunMode};
use crate::invariant::{check, fatal_error};
use crate::isolate_data::IsolateData;
use crate::platform::{InstanceId, Platform};
use crate::process::ProcessSnapshot;
use crate::thread_pool_work::WorkState;

use cleanup::CleanupHooks;

pub type BeforeExitCallback = Box<dyn FnMut(&mut Environment) + 'static>;
pub type AtExitCallback = Box<dyn FnOnce(&mut Environment) + 'static>;

/// Exit code, exiting flag and exit request, shared with the realm so
/// managed code can read and change them.
#[derive(Clone, Default)]
pub struct ProcessState(Rc<ProcessStateInner>);

#[derive(Default)]
struct ProcessStateInner {
    exit_code: Cell<i32>,
    exiting: Cell<bool>,
    exit_requested: Cell<bool>,
}

impl ProcessState {
    pub fn exit_code(&self) -> i32 {
        self.0.exit_code.get()
    }

    pub fn set_exit_code(&self, code: i32) {
        self.0.exit_code.set(code);
    }

    pub fn exiting(&self) -> bool {
        self.0.exiting.get()
    }

    pub fn set_exiting(&self, exiting: bool) {
        self.0.exiting.set(exiting);
    }

    /// `process.reallyExit(code)`: record the code and ask the run loop to
    /// finish without further notifications. The loop must be stopped too.
    pub fn request_exit(&self, code: i32) {
        self.0.exit_code.set(code);
        self.0.exit_requested.set(true);
    }

    pub fn exit_requested(&self) -> bool {
        self.0.exit_requested.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupStage {
    NotStarted,
    Running,
    Finished,
}

pub struct Environment {
    isolate_data: Arc<IsolateData>,
    realm: Box<dyn Realm>,
    event_loop: EventLoop,
    async_hooks: AsyncHooks,
    process: ProcessState,
    cleanup_hooks: CleanupHooks,
    before_exit_callbacks: Vec<BeforeExitCallback>,
    at_exit_callbacks: Vec<AtExitCallback>,
    callback_scope_depth: usize,
    can_call_into_js: bool,
    started: bool,
    cleanup: CleanupStage,
    stop_requested: bool,
    waiting_requests: usize,
    work_requests: HashMap<u64, Arc<WorkState>>,
    next_work_request: u64,
    is_main_thread: bool,
    profiling: bool,
    argv: Vec<String>,
    exec_argv: Vec<String>,
}

impl Environment {
    /// Bind a new environment to `realm` and start its event loop.
    pub fn new(isolate_data: Arc<IsolateData>, mut realm: Box<dyn Realm>) -> Result<Self, StartupError> {
        let event_loop = EventLoop::new(isolate_data.config().threadpool_size)?;
        let process = ProcessState::default();

        realm.attach(RealmHost {
            process: process.clone(),
            event_loop: event_loop.handle(),
            zero_fill: isolate_data.zero_fill_toggle(),
        });

        tracing::debug!(instance = %isolate_data.instance_id(), "environment created");

        Ok(Self {
            isolate_data,
            realm,
            event_loop,
            async_hooks: AsyncHooks::new(),
            process,
            cleanup_hooks: CleanupHooks::default(),
            before_exit_callbacks: Vec::new(),
            at_exit_callbacks: Vec::new(),
            callback_scope_depth: 0,
            can_call_into_js: true,
            started: false,
            cleanup: CleanupStage::NotStarted,
            stop_requested: false,
            waiting_requests: 0,
            work_requests: HashMap::new(),
            next_work_request: 0,
            is_main_thread: true,
            profiling: false,
            argv: Vec::new(),
            exec_argv: Vec::new(),
        })
    }

    /// One-time setup: hand the process snapshot to the realm.
    pub fn start(&mut self, args: Vec<String>, exec_args: Vec<String>, profiling: bool) {
        check(!self.started, "Environment::start called twice");
        self.started = true;
        self.profiling = profiling;

        let snapshot = ProcessSnapshot::capture(
            &args,
            &exec_args,
            self.isolate_data.engine_name(),
            self.isolate_data.engine_version(),
        );

        self.realm.setup_process_object(&snapshot);
        self.argv = args;
        self.exec_argv = exec_args;

        tracing::debug!(argc = self.argv.len(), profiling, "environment started");
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn isolate_data(&self) -> &Arc<IsolateData> {
        &self.isolate_data
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.isolate_data.config()
    }

    pub fn instance_id(&self) -> InstanceId {
        self.isolate_data.instance_id()
    }

    pub fn platform(&self) -> &Arc<Platform> {
        self.isolate_data.platform()
    }

    pub fn realm(&self) -> &dyn Realm {
        self.realm.as_ref()
    }

    pub fn realm_mut(&mut self) -> &mut dyn Realm {
        self.realm.as_mut()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn event_loop_mut(&mut self) -> &mut EventLoop {
        &mut self.event_loop
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.event_loop.handle()
    }

    pub fn async_hooks(&self) -> &AsyncHooks {
        &self.async_hooks
    }

    pub fn async_hooks_mut(&mut self) -> &mut AsyncHooks {
        &mut self.async_hooks
    }

    pub fn process_state(&self) -> &ProcessState {
        &self.process
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn exec_argv(&self) -> &[String] {
        &self.exec_argv
    }

    pub fn profiling(&self) -> bool {
        self.profiling
    }

    pub fn is_main_thread(&self) -> bool {
        self.is_main_thread
    }

    pub fn exit_code(&self) -> i32 {
        self.process.exit_code()
    }

    pub fn set_exit_code(&mut self, code: i32) {
        self.process.set_exit_code(code);
    }

    pub fn exiting(&self) -> bool {
        self.process.exiting()
    }

    /// False once cleanup finished or an exit was requested.
    pub fn can_call_into_js(&self) -> bool {
        self.can_call_into_js && !self.process.exit_requested()
    }

    pub fn set_can_call_into_js(&mut self, can_call: bool) {
        self.can_call_into_js = can_call;
    }

    pub fn callback_scope_depth(&self) -> usize {
        self.callback_scope_depth
    }

    pub(crate) fn enter_callback_scope(&mut self) {
        self.callback_scope_depth += 1;
    }

    pub(crate) fn leave_callback_scope(&mut self) {
        check(self.callback_scope_depth > 0, "callback scope depth underflow");
        self.callback_scope_depth -= 1;
    }

    /// End the run loop at the next transition with the current exit code.
    pub fn request_stop(&mut self) {
        if !self.stop_requested {
            tracing::debug!(code = self.exit_code(), "stop requested");
        }

        self.stop_requested = true;
        self.event_loop.stop();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_requested || self.process.exit_requested()
    }

    /// Exit with `code` as soon as the current callback returns. Unlike
    /// [`request_stop`](Self::request_stop), no `beforeExit` or `exit`
    /// notification follows; cleanup hooks and at-exit callbacks still run.
    pub fn exit(&mut self, code: i32) {
        tracing::debug!(code, "exit requested");
        self.process.request_exit(code);
        self.event_loop.stop();
    }

    pub fn exit_requested(&self) -> bool {
        self.process.exit_requested()
    }

    /// Terminate on the spot.
    #[track_caller]
    pub fn abort(&self, reason: &str) -> ! {
        fatal_error(format!("process aborted: {}", reason))
    }

    /// Requests keeping the loop alive (pool work, spawned requests).
    pub fn active_requests(&self) -> usize {
        self.event_loop.in_flight()
    }

    /// Referenced handles keeping the loop alive.
    pub fn active_handles(&self) -> usize {
        self.event_loop.referenced_handles()
    }

    /// Deliver a process warning to managed code. Falls back to the log if
    /// managed code cannot run or does not take it. Returns whether managed
    /// code took it.
    pub fn emit_warning(&mut self, warning: &str) -> bool {
        let delivered = if self.can_call_into_js() {
            match self.realm.emit_warning(warning) {
                Ok(delivered) => delivered,
                Err(error) => {
                    self.trigger_fatal_exception(&error);
                    false
                }
            }
        } else {
            false
        };

        if !delivered {
            tracing::warn!(warning, "process warning");
        }

        delivered
    }

    /// Run the event loop in `mode`. Returns whether it is still alive.
    pub fn run_event_loop(&mut self, mode: RunMode) -> bool {
        let mut dispatched = false;

        loop {
            while let Some(completion) = self.event_loop.try_next() {
                completion(self);
                dispatched = true;

                if self.event_loop.stop_flag() {
                    break;
                }
            }

            if self.event_loop.stop_flag() || !self.event_loop.is_alive() {
                break;
            }

            match mode {
                RunMode::NoWait => break,
                RunMode::Once if dispatched => break,
                _ => {}
            }

            match self.event_loop.wait_next() {
                Some(completion) => {
                    completion(self);
                    dispatched = true;
                }
                None => break,
            }

            if mode == RunMode::Once {
                // Dispatch whatever became ready alongside it, then return.
                while !self.event_loop.stop_flag() {
                    match self.event_loop.try_next() {
                        Some(completion) => completion(self),
                        None => break,
                    }
                }
                break;
            }
        }

        self.event_loop.take_stop_flag();
        self.event_loop.is_alive()
    }

    /// Wait for background work, then run foreground platform tasks for
    /// this instance until none are left.
    pub fn drain_platform_tasks(&mut self) {
        self.platform().drain_tasks(self.instance_id());
        self.realm.drain_engine_tasks();
    }

    pub fn cancel_platform_tasks(&mut self) {
        self.platform().cancel_pending_tasks(self.instance_id());
    }

    /// Report an exception that escaped managed code.
    ///
    /// The realm's handler gets the first look. If nothing handles it the
    /// exit code becomes 1 (7 if the handler threw) and the loop is stopped.
    pub fn trigger_fatal_exception(&mut self, error: &ScriptError) {
        // Engines unwind managed frames when an exit is requested.
        if self.process.exit_requested() {
            tracing::debug!(error = %error, "exception while exiting");
            return;
        }

        if self.config().abort_on_uncaught_exception {
            fatal_error(format!("uncaught exception: {}", error));
        }

        if !self.can_call_into_js {
            tracing::error!(error = %error, "exception after managed calls were disabled");
            return;
        }

        match self.realm.handle_uncaught_exception(error) {
            Ok(true) => {
                tracing::debug!(error = %error, "uncaught exception handled");
            }
            Ok(false) => {
                tracing::error!(
                    error = %error,
                    stack = error.stack.as_deref().unwrap_or(""),
                    "uncaught exception"
                );

                if self.exit_code() == 0 {
                    self.set_exit_code(EXIT_UNCAUGHT_EXCEPTION);
                }

                self.request_stop();
            }
            Err(handler_error) => {
                tracing::error!(
                    error = %error,
                    handler_error = %handler_error,
                    "uncaught exception handler threw"
                );
                self.set_exit_code(EXIT_EXCEPTION_HANDLER_FAILED);
                self.request_stop();
            }
        }
    }

    pub fn add_cleanup_hook(&mut self, hook: impl FnOnce(&mut Environment) + 'static) -> CleanupHookId {
        self.cleanup_hooks.add(Box::new(hook))
    }

    /// Returns whether the hook was still registered.
    pub fn remove_cleanup_hook(&mut self, id: CleanupHookId) -> bool {
        self.cleanup_hooks.remove(id)
    }

    pub fn cleanup_hook_count(&self) -> usize {
        self.cleanup_hooks.len()
    }

    /// Register a callback that runs on every before-exit pass, ahead of
    /// the managed `beforeExit` notification.
    pub fn before_exit(&mut self, callback: impl FnMut(&mut Environment) + 'static) {
        self.before_exit_callbacks.push(Box::new(callback));
    }

    pub(crate) fn run_before_exit_callbacks(&mut self) {
        let mut callbacks = std::mem::take(&mut self.before_exit_callbacks);

        for callback in callbacks.iter_mut() {
            callback(self);
        }

        // Keep callbacks registered while these ran, after the older ones.
        callbacks.append(&mut self.before_exit_callbacks);
        self.before_exit_callbacks = callbacks;
    }

    /// Register a callback for process exit. Callbacks run newest first.
    pub fn at_exit(&mut self, callback: impl FnOnce(&mut Environment) + 'static) {
        self.at_exit_callbacks.push(Box::new(callback));
    }

    pub fn run_at_exit_callbacks(&mut self) {
        while let Some(callback) = self.at_exit_callbacks.pop() {
            callback(self);
        }
    }

    pub fn cleanup_started(&self) -> bool {
        self.cleanup != CleanupStage::NotStarted
    }

    pub fn cleanup_finished(&self) -> bool {
        self.cleanup == CleanupStage::Finished
    }

    /// Tear the environment down.
    ///
    /// Cancels queued thread-pool work, runs the loop until every
    /// outstanding request has completed, then runs cleanup hooks newest
    /// first, in batches, until none are left. Hooks added while a batch
    /// runs go into the next batch; hooks removed before their turn are
    /// skipped. Calling it again does nothing.
    pub fn run_cleanup(&mut self) {
        if self.cleanup != CleanupStage::NotStarted {
            return;
        }

        self.cleanup = CleanupStage::Running;
        tracing::debug!(
            waiting_requests = self.waiting_requests,
            hooks = self.cleanup_hooks.len(),
            "running cleanup"
        );

        for state in self.work_requests.values() {
            let _ = state.cancel();
        }

        while self.waiting_requests > 0 {
            if !self.event_loop.is_alive() {
                tracing::error!(
                    waiting_requests = self.waiting_requests,
                    "requests outstanding but event loop is idle"
                );
                break;
            }

            self.run_event_loop(RunMode::Once);
        }

        while !self.cleanup_hooks.is_empty() {
            for id in self.cleanup_hooks.batch() {
                if let Some(hook) = self.cleanup_hooks.take(id) {
                    hook(self);
                }
            }
        }

        self.can_call_into_js = false;
        self.cleanup = CleanupStage::Finished;
        tracing::debug!("cleanup finished");
    }

    pub fn waiting_requests(&self) -> usize {
        self.waiting_requests
    }

    pub(crate) fn increase_waiting_request_counter(&mut self) {
        self.waiting_requests += 1;
    }

    pub(crate) fn decrease_waiting_request_counter(&mut self) {
        check(self.waiting_requests > 0, "waiting request counter underflow");
        self.waiting_requests -= 1;
    }

    pub(crate) fn track_work_request(&mut self, state: Arc<WorkState>) -> u64 {
        let id = self.next_work_request;
        self.next_work_request += 1;
        self.work_requests.insert(id, state);
        id
    }

    pub(crate) fn untrack_work_request(&mut self, id: u64) {
        self.work_requests.remove(&id);
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.realm.dispose();

        if std::thread::panicking() {
            return;
        }

        let holds_resources =
            !self.cleanup_hooks.is_empty() || !self.work_requests.is_empty() || self.waiting_requests > 0;

        check(
            self.cleanup == CleanupStage::Finished || (!self.started && !holds_resources),
            "Environment dropped before cleanup ran",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::closure::{ClosureEngine, ClosureRealm};
    use crate::engine::Engine;
    use std::cell::RefCell;

    fn environment() -> Environment {
        let platform = Platform::new(1);
        let id = platform.register_instance();
        let mut engine = ClosureEngine::new();
        engine.initialize(id, Arc::clone(&platform)).unwrap();

        let data = Arc::new(IsolateData::new(id, platform, None, Arc::new(RuntimeConfig::default())));
        let realm = engine.new_context(&data).unwrap();
        Environment::new(data, realm).unwrap()
    }

    #[test]
    #[should_panic(expected = "Environment::start called twice")]
    fn test_double_start_is_fatal() {
        let mut env = environment();
        env.start(vec![], vec![], false);
        env.start(vec![], vec![], false);
    }

    #[test]
    #[should_panic(expected = "Environment dropped before cleanup ran")]
    fn test_drop_with_pending_cleanup_hook_is_fatal() {
        let mut env = environment();
        env.add_cleanup_hook(|_| {});
        drop(env);
    }

    #[test]
    #[should_panic(expected = "Environment dropped before cleanup ran")]
    fn test_drop_started_environment_without_cleanup_is_fatal() {
        let mut env = environment();
        env.start(vec![], vec![], false);
        drop(env);
    }

    #[test]
    fn test_drop_unused_environment_is_fine() {
        let env = environment();
        drop(env);
    }

    #[test]
    #[should_panic(expected = "process aborted: requested by test")]
    fn test_abort_is_fatal() {
        let env = environment();
        env.abort("requested by test");
    }

    #[test]
    fn test_exit_stops_loop_and_disables_managed_calls() {
        let mut env = environment();
        let handle = env.loop_handle();
        let _keepalive = handle.ref_handle();

        handle.queue(|env| env.exit(4));

        assert!(env.run_event_loop(RunMode::Default));
        assert!(env.exit_requested());
        assert!(env.is_stopping());
        assert!(!env.can_call_into_js());
        assert_eq!(env.exit_code(), 4);

        // Exceptions unwinding out of an exiting realm change nothing.
        env.trigger_fatal_exception(&ScriptError::new("terminated"));
        assert_eq!(env.exit_code(), 4);
        env.run_cleanup();
    }

    #[test]
    fn test_activity_counts() {
        let env = environment();
        assert_eq!(env.active_requests(), 0);
        assert_eq!(env.active_handles(), 0);

        let request = env.event_loop().begin_request();
        let handle = env.loop_handle().ref_handle();
        assert_eq!(env.active_requests(), 1);
        assert_eq!(env.active_handles(), 1);

        drop(request);
        drop(handle);
        assert_eq!(env.active_requests(), 0);
    }

    #[test]
    fn test_warning_without_listener_goes_to_log() {
        let mut env = environment();
        assert!(!env.emit_warning("disk almost full"));
        env.run_cleanup();
        assert!(!env.emit_warning("after cleanup"));
    }

    #[test]
    fn test_managed_code_flips_zero_fill() {
        let platform = Platform::new(1);
        let id = platform.register_instance();
        let allocator = crate::allocator::ArrayBufferAllocator::new(None, false);
        let data = Arc::new(IsolateData::new(
            id,
            Arc::clone(&platform),
            Some(Arc::clone(&allocator)),
            Arc::new(RuntimeConfig::default()),
        ));

        let mut engine = ClosureEngine::new();
        engine.initialize(id, platform).unwrap();
        let realm = engine.new_context(&data).unwrap();
        let mut env = Environment::new(data, realm).unwrap();

        let realm = env.realm_mut().as_any_mut().downcast_mut::<ClosureRealm>().unwrap();
        realm.scope().set_zero_fill(false).unwrap();
        assert!(!allocator.should_zero_fill());

        realm.scope().set_zero_fill(true).unwrap();
        assert!(allocator.should_zero_fill());
    }

    #[test]
    fn test_cleanup_hooks_run_newest_first() {
        let mut env = environment();
        let order = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b", "c"] {
            let order = Rc::clone(&order);
            env.add_cleanup_hook(move |_| order.borrow_mut().push(name));
        }

        env.run_cleanup();
        assert_eq!(*order.borrow(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_cleanup_hook_added_during_cleanup_runs() {
        let mut env = environment();
        let order = Rc::new(RefCell::new(Vec::new()));

        let outer = Rc::clone(&order);
        env.add_cleanup_hook(move |env| {
            outer.borrow_mut().push("first");
            let inner = Rc::clone(&outer);
            env.add_cleanup_hook(move |_| inner.borrow_mut().push("late"));
        });

        env.run_cleanup();
        assert_eq!(*order.borrow(), vec!["first", "late"]);
    }

    #[test]
    fn test_cleanup_hook_removed_by_sibling_is_skipped() {
        let mut env = environment();
        let ran = Rc::new(Cell::new(false));

        let flag = Rc::clone(&ran);
        let victim = env.add_cleanup_hook(move |_| flag.set(true));
        env.add_cleanup_hook(move |env| {
            assert!(env.remove_cleanup_hook(victim));
        });

        env.run_cleanup();
        assert!(!ran.get());
    }

    #[test]
    fn test_run_cleanup_is_idempotent() {
        let mut env = environment();
        let runs = Rc::new(Cell::new(0));

        let counter = Rc::clone(&runs);
        env.add_cleanup_hook(move |_| counter.set(counter.get() + 1));

        env.run_cleanup();
        env.run_cleanup();
        assert_eq!(runs.get(), 1);
        assert!(env.cleanup_finished());
        assert!(!env.can_call_into_js());
    }

    #[test]
    fn test_at_exit_runs_lifo() {
        let mut env = environment();
        let order = Rc::new(RefCell::new(Vec::new()));

        for n in 1..=3 {
            let order = Rc::clone(&order);
            env.at_exit(move |_| order.borrow_mut().push(n));
        }

        env.run_at_exit_callbacks();
        env.run_at_exit_callbacks();
        assert_eq!(*order.borrow(), vec![3, 2, 1]);
    }

    #[test]
    fn test_before_exit_callbacks_persist() {
        let mut env = environment();
        let runs = Rc::new(Cell::new(0));

        let counter = Rc::clone(&runs);
        env.before_exit(move |_| counter.set(counter.get() + 1));

        env.run_before_exit_callbacks();
        env.run_before_exit_callbacks();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn test_run_event_loop_dispatches_local_completions() {
        let mut env = environment();
        let seen = Rc::new(Cell::new(0));

        let handle = env.loop_handle();
        let counter = Rc::clone(&seen);
        handle.queue(move |env| {
            counter.set(counter.get() + 1);
            let again = Rc::clone(&counter);
            env.loop_handle().queue(move |_| again.set(again.get() + 1));
        });

        assert!(!env.run_event_loop(RunMode::Default));
        assert_eq!(seen.get(), 2);
    }

    #[test]
    fn test_request_stop_interrupts_run() {
        let mut env = environment();
        let handle = env.loop_handle();
        let _keepalive = handle.ref_handle();

        handle.queue(|env| env.request_stop());

        // The referenced handle would keep a default run going forever.
        assert!(env.run_event_loop(RunMode::Default));
        assert!(env.is_stopping());
    }
}
