//! Engine backend whose managed functions are Rust closures.
//!
//! Deterministic and dependency-free: functions, plain objects, a FIFO
//! microtask queue, a tick queue and process-event listeners. Embedders and
//! tests describe "managed code" as closures receiving a [`Scope`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use crate::allocator::ArrayBufferAllocator;
use crate::config::RuntimeConfig;
use crate::env::ProcessState;
use crate::error::{ScriptError, StartupError};
use crate::event_loop::LoopHandle;
use crate::invariant::fatal_error;
use crate::isolate_data::IsolateData;
use crate::platform::{InstanceId, Platform};
use crate::process::ProcessSnapshot;

use super::{Engine, EngineFactory, NativeModuleLoader, ObjectRef, ProcessEvent, Realm, RealmHost, Value};

pub type ManagedFn = Rc<dyn Fn(&mut Scope<'_>, &[Value]) -> Result<Value, ScriptError>>;

/// Runs in a fresh context before it is handed out.
pub type ContextInit = Rc<dyn Fn(&mut Scope<'_>) -> Result<(), ScriptError>>;

type Job = Box<dyn FnOnce(&mut Scope<'_>) -> Result<(), ScriptError>>;

enum Slot {
    Object(BTreeMap<String, Value>),
    Function(ManagedFn),
}

struct RealmState {
    host: Option<RealmHost>,
    slots: HashMap<u64, Slot>,
    next_slot: u64,
    global: ObjectRef,
    process: ObjectRef,
    microtasks: VecDeque<Job>,
    ticks: VecDeque<Job>,
    listeners: HashMap<ProcessEvent, Vec<ManagedFn>>,
    uncaught_handler: Option<ManagedFn>,
    snapshot: Option<ProcessSnapshot>,
    calls: u64,
}

impl RealmState {
    fn new() -> Self {
        let mut state = Self {
            host: None,
            slots: HashMap::new(),
            next_slot: 1,
            global: ObjectRef(0),
            process: ObjectRef(0),
            microtasks: VecDeque::new(),
            ticks: VecDeque::new(),
            listeners: HashMap::new(),
            uncaught_handler: None,
            snapshot: None,
            calls: 0,
        };

        state.global = state.insert(Slot::Object(BTreeMap::new()));
        state.process = state.insert(Slot::Object(BTreeMap::new()));

        let process = Value::Object(state.process);
        if let Some(Slot::Object(global)) = state.slots.get_mut(&state.global.0) {
            global.insert("process".to_string(), process);
        }

        state
    }

    fn insert(&mut self, slot: Slot) -> ObjectRef {
        let id = self.next_slot;
        self.next_slot += 1;
        self.slots.insert(id, slot);
        ObjectRef(id)
    }

    fn resolve_function(&self, callback: &Value) -> Result<ManagedFn, ScriptError> {
        match callback {
            Value::Object(object) => match self.slots.get(&object.0) {
                Some(Slot::Function(f)) => Ok(Rc::clone(f)),
                Some(Slot::Object(_)) => Err(ScriptError::new("TypeError: object is not a function")),
                None => Err(ScriptError::new("ReferenceError: object was disposed")),
            },
            other => Err(ScriptError::new(format!("TypeError: {:?} is not a function", other))),
        }
    }

    fn object_mut(&mut self, object: &Value) -> Result<&mut BTreeMap<String, Value>, ScriptError> {
        let Value::Object(object) = object else {
            return Err(ScriptError::new("TypeError: cannot set property on a primitive"));
        };

        match self.slots.get_mut(&object.0) {
            Some(Slot::Object(properties)) => Ok(properties),
            Some(Slot::Function(_)) => Err(ScriptError::new("TypeError: functions carry no properties")),
            None => Err(ScriptError::new("ReferenceError: object was disposed")),
        }
    }
}

/// What a managed closure can do while it runs.
pub struct Scope<'a> {
    state: &'a mut RealmState,
}

impl Scope<'_> {
    /// Call a managed function.
    pub fn call(&mut self, callback: &Value, args: &[Value]) -> Result<Value, ScriptError> {
        let f = self.state.resolve_function(callback)?;
        self.state.calls += 1;
        f(self, args)
    }

    pub fn function(
        &mut self,
        f: impl Fn(&mut Scope<'_>, &[Value]) -> Result<Value, ScriptError> + 'static,
    ) -> Value {
        Value::Object(self.state.insert(Slot::Function(Rc::new(f))))
    }

    pub fn new_object(&mut self) -> Value {
        Value::Object(self.state.insert(Slot::Object(BTreeMap::new())))
    }

    pub fn set(&mut self, object: &Value, key: &str, value: Value) -> Result<(), ScriptError> {
        self.state.object_mut(object)?.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, object: &Value, key: &str) -> Value {
        match object {
            Value::Object(object) => match self.state.slots.get(&object.0) {
                Some(Slot::Object(properties)) => properties.get(key).cloned().unwrap_or_default(),
                _ => Value::Undefined,
            },
            _ => Value::Undefined,
        }
    }

    pub fn global(&self) -> Value {
        Value::Object(self.state.global)
    }

    pub fn process_object(&self) -> Value {
        Value::Object(self.state.process)
    }

    pub fn enqueue_microtask(&mut self, job: impl FnOnce(&mut Scope<'_>) -> Result<(), ScriptError> + 'static) {
        self.state.microtasks.push_back(Box::new(job));
    }

    pub fn next_tick(&mut self, job: impl FnOnce(&mut Scope<'_>) -> Result<(), ScriptError> + 'static) {
        self.state.ticks.push_back(Box::new(job));
    }

    /// `process.on(event, listener)`.
    pub fn on(
        &mut self,
        event: ProcessEvent,
        listener: impl Fn(&mut Scope<'_>, &[Value]) -> Result<Value, ScriptError> + 'static,
    ) {
        self.state
            .listeners
            .entry(event)
            .or_default()
            .push(Rc::new(listener));
    }

    pub fn set_uncaught_exception_handler(
        &mut self,
        handler: impl Fn(&mut Scope<'_>, &[Value]) -> Result<Value, ScriptError> + 'static,
    ) {
        self.state.uncaught_handler = Some(Rc::new(handler));
    }

    fn host(&self) -> Result<&RealmHost, ScriptError> {
        self.state
            .host
            .as_ref()
            .ok_or_else(|| ScriptError::new("realm is not attached to an environment"))
    }

    pub fn process(&self) -> Result<&ProcessState, ScriptError> {
        Ok(&self.host()?.process)
    }

    /// `process.exitCode`.
    pub fn exit_code(&self) -> Result<i32, ScriptError> {
        Ok(self.process()?.exit_code())
    }

    pub fn set_exit_code(&self, code: i32) -> Result<(), ScriptError> {
        self.process()?.set_exit_code(code);
        Ok(())
    }

    /// `process._exiting`.
    pub fn exiting(&self) -> Result<bool, ScriptError> {
        Ok(self.process()?.exiting())
    }

    pub fn event_loop(&self) -> Result<&LoopHandle, ScriptError> {
        Ok(&self.host()?.event_loop)
    }

    /// `process.reallyExit(code)`. The environment exits once the current
    /// callback returns, without `beforeExit` or `exit` notifications.
    pub fn exit(&self, code: i32) -> Result<(), ScriptError> {
        let host = self.host()?;
        host.process.request_exit(code);
        host.event_loop.stop();
        Ok(())
    }

    /// `process.abort()`.
    pub fn abort(&self) -> ! {
        fatal_error("process aborted by managed code")
    }

    /// `process._getActiveRequests().length`.
    pub fn active_requests(&self) -> Result<usize, ScriptError> {
        Ok(self.host()?.event_loop.active_requests())
    }

    /// `process._getActiveHandles().length`.
    pub fn active_handles(&self) -> Result<usize, ScriptError> {
        Ok(self.host()?.event_loop.active_handles())
    }

    /// `process._setZeroFill(enabled)`.
    pub fn set_zero_fill(&self, enabled: bool) -> Result<(), ScriptError> {
        let toggle = self
            .host()?
            .zero_fill
            .as_ref()
            .ok_or_else(|| ScriptError::new("TypeError: no ArrayBuffer allocator to configure"))?;

        toggle.set(enabled);
        Ok(())
    }

    pub fn snapshot(&self) -> Option<&ProcessSnapshot> {
        self.state.snapshot.as_ref()
    }
}

pub struct ClosureRealm {
    state: RealmState,
}

impl Default for ClosureRealm {
    fn default() -> Self {
        Self::new()
    }
}

impl ClosureRealm {
    pub fn new() -> Self {
        Self {
            state: RealmState::new(),
        }
    }

    pub fn scope(&mut self) -> Scope<'_> {
        Scope {
            state: &mut self.state,
        }
    }

    pub fn function(
        &mut self,
        f: impl Fn(&mut Scope<'_>, &[Value]) -> Result<Value, ScriptError> + 'static,
    ) -> Value {
        self.scope().function(f)
    }

    pub fn new_object(&mut self) -> Value {
        self.scope().new_object()
    }

    pub fn enqueue_microtask(&mut self, job: impl FnOnce(&mut Scope<'_>) -> Result<(), ScriptError> + 'static) {
        self.scope().enqueue_microtask(job);
    }

    pub fn on(
        &mut self,
        event: ProcessEvent,
        listener: impl Fn(&mut Scope<'_>, &[Value]) -> Result<Value, ScriptError> + 'static,
    ) {
        self.scope().on(event, listener);
    }

    pub fn pending_microtasks(&self) -> usize {
        self.state.microtasks.len()
    }

    /// Managed function calls made so far, listeners included.
    pub fn calls(&self) -> u64 {
        self.state.calls
    }

    fn run_job(&mut self, job: Job) -> Result<(), ScriptError> {
        job(&mut self.scope())
    }

    /// Returns whether any listener was registered.
    fn emit_to_listeners(&mut self, event: ProcessEvent, args: &[Value]) -> Result<bool, ScriptError> {
        let listeners = self.state.listeners.get(&event).cloned().unwrap_or_default();

        tracing::trace!(?event, listeners = listeners.len(), "emit");

        let mut scope = self.scope();
        for listener in &listeners {
            scope.state.calls += 1;
            listener(&mut scope, args)?;
        }

        Ok(!listeners.is_empty())
    }

    fn install_process_properties(&mut self, snapshot: &ProcessSnapshot) -> Result<(), ScriptError> {
        let mut scope = self.scope();
        let process = scope.process_object();

        let strings = |items: &[String]| Value::Array(items.iter().cloned().map(Value::String).collect());

        scope.set(&process, "argv", strings(&snapshot.argv))?;
        scope.set(&process, "execArgv", strings(&snapshot.exec_argv))?;
        scope.set(&process, "pid", Value::Number(snapshot.pid as f64))?;
        scope.set(&process, "title", Value::String(snapshot.title.clone()))?;
        scope.set(&process, "platform", Value::from(snapshot.platform))?;
        scope.set(&process, "arch", Value::from(snapshot.arch))?;

        if let Some(path) = &snapshot.exec_path {
            scope.set(&process, "execPath", Value::String(path.display().to_string()))?;
        }

        let versions = scope.new_object();
        for (component, version) in snapshot.versions.iter() {
            scope.set(&versions, component, Value::from(version))?;
        }
        scope.set(&process, "versions", versions)?;

        let features = scope.new_object();
        for (feature, enabled) in snapshot.features.iter() {
            scope.set(&features, feature, Value::Bool(enabled))?;
        }
        scope.set(&process, "features", features)?;

        let env = scope.new_object();
        for (key, value) in &snapshot.env {
            scope.set(&env, key, Value::String(value.clone()))?;
        }
        scope.set(&process, "env", env)?;

        Ok(())
    }
}

impl Realm for ClosureRealm {
    fn attach(&mut self, host: RealmHost) {
        self.state.host = Some(host);
    }

    fn setup_process_object(&mut self, snapshot: &ProcessSnapshot) {
        if let Err(error) = self.install_process_properties(snapshot) {
            tracing::error!(error = %error, "failed to install process object");
        }

        self.state.snapshot = Some(snapshot.clone());
    }

    fn process_object(&mut self) -> Value {
        Value::Object(self.state.process)
    }

    fn global_object(&mut self) -> Value {
        Value::Object(self.state.global)
    }

    fn call(&mut self, callback: &Value, _receiver: Option<&Value>, args: &[Value]) -> Result<Value, ScriptError> {
        self.scope().call(callback, args)
    }

    /// Runs every queued microtask, including ones queued along the way.
    /// The first exception is returned once the queue is empty.
    fn perform_microtask_checkpoint(&mut self) -> Result<(), ScriptError> {
        let mut first_error = None;

        while let Some(job) = self.state.microtasks.pop_front() {
            if let Err(error) = self.run_job(job) {
                first_error.get_or_insert(error);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn has_tick_scheduled(&self) -> bool {
        !self.state.ticks.is_empty()
    }

    fn run_tick_callback(&mut self) -> Result<(), ScriptError> {
        while let Some(tick) = self.state.ticks.pop_front() {
            self.run_job(tick)?;
            self.perform_microtask_checkpoint()?;
        }

        Ok(())
    }

    fn emit_process_event(&mut self, event: ProcessEvent, code: i32) -> Result<(), ScriptError> {
        self.emit_to_listeners(event, &[Value::from(code)]).map(|_| ())
    }

    fn emit_warning(&mut self, warning: &str) -> Result<bool, ScriptError> {
        self.emit_to_listeners(ProcessEvent::Warning, &[Value::from(warning)])
    }

    fn handle_uncaught_exception(&mut self, error: &ScriptError) -> Result<bool, ScriptError> {
        let Some(handler) = self.state.uncaught_handler.clone() else {
            return Ok(false);
        };

        let mut scope = self.scope();
        scope.state.calls += 1;
        handler(&mut scope, &[Value::String(error.message.clone())]).map(|handled| handled.is_truthy())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn dispose(&mut self) {
        self.state.microtasks.clear();
        self.state.ticks.clear();
        self.state.listeners.clear();
        self.state.slots.clear();
    }
}

pub struct ClosureEngine {
    instance: Option<InstanceId>,
    platform: Option<Arc<Platform>>,
    allocator: Option<Arc<ArrayBufferAllocator>>,
    per_context: Option<ContextInit>,
    contexts_created: usize,
    tracking_heap_objects: bool,
    disposed: bool,
}

impl Default for ClosureEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClosureEngine {
    pub fn new() -> Self {
        Self {
            instance: None,
            platform: None,
            allocator: None,
            per_context: None,
            contexts_created: 0,
            tracking_heap_objects: false,
            disposed: false,
        }
    }

    pub fn with_per_context(mut self, init: ContextInit) -> Self {
        self.per_context = Some(init);
        self
    }

    fn with_allocator(mut self, allocator: Arc<ArrayBufferAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn instance(&self) -> Option<InstanceId> {
        self.instance
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts_created
    }

    pub fn is_tracking_heap_objects(&self) -> bool {
        self.tracking_heap_objects
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Engine for ClosureEngine {
    fn name(&self) -> &'static str {
        "closure"
    }

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn initialize(&mut self, id: InstanceId, platform: Arc<Platform>) -> Result<(), StartupError> {
        if self.instance.is_some() {
            return Err(StartupError::EngineInitialization(format!(
                "engine already initialized as {}",
                id
            )));
        }

        self.instance = Some(id);
        self.platform = Some(platform);
        tracing::debug!(instance = %id, "closure engine initialized");
        Ok(())
    }

    fn new_context(&mut self, _isolate_data: &IsolateData) -> Result<Box<dyn Realm>, ScriptError> {
        let mut realm = ClosureRealm::new();

        if let Some(init) = &self.per_context {
            init(&mut realm.scope())?;
        }

        self.contexts_created += 1;
        Ok(Box::new(realm))
    }

    fn start_tracking_heap_objects(&mut self) {
        self.tracking_heap_objects = true;
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }

        self.disposed = true;

        if let Some(allocator) = &self.allocator {
            tracing::debug!(external_bytes = allocator.current_usage(), "closure engine disposed");
        }
    }
}

/// Creates [`ClosureEngine`]s, optionally failing on purpose.
#[derive(Default, Clone)]
pub struct ClosureEngineFactory {
    per_context: Option<ContextInit>,
    allocation_failure: Option<String>,
    initialization_failure: Option<String>,
}

impl ClosureEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_per_context(
        mut self,
        init: impl Fn(&mut Scope<'_>) -> Result<(), ScriptError> + 'static,
    ) -> Self {
        self.per_context = Some(Rc::new(init));
        self
    }

    /// Every allocation fails with `reason`.
    pub fn failing_allocation(mut self, reason: impl Into<String>) -> Self {
        self.allocation_failure = Some(reason.into());
        self
    }

    pub fn failing_initialization(mut self, reason: impl Into<String>) -> Self {
        self.initialization_failure = Some(reason.into());
        self
    }
}

impl EngineFactory for ClosureEngineFactory {
    fn allocate(
        &self,
        allocator: Arc<ArrayBufferAllocator>,
        _config: &RuntimeConfig,
    ) -> Result<Box<dyn Engine>, StartupError> {
        if let Some(reason) = &self.allocation_failure {
            return Err(StartupError::EngineAllocation(reason.clone()));
        }

        let mut engine = ClosureEngine::new().with_allocator(allocator);

        if let Some(init) = &self.per_context {
            engine = engine.with_per_context(Rc::clone(init));
        }

        match &self.initialization_failure {
            Some(reason) => Ok(Box::new(FailingInit {
                inner: engine,
                reason: reason.clone(),
            })),
            None => Ok(Box::new(engine)),
        }
    }
}

/// An engine that allocates fine but refuses to initialize.
struct FailingInit {
    inner: ClosureEngine,
    reason: String,
}

impl Engine for FailingInit {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn version(&self) -> String {
        self.inner.version()
    }

    fn initialize(&mut self, _id: InstanceId, _platform: Arc<Platform>) -> Result<(), StartupError> {
        Err(StartupError::EngineInitialization(self.reason.clone()))
    }

    fn new_context(&mut self, isolate_data: &IsolateData) -> Result<Box<dyn Realm>, ScriptError> {
        self.inner.new_context(isolate_data)
    }

    fn dispose(&mut self) {
        self.inner.dispose();
    }
}

/// Built-in modules written as closures.
#[derive(Default, Clone)]
pub struct ClosureModules {
    modules: HashMap<String, ManagedFn>,
}

impl ClosureModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(
        mut self,
        id: &str,
        body: impl Fn(&mut Scope<'_>, &[Value]) -> Result<Value, ScriptError> + 'static,
    ) -> Self {
        self.modules.insert(id.to_string(), Rc::new(body));
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }
}

impl NativeModuleLoader for ClosureModules {
    fn compile_and_call(
        &self,
        realm: &mut dyn Realm,
        id: &str,
        parameters: &[&str],
        arguments: &[Value],
    ) -> Result<Value, ScriptError> {
        let Some(body) = self.modules.get(id) else {
            return Err(ScriptError::new(format!("No such built-in module: {}", id)));
        };

        if parameters.len() != arguments.len() {
            return Err(ScriptError::new(format!(
                "{}: {} parameters but {} arguments",
                id,
                parameters.len(),
                arguments.len()
            )));
        }

        let realm = realm
            .as_any_mut()
            .downcast_mut::<ClosureRealm>()
            .ok_or_else(|| ScriptError::new("closure modules need a closure realm"))?;

        realm.state.calls += 1;
        body(&mut realm.scope(), arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[test]
    fn test_call_function() {
        let mut realm = ClosureRealm::new();
        let add = realm.function(|_, args| {
            let sum = args.iter().filter_map(Value::as_i32).sum::<i32>();
            Ok(Value::from(sum))
        });

        let result = realm.call(&add, None, &[Value::from(2), Value::from(3)]);
        assert_eq!(result, Ok(Value::from(5)));
        assert_eq!(realm.calls(), 1);
    }

    #[test]
    fn test_calling_non_function_throws() {
        let mut realm = ClosureRealm::new();
        let object = realm.new_object();

        assert!(realm.call(&object, None, &[]).is_err());
        assert!(realm.call(&Value::Null, None, &[]).is_err());
    }

    #[test]
    fn test_microtasks_run_in_order_including_new_ones() {
        let mut realm = ClosureRealm::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let first = Rc::clone(&order);
        realm.enqueue_microtask(move |scope| {
            first.borrow_mut().push(1);
            let nested = Rc::clone(&first);
            scope.enqueue_microtask(move |_| {
                nested.borrow_mut().push(3);
                Ok(())
            });
            Ok(())
        });

        let second = Rc::clone(&order);
        realm.enqueue_microtask(move |_| {
            second.borrow_mut().push(2);
            Ok(())
        });

        realm.perform_microtask_checkpoint().unwrap();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        assert_eq!(realm.pending_microtasks(), 0);
    }

    #[test]
    fn test_microtask_error_is_reported_after_drain() {
        let mut realm = ClosureRealm::new();
        let ran = Rc::new(Cell::new(false));

        realm.enqueue_microtask(|_| Err(ScriptError::new("first")));
        let flag = Rc::clone(&ran);
        realm.enqueue_microtask(move |_| {
            flag.set(true);
            Ok(())
        });

        let err = realm.perform_microtask_checkpoint().unwrap_err();
        assert_eq!(err.message, "first");
        assert!(ran.get());
    }

    #[test]
    fn test_ticks_interleave_with_microtasks() {
        let mut realm = ClosureRealm::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&order);
        realm.scope().next_tick(move |scope| {
            log.borrow_mut().push("tick");
            let micro = Rc::clone(&log);
            scope.enqueue_microtask(move |_| {
                micro.borrow_mut().push("micro");
                Ok(())
            });
            Ok(())
        });

        assert!(realm.has_tick_scheduled());
        realm.run_tick_callback().unwrap();
        assert!(!realm.has_tick_scheduled());
        assert_eq!(*order.borrow(), vec!["tick", "micro"]);
    }

    #[test]
    fn test_listeners_receive_exit_code() {
        let mut realm = ClosureRealm::new();
        let seen = Rc::new(Cell::new(-1));

        let code = Rc::clone(&seen);
        realm.on(ProcessEvent::Exit, move |_, args| {
            code.set(args[0].as_i32().unwrap_or(-1));
            Ok(Value::Undefined)
        });

        realm.emit_process_event(ProcessEvent::BeforeExit, 3).unwrap();
        assert_eq!(seen.get(), -1);

        realm.emit_process_event(ProcessEvent::Exit, 3).unwrap();
        assert_eq!(seen.get(), 3);
    }

    #[test]
    fn test_uncaught_exception_handler() {
        let mut realm = ClosureRealm::new();
        let error = ScriptError::new("boom");

        assert_eq!(realm.handle_uncaught_exception(&error), Ok(false));

        realm
            .scope()
            .set_uncaught_exception_handler(|_, args| Ok(Value::Bool(args[0] == Value::from("boom"))));
        assert_eq!(realm.handle_uncaught_exception(&error), Ok(true));
    }

    #[test]
    fn test_process_object_properties() {
        let mut realm = ClosureRealm::new();
        let args = vec!["node".to_string(), "app.js".to_string()];
        let snapshot = ProcessSnapshot::capture(&args, &[], "closure", "1.0");

        realm.setup_process_object(&snapshot);

        let scope = realm.scope();
        let process = scope.process_object();
        assert_eq!(
            scope.get(&process, "argv"),
            Value::Array(vec![Value::from("node"), Value::from("app.js")])
        );
        let versions = scope.get(&process, "versions");
        assert_eq!(scope.get(&versions, "closure"), Value::from("1.0"));
        assert_eq!(scope.get(&scope.global(), "process"), process);
    }

    #[test]
    fn test_unattached_scope_has_no_process_state() {
        let mut realm = ClosureRealm::new();
        assert!(realm.scope().exit_code().is_err());
        assert!(realm.scope().exit(1).is_err());
        assert!(realm.scope().set_zero_fill(false).is_err());
    }

    #[test]
    fn test_warning_listeners() {
        let mut realm = ClosureRealm::new();
        assert_eq!(realm.emit_warning("first"), Ok(false));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        realm.on(ProcessEvent::Warning, move |_, args| {
            log.borrow_mut().push(args[0].clone());
            Ok(Value::Undefined)
        });

        assert_eq!(realm.emit_warning("second"), Ok(true));
        assert_eq!(*seen.borrow(), vec![Value::from("second")]);
    }

    #[test]
    fn test_modules_check_arity() {
        let modules = ClosureModules::new().with_module("m", |_, _| Ok(Value::Null));
        let mut realm = ClosureRealm::new();

        assert_eq!(modules.compile_and_call(&mut realm, "m", &["a"], &[Value::Null]), Ok(Value::Null));
        assert!(modules.compile_and_call(&mut realm, "m", &["a", "b"], &[Value::Null]).is_err());
        assert!(modules.compile_and_call(&mut realm, "missing", &[], &[]).is_err());
    }

    #[test]
    fn test_per_context_failure() {
        let factory = ClosureEngineFactory::new().with_per_context(|_| Err(ScriptError::new("per-context threw")));
        let allocator = ArrayBufferAllocator::new(None, false);
        let mut engine = factory.allocate(allocator, &RuntimeConfig::default()).unwrap();

        let platform = Platform::new(1);
        let id = platform.register_instance();
        engine.initialize(id, Arc::clone(&platform)).unwrap();

        let data = IsolateData::new(id, platform, None, Arc::new(RuntimeConfig::default()));
        assert!(engine.new_context(&data).is_err());
    }
}
