//! V8-backed engine.
//!
//! V8 can only be initialized once per process, so the V8 platform lives in
//! a `OnceLock` and is shared by every isolate. Each [`V8Engine`] owns one
//! isolate created with the process [`ArrayBufferAllocator`] and heap
//! limits; each [`V8Realm`] is one context in it.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::pin::pin;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use crate::allocator::ArrayBufferAllocator;
use crate::config::RuntimeConfig;
use crate::error::{ScriptError, StartupError};
use crate::invariant::fatal_error;
use crate::isolate_data::{InternedStrings, IsolateData};
use crate::platform::{InstanceId, Platform};
use crate::process::ProcessSnapshot;

use super::{Engine, EngineFactory, NativeModuleLoader, ObjectRef, ProcessEvent, Realm, RealmHost, Value};

static V8_PLATFORM: OnceLock<v8::SharedRef<v8::Platform>> = OnceLock::new();

/// Get the V8 platform, initializing V8 on first use.
pub fn v8_platform() -> &'static v8::SharedRef<v8::Platform> {
    V8_PLATFORM.get_or_init(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();
        log::debug!("V8 {} initialized", v8::V8::get_version());
        platform
    })
}

macro_rules! context_scope {
    ($scope:ident, $isolate:expr, $context:expr) => {
        let $scope = pin!(v8::HandleScope::new($isolate));
        let mut $scope = $scope.init();
        let context = v8::Local::new(&$scope, $context);
        let $scope = &mut v8::ContextScope::new(&mut $scope, context);
    };
}

/// `queueMicrotask` that hands callback exceptions to `report` instead of
/// turning them into rejected promises nobody observes.
const QUEUE_MICROTASK: &str = r#"
    (function (report) {
        const resolved = Promise.resolve();

        globalThis.queueMicrotask = function queueMicrotask(callback) {
            if (typeof callback !== 'function') {
                throw new TypeError('The "callback" argument must be of type function');
            }

            resolved.then(() => {
                try {
                    callback();
                } catch (error) {
                    report(error);
                }
            });
        };
    })
"#;

/// Exceptions thrown by microtasks since the last checkpoint. Lives in a
/// context slot.
#[derive(Default)]
struct MicrotaskErrors(RefCell<Vec<ScriptError>>);

fn exception_message(tc: &mut v8::PinScope, exception: Option<v8::Local<v8::Value>>, fallback: &str) -> ScriptError {
    let message = exception
        .and_then(|e| e.to_string(tc).map(|s| s.to_rust_string_lossy(tc)))
        .unwrap_or_else(|| fallback.to_string());

    ScriptError::new(message)
}

fn v8_string<'s>(scope: &mut v8::PinScope<'s, '_>, value: &str) -> Result<v8::Local<'s, v8::String>, ScriptError> {
    v8::String::new(scope, value).ok_or_else(|| ScriptError::new("Failed to create V8 string"))
}

/// Values the realm handed out as [`ObjectRef`]s.
#[derive(Default)]
struct ObjectTable {
    objects: HashMap<u64, v8::Global<v8::Value>>,
    next: u64,
}

impl ObjectTable {
    fn insert(&mut self, value: v8::Global<v8::Value>) -> ObjectRef {
        self.next += 1;
        self.objects.insert(self.next, value);
        ObjectRef(self.next)
    }
}

fn to_local<'s>(scope: &mut v8::PinScope<'s, '_>, table: &ObjectTable, value: &Value) -> v8::Local<'s, v8::Value> {
    match value {
        Value::Undefined => v8::undefined(scope).into(),
        Value::Null => v8::null(scope).into(),
        Value::Bool(b) => v8::Boolean::new(scope, *b).into(),
        Value::Number(n) => v8::Number::new(scope, *n).into(),
        Value::String(s) => match v8::String::new(scope, s) {
            Some(s) => s.into(),
            None => v8::undefined(scope).into(),
        },
        Value::Array(items) => {
            let array = v8::Array::new(scope, items.len() as i32);
            for (index, item) in items.iter().enumerate() {
                let item = to_local(scope, table, item);
                array.set_index(scope, index as u32, item);
            }
            array.into()
        }
        Value::Object(object) => match table.objects.get(&object.0) {
            Some(global) => v8::Local::new(scope, global),
            None => v8::undefined(scope).into(),
        },
    }
}

fn from_local(scope: &mut v8::PinScope, table: &mut ObjectTable, value: v8::Local<v8::Value>) -> Value {
    if value.is_undefined() {
        Value::Undefined
    } else if value.is_null() {
        Value::Null
    } else if value.is_boolean() {
        Value::Bool(value.boolean_value(scope))
    } else if value.is_number() {
        Value::Number(value.number_value(scope).unwrap_or(f64::NAN))
    } else if value.is_string() {
        Value::String(value.to_rust_string_lossy(scope))
    } else {
        Value::Object(table.insert(v8::Global::new(scope, value)))
    }
}

fn set_property(scope: &mut v8::PinScope, object: v8::Local<v8::Object>, key: &str, value: v8::Local<v8::Value>) {
    if let Some(key) = v8::String::new(scope, key) {
        object.set(scope, key.into(), value);
    }
}

fn set_method(
    scope: &mut v8::PinScope,
    object: v8::Local<v8::Object>,
    key: &str,
    function: Option<v8::Local<v8::Function>>,
) {
    match function {
        Some(function) => set_property(scope, object, key, function.into()),
        None => log::warn!("Failed to create process.{}", key),
    }
}

fn get_function<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    object: v8::Local<v8::Object>,
    key: &str,
) -> Result<Option<v8::Local<'s, v8::Function>>, ScriptError> {
    let key = v8_string(scope, key)?;

    Ok(object
        .get(scope, key.into())
        .and_then(|f| v8::Local::<v8::Function>::try_from(f).ok()))
}

fn string_array<'s>(scope: &mut v8::PinScope<'s, '_>, items: &[String]) -> v8::Local<'s, v8::Value> {
    let array = v8::Array::new(scope, items.len() as i32);

    for (index, item) in items.iter().enumerate() {
        if let Some(s) = v8::String::new(scope, item) {
            array.set_index(scope, index as u32, s.into());
        }
    }

    array.into()
}

/// Install the natives behind `process.reallyExit`, `process.abort`,
/// `process._getActiveRequests`, `process._getActiveHandles` and
/// `process._setZeroFill`. They reach the host through a context slot.
fn install_process_methods(scope: &mut v8::PinScope, process: v8::Local<v8::Object>) {
    let really_exit = v8::Function::new(
        scope,
        |scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, _retval: v8::ReturnValue| {
            let Some(host) = scope.get_current_context().get_slot::<RealmHost>() else {
                return;
            };

            let code = if args.get(0).is_undefined() {
                host.process.exit_code()
            } else {
                args.get(0).int32_value(scope).unwrap_or(1)
            };

            host.process.request_exit(code);
            host.event_loop.stop();
            scope.terminate_execution();
        },
    );
    set_method(scope, process, "reallyExit", really_exit);

    let abort = v8::Function::new(
        scope,
        |_scope: &mut v8::PinScope, _args: v8::FunctionCallbackArguments, _retval: v8::ReturnValue| {
            fatal_error("process aborted by managed code");
        },
    );
    set_method(scope, process, "abort", abort);

    let active_requests = v8::Function::new(
        scope,
        |scope: &mut v8::PinScope, _args: v8::FunctionCallbackArguments, mut retval: v8::ReturnValue| {
            let count = scope
                .get_current_context()
                .get_slot::<RealmHost>()
                .map_or(0, |host| host.event_loop.active_requests());
            retval.set(v8::Array::new(scope, count as i32).into());
        },
    );
    set_method(scope, process, "_getActiveRequests", active_requests);

    let active_handles = v8::Function::new(
        scope,
        |scope: &mut v8::PinScope, _args: v8::FunctionCallbackArguments, mut retval: v8::ReturnValue| {
            let count = scope
                .get_current_context()
                .get_slot::<RealmHost>()
                .map_or(0, |host| host.event_loop.active_handles());
            retval.set(v8::Array::new(scope, count as i32).into());
        },
    );
    set_method(scope, process, "_getActiveHandles", active_handles);

    let set_zero_fill = v8::Function::new(
        scope,
        |scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, _retval: v8::ReturnValue| {
            if let Some(host) = scope.get_current_context().get_slot::<RealmHost>()
                && let Some(toggle) = &host.zero_fill
            {
                toggle.set(args.get(0).boolean_value(scope));
            }
        },
    );
    set_method(scope, process, "_setZeroFill", set_zero_fill);
}

pub struct V8Realm {
    /// Owned by the `V8Engine` that created this realm, which outlives it.
    isolate: *mut v8::Isolate,
    context: v8::Global<v8::Context>,
    table: ObjectTable,
    process: Option<v8::Global<v8::Object>>,
    process_ref: Option<ObjectRef>,
    global_ref: Option<ObjectRef>,
    microtask_errors: Rc<MicrotaskErrors>,
    strings: InternedStrings,
    host: Option<RealmHost>,
}

impl V8Realm {
    fn isolate(&mut self) -> &mut v8::Isolate {
        // SAFETY: the engine disposes the isolate only after every realm
        // created from it has been dropped.
        unsafe { &mut *self.isolate }
    }

    fn process_local<'s>(&self, scope: &mut v8::PinScope<'s, '_>) -> Option<v8::Local<'s, v8::Object>> {
        self.process.as_ref().map(|p| v8::Local::new(scope, p))
    }

    /// Objects currently held for the embedder.
    pub fn held_objects(&self) -> usize {
        self.table.objects.len()
    }

    /// Define `queueMicrotask` with an error sink read at each checkpoint.
    fn install_queue_microtask(&mut self) -> Result<(), ScriptError> {
        let isolate = unsafe { &mut *self.isolate };
        context_scope!(scope, isolate, &self.context);

        scope.get_current_context().set_slot(Rc::clone(&self.microtask_errors));

        let report = v8::Function::new(
            scope,
            |scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, _retval: v8::ReturnValue| {
                let Some(errors) = scope.get_current_context().get_slot::<MicrotaskErrors>() else {
                    return;
                };

                let error = exception_message(scope, Some(args.get(0)), "Uncaught exception in microtask");
                errors.0.borrow_mut().push(error);
            },
        )
        .ok_or_else(|| ScriptError::new("Failed to create microtask reporter"))?;

        let source = v8_string(scope, QUEUE_MICROTASK)?;

        let tc = pin!(v8::TryCatch::new(scope));
        let mut tc = tc.init();

        let Some(setup) = v8::Script::compile(&tc, source, None)
            .and_then(|script| script.run(&tc))
            .and_then(|f| v8::Local::<v8::Function>::try_from(f).ok())
        else {
            let exception = tc.exception();
            return Err(exception_message(&mut tc, exception, "queueMicrotask setup failed"));
        };

        let recv = v8::undefined(&tc).into();
        if setup.call(&tc, recv, &[report.into()]).is_none() {
            let exception = tc.exception();
            return Err(exception_message(&mut tc, exception, "queueMicrotask setup threw"));
        }

        Ok(())
    }

    /// Copy the host's exit code and exiting flag onto the process object.
    fn push_process_state(&mut self) {
        let Some(host) = self.host.clone() else {
            return;
        };

        let isolate = unsafe { &mut *self.isolate };
        context_scope!(scope, isolate, &self.context);

        if let Some(process) = self.process_local(scope) {
            let code = v8::Integer::new(scope, host.process.exit_code());
            set_property(scope, process, &self.strings.exit_code, code.into());
            let exiting = v8::Boolean::new(scope, host.process.exiting());
            set_property(scope, process, &self.strings.exiting, exiting.into());
        }
    }

    /// Read `process.exitCode` back into the host.
    fn pull_exit_code(&mut self) {
        let Some(host) = self.host.clone() else {
            return;
        };

        let isolate = unsafe { &mut *self.isolate };
        context_scope!(scope, isolate, &self.context);

        let Some(process) = self.process_local(scope) else {
            return;
        };

        let Some(key) = v8::String::new(scope, &self.strings.exit_code) else {
            return;
        };

        if let Some(code) = process.get(scope, key.into())
            && code.is_int32()
            && let Some(code) = code.int32_value(scope)
        {
            host.process.set_exit_code(code);
        }
    }

    /// `process.emit(name, code)`, if managed code defined `emit`.
    fn call_emit(&mut self, event: ProcessEvent, code: i32) -> Result<(), ScriptError> {
        let isolate = unsafe { &mut *self.isolate };
        context_scope!(scope, isolate, &self.context);

        let Some(process) = self.process_local(scope) else {
            return Ok(());
        };

        let Some(emit) = get_function(scope, process, &self.strings.emit)? else {
            return Ok(());
        };

        let tc = pin!(v8::TryCatch::new(scope));
        let mut tc = tc.init();

        let name = v8_string(&mut tc, self.strings.event_name(event))?;
        let code = v8::Integer::new(&tc, code);

        if emit.call(&tc, process.into(), &[name.into(), code.into()]).is_none() {
            let exception = tc.exception();
            return Err(exception_message(&mut tc, exception, "process.emit threw"));
        }

        Ok(())
    }

    /// Wrap `source` as a function of `parameters`, then call it.
    pub fn compile_and_call(
        &mut self,
        id: &str,
        source: &str,
        parameters: &[&str],
        arguments: &[Value],
    ) -> Result<Value, ScriptError> {
        let isolate = unsafe { &mut *self.isolate };
        context_scope!(scope, isolate, &self.context);

        let wrapped = format!("(function ({}) {{\n{}\n}})", parameters.join(", "), source);
        let code = v8_string(scope, &wrapped)?;

        let tc = pin!(v8::TryCatch::new(scope));
        let mut tc = tc.init();

        let Some(script) = v8::Script::compile(&tc, code, None) else {
            let exception = tc.exception();
            return Err(exception_message(&mut tc, exception, &format!("{}: compile error", id)));
        };

        let Some(function) = script
            .run(&tc)
            .and_then(|f| v8::Local::<v8::Function>::try_from(f).ok())
        else {
            let exception = tc.exception();
            return Err(exception_message(&mut tc, exception, &format!("{}: not a function", id)));
        };

        let args: Vec<_> = arguments.iter().map(|a| to_local(&mut tc, &self.table, a)).collect();
        let recv = v8::undefined(&tc).into();

        match function.call(&tc, recv, &args) {
            Some(result) => Ok(from_local(&mut tc, &mut self.table, result)),
            None => {
                let exception = tc.exception();
                Err(exception_message(&mut tc, exception, &format!("{}: threw", id)))
            }
        }
    }

    /// Run `source` as a classic script.
    fn evaluate(&mut self, source: &str) -> Result<(), ScriptError> {
        let isolate = unsafe { &mut *self.isolate };
        context_scope!(scope, isolate, &self.context);

        let code = v8_string(scope, source)?;

        let tc = pin!(v8::TryCatch::new(scope));
        let mut tc = tc.init();

        let Some(script) = v8::Script::compile(&tc, code, None) else {
            let exception = tc.exception();
            return Err(exception_message(&mut tc, exception, "Compile error"));
        };

        if script.run(&tc).is_none() {
            let exception = tc.exception();
            return Err(exception_message(&mut tc, exception, "Runtime error"));
        }

        Ok(())
    }
}

impl Realm for V8Realm {
    fn attach(&mut self, host: RealmHost) {
        self.host = Some(host);
    }

    fn setup_process_object(&mut self, snapshot: &ProcessSnapshot) {
        let isolate = unsafe { &mut *self.isolate };
        context_scope!(scope, isolate, &self.context);

        if let Some(host) = &self.host {
            scope.get_current_context().set_slot(Rc::new(host.clone()));
        }

        let process = v8::Object::new(scope);

        let argv = string_array(scope, &snapshot.argv);
        set_property(scope, process, "argv", argv);
        let exec_argv = string_array(scope, &snapshot.exec_argv);
        set_property(scope, process, "execArgv", exec_argv);

        let pid = v8::Number::new(scope, snapshot.pid as f64);
        set_property(scope, process, "pid", pid.into());

        for (key, value) in [
            ("title", snapshot.title.as_str()),
            ("platform", snapshot.platform),
            ("arch", snapshot.arch),
        ] {
            if let Some(value) = v8::String::new(scope, value) {
                set_property(scope, process, key, value.into());
            }
        }

        let versions = v8::Object::new(scope);
        for (component, version) in snapshot.versions.iter() {
            if let Some(version) = v8::String::new(scope, version) {
                set_property(scope, versions, component, version.into());
            }
        }
        set_property(scope, process, "versions", versions.into());

        let features = v8::Object::new(scope);
        for (feature, enabled) in snapshot.features.iter() {
            let enabled = v8::Boolean::new(scope, enabled);
            set_property(scope, features, feature, enabled.into());
        }
        set_property(scope, process, "features", features.into());

        let env = v8::Object::new(scope);
        for (key, value) in &snapshot.env {
            if let Some(value) = v8::String::new(scope, value) {
                set_property(scope, env, key, value.into());
            }
        }
        set_property(scope, process, "env", env.into());

        install_process_methods(scope, process);

        let global = scope.get_current_context().global(scope);
        set_property(scope, global, "process", process.into());

        let process_value: v8::Local<v8::Value> = process.into();
        self.process_ref = Some(self.table.insert(v8::Global::new(scope, process_value)));
        self.process = Some(v8::Global::new(scope, process));
    }

    fn process_object(&mut self) -> Value {
        self.process_ref.map_or(Value::Undefined, Value::Object)
    }

    fn global_object(&mut self) -> Value {
        if let Some(global) = self.global_ref {
            return Value::Object(global);
        }

        let isolate = unsafe { &mut *self.isolate };
        context_scope!(scope, isolate, &self.context);

        let global: v8::Local<v8::Value> = scope.get_current_context().global(scope).into();
        let global = self.table.insert(v8::Global::new(scope, global));
        self.global_ref = Some(global);
        Value::Object(global)
    }

    fn call(&mut self, callback: &Value, receiver: Option<&Value>, args: &[Value]) -> Result<Value, ScriptError> {
        let isolate = unsafe { &mut *self.isolate };
        context_scope!(scope, isolate, &self.context);

        let tc = pin!(v8::TryCatch::new(scope));
        let mut tc = tc.init();

        let callee = to_local(&mut tc, &self.table, callback);
        let Ok(function) = v8::Local::<v8::Function>::try_from(callee) else {
            return Err(ScriptError::new("TypeError: callback is not a function"));
        };

        let recv = match receiver {
            Some(receiver) => to_local(&mut tc, &self.table, receiver),
            None => v8::undefined(&tc).into(),
        };
        let args: Vec<_> = args.iter().map(|a| to_local(&mut tc, &self.table, a)).collect();

        match function.call(&tc, recv, &args) {
            Some(result) => Ok(from_local(&mut tc, &mut self.table, result)),
            None => {
                let exception = tc.exception();
                Err(exception_message(&mut tc, exception, "Runtime error"))
            }
        }
    }

    /// Returns the first exception a `queueMicrotask` callback threw.
    fn perform_microtask_checkpoint(&mut self) -> Result<(), ScriptError> {
        self.isolate().perform_microtask_checkpoint();

        let mut errors = self.microtask_errors.0.borrow_mut();
        let first = errors.drain(..).next();

        match first {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn emit_process_event(&mut self, event: ProcessEvent, code: i32) -> Result<(), ScriptError> {
        self.push_process_state();
        let emitted = self.call_emit(event, code);
        self.pull_exit_code();
        emitted
    }

    fn emit_warning(&mut self, warning: &str) -> Result<bool, ScriptError> {
        let isolate = unsafe { &mut *self.isolate };
        context_scope!(scope, isolate, &self.context);

        let Some(process) = self.process_local(scope) else {
            return Ok(false);
        };

        let Some(emit_warning) = get_function(scope, process, &self.strings.emit_warning)? else {
            return Ok(false);
        };

        let tc = pin!(v8::TryCatch::new(scope));
        let mut tc = tc.init();

        let warning = v8_string(&mut tc, warning)?;

        match emit_warning.call(&tc, process.into(), &[warning.into()]) {
            Some(_) => Ok(true),
            None => {
                let exception = tc.exception();
                Err(exception_message(&mut tc, exception, "process.emitWarning threw"))
            }
        }
    }

    fn release(&mut self, object: ObjectRef) {
        if Some(object) == self.process_ref || Some(object) == self.global_ref {
            return;
        }

        self.table.objects.remove(&object.0);
    }

    fn handle_uncaught_exception(&mut self, error: &ScriptError) -> Result<bool, ScriptError> {
        let isolate = unsafe { &mut *self.isolate };
        context_scope!(scope, isolate, &self.context);

        let Some(process) = self.process_local(scope) else {
            return Ok(false);
        };

        let Some(handler) = get_function(scope, process, &self.strings.fatal_exception)? else {
            return Ok(false);
        };

        let tc = pin!(v8::TryCatch::new(scope));
        let mut tc = tc.init();

        let message = v8_string(&mut tc, &error.message)?;
        let exception = v8::Exception::error(&tc, message);

        match handler.call(&tc, process.into(), &[exception]) {
            Some(handled) => Ok(handled.boolean_value(&tc)),
            None => {
                let exception = tc.exception();
                Err(exception_message(&mut tc, exception, "_fatalException threw"))
            }
        }
    }

    fn drain_engine_tasks(&mut self) {
        while v8::Platform::pump_message_loop(v8_platform(), self.isolate(), false) {}
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn dispose(&mut self) {
        self.table.objects.clear();
        self.process = None;
        self.process_ref = None;
        self.global_ref = None;
    }
}

pub struct V8Engine {
    isolate: Option<v8::OwnedIsolate>,
    per_context: Option<String>,
    instance: Option<InstanceId>,
}

impl V8Engine {
    fn isolate_ptr(&mut self) -> Option<*mut v8::Isolate> {
        self.isolate.as_mut().map(|isolate| &mut **isolate as *mut v8::Isolate)
    }
}

impl Engine for V8Engine {
    fn name(&self) -> &'static str {
        "v8"
    }

    fn version(&self) -> String {
        v8::V8::get_version().to_string()
    }

    fn initialize(&mut self, id: InstanceId, _platform: Arc<Platform>) -> Result<(), StartupError> {
        let isolate = self
            .isolate
            .as_mut()
            .ok_or_else(|| StartupError::EngineInitialization("isolate was disposed".into()))?;

        // Microtasks only run at callback scope exits.
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
        self.instance = Some(id);
        log::debug!("V8 isolate initialized as {}", id);
        Ok(())
    }

    fn new_context(&mut self, isolate_data: &IsolateData) -> Result<Box<dyn Realm>, ScriptError> {
        let Some(isolate_ptr) = self.isolate_ptr() else {
            return Err(ScriptError::new("isolate was disposed"));
        };

        let context = {
            let isolate = unsafe { &mut *isolate_ptr };
            let scope = pin!(v8::HandleScope::new(isolate));
            let scope = scope.init();
            let context = v8::Context::new(&scope, Default::default());
            v8::Global::new(&scope, context)
        };

        let mut realm = V8Realm {
            isolate: isolate_ptr,
            context,
            table: ObjectTable::default(),
            process: None,
            process_ref: None,
            global_ref: None,
            microtask_errors: Rc::new(MicrotaskErrors::default()),
            strings: isolate_data.strings().clone(),
            host: None,
        };

        realm.install_queue_microtask()?;

        if let Some(source) = &self.per_context {
            realm.evaluate(source)?;
        }

        Ok(Box::new(realm))
    }

    fn dispose(&mut self) {
        if self.isolate.take().is_some() {
            log::debug!("V8 isolate disposed");
        }
    }
}

/// Creates isolates with the configured heap limits.
#[derive(Default, Clone)]
pub struct V8EngineFactory {
    per_context: Option<String>,
}

impl V8EngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script run in every new context before it is handed out.
    pub fn with_per_context(mut self, source: impl Into<String>) -> Self {
        self.per_context = Some(source.into());
        self
    }
}

impl EngineFactory for V8EngineFactory {
    fn allocate(
        &self,
        allocator: Arc<ArrayBufferAllocator>,
        config: &RuntimeConfig,
    ) -> Result<Box<dyn Engine>, StartupError> {
        v8_platform();

        let (heap_initial, heap_max) = config.heap_limits_bytes();

        if heap_initial > heap_max {
            return Err(StartupError::EngineAllocation(format!(
                "initial heap {}MB exceeds maximum {}MB",
                config.heap_initial_mb, config.heap_max_mb
            )));
        }

        let params = v8::CreateParams::default()
            .heap_limits(heap_initial, heap_max)
            .array_buffer_allocator(allocator.into_v8_allocator());

        Ok(Box::new(V8Engine {
            isolate: Some(v8::Isolate::new(params)),
            per_context: self.per_context.clone(),
            instance: None,
        }))
    }
}

/// Built-in modules as JavaScript sources.
#[derive(Default, Clone)]
pub struct V8Modules {
    sources: HashMap<String, String>,
}

impl V8Modules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, id: &str, source: impl Into<String>) -> Self {
        self.sources.insert(id.to_string(), source.into());
        self
    }
}

impl NativeModuleLoader for V8Modules {
    fn compile_and_call(
        &self,
        realm: &mut dyn Realm,
        id: &str,
        parameters: &[&str],
        arguments: &[Value],
    ) -> Result<Value, ScriptError> {
        let source = self
            .sources
            .get(id)
            .ok_or_else(|| ScriptError::new(format!("No such built-in module: {}", id)))?;

        let realm = realm
            .as_any_mut()
            .downcast_mut::<V8Realm>()
            .ok_or_else(|| ScriptError::new("V8 modules need a V8 realm"))?;

        realm.compile_and_call(id, source, parameters, arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v8_engine_runs_per_context_and_calls() {
        let factory = V8EngineFactory::new().with_per_context("globalThis.answer = 42;");
        let allocator = ArrayBufferAllocator::new(None, false);
        let mut engine = factory.allocate(allocator, &RuntimeConfig::default()).unwrap();

        let platform = Platform::new(1);
        let id = platform.register_instance();
        engine.initialize(id, Arc::clone(&platform)).unwrap();

        let data = IsolateData::new(id, platform, None, Arc::new(RuntimeConfig::default()));
        let mut realm = engine.new_context(&data).unwrap();

        let modules = V8Modules::new().with_module("m", "return a + globalThis.answer;");
        let result = modules.compile_and_call(realm.as_mut(), "m", &["a"], &[Value::Number(1.0)]);
        assert_eq!(result, Ok(Value::Number(43.0)));

        drop(realm);
        engine.dispose();
    }

    #[test]
    fn test_v8_per_context_failure() {
        let factory = V8EngineFactory::new().with_per_context("throw new Error('nope')");
        let allocator = ArrayBufferAllocator::new(None, false);
        let mut engine = factory.allocate(allocator, &RuntimeConfig::default()).unwrap();

        let platform = Platform::new(1);
        let id = platform.register_instance();
        engine.initialize(id, Arc::clone(&platform)).unwrap();

        let data = IsolateData::new(id, platform, None, Arc::new(RuntimeConfig::default()));
        let err = engine.new_context(&data).err().unwrap();
        assert!(err.message.contains("nope"));
        engine.dispose();
    }

    fn realm_for_test() -> (Box<dyn Engine>, Box<dyn Realm>) {
        let allocator = ArrayBufferAllocator::new(None, false);
        let mut engine = V8EngineFactory::new()
            .allocate(allocator, &RuntimeConfig::default())
            .unwrap();

        let platform = Platform::new(1);
        let id = platform.register_instance();
        engine.initialize(id, Arc::clone(&platform)).unwrap();

        let data = IsolateData::new(id, platform, None, Arc::new(RuntimeConfig::default()));
        let realm = engine.new_context(&data).unwrap();
        (engine, realm)
    }

    fn held_objects(realm: &mut Box<dyn Realm>) -> usize {
        realm.as_any_mut().downcast_mut::<V8Realm>().unwrap().held_objects()
    }

    #[test]
    fn test_microtask_exception_surfaces_at_checkpoint() {
        let (mut engine, mut realm) = realm_for_test();

        let modules = V8Modules::new().with_module(
            "m",
            "queueMicrotask(() => { throw new Error('late failure'); });
             queueMicrotask(() => { globalThis.second = true; });
             return 0;",
        );
        modules.compile_and_call(realm.as_mut(), "m", &[], &[]).unwrap();

        let err = realm.perform_microtask_checkpoint().unwrap_err();
        assert!(err.message.contains("late failure"));

        // The queue kept running after the throw, and the error was consumed.
        let check = V8Modules::new().with_module("check", "return globalThis.second === true;");
        let second = check.compile_and_call(realm.as_mut(), "check", &[], &[]);
        assert_eq!(second, Ok(Value::Bool(true)));
        assert_eq!(realm.perform_microtask_checkpoint(), Ok(()));

        drop(realm);
        engine.dispose();
    }

    #[test]
    fn test_repeated_lookups_do_not_grow_held_objects() {
        let (mut engine, mut realm) = realm_for_test();
        realm.setup_process_object(&ProcessSnapshot::capture(&["host".to_string()], &[], "v8", "test"));

        let process = realm.process_object();
        let global = realm.global_object();
        let baseline = held_objects(&mut realm);

        for _ in 0..16 {
            assert_eq!(realm.process_object(), process);
            assert_eq!(realm.global_object(), global);
        }
        assert_eq!(held_objects(&mut realm), baseline);

        let modules = V8Modules::new().with_module("m", "return {};");
        let Ok(Value::Object(object)) = modules.compile_and_call(realm.as_mut(), "m", &[], &[]) else {
            panic!("expected an object");
        };
        assert_eq!(held_objects(&mut realm), baseline + 1);

        realm.release(object);
        assert_eq!(held_objects(&mut realm), baseline);

        // Cached handles survive a release.
        if let Value::Object(process) = process {
            realm.release(process);
        }
        assert_eq!(held_objects(&mut realm), baseline);

        drop(realm);
        engine.dispose();
    }

    #[test]
    fn test_process_methods_without_host_are_inert() {
        let (mut engine, mut realm) = realm_for_test();
        realm.setup_process_object(&ProcessSnapshot::capture(&["host".to_string()], &[], "v8", "test"));

        let modules = V8Modules::new().with_module(
            "m",
            "process._setZeroFill(false);
             return process._getActiveRequests().length + process._getActiveHandles().length;",
        );
        let result = modules.compile_and_call(realm.as_mut(), "m", &[], &[]);
        assert_eq!(result, Ok(Value::Number(0.0)));
        assert_eq!(realm.emit_warning("unheard"), Ok(false));

        drop(realm);
        engine.dispose();
    }
}
