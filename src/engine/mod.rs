//! The seam between the lifecycle core and a script engine.
//!
//! An [`Engine`] is one engine instance (heap, compiler, microtask queue).
//! It produces [`Realm`]s, one per environment, which is everything the core
//! needs from managed code: calling functions, flushing microtasks, emitting
//! process events, and the uncaught-exception hook. Bootstrap scripts are
//! compiled through a [`NativeModuleLoader`], and engine instances are
//! created by an [`EngineFactory`].

pub mod closure;
#[cfg(feature = "v8")]
pub mod v8;

use std::any::Any;
use std::sync::Arc;

use crate::allocator::{ArrayBufferAllocator, ZeroFillToggle};
use crate::config::RuntimeConfig;
use crate::env::ProcessState;
use crate::error::{ScriptError, StartupError};
use crate::event_loop::LoopHandle;
use crate::isolate_data::IsolateData;
use crate::platform::{InstanceId, Platform};
use crate::process::ProcessSnapshot;

/// Handle to an object (functions included) living in a realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub u64);

/// A value crossing the native/managed boundary.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(ObjectRef),
}

impl Value {
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Number(n) if n.fract() == 0.0 && *n >= i32::MIN as f64 && *n <= i32::MAX as f64 => {
                Some(*n as i32)
            }
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Value::Object(object) => Some(*object),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

/// Notifications delivered to listeners on the process object. Names
/// come from [`InternedStrings::event_name`](crate::isolate_data::InternedStrings::event_name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessEvent {
    BeforeExit,
    Exit,
    Warning,
}

/// What a realm may reach in the environment that owns it.
#[derive(Clone)]
pub struct RealmHost {
    pub process: ProcessState,
    pub event_loop: LoopHandle,
    /// Switch behind `process._setZeroFill`. `None` without an allocator.
    pub zero_fill: Option<ZeroFillToggle>,
}

/// One execution context, bound to a single environment for its lifetime.
pub trait Realm {
    /// Called once by the owning environment before anything else.
    fn attach(&mut self, host: RealmHost);

    /// Install the process object from primitive data. Nothing comes back.
    fn setup_process_object(&mut self, snapshot: &ProcessSnapshot);

    fn process_object(&mut self) -> Value;

    fn global_object(&mut self) -> Value;

    fn call(
        &mut self,
        callback: &Value,
        receiver: Option<&Value>,
        args: &[Value],
    ) -> Result<Value, ScriptError>;

    fn perform_microtask_checkpoint(&mut self) -> Result<(), ScriptError>;

    fn has_tick_scheduled(&self) -> bool {
        false
    }

    /// Run the tick queue (and the microtasks it produces) to exhaustion.
    fn run_tick_callback(&mut self) -> Result<(), ScriptError> {
        Ok(())
    }

    /// Deliver `event` to the process object's listeners.
    fn emit_process_event(&mut self, event: ProcessEvent, code: i32) -> Result<(), ScriptError>;

    /// Hand `warning` to managed code. `Ok(false)` means nothing took it.
    fn emit_warning(&mut self, _warning: &str) -> Result<bool, ScriptError> {
        Ok(false)
    }

    /// Drop the realm's handle on `object`. Backends whose references are
    /// the objects themselves keep them.
    fn release(&mut self, _object: ObjectRef) {}

    /// Give managed code a chance to handle an uncaught exception.
    /// `Ok(true)` means handled, `Err` means the handler itself threw.
    fn handle_uncaught_exception(&mut self, _error: &ScriptError) -> Result<bool, ScriptError> {
        Ok(false)
    }

    /// Run tasks the engine posted to itself outside the platform.
    fn drain_engine_tasks(&mut self) {}

    /// Lets a loader reach its own backend's realm type.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn dispose(&mut self) {}
}

/// One engine instance.
pub trait Engine {
    fn name(&self) -> &'static str;

    fn version(&self) -> String;

    /// Runs after the instance is registered with the platform.
    fn initialize(&mut self, id: InstanceId, platform: Arc<Platform>) -> Result<(), StartupError>;

    /// Create a context and run the per-context script in it.
    fn new_context(&mut self, isolate_data: &IsolateData) -> Result<Box<dyn Realm>, ScriptError>;

    fn start_tracking_heap_objects(&mut self) {}

    fn dispose(&mut self);
}

pub trait EngineFactory {
    /// Allocate an uninitialized instance whose buffers come from `allocator`.
    fn allocate(
        &self,
        allocator: Arc<ArrayBufferAllocator>,
        config: &RuntimeConfig,
    ) -> Result<Box<dyn Engine>, StartupError>;
}

/// Compiles built-in modules as functions of `parameters` and calls them.
pub trait NativeModuleLoader {
    fn compile_and_call(
        &self,
        realm: &mut dyn Realm,
        id: &str,
        parameters: &[&str],
        arguments: &[Value],
    ) -> Result<Value, ScriptError>;
}
