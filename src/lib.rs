//! Process lifecycle host for a managed script engine.
//!
//! One [`ProcessContext`] per process owns the shared [`Platform`]. Each
//! call to [`start`] creates an engine instance, bootstraps an
//! [`Environment`] in it, and drives the environment's [`RunLoop`] until
//! nothing is left to do, returning the exit code.

pub mod allocator;
pub mod bootstrap;
pub mod callback_scope;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod event_loop;
pub mod invariant;
pub mod isolate_data;
pub mod metadata;
pub mod platform;
pub mod process;
pub mod process_context;
pub mod run_loop;
pub mod thread_pool_work;

// Core API
pub use callback_scope::{CallbackScope, ResourceExpectation, ScopeState, make_callback};
pub use config::RuntimeConfig;
pub use engine::{Engine, EngineFactory, NativeModuleLoader, ObjectRef, ProcessEvent, Realm, Value};
pub use env::{AsyncContext, AsyncId, CleanupHookId, Environment, ProcessState};
pub use error::{
    CancelError, EXIT_EXCEPTION_HANDLER_FAILED, EXIT_INTERNAL_ERROR, EXIT_OK, EXIT_UNCAUGHT_EXCEPTION,
    ScheduleError, ScriptError, StartupError, UV_ECANCELED, UV_EIO,
};
pub use event_loop::{LoopHandle, RunMode};
pub use isolate_data::IsolateData;
pub use platform::{InstanceId, Platform};
pub use process::start;
pub use process_context::ProcessContext;
pub use run_loop::{LoopPhase, RunLoop, RunLoopStats};
pub use thread_pool_work::{ThreadPoolWork, WorkRequest};
