//! Error types and process exit codes.

use thiserror::Error;

/// Normal termination.
pub const EXIT_OK: i32 = 0;

/// An exception reached the top level and nothing handled it.
pub const EXIT_UNCAUGHT_EXCEPTION: i32 = 1;

/// The uncaught-exception handler itself threw.
pub const EXIT_EXCEPTION_HANDLER_FAILED: i32 = 7;

/// Engine allocation or context bootstrap failed.
pub const EXIT_INTERNAL_ERROR: i32 = 12;

/// Completion status of a cancelled thread-pool work unit.
pub const UV_ECANCELED: i32 = -125;

/// Completion status of a work unit whose worker-side step panicked.
pub const UV_EIO: i32 = -5;

/// An exception thrown by managed code.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
    pub stack: Option<String>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Failures before the run loop is entered.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to allocate engine instance: {0}")]
    EngineAllocation(String),

    #[error("failed to initialize engine instance: {0}")]
    EngineInitialization(String),

    #[error("failed to create context: {0}")]
    ContextCreation(#[source] ScriptError),

    #[error("failed to build event loop: {0}")]
    EventLoop(#[from] std::io::Error),

    #[error("bootstrap failed")]
    Bootstrap,
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Bootstrap => EXIT_UNCAUGHT_EXCEPTION,
            _ => EXIT_INTERNAL_ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("environment cleanup has started")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("work is already running")]
    Running,

    #[error("work has already completed")]
    Completed,

    #[error("work was already cancelled")]
    AlreadyCancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_exit_codes() {
        assert_eq!(
            StartupError::EngineAllocation("oom".into()).exit_code(),
            EXIT_INTERNAL_ERROR
        );
        assert_eq!(
            StartupError::ContextCreation(ScriptError::new("boom")).exit_code(),
            EXIT_INTERNAL_ERROR
        );
        assert_eq!(StartupError::Bootstrap.exit_code(), EXIT_UNCAUGHT_EXCEPTION);
    }

    #[test]
    fn test_script_error_display() {
        let err = ScriptError::new("ReferenceError: x is not defined").with_stack("at <anon>:1:1");
        assert_eq!(err.to_string(), "ReferenceError: x is not defined");
        assert_eq!(err.stack.as_deref(), Some("at <anon>:1:1"));
    }
}
