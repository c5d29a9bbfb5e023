//! The top-level run loop.
//!
//! After bootstrap the loop alternates between the event loop and the
//! platform task queue until neither has work, offers a before-exit pass
//! (which may schedule more work and send the loop around again), and then
//! shuts the environment down.
//!
//! ```text
//!   Running ──▶ Draining ──alive──▶ Running
//!                  │
//!                idle
//!                  ▼
//!              BeforeExit ──alive──▶ Running
//!                  │
//!                idle
//!                  ▼
//!               Exiting ──▶ Exited(code)
//! ```
//!
//! A requested stop (uncaught exception) jumps to `Exiting` from any phase.
//! A requested exit (`process.reallyExit`) jumps straight to `Exited`,
//! skipping both notifications.

use crate::callback_scope::{CallbackScope, ResourceExpectation};
use crate::config::RuntimeConfig;
use crate::engine::{NativeModuleLoader, ProcessEvent};
use crate::env::{AsyncContext, Environment};
use crate::error::StartupError;
use crate::event_loop::RunMode;

/// Ids the bootstrap scope runs under.
pub const BOOTSTRAP_ASYNC_CONTEXT: AsyncContext = AsyncContext::new(1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Running,
    Draining,
    BeforeExit,
    Exiting,
    Exited(i32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLoopStats {
    /// Times the event loop was entered.
    pub iterations: u32,
    /// Before-exit passes, in total.
    pub before_exit_passes: u32,
    pub drains: u32,
}

pub struct RunLoop {
    phase: LoopPhase,
    stats: RunLoopStats,
    /// Before-exit passes since the loop last found work on its own.
    consecutive_before_exit: u32,
    warn_interval: u32,
    max_before_exit_passes: Option<u32>,
}

impl RunLoop {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            phase: LoopPhase::Running,
            stats: RunLoopStats::default(),
            consecutive_before_exit: 0,
            warn_interval: config.before_exit_warn_interval,
            max_before_exit_passes: config.max_before_exit_passes,
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn stats(&self) -> RunLoopStats {
        self.stats
    }

    /// Run the bootstrap modules inside one callback scope.
    pub fn bootstrap(env: &mut Environment, loader: &dyn NativeModuleLoader) -> Result<(), StartupError> {
        let mut scope = CallbackScope::new(
            env,
            None,
            BOOTSTRAP_ASYNC_CONTEXT,
            ResourceExpectation::AllowEmpty,
        );

        let loaded = crate::bootstrap::load_environment(&mut scope, loader);
        if !loaded {
            scope.mark_as_failed();
        }

        scope.close();
        drop(scope);

        // Bootstrap called `process.exit`. `run` finishes the job.
        if env.exit_requested() {
            return Ok(());
        }

        // A stop here means a microtask queued by bootstrap threw and
        // nothing handled it.
        if !loaded || env.is_stopping() {
            return Err(StartupError::Bootstrap);
        }

        Ok(())
    }

    /// Drive the environment to completion and return the exit code.
    pub fn run(&mut self, env: &mut Environment) -> i32 {
        loop {
            if let LoopPhase::Exited(code) = self.step(env) {
                return code;
            }
        }
    }

    /// Perform one transition.
    pub fn step(&mut self, env: &mut Environment) -> LoopPhase {
        let next = match self.phase {
            LoopPhase::Exited(_) => self.phase,
            _ if env.exit_requested() => LoopPhase::Exited(Self::really_exit(env)),
            _ if env.is_stopping() && self.phase != LoopPhase::Exiting => LoopPhase::Exiting,
            LoopPhase::Running => {
                self.stats.iterations += 1;
                env.run_event_loop(RunMode::Default);
                LoopPhase::Draining
            }
            LoopPhase::Draining => {
                self.stats.drains += 1;
                env.drain_platform_tasks();

                if env.event_loop().is_alive() {
                    self.consecutive_before_exit = 0;
                    LoopPhase::Running
                } else {
                    LoopPhase::BeforeExit
                }
            }
            LoopPhase::BeforeExit => self.before_exit(env),
            LoopPhase::Exiting => LoopPhase::Exited(Self::exit(env)),
        };

        tracing::trace!(from = ?self.phase, to = ?next, "run loop transition");
        self.phase = next;
        next
    }

    fn before_exit(&mut self, env: &mut Environment) -> LoopPhase {
        self.stats.before_exit_passes += 1;
        self.consecutive_before_exit += 1;

        if self.warn_interval > 0 && self.consecutive_before_exit % self.warn_interval == 0 {
            env.emit_warning(&format!(
                "beforeExit has scheduled more work {} times in a row",
                self.consecutive_before_exit
            ));

            if env.is_stopping() {
                return LoopPhase::Exiting;
            }
        }

        if let Some(max) = self.max_before_exit_passes
            && self.consecutive_before_exit > max
        {
            tracing::warn!(max, "before-exit pass limit reached, exiting");
            return LoopPhase::Exiting;
        }

        env.run_before_exit_callbacks();

        // Native callbacks may have scheduled work, in which case managed
        // listeners are not told the loop is about to exit.
        if !env.event_loop().is_alive() {
            emit_process_event(env, ProcessEvent::BeforeExit);
        }

        if env.is_stopping() {
            LoopPhase::Exiting
        } else if env.event_loop().is_alive() {
            LoopPhase::Running
        } else {
            LoopPhase::Exiting
        }
    }

    fn exit(env: &mut Environment) -> i32 {
        env.process_state().set_exiting(true);
        emit_process_event(env, ProcessEvent::Exit);

        // Listeners may have changed it.
        let code = env.exit_code();
        tracing::debug!(code, "exit notification delivered");

        Self::shutdown(env);
        code
    }

    fn really_exit(env: &mut Environment) -> i32 {
        let code = env.exit_code();
        tracing::debug!(code, "exiting without notifications");

        Self::shutdown(env);
        code
    }

    /// Disable managed calls, run cleanup and at-exit callbacks, then drain
    /// and cancel platform tasks. Also used when bootstrap fails.
    pub fn shutdown(env: &mut Environment) {
        env.set_can_call_into_js(false);
        env.run_cleanup();
        env.run_at_exit_callbacks();
        env.drain_platform_tasks();
        env.cancel_platform_tasks();
    }
}

fn emit_process_event(env: &mut Environment, event: ProcessEvent) {
    let process = env.realm_mut().process_object();
    let code = env.exit_code();
    let mut scope = CallbackScope::for_resource(env, process, AsyncContext::default());

    if scope.failed() {
        return;
    }

    if let Err(error) = scope.realm_mut().emit_process_event(event, code) {
        scope.mark_as_failed();
        scope.trigger_fatal_exception(&error);
    }
}
