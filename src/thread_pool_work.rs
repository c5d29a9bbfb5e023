//! Blocking native work bridged back into the event loop.
//!
//! A [`ThreadPoolWork`] unit runs its blocking step on the loop's blocking
//! pool and its completion step on the loop thread. Scheduling counts the
//! unit as an outstanding request of the environment, so the loop stays
//! alive and cleanup waits for it. The counter is released before
//! `after_thread_pool_work` runs, so the completion step may schedule more
//! work.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::env::Environment;
use crate::error::{CancelError, ScheduleError, UV_ECANCELED, UV_EIO};

pub trait ThreadPoolWork: Send + 'static {
    /// Runs on a pool thread. Must not touch managed state.
    fn do_thread_pool_work(&mut self);

    /// Runs on the loop thread, exactly once, after `do_thread_pool_work`
    /// has returned. `status` is 0 on success, `UV_ECANCELED` if the unit
    /// was cancelled before it started, `UV_EIO` if the worker step panicked.
    fn after_thread_pool_work(self: Box<Self>, env: &mut Environment, status: i32);
}

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

/// Lifecycle of a scheduled unit, shared by the pool thread and the handle.
#[derive(Debug)]
pub(crate) struct WorkState(AtomicU8);

impl WorkState {
    fn new() -> Self {
        Self(AtomicU8::new(QUEUED))
    }

    fn try_start(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        self.0.store(DONE, Ordering::Release);
    }

    pub(crate) fn cancel(&self) -> Result<(), CancelError> {
        match self
            .0
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(RUNNING) => Err(CancelError::Running),
            Err(CANCELLED) => Err(CancelError::AlreadyCancelled),
            Err(_) => Err(CancelError::Completed),
        }
    }
}

/// Handle to a scheduled unit.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    state: Arc<WorkState>,
}

impl WorkRequest {
    /// Submit `work` to the blocking pool.
    ///
    /// Rejected once cleanup has started.
    pub fn schedule(env: &mut Environment, work: Box<dyn ThreadPoolWork>) -> Result<Self, ScheduleError> {
        if env.cleanup_started() {
            return Err(ScheduleError::ShuttingDown);
        }

        let state = Arc::new(WorkState::new());
        let id = env.track_work_request(Arc::clone(&state));
        env.increase_waiting_request_counter();

        let request = env.event_loop().begin_request();
        let worker_state = Arc::clone(&state);
        let mut work = work;

        let _ = env.event_loop().runtime_handle().spawn_blocking(move || {
            let status = if worker_state.try_start() {
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work.do_thread_pool_work()));
                worker_state.finish();

                match outcome {
                    Ok(()) => 0,
                    Err(_) => {
                        tracing::error!("thread pool work panicked");
                        UV_EIO
                    }
                }
            } else {
                UV_ECANCELED
            };

            request.complete(Box::new(move |env: &mut Environment| {
                env.untrack_work_request(id);
                env.decrease_waiting_request_counter();
                work.after_thread_pool_work(env, status);
            }));
        });

        tracing::trace!(id, "thread pool work scheduled");
        Ok(Self { state })
    }

    /// Cancel the unit if it has not started. It then completes with
    /// `UV_ECANCELED` through the normal completion path. Never blocks.
    pub fn cancel(&self) -> Result<(), CancelError> {
        self.state.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.0.load(Ordering::Acquire) == CANCELLED
    }
}
