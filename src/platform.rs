//! Process-wide task platform.
//!
//! Background tasks run on the blocking pool of a multi-thread tokio runtime
//! owned by the platform, sized by `platform_threads`. Each registered engine
//! instance also gets a foreground queue. Foreground tasks only ever run on
//! the thread that calls [`Platform::drain_tasks`] for their instance, which
//! is that instance's main thread. It also hosts the tracing agent switch.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Runtime;
use tokio::sync::watch;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifies an engine instance registered with the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// Decrements the outstanding count even if the task panics or is dropped
/// unrun.
struct TaskGuard(watch::Sender<usize>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count -= 1);
    }
}

pub struct Platform {
    runtime: Mutex<Option<Runtime>>,
    /// Background tasks posted but not yet finished.
    outstanding: watch::Sender<usize>,
    foreground: Mutex<HashMap<InstanceId, VecDeque<Task>>>,
    next_instance_id: AtomicU64,
    tracing_enabled: AtomicBool,
    trace_categories: Mutex<Vec<String>>,
}

impl Platform {
    /// Start the platform with `thread_pool_size` background threads.
    pub fn new(thread_pool_size: usize) -> Arc<Self> {
        let thread_count = thread_pool_size.max(1);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(thread_count)
            .thread_name("platform-worker")
            .build()
            .map_err(|e| log::error!("Failed to start platform runtime: {}", e))
            .ok();

        if runtime.is_some() {
            log::debug!("Platform started with {} background threads", thread_count);
        }

        let (outstanding, _) = watch::channel(0);

        Arc::new(Self {
            runtime: Mutex::new(runtime),
            outstanding,
            foreground: Mutex::new(HashMap::new()),
            next_instance_id: AtomicU64::new(1),
            tracing_enabled: AtomicBool::new(false),
            trace_categories: Mutex::new(Vec::new()),
        })
    }

    pub fn register_instance(&self) -> InstanceId {
        let id = InstanceId(self.next_instance_id.fetch_add(1, Ordering::SeqCst));

        self.foreground
            .lock()
            .expect("foreground queues poisoned")
            .insert(id, VecDeque::new());

        log::debug!("Registered {}", id);
        id
    }

    /// Forget an instance. Foreground tasks still queued for it are dropped.
    pub fn unregister_instance(&self, id: InstanceId) {
        let removed = self
            .foreground
            .lock()
            .expect("foreground queues poisoned")
            .remove(&id);

        match removed {
            Some(queue) if !queue.is_empty() => {
                log::warn!("Unregistered {} with {} pending tasks", id, queue.len())
            }
            Some(_) => log::debug!("Unregistered {}", id),
            None => log::warn!("Unregistering unknown {}", id),
        }
    }

    pub fn is_registered(&self, id: InstanceId) -> bool {
        self.foreground
            .lock()
            .expect("foreground queues poisoned")
            .contains_key(&id)
    }

    /// Run `task` on a background thread.
    pub fn post_background_task(&self, task: Task) {
        let runtime = self.runtime.lock().expect("platform runtime poisoned");

        let Some(runtime) = runtime.as_ref() else {
            log::warn!("Dropping background task posted after platform shutdown");
            return;
        };

        self.outstanding.send_modify(|count| *count += 1);
        let guard = TaskGuard(self.outstanding.clone());

        // A task the runtime never starts is dropped with its guard.
        runtime.spawn_blocking(move || {
            let _guard = guard;

            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
                log::error!("Background task panicked");
            }
        });
    }

    /// Background tasks posted but not yet finished.
    pub fn outstanding_tasks(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Block until no background task is outstanding.
    pub fn wait_idle(&self) {
        let mut idle = self.outstanding.subscribe();

        // The sender lives in `self`, so the channel cannot close here.
        let _ = futures::executor::block_on(idle.wait_for(|count| *count == 0));
    }

    /// Queue `task` for the main thread of `id`.
    pub fn post_foreground_task(&self, id: InstanceId, task: Task) {
        let mut queues = self.foreground.lock().expect("foreground queues poisoned");

        match queues.get_mut(&id) {
            Some(queue) => queue.push_back(task),
            None => log::warn!("Dropping foreground task for unknown {}", id),
        }
    }

    pub fn pending_foreground_tasks(&self, id: InstanceId) -> usize {
        self.foreground
            .lock()
            .expect("foreground queues poisoned")
            .get(&id)
            .map_or(0, VecDeque::len)
    }

    /// Run the foreground tasks queued for `id` right now. Tasks posted while
    /// flushing wait for the next flush. Returns how many ran.
    pub fn flush_foreground_tasks(&self, id: InstanceId) -> usize {
        let batch = {
            let mut queues = self.foreground.lock().expect("foreground queues poisoned");

            match queues.get_mut(&id) {
                Some(queue) => std::mem::take(queue),
                None => return 0,
            }
        };

        let ran = batch.len();

        for task in batch {
            task();
        }

        ran
    }

    /// Wait for every background task, then flush the foreground queue of
    /// `id`, until a flush finds nothing to run.
    pub fn drain_tasks(&self, id: InstanceId) {
        loop {
            self.wait_idle();

            if self.flush_foreground_tasks(id) == 0 {
                break;
            }
        }
    }

    /// Drop the foreground tasks still queued for `id`.
    pub fn cancel_pending_tasks(&self, id: InstanceId) -> usize {
        let mut queues = self.foreground.lock().expect("foreground queues poisoned");

        match queues.get_mut(&id) {
            Some(queue) => {
                let cancelled = queue.len();
                queue.clear();

                if cancelled > 0 {
                    log::debug!("Cancelled {} pending tasks for {}", cancelled, id);
                }

                cancelled
            }
            None => 0,
        }
    }

    pub fn start_tracing_agent(&self, categories: &[String]) {
        if categories.is_empty() {
            return;
        }

        *self.trace_categories.lock().expect("trace categories poisoned") = categories.to_vec();
        self.tracing_enabled.store(true, Ordering::SeqCst);
        log::info!("Tracing agent started: {}", categories.join(","));
    }

    pub fn stop_tracing_agent(&self) {
        if self.tracing_enabled.swap(false, Ordering::SeqCst) {
            self.trace_categories
                .lock()
                .expect("trace categories poisoned")
                .clear();
            log::info!("Tracing agent stopped");
        }
    }

    pub fn is_tracing(&self) -> bool {
        self.tracing_enabled.load(Ordering::SeqCst)
    }

    pub fn trace_categories(&self) -> Vec<String> {
        self.trace_categories
            .lock()
            .expect("trace categories poisoned")
            .clone()
    }

    /// Stop accepting background tasks, let the running ones finish and
    /// release the threads. Idempotent.
    pub fn shutdown(&self) {
        self.stop_tracing_agent();

        let Some(runtime) = self.runtime.lock().expect("platform runtime poisoned").take() else {
            return;
        };

        // Dropping a runtime from inside another one panics.
        if tokio::runtime::Handle::try_current().is_ok() {
            runtime.shutdown_background();
            return;
        }

        self.wait_idle();
        drop(runtime);
        log::debug!("Platform stopped");
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.shutdown();
    }
}
