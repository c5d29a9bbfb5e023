//! Process-wide state shared by every engine instance.
//!
//! Built once per process and passed by reference into [`crate::start`].
//! It owns the platform, the options, and the record of which engine
//! instance is current. The record is written once at startup and cleared
//! once at shutdown, both under the same lock.

use std::sync::{Arc, Mutex};

use crate::config::RuntimeConfig;
use crate::invariant::{check, fatal_error};
use crate::platform::{InstanceId, Platform};

pub struct ProcessContext {
    config: Arc<RuntimeConfig>,
    platform: Arc<Platform>,
    current_instance: Mutex<Option<InstanceId>>,
}

impl ProcessContext {
    pub fn new(config: RuntimeConfig) -> Self {
        let platform = Platform::new(config.platform_threads);
        platform.start_tracing_agent(&config.trace_categories);

        tracing::debug!(
            platform_threads = config.platform_threads,
            threadpool_size = config.threadpool_size,
            "process context initialized"
        );

        Self {
            config: Arc::new(config),
            platform,
            current_instance: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn current_instance(&self) -> Option<InstanceId> {
        *self.current_instance.lock().expect("current instance poisoned")
    }

    /// Mark `id` as the current engine instance until the guard drops.
    ///
    /// Only one instance may be current at a time.
    pub fn enter_instance(&self, id: InstanceId) -> CurrentInstance<'_> {
        let mut current = self.current_instance.lock().expect("current instance poisoned");

        if let Some(existing) = *current {
            drop(current);
            fatal_error(format!("{} is already current, cannot enter {}", existing, id));
        }

        *current = Some(id);
        CurrentInstance { context: self, id }
    }

    /// Stop the tracing agent and join the platform workers.
    pub fn dispose(&self) {
        self.platform.stop_tracing_agent();
        self.platform.shutdown();
    }
}

/// Clears the current-instance record on drop.
pub struct CurrentInstance<'a> {
    context: &'a ProcessContext,
    id: InstanceId,
}

impl CurrentInstance<'_> {
    pub fn id(&self) -> InstanceId {
        self.id
    }
}

impl Drop for CurrentInstance<'_> {
    fn drop(&mut self) {
        let mut current = self
            .context
            .current_instance
            .lock()
            .expect("current instance poisoned");

        let matches = *current == Some(self.id);
        *current = None;
        drop(current);

        if !std::thread::panicking() {
            check(matches, format!("current instance changed while {} was running", self.id));
        }
    }
}
