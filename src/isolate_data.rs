//! Per-engine-instance data shared by every environment on that instance.

use std::sync::Arc;

use crate::allocator::{ArrayBufferAllocator, ZeroFillToggle};
use crate::config::RuntimeConfig;
use crate::engine::ProcessEvent;
use crate::platform::{InstanceId, Platform};

/// Property and event names the realm looks up on every emit.
#[derive(Debug, Clone)]
pub struct InternedStrings {
    pub before_exit: Arc<str>,
    pub exit: Arc<str>,
    pub warning: Arc<str>,
    pub emit: Arc<str>,
    pub emit_warning: Arc<str>,
    pub exit_code: Arc<str>,
    pub exiting: Arc<str>,
    pub fatal_exception: Arc<str>,
}

impl Default for InternedStrings {
    fn default() -> Self {
        Self {
            before_exit: Arc::from("beforeExit"),
            exit: Arc::from("exit"),
            warning: Arc::from("warning"),
            emit: Arc::from("emit"),
            emit_warning: Arc::from("emitWarning"),
            exit_code: Arc::from("exitCode"),
            exiting: Arc::from("_exiting"),
            fatal_exception: Arc::from("_fatalException"),
        }
    }
}

impl InternedStrings {
    /// The name listeners register `event` under.
    pub fn event_name(&self, event: ProcessEvent) -> &Arc<str> {
        match event {
            ProcessEvent::BeforeExit => &self.before_exit,
            ProcessEvent::Exit => &self.exit,
            ProcessEvent::Warning => &self.warning,
        }
    }
}

/// Outlives every environment created against it (they hold an `Arc`).
pub struct IsolateData {
    instance_id: InstanceId,
    platform: Arc<Platform>,
    allocator: Option<Arc<ArrayBufferAllocator>>,
    config: Arc<RuntimeConfig>,
    engine_name: &'static str,
    engine_version: String,
    strings: InternedStrings,
}

impl IsolateData {
    pub fn new(
        instance_id: InstanceId,
        platform: Arc<Platform>,
        allocator: Option<Arc<ArrayBufferAllocator>>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            instance_id,
            platform,
            allocator,
            config,
            engine_name: "unknown",
            engine_version: String::new(),
            strings: InternedStrings::default(),
        }
    }

    pub fn with_engine(mut self, name: &'static str, version: impl Into<String>) -> Self {
        self.engine_name = name;
        self.engine_version = version.into();
        self
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn allocator(&self) -> Option<&Arc<ArrayBufferAllocator>> {
        self.allocator.as_ref()
    }

    /// The allocator's zero-fill switch, if this instance has an allocator.
    pub fn zero_fill_toggle(&self) -> Option<ZeroFillToggle> {
        self.allocator.as_ref().map(|a| a.zero_fill_toggle())
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine_name
    }

    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    pub fn strings(&self) -> &InternedStrings {
        &self.strings
    }
}

impl std::fmt::Debug for IsolateData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateData")
            .field("instance_id", &self.instance_id)
            .field("engine", &self.engine_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let strings = InternedStrings::default();
        assert_eq!(&**strings.event_name(ProcessEvent::BeforeExit), "beforeExit");
        assert_eq!(&**strings.event_name(ProcessEvent::Exit), "exit");
        assert_eq!(&**strings.event_name(ProcessEvent::Warning), "warning");
    }

    #[test]
    fn test_zero_fill_toggle_reaches_allocator() {
        let platform = Platform::new(1);
        let id = platform.register_instance();
        let allocator = ArrayBufferAllocator::new(None, false);
        let data = IsolateData::new(id, platform, Some(Arc::clone(&allocator)), Arc::new(RuntimeConfig::default()));

        let toggle = data.zero_fill_toggle().unwrap();
        toggle.set(false);
        assert!(!allocator.should_zero_fill());

        let bare = IsolateData::new(id, Arc::clone(data.platform()), None, Arc::new(RuntimeConfig::default()));
        assert!(bare.zero_fill_toggle().is_none());
    }
}
