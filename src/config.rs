//! Runtime configuration.
//!
//! One `RuntimeConfig` is built per process and shared (behind an `Arc`) by
//! the [`ProcessContext`](crate::ProcessContext), every engine instance and
//! every environment created from it.

/// Worker threads for platform background tasks.
pub const DEFAULT_PLATFORM_THREADS: usize = 4;

/// Blocking pool size used for thread-pool work (same default as libuv).
pub const DEFAULT_THREADPOOL_SIZE: usize = 4;

/// Upper bound accepted for `UV_THREADPOOL_SIZE`.
pub const MAX_THREADPOOL_SIZE: usize = 1024;

/// Largest megabyte count whose byte size still fits in a `usize`.
pub const MAX_SIZE_MB: usize = usize::MAX / BYTES_PER_MB;

const BYTES_PER_MB: usize = 1024 * 1024;

/// Log a warning every this many consecutive before-exit passes.
pub const DEFAULT_BEFORE_EXIT_WARN_INTERVAL: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Platform worker threads (background tasks posted by the engine).
    pub platform_threads: usize,
    /// Threads available to `ThreadPoolWork::do_thread_pool_work`.
    pub threadpool_size: usize,
    /// Zero every ArrayBuffer allocation, ignoring the managed-side toggle.
    pub zero_fill_buffers: bool,
    /// External memory cap for the ArrayBuffer allocator, in MB. `None` = unbounded.
    pub array_buffer_max_mb: Option<usize>,
    pub heap_initial_mb: usize,
    pub heap_max_mb: usize,
    /// Ask the engine to track heap object allocations from startup.
    pub track_heap_objects: bool,
    pub profiling: bool,
    pub before_exit_warn_interval: u32,
    /// Hard cap on consecutive before-exit passes. `None` = unbounded.
    pub max_before_exit_passes: Option<u32>,
    /// Panic instead of reporting when an uncaught exception reaches the top.
    pub abort_on_uncaught_exception: bool,
    /// Categories enabled on the platform tracing agent. Empty = agent off.
    pub trace_categories: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            platform_threads: DEFAULT_PLATFORM_THREADS,
            threadpool_size: DEFAULT_THREADPOOL_SIZE,
            zero_fill_buffers: false,
            array_buffer_max_mb: None,
            heap_initial_mb: 1,
            heap_max_mb: 128,
            track_heap_objects: false,
            profiling: false,
            before_exit_warn_interval: DEFAULT_BEFORE_EXIT_WARN_INTERVAL,
            max_before_exit_passes: None,
            abort_on_uncaught_exception: false,
            trace_categories: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::default().with_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay values read through `lookup`. Unparseable values are logged
    /// and ignored.
    pub fn with_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(size) = parse_var::<usize>(&lookup, "UV_THREADPOOL_SIZE") {
            self.threadpool_size = size.clamp(1, MAX_THREADPOOL_SIZE);
        }

        if let Some(threads) = parse_var::<usize>(&lookup, "OPENWORKERS_PLATFORM_THREADS") {
            self.platform_threads = threads.max(1);
        }

        if let Some(flag) = parse_flag(&lookup, "OPENWORKERS_ZERO_FILL_BUFFERS") {
            self.zero_fill_buffers = flag;
        }

        if let Some(mb) = parse_megabytes(&lookup, "OPENWORKERS_ARRAY_BUFFER_MAX_MB") {
            self.array_buffer_max_mb = Some(mb);
        }

        if let Some(mb) = parse_megabytes(&lookup, "OPENWORKERS_HEAP_MAX_MB") {
            self.heap_max_mb = mb;
        }

        if let Some(flag) = parse_flag(&lookup, "OPENWORKERS_TRACK_HEAP_OBJECTS") {
            self.track_heap_objects = flag;
        }

        if let Some(passes) = parse_var::<u32>(&lookup, "OPENWORKERS_MAX_BEFORE_EXIT_PASSES") {
            self.max_before_exit_passes = (passes > 0).then_some(passes);
        }

        if let Some(flag) = parse_flag(&lookup, "OPENWORKERS_ABORT_ON_UNCAUGHT_EXCEPTION") {
            self.abort_on_uncaught_exception = flag;
        }

        if let Some(categories) = lookup("OPENWORKERS_TRACE_CATEGORIES") {
            self.trace_categories = categories
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }

        self
    }

    /// Saturates at `usize::MAX` for values set directly on the struct.
    pub fn array_buffer_max_bytes(&self) -> Option<usize> {
        self.array_buffer_max_mb.map(megabytes)
    }

    /// Initial and maximum engine heap, in bytes.
    pub fn heap_limits_bytes(&self) -> (usize, usize) {
        (megabytes(self.heap_initial_mb), megabytes(self.heap_max_mb))
    }
}

fn megabytes(mb: usize) -> usize {
    mb.saturating_mul(BYTES_PER_MB)
}

/// A size in MB whose byte count does not overflow. Larger values are
/// logged and ignored.
fn parse_megabytes(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let mb = parse_var::<usize>(lookup, key)?;

    if mb > MAX_SIZE_MB {
        tracing::warn!(key, mb, max = MAX_SIZE_MB, "ignoring size that overflows a byte count");
        return None;
    }

    Some(mb)
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;

    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;

    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid boolean flag");
            None
        }
    }
}
