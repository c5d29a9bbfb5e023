//! Process snapshot and the top-level entry point.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::allocator::ArrayBufferAllocator;
use crate::engine::{Engine, EngineFactory, NativeModuleLoader};
use crate::env::Environment;
use crate::error::StartupError;
use crate::isolate_data::IsolateData;
use crate::metadata::{Features, Versions};
use crate::process_context::ProcessContext;
use crate::run_loop::RunLoop;

/// Primitive process data handed to the realm when the process object is
/// installed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSnapshot {
    pub argv: Vec<String>,
    pub exec_argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub features: Features,
    pub versions: Versions,
    pub pid: u32,
    pub exec_path: Option<PathBuf>,
    pub title: String,
    pub platform: &'static str,
    pub arch: &'static str,
}

impl ProcessSnapshot {
    pub fn capture(args: &[String], exec_args: &[String], engine_name: &'static str, engine_version: &str) -> Self {
        let env = std::env::vars_os()
            .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
            .collect();

        Self {
            argv: args.to_vec(),
            exec_argv: exec_args.to_vec(),
            env,
            features: Features::current(),
            versions: Versions::new(engine_name, engine_version),
            pid: std::process::id(),
            exec_path: std::env::current_exe().ok(),
            title: args.first().cloned().unwrap_or_else(|| "openworkers".to_string()),
            platform: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }
}

/// Run one engine instance from creation to teardown and return the exit
/// code: 0, whatever managed code set, or 12 if the engine or its context
/// could not be created.
pub fn start(
    ctx: &ProcessContext,
    factory: &dyn EngineFactory,
    loader: &dyn NativeModuleLoader,
    args: Vec<String>,
    exec_args: Vec<String>,
) -> i32 {
    let config = ctx.config();
    let platform = ctx.platform();
    let allocator = ArrayBufferAllocator::new(config.array_buffer_max_bytes(), config.zero_fill_buffers);

    let mut engine = match factory.allocate(Arc::clone(&allocator), config) {
        Ok(engine) => engine,
        Err(err) => {
            tracing::error!(error = %err, "engine allocation failed");
            return err.exit_code();
        }
    };

    let instance_id = platform.register_instance();

    if let Err(err) = engine.initialize(instance_id, Arc::clone(platform)) {
        tracing::error!(error = %err, "engine initialization failed");
        engine.dispose();
        platform.unregister_instance(instance_id);
        return err.exit_code();
    }

    let exit_code = {
        let _current = ctx.enter_instance(instance_id);

        if config.track_heap_objects {
            engine.start_tracking_heap_objects();
        }

        let isolate_data = IsolateData::new(
            instance_id,
            Arc::clone(platform),
            Some(allocator),
            Arc::clone(config),
        )
        .with_engine(engine.name(), engine.version());

        run_instance(engine.as_mut(), Arc::new(isolate_data), loader, args, exec_args)
    };

    engine.dispose();
    platform.unregister_instance(instance_id);

    tracing::info!(exit_code, "engine instance finished");
    exit_code
}

fn run_instance(
    engine: &mut dyn Engine,
    isolate_data: Arc<IsolateData>,
    loader: &dyn NativeModuleLoader,
    args: Vec<String>,
    exec_args: Vec<String>,
) -> i32 {
    let config = Arc::clone(isolate_data.config());

    let realm = match engine.new_context(&isolate_data) {
        Ok(realm) => realm,
        Err(error) => {
            let err = StartupError::ContextCreation(error);
            tracing::error!(error = %err, "context creation failed");
            return err.exit_code();
        }
    };

    let mut env = match Environment::new(isolate_data, realm) {
        Ok(env) => env,
        Err(err) => {
            tracing::error!(error = %err, "environment creation failed");
            return err.exit_code();
        }
    };

    env.start(args, exec_args, config.profiling);

    if let Err(err) = RunLoop::bootstrap(&mut env, loader) {
        tracing::error!(error = %err, "not entering the run loop");
        RunLoop::shutdown(&mut env);

        return match env.exit_code() {
            0 if !env.exit_requested() => err.exit_code(),
            code => code,
        };
    }

    let mut run_loop = RunLoop::new(&config);
    let exit_code = run_loop.run(&mut env);

    let stats = run_loop.stats();
    tracing::debug!(
        iterations = stats.iterations,
        before_exit_passes = stats.before_exit_passes,
        "run loop finished"
    );

    exit_code
}
