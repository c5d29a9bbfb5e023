#![allow(dead_code)]

use std::sync::Arc;

use openworkers_runtime_host::engine::Engine;
use openworkers_runtime_host::engine::closure::ClosureEngine;
use openworkers_runtime_host::{Environment, IsolateData, Platform, RuntimeConfig};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A started environment on the closure engine, with its own platform.
pub fn environment(config: RuntimeConfig) -> Environment {
    init_logging();

    let platform = Platform::new(1);
    let id = platform.register_instance();

    let mut engine = ClosureEngine::new();
    engine.initialize(id, Arc::clone(&platform)).unwrap();

    let data = IsolateData::new(id, platform, None, Arc::new(config)).with_engine(engine.name(), engine.version());
    let data = Arc::new(data);
    let realm = engine.new_context(&data).unwrap();

    let mut env = Environment::new(data, realm).unwrap();
    env.start(vec!["openworkers".to_string()], vec![], false);
    env
}

pub fn args() -> Vec<String> {
    vec!["openworkers".to_string(), "main.js".to_string()]
}
