//! Running the built-in bootstrap modules.

use crate::engine::{NativeModuleLoader, Value};
use crate::env::Environment;

pub const LOADERS_MODULE: &str = "internal/bootstrap/loaders";
pub const NODE_MODULE: &str = "internal/bootstrap/node";
pub const PER_CONTEXT_MODULE: &str = "internal/per_context";

const LOADERS_PARAMETERS: &[&str] = &["process", "global"];
const NODE_PARAMETERS: &[&str] = &["process", "loaderExports", "isMainThread"];

/// Compile and call one bootstrap module.
///
/// On failure the exception is reported and the async-id stack is cleared,
/// since the enclosing scope can no longer pop its ids in order. Returns
/// `None` without running anything once managed calls are disabled.
pub fn execute_bootstrapper(
    env: &mut Environment,
    loader: &dyn NativeModuleLoader,
    id: &str,
    parameters: &[&str],
    arguments: &[Value],
) -> Option<Value> {
    if !env.can_call_into_js() {
        tracing::debug!(module = id, "managed calls disabled, skipping bootstrapper");
        return None;
    }

    tracing::debug!(module = id, "executing bootstrapper");

    match loader.compile_and_call(env.realm_mut(), id, parameters, arguments) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::error!(module = id, error = %error, "bootstrapper failed");
            env.trigger_fatal_exception(&error);
            env.async_hooks_mut().clear_async_id_stack();
            None
        }
    }
}

/// Run the loaders stage, then the main stage with the loaders' exports.
/// Returns false if either stage threw.
///
/// The loaders' exports and the main stage's result are released once the
/// main stage returns.
pub fn load_environment(env: &mut Environment, loader: &dyn NativeModuleLoader) -> bool {
    let process = env.realm_mut().process_object();
    let global = env.realm_mut().global_object();

    let Some(loader_exports) = execute_bootstrapper(
        env,
        loader,
        LOADERS_MODULE,
        LOADERS_PARAMETERS,
        &[process.clone(), global],
    ) else {
        return false;
    };

    let is_main_thread = Value::Bool(env.is_main_thread());

    let result = execute_bootstrapper(
        env,
        loader,
        NODE_MODULE,
        NODE_PARAMETERS,
        &[process, loader_exports.clone(), is_main_thread],
    );

    for value in [Some(loader_exports), result.clone()].into_iter().flatten() {
        if let Some(object) = value.as_object() {
            env.realm_mut().release(object);
        }
    }

    result.is_some()
}
