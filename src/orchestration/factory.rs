//! Runtime factory for creating the configured container engine

use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::orchestration::engine::CliRuntime;
use crate::orchestration::runtime::ContainerRuntime;

/// Create the container runtime named by `engine.program`
///
/// # Returns
/// * `Ok(Box<dyn ContainerRuntime>)` - A boxed runtime implementation
/// * `Err` - If no engine program is configured
pub fn create_runtime(config: &Config) -> KilnResult<Box<dyn ContainerRuntime>> {
    let program = config.engine.program.trim();
    if program.is_empty() {
        return Err(KilnError::EngineNotFound(
            "engine.program is empty".to_string(),
        ));
    }
    Ok(Box::new(CliRuntime::new(program)))
}
