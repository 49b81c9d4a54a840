//! Status command - check the container engine and kiln's state

use crate::cache::volume::{RUN_VOLUME_PREFIX, VOLUME_PREFIX};
use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::orchestration::{create_runtime, ContainerRuntime};
use crate::ui::{self, UiContext};
use std::path::Path;

/// Execute the status command
pub async fn execute(config: &Config, state_dir: &Path) -> KilnResult<()> {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "kiln status");

    let runtime = create_runtime(config)?;
    let engine_ok = check_engine(&*runtime, &ctx, &config.engine.program).await;

    ui::section(&ctx, "State");
    ui::key_value(&ctx, "Directory", &state_dir.display().to_string());

    if engine_ok {
        check_volumes(&*runtime, &ctx).await;
        ui::outro_success(&ctx, "Engine ready");
        Ok(())
    } else {
        ui::outro_error(&ctx, "Engine not ready");
        Err(KilnError::EngineUnavailable {
            reason: format!("{} is not usable", config.engine.program),
        })
    }
}

async fn check_engine(runtime: &dyn ContainerRuntime, ctx: &UiContext, program: &str) -> bool {
    ui::section(ctx, runtime.runtime_name());
    ui::key_value(ctx, "Program", program);

    match runtime.is_available().await {
        Ok(true) => {}
        Ok(false) => {
            ui::step_warn_hint(ctx, "Not installed", "install podman or set engine.program");
            return false;
        }
        Err(e) => {
            ui::step_error(ctx, &e.to_string());
            return false;
        }
    }

    match runtime.version().await {
        Ok(version) => {
            ui::key_value_status(ctx, "Version", &version, true);
            true
        }
        Err(e) => {
            ui::key_value_status(ctx, "Version", &e.to_string(), false);
            false
        }
    }
}

async fn check_volumes(runtime: &dyn ContainerRuntime, ctx: &UiContext) {
    match runtime.volume_list(VOLUME_PREFIX).await {
        Ok(volumes) => ui::key_value(ctx, "Cache volumes", &volumes.len().to_string()),
        Err(e) => ui::step_warn(ctx, &format!("Could not list volumes: {}", e)),
    }

    if let Ok(orphans) = runtime.volume_list(RUN_VOLUME_PREFIX).await {
        if !orphans.is_empty() {
            ui::step_warn_hint(
                ctx,
                &format!("{} private run volume(s) present", orphans.len()),
                "kiln cache gc removes ones left by dead builds",
            );
        }
    }
}
