//! Init command - write a project kiln.toml

use crate::cli::args::InitArgs;
use crate::config::LOCAL_CONFIG_NAME;
use crate::error::{KilnError, KilnResult};
use crate::pipeline::plan::infer_binary;
use crate::ui::{self, UiContext};
use tokio::fs;

/// Project config template; every setting left at its default
const INIT_TEMPLATE: &str = r#"# kiln project configuration
# Settings here override the global config (~/.config/kiln/config.toml)

[toolchain]
# Exact tag or digest, never latest
# image = "docker.io/library/rust:1.82.0-slim-bookworm"
# channel = "1.82.0"              # or nightly-YYYY-MM-DD

[artifact]
{binary_line}
# locked = true
# features = ["tls"]

[runtime]
# base_image = "docker.io/library/debian:bookworm-slim"
# workdir = "/app"

[cache]
# sharing = "locked"              # locked, isolated
# promote = true                  # isolated only: copy caches back on success
# lock_timeout_secs = 600

[timeouts]
# builder_secs = 3600
# runtime_secs = 600

[verify]
# smoke_secs = 0                  # run the image this long before publishing
"#;

fn render_template(binary: Option<&str>) -> String {
    let binary_line = match binary {
        Some(name) => format!("binary = \"{}\"", name),
        None => "# binary = \"my-service\"".to_string(),
    };
    INIT_TEMPLATE.replace("{binary_line}", &binary_line)
}

/// Execute the init command
pub async fn execute(args: InitArgs) -> KilnResult<()> {
    let ctx = UiContext::detect();

    let target_dir = match args.path {
        Some(p) => p,
        None => {
            std::env::current_dir().map_err(|e| KilnError::io("getting current directory", e))?
        }
    };
    let config_path = target_dir.join(LOCAL_CONFIG_NAME);

    if config_path.exists() && !args.force {
        return Err(KilnError::User(format!(
            "{} already exists. Use --force to overwrite.",
            config_path.display()
        )));
    }

    fs::create_dir_all(&target_dir)
        .await
        .map_err(|e| KilnError::io(format!("creating directory {}", target_dir.display()), e))?;

    // Pre-fill the binary when the manifest names one unambiguously
    let binary = infer_binary(&target_dir).ok();

    fs::write(&config_path, render_template(binary.as_deref()))
        .await
        .map_err(|e| KilnError::io(format!("writing {}", config_path.display()), e))?;

    ui::step_ok_detail(
        &ctx,
        "Created project config",
        &config_path.display().to_string(),
    );

    Ok(())
}
