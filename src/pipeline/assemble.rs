//! Runtime stage
//!
//! Assembles the final image from the pinned base image and the builder's
//! artifact alone. The image is built under a staging tag, checked, and only
//! then tagged with its final name, so a failed run publishes nothing.

use crate::error::{KilnError, KilnResult};
use crate::orchestration::{ContainerRuntime, ContainerStatus};
use crate::pipeline::builder::{ensure_image, sha256_hex, Artifact};
use crate::pipeline::containerfile::{self, labels};
use crate::pipeline::plan::BuildPlan;
use crate::pipeline::report::{BuildReport, ImageReport, ProgressSink};
use crate::pipeline::{bounded, RunId, Stage, Step, Tracker};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Run the runtime stage under its budget
pub async fn run(
    runtime: &dyn ContainerRuntime,
    progress: &dyn ProgressSink,
    plan: &BuildPlan,
    run: &RunId,
    artifact: &Artifact,
    report: &mut BuildReport,
) -> KilnResult<()> {
    let staging_tag = format!("kiln-staging-{}", run.short());
    let smoke_name = format!("kiln-smoke-{}", run.short());
    let final_tag = plan.final_tag(run);
    let mut built = false;
    let mut tagged = false;

    let result = {
        let mut tracker = Tracker {
            report: &mut *report,
            progress,
        };
        bounded(
            Stage::Runtime,
            plan.runtime_budget,
            steps(
                runtime,
                progress,
                plan,
                run,
                artifact,
                &staging_tag,
                &smoke_name,
                &final_tag,
                &mut built,
                &mut tagged,
                &mut tracker,
            ),
        )
        .await
    };

    if matches!(
        result,
        Err(KilnError::StageTimeout { .. }) | Err(KilnError::Interrupted)
    ) {
        report.mark_running_timed_out();
    }

    if plan.smoke.is_some() {
        if let Err(e) = runtime.remove(&smoke_name).await {
            warn!("Failed to remove smoke-test container {}: {}", smoke_name, e);
        }
    }

    if result.is_err() && built {
        debug!("Removing unpublished image {}", staging_tag);
        if let Err(e) = runtime.image_remove(&staging_tag).await {
            warn!("Failed to remove staging image {}: {}", staging_tag, e);
        }
    }

    // A run that fails after tagging must not leave the final tag behind
    if result.is_err() && tagged {
        debug!("Withdrawing {}", final_tag);
        if let Err(e) = runtime.image_remove(&final_tag).await {
            warn!("Failed to remove tag {}: {}", final_tag, e);
        }
    }

    result
}

#[allow(clippy::too_many_arguments)]
async fn steps(
    runtime: &dyn ContainerRuntime,
    progress: &dyn ProgressSink,
    plan: &BuildPlan,
    run: &RunId,
    artifact: &Artifact,
    staging_tag: &str,
    smoke_name: &str,
    final_tag: &str,
    built: &mut bool,
    tagged: &mut bool,
    tracker: &mut Tracker<'_>,
) -> KilnResult<()> {
    let base = plan.base.to_string();

    tracker
        .step(Step::ResolveBase, async {
            ensure_image(runtime, &base)
                .await
                .map_err(|reason| KilnError::BaseImageResolve {
                    image: base.clone(),
                    reason,
                })
        })
        .await?;

    tracker
        .step(Step::Assemble, async {
            let context = prepare_context(plan, run, artifact).await?;
            *built = true;
            runtime
                .build_image(&context, staging_tag, &|line| {
                    progress.step_output(Step::Assemble, &line)
                })
                .await
        })
        .await?;

    tracker
        .step(Step::Verify, async {
            verify_image(runtime, plan, artifact, staging_tag).await?;
            if let Some(duration) = plan.smoke {
                smoke_test(runtime, staging_tag, smoke_name, duration).await?;
            }
            Ok(())
        })
        .await?;

    let image = tracker
        .step(Step::Publish, async {
            runtime.image_tag(staging_tag, final_tag).await?;
            *tagged = true;
            if let Err(e) = runtime.image_remove(staging_tag).await {
                warn!("Failed to drop staging tag {}: {}", staging_tag, e);
            }
            runtime
                .image_inspect(final_tag)
                .await?
                .ok_or_else(|| KilnError::Internal(format!("{} vanished after tagging", final_tag)))
        })
        .await?;

    info!("Published {} ({})", final_tag, image.id);
    tracker.report.image = Some(ImageReport {
        tag: final_tag.to_string(),
        id: image.id,
        entrypoint: image.entrypoint,
        size_bytes: image.size_bytes,
    });

    Ok(())
}

/// Build a context directory holding only the Containerfile and the binary.
///
/// The artifact is re-hashed first so a truncated or swapped file never
/// reaches an image.
async fn prepare_context(plan: &BuildPlan, run: &RunId, artifact: &Artifact) -> KilnResult<PathBuf> {
    let copy_error = |reason: String| KilnError::ArtifactCopy {
        binary: artifact.name.clone(),
        reason,
    };

    let bytes = tokio::fs::read(&artifact.path)
        .await
        .map_err(|e| copy_error(format!("{}: {}", artifact.path.display(), e)))?;
    if sha256_hex(&bytes) != artifact.sha256 {
        return Err(copy_error("binary changed after extraction".to_string()));
    }

    let staging = artifact
        .path
        .parent()
        .ok_or_else(|| KilnError::Internal("artifact has no staging directory".to_string()))?;
    let context = staging.join("context");
    write_context(&context, plan, run, artifact, &bytes).await?;
    Ok(context)
}

async fn write_context(
    context: &Path,
    plan: &BuildPlan,
    run: &RunId,
    artifact: &Artifact,
    bytes: &[u8],
) -> KilnResult<()> {
    tokio::fs::create_dir_all(context)
        .await
        .map_err(|e| KilnError::io(format!("creating {}", context.display()), e))?;

    let binary_path = context.join(&artifact.name);
    tokio::fs::write(&binary_path, bytes)
        .await
        .map_err(|e| KilnError::io(format!("writing {}", binary_path.display()), e))?;
    set_executable(&binary_path).await?;

    let text = containerfile::render(plan, &run.to_string(), &artifact.sha256);
    tokio::fs::write(context.join("Containerfile"), text)
        .await
        .map_err(|e| KilnError::io("writing Containerfile", e))
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> KilnResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| KilnError::io(format!("chmod {}", path.display()), e))
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> KilnResult<()> {
    Ok(())
}

/// Check the staged image runs the binary with no arguments from the workdir
async fn verify_image(
    runtime: &dyn ContainerRuntime,
    plan: &BuildPlan,
    artifact: &Artifact,
    tag: &str,
) -> KilnResult<()> {
    let fail = |reason: String| KilnError::Verify {
        tag: tag.to_string(),
        reason,
    };

    let info = runtime
        .image_inspect(tag)
        .await?
        .ok_or_else(|| fail("image not found after build".to_string()))?;

    let expected = containerfile::entrypoint(&plan.binary);
    if info.entrypoint != expected {
        return Err(fail(format!(
            "entrypoint is {:?}, expected {:?}",
            info.entrypoint, expected
        )));
    }
    if !info.cmd.is_empty() {
        return Err(fail(format!("unexpected command arguments {:?}", info.cmd)));
    }
    if info.workdir.trim_end_matches('/') != plan.runtime_workdir.trim_end_matches('/') {
        return Err(fail(format!(
            "working directory is {:?}, expected {:?}",
            info.workdir, plan.runtime_workdir
        )));
    }
    if info.labels.get(labels::BINARY_SHA256) != Some(&artifact.sha256) {
        return Err(fail("binary digest label does not match the artifact".to_string()));
    }

    Ok(())
}

/// Start the image and require it to survive `duration` (or exit cleanly)
async fn smoke_test(
    runtime: &dyn ContainerRuntime,
    tag: &str,
    name: &str,
    duration: std::time::Duration,
) -> KilnResult<()> {
    runtime.run_detached(tag, name).await?;
    tokio::time::sleep(duration).await;

    let status = runtime.container_status(name).await?;
    runtime.remove(name).await?;

    match status {
        ContainerStatus::Running | ContainerStatus::Exited(0) => Ok(()),
        ContainerStatus::Exited(code) => Err(KilnError::Verify {
            tag: tag.to_string(),
            reason: format!("container exited with code {} during smoke test", code),
        }),
        ContainerStatus::Missing => Err(KilnError::Verify {
            tag: tag.to_string(),
            reason: "container disappeared during smoke test".to_string(),
        }),
    }
}
