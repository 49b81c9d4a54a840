//! Builder stage
//!
//! Compiles the service inside a throwaway container created from the
//! pinned toolchain image, with the cache volumes mounted, and copies the
//! debug-compressed binary out to the run's staging directory. The
//! container is removed and the cache lease released on every path.

use crate::cache::{CacheLease, CacheMount, CacheStore};
use crate::error::{KilnError, KilnResult};
use crate::orchestration::{ContainerConfig, ContainerRuntime, ExecOutput};
use crate::pipeline::plan::BuildPlan;
use crate::pipeline::report::{ArtifactReport, BuildReport, CacheReport, ProgressSink};
use crate::pipeline::{bounded, RunId, Stage, Step, Tracker};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The compiled binary handed to the runtime stage
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Binary file name
    pub name: String,
    /// Host path inside the staging directory
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Hex SHA-256 of the file
    pub sha256: String,
}

impl Artifact {
    /// Hash and measure a binary copied out of the builder
    pub async fn from_file(name: &str, path: PathBuf) -> KilnResult<Self> {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| KilnError::ArtifactCopy {
                binary: name.to_string(),
                reason: format!("{}: {}", path.display(), e),
            })?;

        if bytes.is_empty() {
            return Err(KilnError::ArtifactCopy {
                binary: name.to_string(),
                reason: "copied binary is empty".to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            size_bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
            path,
        })
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Make an image available locally, pulling it if needed.
///
/// Returns the reason on failure so callers can attribute it to a stage.
pub(crate) async fn ensure_image(
    runtime: &dyn ContainerRuntime,
    image: &str,
) -> Result<(), String> {
    match runtime.image_exists(image).await {
        Ok(true) => return Ok(()),
        Ok(false) => {}
        Err(e) => return Err(e.to_string()),
    }

    match runtime.pull(image).await {
        Ok(()) => Ok(()),
        Err(KilnError::ImagePull { reason, .. }) => Err(reason),
        Err(e) => Err(e.to_string()),
    }
}

/// Run the builder stage under its budget
pub async fn run(
    runtime: &dyn ContainerRuntime,
    store: &CacheStore,
    progress: &dyn ProgressSink,
    plan: &BuildPlan,
    run: &RunId,
    staging: &Path,
    report: &mut BuildReport,
) -> KilnResult<Artifact> {
    let container = format!("kiln-build-{}", run.short());
    let mut lease = CacheLease::disabled();

    let result = {
        let mut tracker = Tracker {
            report: &mut *report,
            progress,
        };
        bounded(
            Stage::Builder,
            plan.builder_budget,
            steps(
                runtime,
                store,
                progress,
                plan,
                run,
                staging,
                &container,
                &mut lease,
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

    // Teardown runs whatever happened above
    if let Err(e) = runtime.remove(&container).await {
        warn!("Failed to remove builder container {}: {}", container, e);
    }

    if result.is_ok() {
        if let Err(e) = lease.commit(runtime, store).await {
            warn!("Build succeeded but caches were not updated: {}", e);
        }
    }
    lease.release(runtime).await;

    result
}

#[allow(clippy::too_many_arguments)]
async fn steps(
    runtime: &dyn ContainerRuntime,
    store: &CacheStore,
    progress: &dyn ProgressSink,
    plan: &BuildPlan,
    run: &RunId,
    staging: &Path,
    container: &str,
    lease: &mut CacheLease,
    tracker: &mut Tracker<'_>,
) -> KilnResult<Artifact> {
    let toolchain = plan.toolchain.to_string();

    tracker
        .step(Step::ResolveToolchain, async {
            ensure_image(runtime, &toolchain)
                .await
                .map_err(|reason| KilnError::ToolchainResolve {
                    image: toolchain.clone(),
                    reason,
                })
        })
        .await?;

    if let Some(spec) = &plan.cache {
        let short = run.short();
        tracker
            .step(
                Step::AcquireCaches,
                lease.acquire_into(runtime, spec, &short, store),
            )
            .await?;

        tracker.report.caches = lease
            .summary()
            .into_iter()
            .map(|(kind, volume, temperature)| CacheReport {
                kind,
                volume,
                temperature,
            })
            .collect();
    }

    let mounts = lease.mounts();
    tracker
        .step(Step::Prepare, async {
            let mut config = ContainerConfig::idle(&toolchain, container, &plan.builder_workdir);
            config.volumes = mounts.iter().map(CacheMount::volume_arg).collect();
            config
                .env
                .insert("CARGO_TERM_COLOR".to_string(), "never".to_string());
            config
                .labels
                .insert("io.kiln.run".to_string(), run.to_string());

            runtime.create(&config).await?;
            runtime
                .copy_into(container, &plan.source_dir, &plan.builder_workdir)
                .await?;
            runtime.start(container).await
        })
        .await?;

    tracker
        .step(Step::InstallToolchain, async {
            for command in plan.toolchain_commands() {
                let output =
                    exec_step(runtime, progress, container, Step::InstallToolchain, &command)
                        .await?;
                if !output.success() {
                    return Err(KilnError::ToolchainInstall {
                        channel: plan.channel.to_string(),
                        output: output.tail(),
                    });
                }
            }
            Ok(())
        })
        .await?;

    tracker
        .step(Step::Compile, async {
            let output = exec_step(
                runtime,
                progress,
                container,
                Step::Compile,
                &plan.compile_command(),
            )
            .await?;
            if output.success() {
                Ok(())
            } else {
                Err(KilnError::Compile {
                    binary: plan.binary.clone(),
                    output: output.tail(),
                })
            }
        })
        .await?;

    tracker
        .step(Step::PostProcess, async {
            let output = exec_step(
                runtime,
                progress,
                container,
                Step::PostProcess,
                &plan.post_process_command(),
            )
            .await?;
            if output.success() {
                Ok(())
            } else {
                Err(KilnError::PostProcess {
                    binary: plan.binary.clone(),
                    output: output.tail(),
                })
            }
        })
        .await?;

    let artifact = tracker
        .step(Step::Extract, async {
            let host_path = staging.join(&plan.binary);
            runtime
                .copy_out(container, &plan.artifact_path(), &host_path)
                .await
                .map_err(|e| KilnError::ArtifactCopy {
                    binary: plan.binary.clone(),
                    reason: e.to_string(),
                })?;
            Artifact::from_file(&plan.binary, host_path).await
        })
        .await?;

    info!(
        "Built {} ({} bytes, sha256 {})",
        artifact.name, artifact.size_bytes, artifact.sha256
    );
    tracker.report.artifact = Some(ArtifactReport {
        name: artifact.name.clone(),
        size_bytes: artifact.size_bytes,
        sha256: artifact.sha256.clone(),
    });

    Ok(artifact)
}

async fn exec_step(
    runtime: &dyn ContainerRuntime,
    progress: &dyn ProgressSink,
    container: &str,
    step: Step,
    command: &[String],
) -> KilnResult<ExecOutput> {
    debug!("{}: {}", step, command.join(" "));
    runtime
        .exec(container, command, &|line| progress.step_output(step, &line))
        .await
}
