//! The two-stage build pipeline
//!
//! A run compiles the service inside a builder container (toolchain image,
//! cache volumes, full source tree) and then assembles the final image from
//! the compiled binary alone. The stages run strictly in order, each under
//! its own wall-clock budget; the runtime stage never starts unless the
//! builder produced an artifact.

pub mod assemble;
pub mod builder;
pub mod containerfile;
pub mod plan;
pub mod report;

pub use builder::Artifact;
pub use plan::{BuildPlan, PlanOverrides};
pub use report::{BuildReport, NullProgress, ProgressSink, StepOutcome, StepRecord};

use crate::cache::CacheStore;
use crate::error::{KilnError, KilnResult};
use crate::orchestration::ContainerRuntime;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Builder,
    Runtime,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builder => write!(f, "builder"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// One attributable step of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    ResolveToolchain,
    AcquireCaches,
    Prepare,
    InstallToolchain,
    Compile,
    PostProcess,
    Extract,
    ResolveBase,
    Assemble,
    Verify,
    Publish,
}

impl Step {
    /// Every step, in execution order
    pub fn all() -> &'static [Self] {
        &[
            Self::ResolveToolchain,
            Self::AcquireCaches,
            Self::Prepare,
            Self::InstallToolchain,
            Self::Compile,
            Self::PostProcess,
            Self::Extract,
            Self::ResolveBase,
            Self::Assemble,
            Self::Verify,
            Self::Publish,
        ]
    }

    /// Stage the step belongs to
    pub fn stage(&self) -> Stage {
        match self {
            Self::ResolveBase | Self::Assemble | Self::Verify | Self::Publish => Stage::Runtime,
            _ => Stage::Builder,
        }
    }

    /// Progress message shown while the step runs
    pub fn label(&self) -> &'static str {
        match self {
            Self::ResolveToolchain => "Resolving toolchain image",
            Self::AcquireCaches => "Acquiring build caches",
            Self::Prepare => "Preparing builder container",
            Self::InstallToolchain => "Installing toolchain channel",
            Self::Compile => "Compiling",
            Self::PostProcess => "Compressing debug sections",
            Self::Extract => "Extracting binary",
            Self::ResolveBase => "Resolving base image",
            Self::Assemble => "Assembling runtime image",
            Self::Verify => "Verifying image",
            Self::Publish => "Publishing image",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResolveToolchain => "resolve-toolchain",
            Self::AcquireCaches => "acquire-caches",
            Self::Prepare => "prepare",
            Self::InstallToolchain => "install-toolchain",
            Self::Compile => "compile",
            Self::PostProcess => "post-process",
            Self::Extract => "extract",
            Self::ResolveBase => "resolve-base",
            Self::Assemble => "assemble",
            Self::Verify => "verify",
            Self::Publish => "publish",
        };
        write!(f, "{}", name)
    }
}

/// Identity of one pipeline invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 12 hex characters, used in container, volume and tag names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run `fut` under a stage budget, aborting on expiry or Ctrl-C.
///
/// The future is dropped when the budget runs out, so anything it must
/// release has to be owned by the caller and cleaned up afterwards.
pub(crate) async fn bounded<T, F>(stage: Stage, budget: Duration, fut: F) -> KilnResult<T>
where
    F: Future<Output = KilnResult<T>>,
{
    tokio::select! {
        result = tokio::time::timeout(budget, fut) => match result {
            Ok(inner) => inner,
            Err(_) => {
                warn!("{} stage exceeded {:?}", stage, budget);
                Err(KilnError::StageTimeout { stage, budget })
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted during {} stage", stage);
            Err(KilnError::Interrupted)
        }
    }
}

/// Records step outcomes into the report and mirrors them to a progress sink
pub(crate) struct Tracker<'a> {
    pub report: &'a mut BuildReport,
    pub progress: &'a dyn ProgressSink,
}

impl Tracker<'_> {
    /// Run one step, timing it and recording its outcome
    pub async fn step<T, F>(&mut self, step: Step, fut: F) -> KilnResult<T>
    where
        F: Future<Output = KilnResult<T>>,
    {
        debug!("Step {} started", step);
        self.progress.step_started(step);
        self.report.begin(step);
        let started = Instant::now();

        let result = fut.await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => {
                self.report.finish(step, StepOutcome::Ok, elapsed);
                self.progress.step_finished(step, elapsed);
            }
            Err(e) => {
                debug!("Step {} failed: {}", step, e);
                self.report.finish(step, StepOutcome::Failed, elapsed);
                self.progress.step_failed(step, elapsed);
            }
        }
        result
    }
}

/// Drives a [`BuildPlan`] through both stages against one engine
pub struct Pipeline<'a> {
    runtime: &'a dyn ContainerRuntime,
    store: CacheStore,
    staging_root: PathBuf,
    progress: &'a dyn ProgressSink,
}

impl<'a> Pipeline<'a> {
    /// Create a pipeline keeping cache records and staging under `state_dir`
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        state_dir: &Path,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            runtime,
            store: CacheStore::new(state_dir),
            staging_root: state_dir.join("staging"),
            progress,
        }
    }

    /// Run the whole pipeline, returning the report of a published image
    pub async fn run(&self, plan: &BuildPlan) -> KilnResult<BuildReport> {
        self.run_with_id(plan, RunId::new()).await
    }

    /// Run the pipeline under a given run id
    pub async fn run_with_id(&self, plan: &BuildPlan, run: RunId) -> KilnResult<BuildReport> {
        let started = Instant::now();
        let mut report = BuildReport::new(&run, plan);
        info!("Run {} building {}", run, plan.binary);

        self.runtime.ensure_ready().await?;

        let staging = self.staging_root.join(run.short());
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", staging.display()), e))?;

        let result = self.run_stages(plan, &run, &staging, &mut report).await;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!("Failed to remove staging directory {}: {}", staging.display(), e);
        }

        result?;
        report.total_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn run_stages(
        &self,
        plan: &BuildPlan,
        run: &RunId,
        staging: &Path,
        report: &mut BuildReport,
    ) -> KilnResult<()> {
        let artifact = builder::run(
            self.runtime,
            &self.store,
            self.progress,
            plan,
            run,
            staging,
            report,
        )
        .await?;

        assemble::run(self.runtime, self.progress, plan, run, &artifact, report).await
    }
}

#[cfg(test)]
mod tests;
