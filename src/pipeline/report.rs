//! Build reports and progress reporting

use crate::cache::{CacheKind, CacheTemperature};
use crate::pipeline::plan::BuildPlan;
use crate::pipeline::{RunId, Step};
use serde::Serialize;
use std::time::Duration;

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepOutcome {
    /// Started and not yet finished (or cut off by a timeout)
    Running,
    Ok,
    Failed,
    TimedOut,
}

/// Timing and outcome of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
}

/// One cache as seen by a run
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    #[serde(serialize_with = "serialize_display")]
    pub kind: CacheKind,
    pub volume: String,
    pub temperature: CacheTemperature,
}

/// The binary handed from the builder to the runtime stage
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactReport {
    pub name: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// The published image
#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub tag: String,
    pub id: String,
    pub entrypoint: Vec<String>,
    pub size_bytes: Option<u64>,
}

/// Everything a run produced, printed at the end of `kiln build`
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub run_id: String,
    pub binary: String,
    pub toolchain_image: String,
    pub channel: String,
    pub base_image: String,
    pub steps: Vec<StepRecord>,
    pub caches: Vec<CacheReport>,
    pub artifact: Option<ArtifactReport>,
    pub image: Option<ImageReport>,
    pub total_ms: u64,
}

fn serialize_display<S: serde::Serializer>(kind: &CacheKind, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(kind)
}

impl BuildReport {
    /// Empty report for a run
    pub fn new(run: &RunId, plan: &BuildPlan) -> Self {
        Self {
            run_id: run.to_string(),
            binary: plan.binary.clone(),
            toolchain_image: plan.toolchain.to_string(),
            channel: plan.channel.to_string(),
            base_image: plan.base.to_string(),
            steps: Vec::new(),
            caches: Vec::new(),
            artifact: None,
            image: None,
            total_ms: 0,
        }
    }

    pub(crate) fn begin(&mut self, step: Step) {
        self.steps.push(StepRecord {
            step,
            outcome: StepOutcome::Running,
            duration_ms: 0,
        });
    }

    pub(crate) fn finish(&mut self, step: Step, outcome: StepOutcome, elapsed: Duration) {
        if let Some(record) = self.steps.iter_mut().rev().find(|r| r.step == step) {
            record.outcome = outcome;
            record.duration_ms = elapsed.as_millis() as u64;
        }
    }

    /// Mark a step cut off by a stage timeout
    pub(crate) fn mark_running_timed_out(&mut self) {
        for record in &mut self.steps {
            if record.outcome == StepOutcome::Running {
                record.outcome = StepOutcome::TimedOut;
            }
        }
    }

    /// Outcome of a step, if it ran
    pub fn outcome(&self, step: Step) -> Option<StepOutcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| r.outcome)
    }

    /// Whether every cache was already populated
    pub fn is_warm(&self) -> bool {
        !self.caches.is_empty()
            && self
                .caches
                .iter()
                .all(|c| c.temperature == CacheTemperature::Warm)
    }
}

/// Receives step progress as a run advances
pub trait ProgressSink: Send + Sync {
    /// A step began
    fn step_started(&self, step: Step);

    /// A line of engine or tool output produced by a step
    fn step_output(&self, step: Step, line: &str);

    /// A step completed
    fn step_finished(&self, step: Step, elapsed: Duration);

    /// A step failed
    fn step_failed(&self, step: Step, elapsed: Duration);
}

/// Discards all progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn step_started(&self, _step: Step) {}
    fn step_output(&self, _step: Step, _line: &str) {}
    fn step_finished(&self, _step: Step, _elapsed: Duration) {}
    fn step_failed(&self, _step: Step, _elapsed: Duration) {}
}
