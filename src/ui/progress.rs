//! Progress indicators with CI fallback

use super::context::UiContext;
use super::output;
use crate::pipeline::{ProgressSink, Step};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
    quiet: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
            quiet: ctx.is_quiet(),
        }
    }

    pub fn start(&mut self, message: &str) {
        if self.quiet {
            return;
        }
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Replace the running message (interactive only)
    pub fn message(&mut self, message: &str) {
        if let Some(ref spinner) = self.spinner {
            spinner.start(message);
        }
    }

    pub fn stop(&mut self, message: &str) {
        if self.quiet {
            return;
        }
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(message);
        } else {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    pub fn stop_error(&mut self, message: &str) {
        if self.quiet {
            return;
        }
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }

    pub fn clear(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.clear();
        }
    }
}

/// Progress bar for the runtime image build.
///
/// Tracks `STEP N/M: <instruction>` lines from the engine's build output.
pub struct BuildProgress {
    bar: Option<ProgressBar>,
}

impl BuildProgress {
    pub fn new(ctx: &UiContext, label: &str) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("  {spinner:.yellow} {prefix}  {bar:20.yellow/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}")
                    .unwrap()
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                    .progress_chars("━╸─"),
            );
            bar.set_prefix(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        } else {
            if !ctx.is_quiet() {
                println!("{} {}", style("...").dim(), label);
            }
            None
        };
        Self { bar }
    }

    pub fn on_line(&self, line: &str) {
        let Some(ref bar) = self.bar else {
            return;
        };
        if let Some((n, total, instruction)) = parse_step_line(line) {
            bar.set_length(total);
            bar.set_position(n);
            bar.set_message(instruction.to_string());
        } else {
            let trimmed = line.trim();
            if !trimmed.is_empty() && !is_build_noise(trimmed) {
                bar.set_message(shorten(trimmed, 60));
            }
        }
    }

    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

/// Engine build lines not worth showing
fn is_build_noise(line: &str) -> bool {
    line.starts_with("--->")
        || line.starts_with("-->")
        || line.starts_with("Removing intermediate")
        || line.starts_with("COMMIT")
}

/// Parse `STEP N/M: INSTRUCTION args...`
fn parse_step_line(line: &str) -> Option<(u64, u64, &str)> {
    let rest = line.strip_prefix("STEP ")?;
    let slash = rest.find('/')?;
    let colon = rest.find(':')?;
    if colon <= slash {
        return None;
    }
    let n: u64 = rest[..slash].parse().ok()?;
    let total: u64 = rest[slash + 1..colon].parse().ok()?;
    let instruction = rest[colon + 1..].trim();
    Some((n, total, instruction))
}

fn shorten(line: &str, max: usize) -> String {
    if line.chars().count() <= max {
        return line.to_string();
    }
    let head: String = line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", head)
}

struct StepState {
    spinner: TaskSpinner,
    build: Option<BuildProgress>,
}

/// Renders pipeline steps as spinners, and the image build as a bar
pub struct StepProgress {
    ctx: UiContext,
    state: Mutex<StepState>,
}

impl StepProgress {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            ctx: ctx.clone(),
            state: Mutex::new(StepState {
                spinner: TaskSpinner::new(ctx),
                build: None,
            }),
        }
    }

    fn with_state(&self, f: impl FnOnce(&mut StepState)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
    }
}

fn done_message(step: Step, elapsed: Duration) -> String {
    format!("{} ({:.1}s)", step.label(), elapsed.as_secs_f64())
}

impl ProgressSink for StepProgress {
    fn step_started(&self, step: Step) {
        self.with_state(|state| {
            if step == Step::Assemble {
                state.build = Some(BuildProgress::new(&self.ctx, step.label()));
            } else {
                state.spinner.start(step.label());
            }
        });
    }

    fn step_output(&self, step: Step, line: &str) {
        if !self.ctx.use_fancy_output() {
            return;
        }
        self.with_state(|state| match state.build {
            Some(ref build) => build.on_line(line),
            None => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    state
                        .spinner
                        .message(&format!("{}: {}", step.label(), shorten(trimmed, 60)));
                }
            }
        });
    }

    fn step_finished(&self, step: Step, elapsed: Duration) {
        self.with_state(|state| match state.build.take() {
            Some(build) => {
                build.finish();
                output::step_ok(&self.ctx, &done_message(step, elapsed));
            }
            None => state.spinner.stop(&done_message(step, elapsed)),
        });
    }

    fn step_failed(&self, step: Step, elapsed: Duration) {
        self.with_state(|state| match state.build.take() {
            Some(build) => {
                build.finish();
                output::step_error(&self.ctx, &format!("{} failed", step.label()));
            }
            None => state.spinner.stop_error(&format!(
                "{} failed after {:.1}s",
                step.label(),
                elapsed.as_secs_f64()
            )),
        });
    }
}
