//! Terminal UI
//!
//! `cliclack` spinners and prompts, an `indicatif` bar for image builds,
//! and plain line output when not attached to a terminal or running in CI.
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln::ui::{self, StepProgress, UiContext};
//!
//! let ctx = UiContext::detect();
//! ui::intro(&ctx, "kiln build");
//! let progress = StepProgress::new(&ctx);
//! let report = Pipeline::new(runtime, &state_dir, &progress).run(&plan).await?;
//! ui::outro_success(&ctx, "Published");
//! ```

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::UiContext;
pub use output::{
    intro, key_value, key_value_status, outro_error, outro_success, remark, section, step_error,
    step_info, step_ok, step_ok_detail, step_warn, step_warn_hint,
};
pub use progress::{BuildProgress, StepProgress, TaskSpinner};
pub use prompts::confirm;
pub use theme::{init_theme, KilnTheme};
