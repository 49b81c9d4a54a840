//! Confirmation prompts with a non-interactive fallback

use super::context::UiContext;
use crate::error::{KilnError, KilnResult};

/// Ask for confirmation.
///
/// `--yes` approves without asking; without a terminal the default wins.
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> KilnResult<bool> {
    if ctx.auto_yes() {
        return Ok(true);
    }

    if !ctx.is_interactive() {
        return Ok(default);
    }

    // cliclack blocks on stdin
    let message = message.to_string();
    tokio::task::spawn_blocking(move || {
        cliclack::confirm(&message)
            .initial_value(default)
            .interact()
    })
    .await
    .map_err(|e| KilnError::Internal(format!("prompt task failed: {}", e)))?
    .map_err(|e| KilnError::User(format!("Prompt cancelled: {}", e)))
}
