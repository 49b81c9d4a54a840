//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager, LOCAL_CONFIG_NAME};
use crate::error::{KilnError, KilnResult};
use crate::ui::{self, UiContext};
use std::path::{Path, PathBuf};

/// Execute the config command.
///
/// `config` is the effective configuration, `global_path` the file that
/// `config set` edits without `--local`.
pub async fn execute(args: ConfigArgs, config: &Config, global_path: &Path) -> KilnResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => {
            print!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
        Some(ConfigAction::Path) => {
            println!("{}", global_path.display());
            Ok(())
        }
        Some(ConfigAction::Set { key, value, local }) => {
            let path = if local {
                local_config_path()?
            } else {
                global_path.to_path_buf()
            };
            ConfigManager::set_value(&path, &key, &value).await?;
            ui::step_ok_detail(
                &UiContext::detect(),
                &format!("Set {} = {}", key, value),
                &path.display().to_string(),
            );
            Ok(())
        }
    }
}

/// The project kiln.toml above the current directory, or a new one here
fn local_config_path() -> KilnResult<PathBuf> {
    let cwd = std::env::current_dir().map_err(|e| KilnError::io("getting current directory", e))?;
    Ok(ConfigManager::find_local_config(&cwd).unwrap_or_else(|| cwd.join(LOCAL_CONFIG_NAME)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn set_writes_global_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let args = ConfigArgs {
            action: Some(ConfigAction::Set {
                key: "cache.sharing".to_string(),
                value: "isolated".to_string(),
                local: false,
            }),
        };

        execute(args, &Config::default(), &path).await.unwrap();

        let manager = ConfigManager::with_path(path);
        let config = manager.load().await.unwrap();
        assert_eq!(config.cache.sharing, crate::config::CacheSharing::Isolated);
    }

    #[tokio::test]
    async fn set_unknown_key_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let args = ConfigArgs {
            action: Some(ConfigAction::Set {
                key: "vm.name".to_string(),
                value: "x".to_string(),
                local: false,
            }),
        };
        assert!(execute(args, &Config::default(), &path).await.is_err());
    }
}
