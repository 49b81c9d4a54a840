//! Configuration management for kiln

pub mod schema;

pub use schema::{CacheSharing, Config};

use crate::error::{KilnError, KilnResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use toml_edit::DocumentMut;
use tracing::{debug, info};

/// File name of the project-local configuration
pub const LOCAL_CONFIG_NAME: &str = "kiln.toml";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
            .join("config.toml")
    }

    /// Get the state directory path (cache records, lock files, staging)
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
    }

    /// Walk up from `start` looking for a project `kiln.toml`
    pub fn find_local_config(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(LOCAL_CONFIG_NAME))
            .find(|candidate| candidate.is_file())
    }

    /// Load configuration, creating default if not exists
    pub async fn load(&self) -> KilnResult<Config> {
        let value = self.load_value(&self.config_path).await?;
        Self::from_value(value, &self.config_path)
    }

    /// Load the global config with a project config layered on top.
    ///
    /// A relative `source.dir` is resolved against the project config's
    /// directory so builds behave the same from any subdirectory.
    pub async fn load_merged(&self, local: Option<&Path>) -> KilnResult<Config> {
        let mut merged = self.load_value(&self.config_path).await?;

        if let Some(local_path) = local {
            let overlay = self.load_value(local_path).await?;
            merge_values(&mut merged, overlay);
            debug!("Merged project config {}", local_path.display());
        }

        let origin = local.unwrap_or(self.config_path.as_path());
        let mut config = Self::from_value(merged, origin)?;

        if let Some(project_root) = local.and_then(Path::parent) {
            if config.source.dir.is_relative() {
                config.source.dir = project_root.join(&config.source.dir);
            }
        }

        Ok(config)
    }

    async fn load_value(&self, path: &Path) -> KilnResult<toml::Value> {
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(toml::Value::Table(toml::map::Map::new()));
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| KilnError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn from_value(value: toml::Value, path: &Path) -> KilnResult<Config> {
        value.try_into().map_err(|e: toml::de::Error| KilnError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> KilnResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            KilnError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Set a dotted key in a config file, keeping its comments and layout
    pub async fn set_value(path: &Path, key: &str, value: &str) -> KilnResult<()> {
        let content = if path.exists() {
            fs::read_to_string(path)
                .await
                .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?
        } else {
            String::new()
        };

        let updated = edit_document(&content, key, value)?;

        // Reject edits that would leave the file unloadable
        let check: toml::Value = toml::from_str(&updated)?;
        Self::from_value(check, path)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        fs::write(path, updated)
            .await
            .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))?;

        info!("Set {} in {}", key, path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> KilnResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Create the state directory and its `caches/` and `staging/` children
    pub async fn ensure_state_dirs(dir: &Path) -> KilnResult<()> {
        for sub in ["caches", "staging"] {
            let path = dir.join(sub);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| KilnError::io(format!("creating directory {}", path.display()), e))?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys accepted by `config set`
pub const SETTABLE_KEYS: &[&str] = &[
    "general.log_format",
    "engine.program",
    "toolchain.image",
    "toolchain.channel",
    "source.dir",
    "source.workdir",
    "artifact.binary",
    "artifact.locked",
    "artifact.features",
    "runtime.base_image",
    "runtime.workdir",
    "cache.enabled",
    "cache.sharing",
    "cache.promote",
    "cache.key",
    "cache.lock_timeout_secs",
    "cache.gc_days",
    "timeouts.builder_secs",
    "timeouts.runtime_secs",
    "verify.smoke_secs",
];

/// Apply `key = value` to a TOML document, inferring the value type
fn edit_document(content: &str, key: &str, value: &str) -> KilnResult<String> {
    if !SETTABLE_KEYS.contains(&key) {
        return Err(KilnError::User(format!(
            "Unknown config key: {}. Valid keys: {}",
            key,
            SETTABLE_KEYS.join(", ")
        )));
    }

    let mut doc: DocumentMut = content.parse()?;
    let (section, field) = key
        .split_once('.')
        .ok_or_else(|| KilnError::Internal(format!("malformed key {}", key)))?;

    let item = if let Ok(b) = value.parse::<bool>() {
        toml_edit::value(b)
    } else if let Ok(n) = value.parse::<i64>() {
        toml_edit::value(n)
    } else if key == "artifact.features" {
        let mut array = toml_edit::Array::new();
        for feature in value.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            array.push(feature);
        }
        toml_edit::value(array)
    } else {
        toml_edit::value(value)
    };

    if !doc.contains_table(section) {
        doc[section] = toml_edit::table();
    }
    doc[section][field] = item;

    Ok(doc.to_string())
}

/// Recursively overlay `overlay` onto `base`; tables merge, everything else replaces
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
