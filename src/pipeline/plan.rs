//! Build plans
//!
//! A [`BuildPlan`] is the fully resolved, validated input of one run:
//! configuration layers and command-line overrides merged, pins checked,
//! the binary name known. Everything that can be rejected without an
//! engine is rejected here.

use crate::cache::{derive_project_key, is_valid_project_key, CacheSpec};
use crate::config::{CacheSharing, Config};
use crate::error::{KilnError, KilnResult};
use crate::image::{ImageRef, PinPolicy, ToolchainChannel};
use crate::pipeline::RunId;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Command-line overrides for `kiln build`
#[derive(Debug, Clone, Default)]
pub struct PlanOverrides {
    pub source: Option<PathBuf>,
    pub tag: Option<String>,
    pub binary: Option<String>,
    pub toolchain: Option<String>,
    pub channel: Option<String>,
    pub base: Option<String>,
    pub no_cache: bool,
    pub isolated: bool,
}

/// Validated input of one pipeline run
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// Source tree on the host
    pub source_dir: PathBuf,
    /// Where the tree lives inside the builder container
    pub builder_workdir: String,
    /// Pinned toolchain image
    pub toolchain: ImageRef,
    /// Pinned rustup channel
    pub channel: ToolchainChannel,
    /// Pinned runtime base image
    pub base: ImageRef,
    /// Working directory of the final image
    pub runtime_workdir: String,
    /// Binary target to build and ship
    pub binary: String,
    pub locked: bool,
    pub features: Vec<String>,
    /// Requested final tag; defaults to `<binary>:<run>`
    pub tag: Option<String>,
    /// Cache lease parameters, `None` when caching is off
    pub cache: Option<CacheSpec>,
    pub builder_budget: Duration,
    pub runtime_budget: Duration,
    /// How long the smoke test runs the image, `None` to skip
    pub smoke: Option<Duration>,
}

impl BuildPlan {
    /// Merge config and overrides, then validate the result
    pub fn resolve(config: &Config, overrides: &PlanOverrides) -> KilnResult<Self> {
        let source_dir = overrides
            .source
            .clone()
            .unwrap_or_else(|| config.source.dir.clone());
        check_source_dir(&source_dir)?;

        let toolchain = ImageRef::parse_pinned(
            overrides
                .toolchain
                .as_deref()
                .unwrap_or(&config.toolchain.image),
            "toolchain image",
            PinPolicy::Versioned,
        )?;

        let channel: ToolchainChannel = overrides
            .channel
            .as_deref()
            .unwrap_or(&config.toolchain.channel)
            .parse()?;

        let base = ImageRef::parse_pinned(
            overrides
                .base
                .as_deref()
                .unwrap_or(&config.runtime.base_image),
            "runtime base image",
            PinPolicy::Tagged,
        )?;

        let builder_workdir = check_workdir("source.workdir", &config.source.workdir)?;
        let runtime_workdir = check_workdir("runtime.workdir", &config.runtime.workdir)?;

        let binary = match overrides
            .binary
            .clone()
            .or_else(|| config.artifact.binary.clone())
        {
            Some(name) => name,
            None => infer_binary(&source_dir)?,
        };
        if !is_valid_binary_name(&binary) {
            return Err(KilnError::BinaryUnknown(format!(
                "{:?} is not a valid binary target name",
                binary
            )));
        }

        let tag = match overrides.tag.as_deref() {
            Some(tag) => Some(ImageRef::parse_tag(tag)?.to_string()),
            None => None,
        };

        let cache = if config.cache.enabled && !overrides.no_cache {
            let project = match &config.cache.key {
                Some(key) if is_valid_project_key(key) => key.clone(),
                Some(key) => {
                    return Err(KilnError::User(format!(
                        "cache.key {:?} may only contain lowercase letters, digits, '-' and '_'",
                        key
                    )))
                }
                None => derive_project_key(&source_dir),
            };
            let sharing = if overrides.isolated {
                CacheSharing::Isolated
            } else {
                config.cache.sharing
            };
            Some(CacheSpec {
                project,
                sharing,
                promote: config.cache.promote,
                lock_timeout: Duration::from_secs(config.cache.lock_timeout_secs),
                builder_workdir: builder_workdir.clone(),
            })
        } else {
            None
        };

        let smoke = (config.verify.smoke_secs > 0)
            .then(|| Duration::from_secs(config.verify.smoke_secs));

        let plan = Self {
            source_dir,
            builder_workdir,
            toolchain,
            channel,
            base,
            runtime_workdir,
            binary,
            locked: config.artifact.locked,
            features: config.artifact.features.clone(),
            tag,
            cache,
            builder_budget: Duration::from_secs(config.timeouts.builder_secs),
            runtime_budget: Duration::from_secs(config.timeouts.runtime_secs),
            smoke,
        };
        debug!("Resolved plan: {:?}", plan);
        Ok(plan)
    }

    /// Tag the published image will carry
    pub fn final_tag(&self, run: &RunId) -> String {
        self.tag
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.default_repository(), run.short()))
    }

    /// Repository of the default tag; image repositories are lowercase
    pub fn default_repository(&self) -> String {
        self.binary.to_ascii_lowercase()
    }

    /// Commands pinning the rustup channel inside the builder
    pub fn toolchain_commands(&self) -> Vec<Vec<String>> {
        let channel = self.channel.rustup_name();
        vec![
            strings(&["rustup", "toolchain", "install", &channel, "--profile", "minimal"]),
            strings(&["rustup", "default", &channel]),
        ]
    }

    /// Release build of the binary target
    pub fn compile_command(&self) -> Vec<String> {
        let mut cmd = strings(&["cargo", "build", "--release", "--bin", &self.binary]);
        if self.locked {
            cmd.push("--locked".to_string());
        }
        if !self.features.is_empty() {
            cmd.push("--features".to_string());
            cmd.push(self.features.join(","));
        }
        cmd
    }

    /// Debug-section compression into a second file next to the original
    pub fn post_process_command(&self) -> Vec<String> {
        strings(&[
            "objcopy",
            "--compress-debug-sections",
            &format!("target/release/{}", self.binary),
            &format!("./{}", self.binary),
        ])
    }

    /// Path of the compressed binary inside the builder container
    pub fn artifact_path(&self) -> String {
        format!("{}/{}", self.builder_workdir.trim_end_matches('/'), self.binary)
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn check_source_dir(dir: &Path) -> KilnResult<()> {
    if !dir.exists() {
        return Err(KilnError::PathNotFound(dir.to_path_buf()));
    }
    if !dir.is_dir() {
        return Err(KilnError::PathInvalid {
            path: dir.to_path_buf(),
            reason: "source must be a directory".to_string(),
        });
    }
    Ok(())
}

fn check_workdir(key: &str, workdir: &str) -> KilnResult<String> {
    if !workdir.starts_with('/') {
        return Err(KilnError::User(format!(
            "{} must be an absolute path, got {:?}",
            key, workdir
        )));
    }
    Ok(workdir.to_string())
}

fn is_valid_binary_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Read the binary target name from the source tree's Cargo.toml.
///
/// A single `[[bin]]` wins; otherwise the package name is the default
/// binary target.
pub fn infer_binary(source_dir: &Path) -> KilnResult<String> {
    let manifest_path = source_dir.join("Cargo.toml");
    let content = std::fs::read_to_string(&manifest_path).map_err(|_| {
        KilnError::BinaryUnknown(format!("no Cargo.toml in {}", source_dir.display()))
    })?;

    let manifest: toml::Value = toml::from_str(&content).map_err(|e| KilnError::ConfigInvalid {
        path: manifest_path.clone(),
        reason: e.to_string(),
    })?;

    let bins: Vec<&str> = manifest
        .get("bin")
        .and_then(toml::Value::as_array)
        .map(|bins| {
            bins.iter()
                .filter_map(|b| b.get("name").and_then(toml::Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    match bins.as_slice() {
        [only] => return Ok(only.to_string()),
        [] => {}
        many => {
            return Err(KilnError::BinaryUnknown(format!(
                "{} declares several binaries ({})",
                manifest_path.display(),
                many.join(", ")
            )))
        }
    }

    manifest
        .get("package")
        .and_then(|p| p.get("name"))
        .and_then(toml::Value::as_str)
        .map(String::from)
        .ok_or_else(|| {
            KilnError::BinaryUnknown(format!(
                "{} has no [package] name",
                manifest_path.display()
            ))
        })
}
