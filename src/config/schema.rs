//! Configuration schema for kiln
//!
//! Global configuration lives at `~/.config/kiln/config.toml`; a project
//! `kiln.toml` overrides it key by key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Container engine settings
    pub engine: EngineConfig,

    /// Builder toolchain pins
    pub toolchain: ToolchainConfig,

    /// Source tree settings
    pub source: SourceConfig,

    /// Compiled artifact settings
    pub artifact: ArtifactConfig,

    /// Runtime image settings
    pub runtime: RuntimeConfig,

    /// Cache settings
    pub cache: CacheConfig,

    /// Per-stage wall-clock budgets
    pub timeouts: TimeoutConfig,

    /// Post-build verification
    pub verify: VerifyConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Container engine selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine CLI to drive: "podman" or "docker"
    pub program: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "podman".to_string(),
        }
    }
}

/// Toolchain pins for the builder stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Toolchain image (exact version tag or digest)
    pub image: String,

    /// Rustup channel installed inside the image
    pub channel: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            image: "docker.io/library/rust:1.82.0-slim-bookworm".to_string(),
            channel: "1.82.0".to_string(),
        }
    }
}

/// Source tree settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Source tree on the host, relative to the config file's directory
    pub dir: PathBuf,

    /// Where the tree is copied inside the builder container
    pub workdir: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            workdir: "/usr/src/app".to_string(),
        }
    }
}

/// Compiled artifact settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Binary target to build (inferred from Cargo.toml when unset)
    pub binary: Option<String>,

    /// Pass --locked to cargo
    pub locked: bool,

    /// Cargo features to enable
    pub features: Vec<String>,
}

/// Runtime image settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Minimal base image (explicit tag or digest)
    pub base_image: String,

    /// Working directory holding the binary
    pub workdir: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_image: "docker.io/library/debian:bookworm-slim".to_string(),
            workdir: "/app".to_string(),
        }
    }
}

/// How concurrent builds share cache volumes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSharing {
    /// Exclusive lock per cache volume for the whole builder stage
    #[default]
    Locked,
    /// Private copy of each cache per build, optionally promoted back
    Isolated,
}

impl fmt::Display for CacheSharing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => write!(f, "locked"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Mount persistent cache volumes into the builder (default: true)
    pub enabled: bool,

    /// Concurrency discipline for shared volumes
    pub sharing: CacheSharing,

    /// Copy isolated caches back into the shared volumes after success
    pub promote: bool,

    /// Project cache key (derived from the source path when unset)
    pub key: Option<String>,

    /// Seconds to wait for a busy cache before giving up
    pub lock_timeout_secs: u64,

    /// `cache gc` removes caches unused for this many days (0 = disabled)
    pub gc_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sharing: CacheSharing::Locked,
            promote: true,
            key: None,
            lock_timeout_secs: 600,
            gc_days: 30,
        }
    }
}

/// Stage budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Builder stage budget in seconds
    pub builder_secs: u64,

    /// Runtime stage budget in seconds
    pub runtime_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            builder_secs: 3600,
            runtime_secs: 600,
        }
    }
}

/// Verification of the assembled image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Start the image and require it to stay up this long (0 = skip)
    pub smoke_secs: u64,
}
