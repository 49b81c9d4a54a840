//! Error types for kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use crate::pipeline::Stage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// Whole seconds as `12s`, anything finer as `1500ms`
fn format_budget(budget: &Duration) -> String {
    if budget.subsec_millis() == 0 && budget.as_secs() > 0 {
        format!("{}s", budget.as_secs())
    } else {
        format!("{}ms", budget.as_millis())
    }
}

/// All errors that can occur in kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Engine errors
    #[error("Container engine not found: {0}. Install podman or docker and make sure it is on PATH")]
    EngineNotFound(String),

    #[error("Container engine unavailable: {reason}")]
    EngineUnavailable { reason: String },

    #[error("{engine} does not support {operation}")]
    EngineUnsupported { engine: String, operation: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} must be pinned, got {value:?}: {reason}")]
    PinRequired {
        what: String,
        value: String,
        reason: String,
    },

    #[error("Cannot determine the binary to build: {0}")]
    BinaryUnknown(String),

    // Builder stage errors
    #[error("Toolchain image could not be resolved: {image}: {reason}")]
    ToolchainResolve { image: String, reason: String },

    #[error("Toolchain channel {channel} failed to install:\n{output}")]
    ToolchainInstall { channel: String, output: String },

    #[error("Compilation of {binary} failed:\n{output}")]
    Compile { binary: String, output: String },

    #[error("Debug-section compression of {binary} failed:\n{output}")]
    PostProcess { binary: String, output: String },

    // Runtime stage errors
    #[error("Base image could not be resolved: {image}: {reason}")]
    BaseImageResolve { image: String, reason: String },

    #[error("Artifact {binary} was not produced: {reason}")]
    ArtifactCopy { binary: String, reason: String },

    #[error("Image build failed: {tag}:\n{reason}")]
    ImageBuild { tag: String, reason: String },

    #[error("Image verification failed for {tag}: {reason}")]
    Verify { tag: String, reason: String },

    #[error("{stage} stage exceeded its budget of {}", format_budget(.budget))]
    StageTimeout { stage: Stage, budget: Duration },

    #[error("Build interrupted")]
    Interrupted,

    // Container errors
    #[error("Failed to create builder container: {0}")]
    ContainerCreate(String),

    #[error("Image pull failed: {image}: {reason}")]
    ImagePull { image: String, reason: String },

    // Cache errors
    #[error("Timed out after {} waiting for cache lock on {volume}", format_budget(.waited))]
    CacheLockTimeout { volume: String, waited: Duration },

    #[error("Cache volume not found: {0}")]
    CacheVolumeNotFound(String),

    #[error("Failed to read cache record {path}: {reason}")]
    CacheRecordRead { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Invalid path: {path}: {reason}")]
    PathInvalid { path: PathBuf, reason: String },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("TOML edit error: {0}")]
    TomlEdit(#[from] toml_edit::TomlError),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// The pipeline stage this error is attributed to, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::ToolchainResolve { .. }
            | Self::ToolchainInstall { .. }
            | Self::Compile { .. }
            | Self::PostProcess { .. }
            | Self::ContainerCreate(_)
            | Self::CacheLockTimeout { .. } => Some(Stage::Builder),
            Self::BaseImageResolve { .. }
            | Self::ArtifactCopy { .. }
            | Self::ImageBuild { .. }
            | Self::Verify { .. } => Some(Stage::Runtime),
            Self::StageTimeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::EngineNotFound(_) => Some("Set engine.program in kiln.toml or install podman"),
            Self::EngineUnavailable { .. } => Some("Run `kiln status` to check the engine"),
            Self::EngineUnsupported { .. } => Some("Use podman, or set cache.sharing = \"locked\""),
            Self::PinRequired { .. } => {
                Some("Use an exact tag (rust:1.82.0-slim) or a digest, and a versioned channel")
            }
            Self::ToolchainResolve { .. } => Some("Check registry connectivity, then retry"),
            Self::BaseImageResolve { .. } => Some("Check runtime.base_image and registry connectivity"),
            Self::CacheLockTimeout { .. } => {
                Some("Another build holds this cache. Raise cache.lock_timeout_secs or use --isolated")
            }
            Self::StageTimeout { .. } => Some("Raise the budget under [timeouts] in kiln.toml"),
            Self::BinaryUnknown(_) => Some("Pass --binary or set artifact.binary in kiln.toml"),
            _ => None,
        }
    }
}
