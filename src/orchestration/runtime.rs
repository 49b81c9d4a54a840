//! Container engine abstraction
//!
//! Every engine interaction the pipeline performs goes through the
//! [`ContainerRuntime`] trait. The CLI-backed implementation drives podman
//! or docker; tests substitute an in-memory engine.

use crate::error::KilnResult;
use crate::orchestration::podman::ContainerConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

/// Information about a container volume
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    /// Volume name
    pub name: String,
    /// Volume labels
    pub labels: HashMap<String, String>,
    /// Mount point on host (if available)
    pub mountpoint: Option<String>,
    /// Creation timestamp as reported by the engine
    pub created_at: Option<String>,
    /// Size in bytes (if available)
    pub size_bytes: Option<u64>,
}

/// The parts of an image's configuration the pipeline verifies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    /// Image ID
    pub id: String,
    /// Entrypoint in exec form
    pub entrypoint: Vec<String>,
    /// Default command arguments
    pub cmd: Vec<String>,
    /// Working directory
    pub workdir: String,
    /// Image labels
    pub labels: HashMap<String, String>,
    /// Size in bytes
    pub size_bytes: Option<u64>,
}

/// Result of a command executed inside a container
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code of the command (-1 if killed by a signal)
    pub exit_code: i32,
    /// Combined stdout and stderr lines
    pub lines: Vec<String>,
}

impl ExecOutput {
    /// Whether the command exited 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last lines of output for error messages
    pub fn tail(&self) -> String {
        super::build_error_output(&self.lines.join("\n"), "")
    }
}

/// Observed state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Still running
    Running,
    /// Exited with the given code
    Exited(i32),
    /// Container does not exist
    Missing,
}

/// Abstract container engine interface
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check if the engine is available on this system
    async fn is_available(&self) -> KilnResult<bool>;

    /// Ensure the engine is ready to run builds
    async fn ensure_ready(&self) -> KilnResult<()>;

    /// Engine version string
    async fn version(&self) -> KilnResult<String>;

    /// Check if an image exists locally
    async fn image_exists(&self, image: &str) -> KilnResult<bool>;

    /// Pull an image from its registry
    async fn pull(&self, image: &str) -> KilnResult<()>;

    /// Create (but do not start) a container, returning its ID
    async fn create(&self, config: &ContainerConfig) -> KilnResult<String>;

    /// Start a created container
    async fn start(&self, container_id: &str) -> KilnResult<()>;

    /// Copy the contents of a host directory or file into a container
    async fn copy_into(
        &self,
        container_id: &str,
        host_path: &Path,
        container_path: &str,
    ) -> KilnResult<()>;

    /// Copy a file out of a container onto the host
    async fn copy_out(
        &self,
        container_id: &str,
        container_path: &str,
        host_path: &Path,
    ) -> KilnResult<()>;

    /// Run a command in a running container, streaming each output line.
    ///
    /// A non-zero exit is reported through [`ExecOutput::exit_code`], not as
    /// an error; errors mean the engine itself could not run the command.
    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> KilnResult<ExecOutput>;

    /// Remove a container (force); missing containers are not an error
    async fn remove(&self, container_id: &str) -> KilnResult<()>;

    /// Start an image detached under `name`, returning the container ID
    async fn run_detached(&self, image: &str, name: &str) -> KilnResult<String>;

    /// Current state of a container
    async fn container_status(&self, container_id: &str) -> KilnResult<ContainerStatus>;

    /// Build an image from a context directory containing a `Containerfile`
    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> KilnResult<()>;

    /// Inspect an image, `None` if it does not exist
    async fn image_inspect(&self, image: &str) -> KilnResult<Option<ImageInfo>>;

    /// Add a tag to an existing image
    async fn image_tag(&self, image: &str, tag: &str) -> KilnResult<()>;

    /// Remove an image or tag; missing images are not an error
    async fn image_remove(&self, image: &str) -> KilnResult<()>;

    /// Create a volume with labels (no-op if it already exists)
    async fn volume_create(&self, name: &str, labels: &HashMap<String, String>) -> KilnResult<()>;

    /// Check if a volume exists
    async fn volume_exists(&self, name: &str) -> KilnResult<bool>;

    /// Remove a volume; missing volumes are not an error
    async fn volume_remove(&self, name: &str) -> KilnResult<()>;

    /// List volumes whose name starts with `prefix`
    async fn volume_list(&self, prefix: &str) -> KilnResult<Vec<VolumeInfo>>;

    /// Inspect a single volume, `None` if it does not exist
    async fn volume_inspect(&self, name: &str) -> KilnResult<Option<VolumeInfo>>;

    /// Replace the contents of volume `to` with those of volume `from`
    async fn volume_copy(&self, from: &str, to: &str) -> KilnResult<()>;

    /// Disk usage in bytes for volumes whose name starts with `prefix`
    async fn volume_disk_usage(&self, prefix: &str) -> KilnResult<HashMap<String, u64>>;

    /// Get the human-readable engine name for display
    fn runtime_name(&self) -> &'static str;
}
