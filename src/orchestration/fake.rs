//! In-memory container engine for pipeline tests
//!
//! Records every operation in order so tests can assert on what the
//! pipeline asked the engine to do, and can be told to fail specific steps.

use crate::error::{KilnError, KilnResult};
use crate::orchestration::podman::ContainerConfig;
use crate::orchestration::runtime::{
    ContainerRuntime, ContainerStatus, ExecOutput, ImageInfo, VolumeInfo,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Bytes written for any file copied out of a fake container
pub const FAKE_BINARY: &[u8] = b"\x7fELF fake service binary";

/// A captured `build_image` call
#[derive(Debug, Clone)]
pub struct FakeBuild {
    pub tag: String,
    /// File names in the build context, sorted
    pub context_files: Vec<String>,
    pub containerfile: String,
}

#[derive(Default)]
struct State {
    ops: Vec<String>,
    local_images: HashMap<String, ImageInfo>,
    registry: HashSet<String>,
    volumes: HashMap<String, VolumeInfo>,
    containers: HashSet<String>,
    builds: Vec<FakeBuild>,
    exec_failures: Vec<(String, i32, Vec<String>)>,
    fail_build: bool,
    fail_copy_out: bool,
    exec_delay: Option<Duration>,
    build_delay: Option<Duration>,
    failing_inspect: HashSet<String>,
    smoke_status: Option<ContainerStatus>,
    next_id: u32,
}

/// Scriptable in-memory engine
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn log(&self, op: impl Into<String>) {
        self.state().ops.push(op.into());
    }

    /// Make an image pullable from the fake registry
    pub fn with_registry_image(self, image: &str) -> Self {
        self.state().registry.insert(image.to_string());
        self
    }

    /// Make an image present locally
    pub fn with_local_image(self, image: &str) -> Self {
        self.state()
            .local_images
            .insert(image.to_string(), ImageInfo::default());
        self
    }

    /// Exec commands containing `needle` exit with `code` and print `lines`
    pub fn fail_exec_matching(self, needle: &str, code: i32, lines: &[&str]) -> Self {
        self.state().exec_failures.push((
            needle.to_string(),
            code,
            lines.iter().map(|l| l.to_string()).collect(),
        ));
        self
    }

    /// Image builds fail
    pub fn fail_build(self) -> Self {
        self.state().fail_build = true;
        self
    }

    /// Copying files out of containers fails
    pub fn fail_copy_out(self) -> Self {
        self.state().fail_copy_out = true;
        self
    }

    /// Every exec sleeps this long first
    pub fn exec_delay(self, delay: Duration) -> Self {
        self.state().exec_delay = Some(delay);
        self
    }

    /// Image builds finish, then keep the caller waiting this long
    pub fn build_delay(self, delay: Duration) -> Self {
        self.state().build_delay = Some(delay);
        self
    }

    /// Inspecting `reference` fails
    pub fn fail_inspect_of(self, reference: &str) -> Self {
        self.state().failing_inspect.insert(reference.to_string());
        self
    }

    /// Status reported for detached smoke-test containers
    pub fn smoke_status(self, status: ContainerStatus) -> Self {
        self.state().smoke_status = Some(status);
        self
    }

    /// Operations performed so far, in order
    pub fn ops(&self) -> Vec<String> {
        self.state().ops.clone()
    }

    /// Whether any recorded operation starts with `prefix`
    pub fn did(&self, prefix: &str) -> bool {
        self.state().ops.iter().any(|op| op.starts_with(prefix))
    }

    /// Index of the first operation starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.state().ops.iter().position(|op| op.starts_with(prefix))
    }

    /// Captured image builds
    pub fn builds(&self) -> Vec<FakeBuild> {
        self.state().builds.clone()
    }

    /// Local image with the given reference
    pub fn image(&self, reference: &str) -> Option<ImageInfo> {
        self.state().local_images.get(reference).cloned()
    }

    /// Names of existing volumes, sorted
    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of containers that exist right now
    pub fn live_containers(&self) -> usize {
        self.state().containers.len()
    }
}

/// Read `WORKDIR` and `ENTRYPOINT` out of a rendered Containerfile
fn image_from_containerfile(containerfile: &str, id: String) -> ImageInfo {
    let mut info = ImageInfo {
        id,
        ..ImageInfo::default()
    };
    for line in containerfile.lines() {
        if let Some(dir) = line.strip_prefix("WORKDIR ") {
            info.workdir = dir.trim().to_string();
        } else if let Some(json) = line.strip_prefix("ENTRYPOINT ") {
            info.entrypoint = serde_json::from_str(json.trim()).unwrap_or_default();
        } else if let Some(label) = line.strip_prefix("LABEL ") {
            if let Some((k, v)) = label.split_once('=') {
                info.labels
                    .insert(k.trim().to_string(), v.trim().trim_matches('"').to_string());
            }
        }
    }
    info
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn is_available(&self) -> KilnResult<bool> {
        Ok(true)
    }

    async fn ensure_ready(&self) -> KilnResult<()> {
        self.log("ready");
        Ok(())
    }

    async fn version(&self) -> KilnResult<String> {
        Ok("0.0.0-fake".to_string())
    }

    async fn image_exists(&self, image: &str) -> KilnResult<bool> {
        Ok(self.state().local_images.contains_key(image))
    }

    async fn pull(&self, image: &str) -> KilnResult<()> {
        self.log(format!("pull {}", image));
        let mut state = self.state();
        if state.registry.contains(image) {
            state
                .local_images
                .insert(image.to_string(), ImageInfo::default());
            Ok(())
        } else {
            Err(KilnError::ImagePull {
                image: image.to_string(),
                reason: "dial tcp: lookup registry: no such host".to_string(),
            })
        }
    }

    async fn create(&self, config: &ContainerConfig) -> KilnResult<String> {
        self.log(format!("create {} {}", config.name, config.volumes.join(",")));
        let mut state = self.state();
        if !state.local_images.contains_key(&config.image) {
            return Err(KilnError::ContainerCreate(format!(
                "{}: image not known",
                config.image
            )));
        }
        for mount in &config.volumes {
            let volume = mount.split(':').next().unwrap_or_default();
            if !state.volumes.contains_key(volume) {
                return Err(KilnError::ContainerCreate(format!(
                    "no such volume {}",
                    volume
                )));
            }
        }
        state.containers.insert(config.name.clone());
        Ok(config.name.clone())
    }

    async fn start(&self, container_id: &str) -> KilnResult<()> {
        self.log(format!("start {}", container_id));
        Ok(())
    }

    async fn copy_into(
        &self,
        container_id: &str,
        host_path: &Path,
        container_path: &str,
    ) -> KilnResult<()> {
        self.log(format!(
            "cp {} {}:{}",
            host_path.display(),
            container_id,
            container_path
        ));
        Ok(())
    }

    async fn copy_out(
        &self,
        container_id: &str,
        container_path: &str,
        host_path: &Path,
    ) -> KilnResult<()> {
        self.log(format!(
            "cp {}:{} {}",
            container_id,
            container_path,
            host_path.display()
        ));
        if self.state().fail_copy_out {
            return Err(KilnError::command_exec(
                "cp",
                format!("{}: no such file or directory", container_path),
            ));
        }
        std::fs::write(host_path, FAKE_BINARY)
            .map_err(|e| KilnError::io(format!("writing {}", host_path.display()), e))
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> KilnResult<ExecOutput> {
        let joined = command.join(" ");
        self.log(format!("exec {}", joined));

        let delay = self.state().exec_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !self.state().containers.contains(container_id) {
            return Err(KilnError::command_exec("exec", "no such container"));
        }

        let failure = self
            .state()
            .exec_failures
            .iter()
            .find(|(needle, _, _)| joined.contains(needle.as_str()))
            .cloned();

        match failure {
            Some((_, code, lines)) => {
                for line in &lines {
                    on_output(line.clone());
                }
                Ok(ExecOutput {
                    exit_code: code,
                    lines,
                })
            }
            None => {
                let line = format!("ok: {}", joined);
                on_output(line.clone());
                Ok(ExecOutput {
                    exit_code: 0,
                    lines: vec![line],
                })
            }
        }
    }

    async fn remove(&self, container_id: &str) -> KilnResult<()> {
        self.log(format!("rm {}", container_id));
        self.state().containers.remove(container_id);
        Ok(())
    }

    async fn run_detached(&self, image: &str, name: &str) -> KilnResult<String> {
        self.log(format!("run {} {}", name, image));
        self.state().containers.insert(name.to_string());
        Ok(name.to_string())
    }

    async fn container_status(&self, container_id: &str) -> KilnResult<ContainerStatus> {
        let state = self.state();
        if !state.containers.contains(container_id) {
            return Ok(ContainerStatus::Missing);
        }
        Ok(state.smoke_status.unwrap_or(ContainerStatus::Running))
    }

    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> KilnResult<()> {
        self.log(format!("build {}", tag));

        let mut context_files = Vec::new();
        let entries = std::fs::read_dir(context_dir)
            .map_err(|e| KilnError::io(format!("reading {}", context_dir.display()), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| KilnError::io("reading context entry", e))?;
            context_files.push(entry.file_name().to_string_lossy().to_string());
        }
        context_files.sort();

        let containerfile = std::fs::read_to_string(context_dir.join("Containerfile"))
            .map_err(|e| KilnError::io("reading Containerfile", e))?;

        on_output("STEP 1/5: FROM base".to_string());

        let delay = {
            let mut state = self.state();
            state.builds.push(FakeBuild {
                tag: tag.to_string(),
                context_files,
                containerfile: containerfile.clone(),
            });

            if state.fail_build {
                return Err(KilnError::ImageBuild {
                    tag: tag.to_string(),
                    reason: "COPY failed: file not found in build context".to_string(),
                });
            }

            state.next_id += 1;
            let id = format!("sha256:{:064x}", state.next_id);
            let info = image_from_containerfile(&containerfile, id);
            state.local_images.insert(tag.to_string(), info);
            state.build_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn image_inspect(&self, image: &str) -> KilnResult<Option<ImageInfo>> {
        let state = self.state();
        if state.failing_inspect.contains(image) {
            return Err(KilnError::command_exec("image inspect", "engine went away"));
        }
        Ok(state.local_images.get(image).cloned())
    }

    async fn image_tag(&self, image: &str, tag: &str) -> KilnResult<()> {
        self.log(format!("tag {} {}", image, tag));
        let mut state = self.state();
        let info = state
            .local_images
            .get(image)
            .cloned()
            .ok_or_else(|| KilnError::command_exec("tag", "image not known"))?;
        state.local_images.insert(tag.to_string(), info);
        Ok(())
    }

    async fn image_remove(&self, image: &str) -> KilnResult<()> {
        self.log(format!("rmi {}", image));
        self.state().local_images.remove(image);
        Ok(())
    }

    async fn volume_create(&self, name: &str, labels: &HashMap<String, String>) -> KilnResult<()> {
        self.log(format!("volume create {}", name));
        self.state()
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| VolumeInfo {
                name: name.to_string(),
                labels: labels.clone(),
                mountpoint: None,
                created_at: None,
                size_bytes: None,
            });
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> KilnResult<bool> {
        Ok(self.state().volumes.contains_key(name))
    }

    async fn volume_remove(&self, name: &str) -> KilnResult<()> {
        self.log(format!("volume rm {}", name));
        self.state().volumes.remove(name);
        Ok(())
    }

    async fn volume_list(&self, prefix: &str) -> KilnResult<Vec<VolumeInfo>> {
        let mut vols: Vec<_> = self
            .state()
            .volumes
            .values()
            .filter(|v| v.name.starts_with(prefix))
            .cloned()
            .collect();
        vols.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vols)
    }

    async fn volume_inspect(&self, name: &str) -> KilnResult<Option<VolumeInfo>> {
        Ok(self.state().volumes.get(name).cloned())
    }

    async fn volume_copy(&self, from: &str, to: &str) -> KilnResult<()> {
        self.log(format!("volume copy {} {}", from, to));
        let state = self.state();
        if !state.volumes.contains_key(from) || !state.volumes.contains_key(to) {
            return Err(KilnError::CacheVolumeNotFound(format!("{} or {}", from, to)));
        }
        Ok(())
    }

    async fn volume_disk_usage(&self, prefix: &str) -> KilnResult<HashMap<String, u64>> {
        Ok(self
            .state()
            .volumes
            .keys()
            .filter(|name| name.starts_with(prefix))
            .map(|name| (name.clone(), 1024 * 1024))
            .collect())
    }

    fn runtime_name(&self) -> &'static str {
        "Fake"
    }
}
