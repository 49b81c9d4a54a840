//! CLI-backed container engine
//!
//! Implements the ContainerRuntime trait by running the podman or docker
//! command-line client directly. Both speak the same dialect for everything
//! the pipeline needs except volume export/import, which only podman has.

use crate::error::{KilnError, KilnResult};
use crate::orchestration::podman::ContainerConfig;
use crate::orchestration::runtime::{
    ContainerRuntime, ContainerStatus, ExecOutput, ImageInfo, VolumeInfo,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Which engine dialect a program speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Podman,
    Docker,
}

impl Engine {
    /// Infer the dialect from the configured program name or path
    pub fn detect(program: &str) -> Self {
        let file_name = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if file_name.contains("docker") {
            Self::Docker
        } else {
            Self::Podman
        }
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Podman => "Podman",
            Self::Docker => "Docker",
        }
    }
}

/// Container engine driven through its command-line client
pub struct CliRuntime {
    program: String,
    engine: Engine,
}

impl CliRuntime {
    /// Create a runtime for the given engine program (e.g. "podman")
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let engine = Engine::detect(&program);
        Self { program, engine }
    }

    /// Engine dialect in use
    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Check if the engine program is installed
    async fn installed(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.program, args.join(" "))
    }

    /// Execute an engine command and return the output
    async fn run_cli(&self, args: &[&str]) -> KilnResult<std::process::Output> {
        debug!("Executing: {} {:?}", self.program, args);

        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| KilnError::command_failed(self.describe(args), e))
    }

    /// Execute an engine command, turning a non-zero exit into an error
    async fn run_checked(&self, args: &[&str]) -> KilnResult<String> {
        let output = self.run_cli(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(KilnError::command_exec(self.describe(args), stderr))
        }
    }

    /// Spawn an engine command with piped output, for streaming
    fn spawn_piped(&self, args: &[&str]) -> KilnResult<tokio::process::Child> {
        debug!("Spawning: {} {:?}", self.program, args);

        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KilnError::command_failed(self.describe(args), e))
    }

    fn require_podman(&self, operation: &str) -> KilnResult<()> {
        match self.engine {
            Engine::Podman => Ok(()),
            Engine::Docker => Err(KilnError::EngineUnsupported {
                engine: self.engine.name().to_string(),
                operation: operation.to_string(),
            }),
        }
    }
}

/// Whether engine stderr says the object does not exist
fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such") || lower.contains("not known") || lower.contains("not found")
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        serde_json::Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn string_map(value: &serde_json::Value) -> HashMap<String, String> {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_volume(vol: &serde_json::Value) -> VolumeInfo {
    VolumeInfo {
        name: vol["Name"].as_str().unwrap_or_default().to_string(),
        labels: string_map(&vol["Labels"]),
        mountpoint: vol["Mountpoint"].as_str().map(String::from),
        created_at: vol["CreatedAt"].as_str().map(String::from),
        size_bytes: None,
    }
}

/// Parse `image inspect` output (a JSON array with one element)
pub(crate) fn parse_image_inspect(stdout: &str) -> KilnResult<Option<ImageInfo>> {
    let images: Vec<serde_json::Value> = serde_json::from_str(stdout)?;
    let Some(image) = images.first() else {
        return Ok(None);
    };

    let config = &image["Config"];
    Ok(Some(ImageInfo {
        id: image["Id"].as_str().unwrap_or_default().to_string(),
        entrypoint: string_list(&config["Entrypoint"]),
        cmd: string_list(&config["Cmd"]),
        workdir: config["WorkingDir"].as_str().unwrap_or_default().to_string(),
        labels: string_map(&config["Labels"]),
        size_bytes: image["Size"].as_u64(),
    }))
}

/// Parse `volume ls --format json` output, keeping names with `prefix`.
///
/// Docker prints one JSON object per line with labels as a `k=v,k=v`
/// string; podman prints a single array with a label object.
pub(crate) fn parse_volume_list(stdout: &str, prefix: &str) -> KilnResult<Vec<VolumeInfo>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<serde_json::Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?
    };

    Ok(raw
        .iter()
        .map(|vol| {
            let mut info = parse_volume(vol);
            if let Some(labels) = vol["Labels"].as_str() {
                info.labels = labels
                    .split(',')
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
            }
            info
        })
        .filter(|info| info.name.starts_with(prefix))
        .collect())
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn is_available(&self) -> KilnResult<bool> {
        if !self.installed().await {
            return Ok(false);
        }
        Ok(self.run_cli(&["info"]).await?.status.success())
    }

    async fn ensure_ready(&self) -> KilnResult<()> {
        if !self.installed().await {
            return Err(KilnError::EngineNotFound(self.program.clone()));
        }

        let output = self.run_cli(&["info"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(KilnError::EngineUnavailable {
                reason: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    async fn version(&self) -> KilnResult<String> {
        let stdout = self
            .run_checked(&["version", "--format", "{{.Client.Version}}"])
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn image_exists(&self, image: &str) -> KilnResult<bool> {
        let output = self.run_cli(&["image", "inspect", image]).await?;
        Ok(output.status.success())
    }

    async fn pull(&self, image: &str) -> KilnResult<()> {
        info!("Pulling image: {}", image);

        let output = self.run_cli(&["pull", image]).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(KilnError::ImagePull {
                image: image.to_string(),
                reason: stderr.trim().to_string(),
            })
        }
    }

    async fn create(&self, config: &ContainerConfig) -> KilnResult<String> {
        let mut args = vec!["create".to_string()];
        args.extend(config.to_args());

        debug!("Creating container: {} {:?}", self.program, args);

        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run_cli(&args_refs).await?;

        if output.status.success() {
            let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
            debug!(
                "Container created: {}",
                &container_id[..12.min(container_id.len())]
            );
            Ok(container_id)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(KilnError::ContainerCreate(stderr.trim().to_string()))
        }
    }

    async fn start(&self, container_id: &str) -> KilnResult<()> {
        self.run_checked(&["start", container_id]).await.map(|_| ())
    }

    async fn copy_into(
        &self,
        container_id: &str,
        host_path: &Path,
        container_path: &str,
    ) -> KilnResult<()> {
        // Trailing "/." copies the directory's contents, not the directory
        let source = if host_path.is_dir() {
            format!("{}/.", host_path.display())
        } else {
            host_path.display().to_string()
        };
        let dest = format!("{}:{}", container_id, container_path);
        self.run_checked(&["cp", &source, &dest]).await.map(|_| ())
    }

    async fn copy_out(
        &self,
        container_id: &str,
        container_path: &str,
        host_path: &Path,
    ) -> KilnResult<()> {
        let source = format!("{}:{}", container_id, container_path);
        let dest = host_path.display().to_string();
        self.run_checked(&["cp", &source, &dest]).await.map(|_| ())
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> KilnResult<ExecOutput> {
        let mut args = vec!["exec", container_id];
        args.extend(command.iter().map(String::as_str));

        let mut child = self.spawn_piped(&args)?;
        let lines = super::stream_child_output(&mut child, on_output).await;

        let status = child
            .wait()
            .await
            .map_err(|e| KilnError::command_failed(self.describe(&args), e))?;

        Ok(ExecOutput {
            exit_code: status.code().unwrap_or(-1),
            lines,
        })
    }

    async fn remove(&self, container_id: &str) -> KilnResult<()> {
        debug!("Removing container: {}", container_id);

        let output = self.run_cli(&["rm", "-f", container_id]).await?;

        if output.status.success() {
            Ok(())
        } else {
            // Ignore error if container doesn't exist
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                Ok(())
            } else {
                Err(KilnError::command_exec(format!("{} rm", self.program), stderr))
            }
        }
    }

    async fn run_detached(&self, image: &str, name: &str) -> KilnResult<String> {
        let stdout = self
            .run_checked(&["run", "-d", "--name", name, image])
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn container_status(&self, container_id: &str) -> KilnResult<ContainerStatus> {
        let output = self
            .run_cli(&[
                "container",
                "inspect",
                "--format",
                "{{.State.Status}} {{.State.ExitCode}}",
                container_id,
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(ContainerStatus::Missing);
            }
            return Err(KilnError::command_exec(
                format!("{} container inspect", self.program),
                stderr,
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut parts = stdout.split_whitespace();
        let state = parts.next().unwrap_or_default();
        let code = parts.next().and_then(|c| c.parse().ok()).unwrap_or(-1);

        Ok(match state {
            "exited" | "stopped" | "dead" => ContainerStatus::Exited(code),
            _ => ContainerStatus::Running,
        })
    }

    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> KilnResult<()> {
        let context_str = context_dir.display().to_string();
        let containerfile = context_dir.join("Containerfile").display().to_string();
        let mut child =
            self.spawn_piped(&["build", "-f", &containerfile, "-t", tag, &context_str])?;

        let all_output = super::stream_child_output(&mut child, on_output).await;

        let status = child
            .wait()
            .await
            .map_err(|e| KilnError::command_failed(format!("{} build", self.program), e))?;

        if !status.success() {
            let combined = all_output.join("\n");
            let tail = super::build_error_output(&combined, "");
            return Err(KilnError::ImageBuild {
                tag: tag.to_string(),
                reason: tail,
            });
        }

        Ok(())
    }

    async fn image_inspect(&self, image: &str) -> KilnResult<Option<ImageInfo>> {
        let output = self.run_cli(&["image", "inspect", image]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(None);
            }
            return Err(KilnError::command_exec(
                format!("{} image inspect", self.program),
                stderr,
            ));
        }

        parse_image_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    async fn image_tag(&self, image: &str, tag: &str) -> KilnResult<()> {
        self.run_checked(&["tag", image, tag]).await.map(|_| ())
    }

    async fn image_remove(&self, image: &str) -> KilnResult<()> {
        let output = self.run_cli(&["rmi", image]).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                Ok(())
            } else {
                Err(KilnError::command_exec(format!("{} rmi", self.program), stderr))
            }
        }
    }

    async fn volume_create(&self, name: &str, labels: &HashMap<String, String>) -> KilnResult<()> {
        debug!("Creating volume: {}", name);

        let mut args = vec!["volume", "create"];
        if self.engine == Engine::Podman {
            args.push("--ignore");
        }

        // Build label arguments
        let label_strings: Vec<String> =
            labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        for label in &label_strings {
            args.push("--label");
            args.push(label);
        }

        args.push(name);

        self.run_checked(&args).await?;
        debug!("Volume created: {}", name);
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> KilnResult<bool> {
        let output = self.run_cli(&["volume", "inspect", name]).await?;
        Ok(output.status.success())
    }

    async fn volume_remove(&self, name: &str) -> KilnResult<()> {
        debug!("Removing volume: {}", name);

        let output = self.run_cli(&["volume", "rm", "-f", name]).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                Ok(())
            } else {
                Err(KilnError::command_exec(
                    format!("{} volume rm", self.program),
                    stderr,
                ))
            }
        }
    }

    async fn volume_list(&self, prefix: &str) -> KilnResult<Vec<VolumeInfo>> {
        let format = match self.engine {
            Engine::Podman => "json",
            Engine::Docker => "{{json .}}",
        };
        let stdout = self
            .run_checked(&["volume", "ls", "--format", format])
            .await?;
        parse_volume_list(&stdout, prefix)
    }

    async fn volume_inspect(&self, name: &str) -> KilnResult<Option<VolumeInfo>> {
        let output = self.run_cli(&["volume", "inspect", name]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(None);
            }
            return Err(KilnError::command_exec(
                format!("{} volume inspect", self.program),
                stderr,
            ));
        }

        // Inspect returns an array even for a single volume
        let volumes: Vec<serde_json::Value> =
            serde_json::from_str(&String::from_utf8_lossy(&output.stdout))?;
        Ok(volumes.first().map(parse_volume))
    }

    async fn volume_copy(&self, from: &str, to: &str) -> KilnResult<()> {
        self.require_podman("volume export/import")?;

        let archive = std::env::temp_dir().join(format!("kiln-{}.tar", to));
        let archive_str = archive.display().to_string();
        debug!("Copying volume {} -> {} via {}", from, to, archive_str);

        let result: KilnResult<()> = async {
            self.run_checked(&["volume", "export", from, "--output", &archive_str])
                .await?;
            self.run_checked(&["volume", "import", to, &archive_str])
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&archive).await {
            debug!("Could not remove {}: {}", archive_str, e);
        }

        result
    }

    async fn volume_disk_usage(&self, prefix: &str) -> KilnResult<HashMap<String, u64>> {
        let volumes = self.volume_list(prefix).await?;
        let mut sizes = HashMap::new();

        for vol in &volumes {
            let mountpoint = match self.volume_inspect(&vol.name).await? {
                Some(VolumeInfo {
                    mountpoint: Some(m),
                    ..
                }) if !m.is_empty() => m,
                _ => continue,
            };

            // Get directory size via du; rootful mountpoints may be unreadable
            let du_output = Command::new("du")
                .args(["-sb", &mountpoint])
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output()
                .await
                .map_err(|e| KilnError::command_failed("du", e))?;

            if du_output.status.success() {
                let du_str = String::from_utf8_lossy(&du_output.stdout);
                if let Some(size) = du_str
                    .split_whitespace()
                    .next()
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    sizes.insert(vol.name.clone(), size);
                }
            }
        }

        Ok(sizes)
    }

    fn runtime_name(&self) -> &'static str {
        self.engine.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_detection() {
        assert_eq!(Engine::detect("podman"), Engine::Podman);
        assert_eq!(Engine::detect("/usr/local/bin/docker"), Engine::Docker);
        assert_eq!(CliRuntime::new("docker").runtime_name(), "Docker");
        assert_eq!(CliRuntime::new("podman-remote").engine(), Engine::Podman);
    }

    #[test]
    fn image_inspect_parses_config() {
        let json = r#"[{
            "Id": "sha256:feed",
            "Size": 81234567,
            "Config": {
                "Entrypoint": ["./shim"],
                "Cmd": null,
                "WorkingDir": "/app",
                "Labels": {"io.kiln.binary-sha256": "ab12"}
            }
        }]"#;

        let info = parse_image_inspect(json).unwrap().unwrap();
        assert_eq!(info.id, "sha256:feed");
        assert_eq!(info.entrypoint, vec!["./shim"]);
        assert!(info.cmd.is_empty());
        assert_eq!(info.workdir, "/app");
        assert_eq!(info.labels.get("io.kiln.binary-sha256").unwrap(), "ab12");
        assert_eq!(info.size_bytes, Some(81234567));
    }

    #[test]
    fn image_inspect_empty_array() {
        assert!(parse_image_inspect("[]").unwrap().is_none());
    }

    #[test]
    fn volume_list_podman_array() {
        let json = r#"[
            {"Name": "kiln-cache-abc-target", "Labels": {"io.kiln.cache": "true"}, "Mountpoint": "/v/1"},
            {"Name": "unrelated", "Labels": {}}
        ]"#;
        let vols = parse_volume_list(json, "kiln-cache-").unwrap();
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].labels.get("io.kiln.cache").unwrap(), "true");
        assert_eq!(vols[0].mountpoint.as_deref(), Some("/v/1"));
    }

    #[test]
    fn volume_list_docker_lines() {
        let out = "{\"Name\":\"kiln-cache-abc-rustup\",\"Labels\":\"io.kiln.cache=true,io.kiln.cache.kind=rustup\"}\n\
                   {\"Name\":\"other\",\"Labels\":\"\"}\n";
        let vols = parse_volume_list(out, "kiln-cache-").unwrap();
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].labels.get("io.kiln.cache.kind").unwrap(), "rustup");
    }

    #[test]
    fn missing_object_messages() {
        assert!(is_missing("Error: shim:1: image not known"));
        assert!(is_missing("Error response from daemon: No such container: x"));
        assert!(!is_missing("permission denied"));
    }

    #[tokio::test]
    async fn docker_refuses_volume_copy() {
        let runtime = CliRuntime::new("docker");
        let err = runtime.volume_copy("a", "b").await.unwrap_err();
        assert!(matches!(err, KilnError::EngineUnsupported { .. }));
    }
}
