//! Shared container types
//!
//! Data structures passed to the engine implementations. The command-line
//! handling lives in [`super::engine`].

use std::collections::HashMap;

/// Configuration for creating a builder container
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Container image to use
    pub image: String,
    /// Container name
    pub name: String,
    /// Working directory inside the container
    pub workdir: String,
    /// Volume mounts (volume:container format)
    pub volumes: Vec<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Labels attached to the container
    pub labels: HashMap<String, String>,
    /// Command keeping the container alive between exec steps
    pub command: Vec<String>,
}

impl ContainerConfig {
    /// Builder container: idles until steps are exec'd into it
    pub fn idle(image: &str, name: &str, workdir: &str) -> Self {
        Self {
            image: image.to_string(),
            name: name.to_string(),
            workdir: workdir.to_string(),
            volumes: Vec::new(),
            env: HashMap::new(),
            labels: HashMap::new(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
        }
    }

    /// Engine arguments shared by `create` for podman and docker
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--name".to_string(),
            self.name.clone(),
            "-w".to_string(),
            self.workdir.clone(),
        ];

        for v in &self.volumes {
            args.push("-v".to_string());
            args.push(v.clone());
        }

        let mut env: Vec<_> = self.env.iter().collect();
        env.sort();
        for (k, v) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }

        let mut labels: Vec<_> = self.labels.iter().collect();
        labels.sort();
        for (k, v) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", k, v));
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}
