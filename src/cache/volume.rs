//! Cache volume naming and labels
//!
//! Each project gets one named engine volume per cache kind. Volumes carry
//! immutable creation labels; mutable state lives in [`super::record`].

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Prefix shared by every kiln cache volume
pub const VOLUME_PREFIX: &str = "kiln-cache-";

/// Prefix of per-run private volumes (isolated sharing)
pub const RUN_VOLUME_PREFIX: &str = "kiln-run-";

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Volume label keys used to track cache metadata
pub mod labels {
    /// Marks volume as a kiln cache
    pub const KILN_CACHE: &str = "io.kiln.cache";
    /// The cache kind (target, registry-index, ...)
    pub const KIND: &str = "io.kiln.cache.kind";
    /// The project cache key
    pub const PROJECT: &str = "io.kiln.cache.project";
    /// Creation timestamp (RFC3339)
    pub const CREATED_AT: &str = "io.kiln.cache.created_at";
    /// Run id, only on private per-run volumes
    pub const RUN: &str = "io.kiln.cache.run";
}

/// What a cache volume holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKind {
    /// Compiled build artifacts (`target/`)
    Target,
    /// Downloaded package registry metadata
    RegistryIndex,
    /// Downloaded package sources
    RegistryCache,
    /// Toolchain installation state
    Rustup,
}

impl CacheKind {
    /// All kinds, in mount order
    pub fn all() -> &'static [Self] {
        &[
            Self::Target,
            Self::RegistryIndex,
            Self::RegistryCache,
            Self::Rustup,
        ]
    }

    /// Mount path inside the builder container
    pub fn container_path(&self, builder_workdir: &str) -> String {
        match self {
            Self::Target => format!("{}/target", builder_workdir.trim_end_matches('/')),
            Self::RegistryIndex => "/usr/local/cargo/registry/index".to_string(),
            Self::RegistryCache => "/usr/local/cargo/registry/cache".to_string(),
            Self::Rustup => "/usr/local/rustup".to_string(),
        }
    }

    /// Parse from a label value
    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "target" => Some(Self::Target),
            "registry-index" => Some(Self::RegistryIndex),
            "registry-cache" => Some(Self::RegistryCache),
            "rustup" => Some(Self::Rustup),
            _ => None,
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Target => "target",
            Self::RegistryIndex => "registry-index",
            Self::RegistryCache => "registry-cache",
            Self::Rustup => "rustup",
        };
        write!(f, "{}", name)
    }
}

/// Derive a project cache key from the source tree location.
///
/// SHA256 of the path, first 12 hex chars, so two checkouts of the same
/// service keep separate caches.
pub fn derive_project_key(source_dir: &Path) -> String {
    let canonical = source_dir
        .canonicalize()
        .unwrap_or_else(|_| source_dir.to_path_buf());

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let result = hasher.finalize();

    // Take first 12 hex characters (6 bytes)
    hex::encode(&result[..6])
}

/// Check that a configured key is usable inside a volume name
pub fn is_valid_project_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 64
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Information about a shared cache volume
#[derive(Debug, Clone)]
pub struct CacheVolume {
    /// Volume name (kiln-cache-{project}-{kind})
    pub name: String,
    /// What this volume holds
    pub kind: CacheKind,
    /// Project cache key
    pub project: String,
    /// When the volume was created
    pub created_at: DateTime<Utc>,
}

impl CacheVolume {
    /// Create a new cache volume record
    pub fn new(project: &str, kind: CacheKind) -> Self {
        Self {
            name: Self::volume_name(project, kind),
            kind,
            project: project.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Shared volume name for a project and kind
    pub fn volume_name(project: &str, kind: CacheKind) -> String {
        format!("{}{}-{}", VOLUME_PREFIX, project, kind)
    }

    /// Private volume name for one run (isolated sharing)
    pub fn run_volume_name(run_short: &str, kind: CacheKind) -> String {
        format!("{}{}-{}", RUN_VOLUME_PREFIX, run_short, kind)
    }

    /// Generate labels for volume creation
    pub fn labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(labels::KILN_CACHE.to_string(), "true".to_string());
        labels.insert(labels::KIND.to_string(), self.kind.to_string());
        labels.insert(labels::PROJECT.to_string(), self.project.clone());
        labels.insert(
            labels::CREATED_AT.to_string(),
            self.created_at.to_rfc3339(),
        );
        labels
    }

    /// Try to parse from volume labels
    pub fn from_labels(name: &str, labels: &HashMap<String, String>) -> Option<Self> {
        // Must be a kiln cache
        if labels.get(labels::KILN_CACHE).map(String::as_str) != Some("true") {
            return None;
        }

        // Private run volumes are not shared caches
        if labels.contains_key(labels::RUN) {
            return None;
        }

        let kind = labels
            .get(labels::KIND)
            .and_then(|s| CacheKind::from_label(s))?;

        let project = labels.get(labels::PROJECT)?.clone();

        let created_at = labels
            .get(labels::CREATED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Some(Self {
            name: name.to_string(),
            kind,
            project,
            created_at,
        })
    }
}

/// One cache volume mounted into the builder container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMount {
    /// Volume name
    pub volume_name: String,
    /// Mount path inside container
    pub container_path: String,
    /// What the volume holds
    pub kind: CacheKind,
}

impl CacheMount {
    /// Generate the volume mount string for the engine
    pub fn volume_arg(&self) -> String {
        format!("{}:{}", self.volume_name, self.container_path)
    }
}
