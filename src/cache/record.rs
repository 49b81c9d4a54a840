//! Cache state records
//!
//! Engine volume labels cannot change after creation, so the mutable side
//! of a cache (state, last use) is kept as a small JSON file per volume,
//! next to that volume's lock file.

use crate::cache::volume::CacheKind;
use crate::error::{KilnError, KilnResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// State of a cache volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// No volume exists (will be created)
    Miss,
    /// A run is writing to it, or the last run failed part way
    Building,
    /// Last run that wrote to it succeeded
    Ready,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Miss => write!(f, "miss"),
            Self::Building => write!(f, "building"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// Persisted state of one shared cache volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Volume name
    pub volume: String,
    /// What the volume holds
    #[serde(with = "kind_serde")]
    pub kind: CacheKind,
    /// Project cache key
    pub project: String,
    /// Current state
    pub state: CacheState,
    /// Last time a build mounted this cache
    pub last_used: DateTime<Utc>,
    /// Run that last touched it
    pub last_run: Option<String>,
}

impl CacheRecord {
    /// Fresh record for a volume about to be written
    pub fn new(volume: &str, kind: CacheKind, project: &str) -> Self {
        Self {
            volume: volume.to_string(),
            kind,
            project: project.to_string(),
            state: CacheState::Building,
            last_used: Utc::now(),
            last_run: None,
        }
    }

    /// Check if this cache was last used more than `days` ago
    pub fn is_older_than_days(&self, days: u32) -> bool {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        self.last_used < cutoff
    }
}

mod kind_serde {
    use super::CacheKind;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(kind: &CacheKind, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&kind.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<CacheKind, D::Error> {
        let value = String::deserialize(d)?;
        CacheKind::from_label(&value)
            .ok_or_else(|| D::Error::custom(format!("unknown cache kind {}", value)))
    }
}

/// Directory of cache records and lock files
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Store rooted at `<state_dir>/caches`
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("caches"),
        }
    }

    /// Directory holding records and locks
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock file guarding a volume
    pub fn lock_path(&self, volume: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", volume))
    }

    fn record_path(&self, volume: &str) -> PathBuf {
        self.dir.join(format!("{}.json", volume))
    }

    /// Load the record for a volume, if any
    pub async fn load(&self, volume: &str) -> KilnResult<Option<CacheRecord>> {
        let path = self.record_path(volume);
        if !path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| KilnError::CacheRecordRead {
                path,
                reason: e.to_string(),
            })
    }

    /// Persist a record (write to a temp file, then rename)
    pub async fn save(&self, record: &CacheRecord) -> KilnResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", self.dir.display()), e))?;

        let path = self.record_path(&record.volume);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record)?;

        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| KilnError::io(format!("writing {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| KilnError::io(format!("renaming {}", tmp.display()), e))?;

        debug!("Cache record {} -> {}", record.volume, record.state);
        Ok(())
    }

    /// Set the state of a volume's record, creating the record if missing
    pub async fn mark(
        &self,
        volume: &str,
        kind: CacheKind,
        project: &str,
        state: CacheState,
        run: &str,
    ) -> KilnResult<()> {
        let mut record = self
            .load(volume)
            .await?
            .unwrap_or_else(|| CacheRecord::new(volume, kind, project));
        record.state = state;
        record.last_used = Utc::now();
        record.last_run = Some(run.to_string());
        self.save(&record).await
    }

    /// Record a read-only use of a volume without changing its state
    pub async fn touch(&self, volume: &str, run: &str) -> KilnResult<()> {
        if let Some(mut record) = self.load(volume).await? {
            record.last_used = Utc::now();
            record.last_run = Some(run.to_string());
            self.save(&record).await?;
        }
        Ok(())
    }

    /// Remove a volume's record and lock file
    pub async fn remove(&self, volume: &str) -> KilnResult<()> {
        for path in [self.record_path(volume), self.lock_path(volume)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(KilnError::io(format!("removing {}", path.display()), e)),
            }
        }
        Ok(())
    }
}
