//! Cache leases
//!
//! A lease is everything one builder run holds on the shared caches: the
//! volume locks and, in isolated mode, the private per-run volumes. The
//! builder mounts whatever [`CacheLease::mounts`] returns and never names a
//! cache volume directly.
//!
//! Locked mode takes exclusive locks on every shared volume, always in
//! volume-name order, and holds them until the lease is released. Isolated
//! mode seeds private copies under shared locks, drops those locks, and
//! only takes exclusive locks again to promote results back on success.

use crate::cache::lock::{CacheLock, LockMode};
use crate::cache::record::{CacheState, CacheStore};
use crate::cache::volume::{labels, CacheKind, CacheMount, CacheVolume};
use crate::config::CacheSharing;
use crate::error::KilnResult;
use crate::orchestration::ContainerRuntime;
use futures_util::future::join_all;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Whether a cache held anything when the run started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTemperature {
    /// Volume was created for this run
    Cold,
    /// Volume existed before this run
    Warm,
}

impl fmt::Display for CacheTemperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cold => write!(f, "cold"),
            Self::Warm => write!(f, "warm"),
        }
    }
}

/// What a lease should cover
#[derive(Debug, Clone)]
pub struct CacheSpec {
    /// Project cache key
    pub project: String,
    /// Concurrency discipline
    pub sharing: CacheSharing,
    /// Copy private volumes back after success (isolated only)
    pub promote: bool,
    /// Longest wait for any lock
    pub lock_timeout: Duration,
    /// Builder working directory (the target cache mounts beneath it)
    pub builder_workdir: String,
}

#[derive(Debug)]
struct LeaseEntry {
    kind: CacheKind,
    shared: String,
    mounted: String,
    temperature: CacheTemperature,
}

/// Caches held by one builder run
#[derive(Debug)]
pub struct CacheLease {
    spec: Option<CacheSpec>,
    run: String,
    entries: Vec<LeaseEntry>,
    locks: Vec<CacheLock>,
    released: bool,
}

impl CacheLease {
    /// A lease that mounts nothing (caching disabled)
    pub fn disabled() -> Self {
        Self {
            spec: None,
            run: String::new(),
            entries: Vec::new(),
            locks: Vec::new(),
            released: true,
        }
    }

    /// Acquire every cache kind for `run` (the short run id).
    ///
    /// Missing shared volumes are created lazily. On error nothing stays
    /// held: locks are dropped and private volumes removed.
    pub async fn acquire(
        runtime: &dyn ContainerRuntime,
        spec: &CacheSpec,
        run: &str,
        store: &CacheStore,
    ) -> KilnResult<Self> {
        let mut lease = Self::disabled();
        lease.acquire_into(runtime, spec, run, store).await?;
        Ok(lease)
    }

    /// Acquire into this lease in place.
    ///
    /// Locks and private volumes are recorded here as soon as they exist,
    /// so a caller that abandons this future part way can still release
    /// everything through its own lease.
    pub async fn acquire_into(
        &mut self,
        runtime: &dyn ContainerRuntime,
        spec: &CacheSpec,
        run: &str,
        store: &CacheStore,
    ) -> KilnResult<()> {
        self.release(runtime).await;
        self.spec = Some(spec.clone());
        self.run = run.to_string();
        self.entries.clear();
        self.released = false;

        let result = match spec.sharing {
            CacheSharing::Locked => self.acquire_locked(runtime, spec, store).await,
            CacheSharing::Isolated => self.acquire_isolated(runtime, spec, store).await,
        };

        if result.is_err() {
            self.release(runtime).await;
        }
        result
    }

    /// Shared volumes for this project, in lock order
    fn shared_volumes(project: &str) -> Vec<(String, CacheKind)> {
        let mut volumes: Vec<_> = CacheKind::all()
            .iter()
            .map(|kind| (CacheVolume::volume_name(project, *kind), *kind))
            .collect();
        volumes.sort();
        volumes
    }

    fn remaining(started: Instant, timeout: Duration) -> Duration {
        timeout.saturating_sub(started.elapsed())
    }

    async fn acquire_locked(
        &mut self,
        runtime: &dyn ContainerRuntime,
        spec: &CacheSpec,
        store: &CacheStore,
    ) -> KilnResult<()> {
        let started = Instant::now();
        let volumes = Self::shared_volumes(&spec.project);

        // All locks first, in name order, before touching any volume
        for (name, _) in &volumes {
            let lock = CacheLock::acquire(
                &store.lock_path(name),
                name,
                LockMode::Exclusive,
                Self::remaining(started, spec.lock_timeout),
            )
            .await?;
            self.locks.push(lock);
        }

        for (name, kind) in volumes {
            let temperature = ensure_volume(runtime, &spec.project, kind).await?;
            store
                .mark(&name, kind, &spec.project, CacheState::Building, &self.run)
                .await?;
            self.entries.push(LeaseEntry {
                kind,
                shared: name.clone(),
                mounted: name,
                temperature,
            });
        }

        Ok(())
    }

    async fn acquire_isolated(
        &mut self,
        runtime: &dyn ContainerRuntime,
        spec: &CacheSpec,
        store: &CacheStore,
    ) -> KilnResult<()> {
        let started = Instant::now();

        for (name, kind) in Self::shared_volumes(&spec.project) {
            let private = CacheVolume::run_volume_name(&self.run, kind);
            let mut private_labels = CacheVolume::new(&spec.project, kind).labels();
            private_labels.insert(labels::RUN.to_string(), self.run.clone());

            // Record the private volume before creating it so release removes it
            self.entries.push(LeaseEntry {
                kind,
                shared: name.clone(),
                mounted: private.clone(),
                temperature: CacheTemperature::Cold,
            });
            runtime.volume_create(&private, &private_labels).await?;

            let _shared = CacheLock::acquire(
                &store.lock_path(&name),
                &name,
                LockMode::Shared,
                Self::remaining(started, spec.lock_timeout),
            )
            .await?;

            if runtime.volume_exists(&name).await? {
                debug!("Seeding {} from {}", private, name);
                runtime.volume_copy(&name, &private).await?;
                store.touch(&name, &self.run).await?;
                if let Some(entry) = self.entries.last_mut() {
                    entry.temperature = CacheTemperature::Warm;
                }
            }
        }

        Ok(())
    }

    /// Mounts for the builder container
    pub fn mounts(&self) -> Vec<CacheMount> {
        let workdir = self
            .spec
            .as_ref()
            .map(|s| s.builder_workdir.as_str())
            .unwrap_or_default();

        self.entries
            .iter()
            .map(|entry| CacheMount {
                volume_name: entry.mounted.clone(),
                container_path: entry.kind.container_path(workdir),
                kind: entry.kind,
            })
            .collect()
    }

    /// Temperature of each mounted cache, in mount order
    pub fn temperatures(&self) -> Vec<(CacheKind, CacheTemperature)> {
        self.entries
            .iter()
            .map(|entry| (entry.kind, entry.temperature))
            .collect()
    }

    /// Shared volume name and temperature of each cache, in mount order
    pub fn summary(&self) -> Vec<(CacheKind, String, CacheTemperature)> {
        self.entries
            .iter()
            .map(|entry| (entry.kind, entry.shared.clone(), entry.temperature))
            .collect()
    }

    /// Mark the run's caches as good after a successful builder stage.
    ///
    /// In isolated mode with promotion on, private volumes are copied back
    /// into the shared ones under exclusive locks.
    pub async fn commit(
        &self,
        runtime: &dyn ContainerRuntime,
        store: &CacheStore,
    ) -> KilnResult<()> {
        let Some(spec) = &self.spec else {
            return Ok(());
        };

        match spec.sharing {
            CacheSharing::Locked => {
                for entry in &self.entries {
                    store
                        .mark(
                            &entry.shared,
                            entry.kind,
                            &spec.project,
                            CacheState::Ready,
                            &self.run,
                        )
                        .await?;
                }
            }
            CacheSharing::Isolated if spec.promote => {
                let started = Instant::now();
                for entry in &self.entries {
                    let _lock = CacheLock::acquire(
                        &store.lock_path(&entry.shared),
                        &entry.shared,
                        LockMode::Exclusive,
                        Self::remaining(started, spec.lock_timeout),
                    )
                    .await?;

                    ensure_volume(runtime, &spec.project, entry.kind).await?;
                    store
                        .mark(
                            &entry.shared,
                            entry.kind,
                            &spec.project,
                            CacheState::Building,
                            &self.run,
                        )
                        .await?;
                    runtime.volume_copy(&entry.mounted, &entry.shared).await?;
                    store
                        .mark(
                            &entry.shared,
                            entry.kind,
                            &spec.project,
                            CacheState::Ready,
                            &self.run,
                        )
                        .await?;
                    info!("Promoted {} into {}", entry.mounted, entry.shared);
                }
            }
            CacheSharing::Isolated => {}
        }

        Ok(())
    }

    /// Drop all locks and remove private volumes.
    ///
    /// Safe to call more than once. Removal failures are logged, never
    /// returned, so release cannot mask the error that caused it.
    pub async fn release(&mut self, runtime: &dyn ContainerRuntime) {
        if !self.released {
            let private: Vec<&str> = self
                .entries
                .iter()
                .filter(|e| e.mounted != e.shared)
                .map(|e| e.mounted.as_str())
                .collect();

            let results = join_all(private.iter().map(|name| runtime.volume_remove(name))).await;
            for (name, result) in private.iter().zip(results) {
                if let Err(e) = result {
                    warn!("Failed to remove private cache volume {}: {}", name, e);
                }
            }
            self.released = true;
        }

        self.locks.clear();
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        if !self.released && self.entries.iter().any(|e| e.mounted != e.shared) {
            warn!(
                "Cache lease for run {} dropped without release; private volumes may remain",
                self.run
            );
        }
    }
}

/// Create a shared cache volume if missing, reporting its temperature
async fn ensure_volume(
    runtime: &dyn ContainerRuntime,
    project: &str,
    kind: CacheKind,
) -> KilnResult<CacheTemperature> {
    let volume = CacheVolume::new(project, kind);
    if runtime.volume_exists(&volume.name).await? {
        return Ok(CacheTemperature::Warm);
    }

    debug!("Creating cache volume {}", volume.name);
    runtime.volume_create(&volume.name, &volume.labels()).await?;
    Ok(CacheTemperature::Cold)
}
