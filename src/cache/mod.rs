//! Persistent build caches
//!
//! The builder stage mounts one named volume per cache kind (compiled
//! artifacts, registry index, registry sources, toolchain state). Volumes
//! outlive a single run and are shared by every build of the same project.
//!
//! # Cache States
//!
//! | State | Meaning |
//! |-------|---------|
//! | Miss | No volume exists, created on next build |
//! | Building | A run is writing, or the last writer failed |
//! | Ready | The last run that wrote to it succeeded |
//!
//! Concurrent builds are kept apart by [`CacheLease`]; see [`lease`].

pub mod lease;
pub mod lock;
pub mod record;
pub mod volume;

pub use lease::{CacheLease, CacheSpec, CacheTemperature};
pub use lock::{CacheLock, LockMode};
pub use record::{CacheRecord, CacheState, CacheStore};
pub use volume::{
    derive_project_key, format_bytes, is_valid_project_key, labels, CacheKind, CacheMount,
    CacheVolume,
};
