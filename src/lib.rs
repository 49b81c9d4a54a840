//! kiln - two-stage container image builds for Rust services
//!
//! A builder container compiles the service with persistent, lock-guarded
//! cache volumes; a runtime image is then assembled from the compiled
//! binary alone, verified, and only then tagged.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod image;
pub mod orchestration;
pub mod pipeline;
pub mod ui;

pub use error::{KilnError, KilnResult};
