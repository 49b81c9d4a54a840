//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// kiln - two-stage container image builds for Rust services
///
/// Compiles a service in a pinned toolchain container with persistent
/// caches, then ships the binary alone in a minimal runtime image.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip project kiln.toml discovery
    #[arg(long, global = true)]
    pub no_local: bool,

    /// Directory for cache records, locks and staging
    #[arg(long, global = true, env = "KILN_STATE_DIR", hide = true)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build and publish a runtime image
    Build(BuildArgs),

    /// Write a commented kiln.toml into a project
    Init(InitArgs),

    /// Inspect and prune build caches
    Cache(CacheArgs),

    /// Show or edit configuration
    Config(ConfigArgs),

    /// Check the container engine
    Status,

    /// Print shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Source tree to build (defaults to source.dir, then ".")
    #[arg(short, long)]
    pub source: Option<PathBuf>,

    /// Tag for the published image (defaults to <binary>:<run>)
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Binary target to ship
    #[arg(short, long)]
    pub binary: Option<String>,

    /// Pinned toolchain image
    #[arg(long)]
    pub toolchain: Option<String>,

    /// Pinned rustup channel (e.g. 1.82.0, nightly-2024-10-01)
    #[arg(long)]
    pub channel: Option<String>,

    /// Pinned runtime base image
    #[arg(long)]
    pub base: Option<String>,

    /// Build without cache volumes
    #[arg(long)]
    pub no_cache: bool,

    /// Use private copies of the caches for this run
    #[arg(long, conflicts_with = "no_cache")]
    pub isolated: bool,

    /// Print the plan without touching the engine
    #[arg(long)]
    pub dry_run: bool,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the init command
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Overwrite an existing kiln.toml
    #[arg(short, long)]
    pub force: bool,

    /// Project directory (defaults to current directory)
    #[arg(short, long)]
    pub path: Option<PathBuf>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Show the global configuration file path
    Path,

    /// Set a configuration value
    Set {
        /// Dotted key, e.g. cache.sharing
        key: String,
        /// Value to set
        value: String,
        /// Write to the project kiln.toml instead of the global config
        #[arg(long)]
        local: bool,
    },
}

/// Output format for reports and listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Bare values, one per line
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List kiln cache volumes
    List {
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show the caches of one project
    Info {
        /// Source tree (defaults to source.dir, then ".")
        #[arg(short, long)]
        source: Option<PathBuf>,
    },

    /// Remove caches unused for a number of days
    Gc {
        /// Age threshold in days (defaults to cache.gc_days)
        #[arg(long)]
        days: Option<u32>,

        /// Show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every kiln cache
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}
