//! Cache command - inspect and prune build caches

use crate::cache::{
    derive_project_key, format_bytes, labels, CacheKind, CacheLock, CacheRecord, CacheState,
    CacheStore, CacheVolume, LockMode,
};
use crate::cache::volume::{RUN_VOLUME_PREFIX, VOLUME_PREFIX};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::orchestration::{create_runtime, ContainerRuntime, VolumeInfo};
use crate::ui::{self, UiContext};
use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config, state_dir: &Path) -> KilnResult<()> {
    let runtime = create_runtime(config)?;
    runtime.ensure_ready().await?;
    let store = CacheStore::new(state_dir);

    match args.action {
        CacheAction::List { format } => list_caches(&*runtime, &store, format).await,
        CacheAction::Info { source } => show_project_info(&*runtime, &store, config, source).await,
        CacheAction::Gc { days, dry_run } => {
            let days = days.unwrap_or(config.cache.gc_days);
            let ctx = UiContext::detect();
            gc_caches(&*runtime, &store, config, days, dry_run, &ctx)
                .await
                .map(|_| ())
        }
        CacheAction::Clear { yes } => {
            let ctx = UiContext::detect().with_auto_yes(yes);
            clear_caches(&*runtime, &store, &ctx).await.map(|_| ())
        }
    }
}

/// One shared cache as shown by `cache list`
#[derive(Debug, Serialize)]
struct CacheRow {
    volume: String,
    project: String,
    kind: String,
    state: CacheState,
    size_bytes: Option<u64>,
    last_used: DateTime<Utc>,
    busy: bool,
}

async fn shared_caches(runtime: &dyn ContainerRuntime) -> KilnResult<Vec<CacheVolume>> {
    let volumes = runtime.volume_list(VOLUME_PREFIX).await?;
    Ok(volumes
        .iter()
        .filter_map(|v| CacheVolume::from_labels(&v.name, &v.labels))
        .collect())
}

/// Record for a volume, falling back to its creation labels
async fn record_or_default(store: &CacheStore, cache: &CacheVolume) -> KilnResult<CacheRecord> {
    Ok(match store.load(&cache.name).await? {
        Some(record) => record,
        None => CacheRecord {
            state: CacheState::Miss,
            last_used: cache.created_at,
            ..CacheRecord::new(&cache.name, cache.kind, &cache.project)
        },
    })
}

async fn cache_rows(runtime: &dyn ContainerRuntime, store: &CacheStore) -> KilnResult<Vec<CacheRow>> {
    let caches = shared_caches(runtime).await?;
    let sizes = runtime
        .volume_disk_usage(VOLUME_PREFIX)
        .await
        .unwrap_or_else(|e| {
            debug!("Could not measure cache sizes: {}", e);
            HashMap::new()
        });

    let mut rows = Vec::with_capacity(caches.len());
    for cache in &caches {
        let record = record_or_default(store, cache).await?;
        rows.push(CacheRow {
            volume: cache.name.clone(),
            project: cache.project.clone(),
            kind: cache.kind.to_string(),
            state: record.state,
            size_bytes: sizes.get(&cache.name).copied(),
            last_used: record.last_used,
            busy: CacheLock::is_busy(&store.lock_path(&cache.name)),
        });
    }
    rows.sort_by(|a, b| a.volume.cmp(&b.volume));
    Ok(rows)
}

async fn list_caches(
    runtime: &dyn ContainerRuntime,
    store: &CacheStore,
    format: OutputFormat,
) -> KilnResult<()> {
    let rows = cache_rows(runtime, store).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Plain => {
            for row in &rows {
                println!("{}", row.volume);
            }
        }
        OutputFormat::Table if rows.is_empty() => println!("No cache volumes found."),
        OutputFormat::Table => print_table(&rows),
    }
    Ok(())
}

fn state_cell(state: CacheState, busy: bool) -> String {
    if busy {
        return style("in use").cyan().to_string();
    }
    match state {
        CacheState::Ready => style("ready").green().to_string(),
        CacheState::Building => style("building").yellow().to_string(),
        CacheState::Miss => style("miss").dim().to_string(),
    }
}

fn print_table(rows: &[CacheRow]) {
    println!(
        "{:<48} {:<16} {:<10} {:>10}  {:<16}",
        "VOLUME", "KIND", "STATE", "SIZE", "LAST USED"
    );
    println!("{}", "-".repeat(104));

    let mut total = 0;
    for row in rows {
        let size = row.size_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string());
        total += row.size_bytes.unwrap_or(0);
        println!(
            "{:<48} {:<16} {:<10} {:>10}  {:<16}",
            row.volume,
            row.kind,
            state_cell(row.state, row.busy),
            size,
            row.last_used.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("Total: {} cache(s), {}", rows.len(), format_bytes(total));
}

async fn show_project_info(
    runtime: &dyn ContainerRuntime,
    store: &CacheStore,
    config: &Config,
    source: Option<PathBuf>,
) -> KilnResult<()> {
    let ctx = UiContext::detect();
    let source = source.unwrap_or_else(|| config.source.dir.clone());
    let project = config
        .cache
        .key
        .clone()
        .unwrap_or_else(|| derive_project_key(&source));

    ui::section(&ctx, "Project");
    ui::key_value(&ctx, "Source", &source.display().to_string());
    ui::key_value(&ctx, "Cache key", &project);
    ui::key_value(&ctx, "Sharing", &config.cache.sharing.to_string());

    ui::section(&ctx, "Caches");
    for kind in CacheKind::all() {
        let name = CacheVolume::volume_name(&project, *kind);
        let exists = runtime.volume_exists(&name).await?;
        let state = match store.load(&name).await? {
            Some(record) if exists => record.state.to_string(),
            None if exists => "unknown".to_string(),
            _ => "miss (created on next build)".to_string(),
        };
        let busy = if CacheLock::is_busy(&store.lock_path(&name)) {
            ", in use"
        } else {
            ""
        };
        ui::key_value_status(
            &ctx,
            &format!("{:<15}", kind.to_string()),
            &format!("{} [{}{}]", name, state, busy),
            exists,
        );
    }

    Ok(())
}

/// Creation time from our label, else the engine's own timestamp
fn created_at(volume: &VolumeInfo) -> Option<DateTime<Utc>> {
    volume
        .labels
        .get(labels::CREATED_AT)
        .or(volume.created_at.as_ref())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Remove one shared cache under an exclusive lock.
///
/// Returns false when a build holds the cache.
async fn remove_cache(runtime: &dyn ContainerRuntime, store: &CacheStore, name: &str) -> KilnResult<bool> {
    let Some(_lock) = CacheLock::try_acquire(&store.lock_path(name), LockMode::Exclusive)? else {
        return Ok(false);
    };
    runtime.volume_remove(name).await?;
    store.remove(name).await?;
    Ok(true)
}

/// Remove caches unused for `days`, plus private run volumes left behind
/// by builds that died longer ago than the builder budget.
///
/// Returns the names removed (or that would be, on a dry run).
async fn gc_caches(
    runtime: &dyn ContainerRuntime,
    store: &CacheStore,
    config: &Config,
    days: u32,
    dry_run: bool,
    ctx: &UiContext,
) -> KilnResult<Vec<String>> {
    if days == 0 {
        ui::step_info(ctx, "Cache GC is disabled (gc_days = 0)");
        return Ok(Vec::new());
    }

    let mut stale = Vec::new();
    for cache in shared_caches(runtime).await? {
        let record = record_or_default(store, &cache).await?;
        if record.is_older_than_days(days) {
            stale.push(cache.name);
        }
    }

    let orphan_cutoff =
        Utc::now() - chrono::Duration::seconds(config.timeouts.builder_secs as i64);
    let orphans: Vec<String> = runtime
        .volume_list(RUN_VOLUME_PREFIX)
        .await?
        .iter()
        .filter(|v| created_at(v).map(|t| t < orphan_cutoff).unwrap_or(false))
        .map(|v| v.name.clone())
        .collect();

    if stale.is_empty() && orphans.is_empty() {
        ui::step_ok(ctx, &format!("No caches unused for {} days", days));
        return Ok(Vec::new());
    }

    for name in stale.iter().chain(&orphans) {
        ui::remark(ctx, name);
    }

    if dry_run {
        ui::step_info(
            ctx,
            &format!("Dry run: {} volume(s) would be removed", stale.len() + orphans.len()),
        );
        return Ok(stale.into_iter().chain(orphans).collect());
    }

    let mut removed = Vec::new();
    for name in stale {
        if remove_cache(runtime, store, &name).await? {
            removed.push(name);
        } else {
            ui::step_warn_hint(ctx, &format!("Skipped {}", name), "a build is using it");
        }
    }
    for name in orphans {
        debug!("Removing orphaned run volume {}", name);
        runtime.volume_remove(&name).await?;
        removed.push(name);
    }

    ui::step_ok(ctx, &format!("Removed {} volume(s)", removed.len()));
    Ok(removed)
}

/// Remove every shared cache not held by a build
async fn clear_caches(
    runtime: &dyn ContainerRuntime,
    store: &CacheStore,
    ctx: &UiContext,
) -> KilnResult<Vec<String>> {
    let caches = shared_caches(runtime).await?;
    if caches.is_empty() {
        ui::step_info(ctx, "No cache volumes to clear");
        return Ok(Vec::new());
    }

    let prompt = format!("Remove {} cache volume(s)?", caches.len());
    if !ui::confirm(ctx, &prompt, false).await? {
        return Err(KilnError::User("Aborted".to_string()));
    }

    let mut removed = Vec::new();
    for cache in caches {
        if remove_cache(runtime, store, &cache.name).await? {
            removed.push(cache.name);
        } else {
            ui::step_warn_hint(ctx, &format!("Skipped {}", cache.name), "a build is using it");
        }
    }

    ui::step_ok(ctx, &format!("Cleared {} cache(s)", removed.len()));
    Ok(removed)
}
