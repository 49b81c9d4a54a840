//! Build command - run the two-stage pipeline

use crate::cache::{format_bytes, CacheKind, CacheVolume};
use crate::cli::args::{BuildArgs, OutputFormat};
use crate::config::Config;
use crate::error::KilnResult;
use crate::orchestration::create_runtime;
use crate::pipeline::{containerfile, BuildPlan, BuildReport, Pipeline, PlanOverrides};
use crate::ui::{self, StepProgress, UiContext};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config, state_dir: &Path) -> KilnResult<()> {
    let overrides = PlanOverrides {
        source: args.source,
        tag: args.tag,
        binary: args.binary,
        toolchain: args.toolchain,
        channel: args.channel,
        base: args.base,
        no_cache: args.no_cache,
        isolated: args.isolated,
    };
    let plan = BuildPlan::resolve(config, &overrides)?;

    if args.dry_run {
        return print_dry_run(&plan, args.format);
    }

    let ctx = UiContext::detect().with_quiet(args.format != OutputFormat::Table);
    let runtime = create_runtime(config)?;
    debug!("Using engine: {}", runtime.runtime_name());

    ui::intro(&ctx, &format!("kiln build {}", plan.binary));
    let progress = StepProgress::new(&ctx);
    let report = Pipeline::new(&*runtime, state_dir, &progress)
        .run(&plan)
        .await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => {
            if let Some(image) = &report.image {
                println!("{}", image.tag);
            }
        }
        OutputFormat::Table => print_summary(&ctx, &report),
    }
    Ok(())
}

fn print_summary(ctx: &UiContext, report: &BuildReport) {
    if !report.caches.is_empty() {
        ui::section(ctx, "Caches");
        for cache in &report.caches {
            ui::key_value(
                ctx,
                &format!("{:<15}", cache.kind.to_string()),
                &format!("{} ({})", cache.temperature, cache.volume),
            );
        }
    }

    if let Some(artifact) = &report.artifact {
        ui::section(ctx, "Binary");
        ui::key_value(ctx, "Name", &artifact.name);
        ui::key_value(ctx, "Size", &format_bytes(artifact.size_bytes));
        ui::key_value(ctx, "SHA-256", &artifact.sha256);
    }

    if let Some(image) = &report.image {
        ui::section(ctx, "Image");
        ui::key_value(ctx, "Tag", &image.tag);
        ui::key_value(ctx, "ID", &image.id);
        ui::key_value(ctx, "Entrypoint", &image.entrypoint.join(" "));
        if let Some(size) = image.size_bytes {
            ui::key_value(ctx, "Size", &format_bytes(size));
        }
        ui::outro_success(
            ctx,
            &format!(
                "Published {} in {:.1}s",
                image.tag,
                report.total_ms as f64 / 1000.0
            ),
        );
    }
}

/// Everything a build would do, without an engine
#[derive(Debug, Serialize)]
struct DryRun {
    binary: String,
    source: String,
    toolchain: String,
    channel: String,
    base: String,
    tag: String,
    caches: Vec<DryRunCache>,
    commands: Vec<Vec<String>>,
    containerfile: String,
}

#[derive(Debug, Serialize)]
struct DryRunCache {
    kind: String,
    volume: String,
    mount: String,
}

fn dry_run(plan: &BuildPlan) -> DryRun {
    let caches = match &plan.cache {
        Some(spec) => CacheKind::all()
            .iter()
            .map(|kind| DryRunCache {
                kind: kind.to_string(),
                volume: CacheVolume::volume_name(&spec.project, *kind),
                mount: kind.container_path(&plan.builder_workdir),
            })
            .collect(),
        None => Vec::new(),
    };

    let mut commands = plan.toolchain_commands();
    commands.push(plan.compile_command());
    commands.push(plan.post_process_command());

    DryRun {
        binary: plan.binary.clone(),
        source: plan.source_dir.display().to_string(),
        toolchain: plan.toolchain.to_string(),
        channel: plan.channel.to_string(),
        base: plan.base.to_string(),
        tag: plan
            .tag
            .clone()
            .unwrap_or_else(|| format!("{}:<run>", plan.default_repository())),
        caches,
        commands,
        containerfile: containerfile::render(plan, "<run>", "<sha256>"),
    }
}

fn print_dry_run(plan: &BuildPlan, format: OutputFormat) -> KilnResult<()> {
    let dry = dry_run(plan);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&dry)?),
        OutputFormat::Plain => {
            for command in &dry.commands {
                println!("{}", command.join(" "));
            }
        }
        OutputFormat::Table => {
            let ctx = UiContext::non_interactive();
            ui::section(&ctx, "Plan");
            ui::key_value(&ctx, "Binary", &dry.binary);
            ui::key_value(&ctx, "Source", &dry.source);
            ui::key_value(&ctx, "Toolchain", &dry.toolchain);
            ui::key_value(&ctx, "Channel", &dry.channel);
            ui::key_value(&ctx, "Base", &dry.base);
            ui::key_value(&ctx, "Tag", &dry.tag);

            ui::section(&ctx, "Caches");
            if dry.caches.is_empty() {
                ui::remark(&ctx, "disabled");
            }
            for cache in &dry.caches {
                ui::key_value(&ctx, &cache.volume, &cache.mount);
            }

            ui::section(&ctx, "Builder commands");
            for command in &dry.commands {
                ui::remark(&ctx, &command.join(" "));
            }

            ui::section(&ctx, "Containerfile");
            print!("{}", dry.containerfile);
        }
    }
    Ok(())
}
