use super::*;
use crate::cache::{CacheKind, CacheLock, CacheState, CacheVolume, LockMode};
use crate::config::Config;
use crate::orchestration::fake::{FakeRuntime, FAKE_BINARY};
use crate::orchestration::ContainerStatus;
use crate::pipeline::builder::sha256_hex;
use tempfile::TempDir;

const TOOLCHAIN: &str = "docker.io/library/rust:1.82.0-slim-bookworm";
const BASE: &str = "docker.io/library/debian:bookworm-slim";

struct Fixture {
    source: TempDir,
    state: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let source = TempDir::new().unwrap();
        std::fs::write(
            source.path().join("Cargo.toml"),
            "[package]\nname = \"shim\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        std::fs::create_dir_all(source.path().join("src")).unwrap();
        std::fs::write(source.path().join("src/main.rs"), "fn main() {}\n").unwrap();

        Self {
            source,
            state: TempDir::new().unwrap(),
        }
    }

    fn plan_with(&self, config: &Config, overrides: PlanOverrides) -> BuildPlan {
        let overrides = PlanOverrides {
            source: Some(self.source.path().to_path_buf()),
            ..overrides
        };
        BuildPlan::resolve(config, &overrides).unwrap()
    }

    fn plan(&self) -> BuildPlan {
        self.plan_with(&Config::default(), PlanOverrides::default())
    }

    fn store(&self) -> CacheStore {
        CacheStore::new(self.state.path())
    }
}

fn engine() -> FakeRuntime {
    FakeRuntime::new()
        .with_registry_image(TOOLCHAIN)
        .with_registry_image(BASE)
}

async fn build(fx: &Fixture, runtime: &FakeRuntime, plan: &BuildPlan) -> KilnResult<BuildReport> {
    Pipeline::new(runtime, fx.state.path(), &NullProgress)
        .run(plan)
        .await
}

fn no_locks_held(fx: &Fixture, plan: &BuildPlan) -> bool {
    let project = &plan.cache.as_ref().unwrap().project;
    CacheKind::all().iter().all(|kind| {
        let volume = CacheVolume::volume_name(project, *kind);
        !CacheLock::is_busy(&fx.store().lock_path(&volume))
    })
}

#[tokio::test]
async fn cold_then_warm_build() {
    let fx = Fixture::new();
    let runtime = engine();
    let plan = fx.plan();

    let cold = build(&fx, &runtime, &plan).await.unwrap();
    assert_eq!(cold.caches.len(), CacheKind::all().len());
    assert!(!cold.is_warm());
    assert!(cold.steps.iter().all(|s| s.outcome == StepOutcome::Ok));
    assert_eq!(cold.steps.len(), Step::all().len());

    let warm = build(&fx, &runtime, &plan).await.unwrap();
    assert!(warm.is_warm());

    let cold_image = cold.image.unwrap();
    let warm_image = warm.image.unwrap();
    assert_eq!(cold_image.entrypoint, vec!["./shim".to_string()]);
    assert_eq!(cold_image.entrypoint, warm_image.entrypoint);
    assert_ne!(cold_image.tag, warm_image.tag);

    // Same source, same artifact
    assert_eq!(cold.artifact.unwrap().sha256, warm.artifact.unwrap().sha256);

    let project = &plan.cache.as_ref().unwrap().project;
    let target = CacheVolume::volume_name(project, CacheKind::Target);
    let record = fx.store().load(&target).await.unwrap().unwrap();
    assert_eq!(record.state, CacheState::Ready);
    assert!(no_locks_held(&fx, &plan));
}

#[tokio::test]
async fn published_image_carries_binary_digest() {
    let fx = Fixture::new();
    let runtime = engine();
    let plan = fx.plan();

    let report = build(&fx, &runtime, &plan).await.unwrap();
    let tag = report.image.as_ref().unwrap().tag.clone();
    let image = runtime.image(&tag).unwrap();

    assert_eq!(
        image.labels.get(containerfile::labels::BINARY_SHA256),
        Some(&sha256_hex(FAKE_BINARY))
    );
    assert_eq!(image.workdir, "/app");
    assert!(image.cmd.is_empty());
}

#[tokio::test]
async fn steps_run_in_order() {
    let fx = Fixture::new();
    let runtime = engine();
    build(&fx, &runtime, &fx.plan()).await.unwrap();

    let order = [
        "pull docker.io/library/rust",
        "volume create kiln-cache-",
        "create kiln-build-",
        "cp ",
        "start ",
        "exec rustup toolchain install",
        "exec cargo build",
        "exec objcopy",
        "pull docker.io/library/debian",
        "build kiln-staging-",
        "tag kiln-staging-",
        "rmi kiln-staging-",
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|op| runtime.position(op).unwrap_or_else(|| panic!("missing {}", op)))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", runtime.ops());

    // Builder container gone before the runtime stage starts
    let rm = runtime.position("rm kiln-build-").unwrap();
    assert!(rm < runtime.position("pull docker.io/library/debian").unwrap());
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test]
async fn build_context_holds_only_binary() {
    let fx = Fixture::new();
    let runtime = engine();
    build(&fx, &runtime, &fx.plan()).await.unwrap();

    let builds = runtime.builds();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].context_files, vec!["Containerfile", "shim"]);
    assert!(!builds[0].containerfile.contains("target/"));
    assert!(!builds[0].containerfile.contains("cargo"));
}

#[tokio::test]
async fn compile_failure_publishes_nothing() {
    let fx = Fixture::new();
    let runtime = engine().fail_exec_matching(
        "cargo build",
        101,
        &["error[E0425]: cannot find value `x` in this scope"],
    );
    let plan = fx.plan();

    let err = build(&fx, &runtime, &plan).await.unwrap_err();
    match &err {
        KilnError::Compile { binary, output } => {
            assert_eq!(binary, "shim");
            assert!(output.contains("E0425"));
        }
        other => panic!("expected compile error, got {:?}", other),
    }
    assert_eq!(err.stage(), Some(Stage::Builder));

    assert!(!runtime.did("exec objcopy"));
    assert!(!runtime.did("build "));
    assert!(!runtime.did("tag "));
    assert_eq!(runtime.live_containers(), 0);
    assert!(no_locks_held(&fx, &plan));

    // Failed run leaves the cache marked as mid-build
    let project = &plan.cache.as_ref().unwrap().project;
    let target = CacheVolume::volume_name(project, CacheKind::Target);
    let record = fx.store().load(&target).await.unwrap().unwrap();
    assert_eq!(record.state, CacheState::Building);
}

#[tokio::test]
async fn unresolvable_toolchain_stops_before_any_container() {
    let fx = Fixture::new();
    let runtime = FakeRuntime::new().with_registry_image(BASE);

    let err = build(&fx, &runtime, &fx.plan()).await.unwrap_err();
    assert!(matches!(err, KilnError::ToolchainResolve { .. }));
    assert!(!runtime.did("create "));
    assert!(!runtime.did("exec cargo"));
    assert!(!runtime.did("volume create"));
}

#[tokio::test]
async fn toolchain_install_failure() {
    let fx = Fixture::new();
    let runtime = engine().fail_exec_matching(
        "rustup toolchain install",
        1,
        &["error: toolchain '1.82.0' is not installable"],
    );

    let err = build(&fx, &runtime, &fx.plan()).await.unwrap_err();
    assert!(matches!(err, KilnError::ToolchainInstall { .. }));
    assert!(!runtime.did("exec cargo"));
}

#[tokio::test]
async fn unresolvable_base_stops_before_assembly() {
    let fx = Fixture::new();
    let runtime = FakeRuntime::new().with_registry_image(TOOLCHAIN);

    let err = build(&fx, &runtime, &fx.plan()).await.unwrap_err();
    assert!(matches!(err, KilnError::BaseImageResolve { .. }));
    assert_eq!(err.stage(), Some(Stage::Runtime));
    assert!(runtime.did("exec cargo build"));
    assert!(!runtime.did("build "));
    assert!(!runtime.did("tag "));
}

#[tokio::test]
async fn post_process_failure() {
    let fx = Fixture::new();
    let runtime = engine().fail_exec_matching(
        "objcopy",
        1,
        &["objcopy: target/release/shim: file format not recognized"],
    );

    let err = build(&fx, &runtime, &fx.plan()).await.unwrap_err();
    assert!(matches!(err, KilnError::PostProcess { .. }));
    assert!(!runtime.did("cp kiln-build-"));
    assert!(!runtime.did("build "));
}

#[tokio::test]
async fn artifact_copy_failure() {
    let fx = Fixture::new();
    let runtime = engine().fail_copy_out();

    let err = build(&fx, &runtime, &fx.plan()).await.unwrap_err();
    assert!(matches!(err, KilnError::ArtifactCopy { .. }));
    assert!(!runtime.did("pull docker.io/library/debian"));
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test]
async fn image_build_failure_leaves_no_staging_image() {
    let fx = Fixture::new();
    let runtime = engine().fail_build();

    let err = build(&fx, &runtime, &fx.plan()).await.unwrap_err();
    assert!(matches!(err, KilnError::ImageBuild { .. }));
    assert!(runtime.did("rmi kiln-staging-"));
    assert!(!runtime.did("tag "));
}

#[tokio::test]
async fn failed_smoke_test_publishes_nothing() {
    let fx = Fixture::new();
    let runtime = engine().smoke_status(ContainerStatus::Exited(1));
    let mut config = Config::default();
    config.verify.smoke_secs = 1;
    let plan = fx.plan_with(&config, PlanOverrides::default());

    let run = RunId::new();
    let err = Pipeline::new(&runtime, fx.state.path(), &NullProgress)
        .run_with_id(&plan, run)
        .await
        .unwrap_err();

    assert!(matches!(err, KilnError::Verify { .. }));
    assert!(runtime.did("run kiln-smoke-"));
    assert!(!runtime.did("tag "));
    assert!(runtime.image(&plan.final_tag(&run)).is_none());
    assert!(runtime
        .image(&format!("kiln-staging-{}", run.short()))
        .is_none());
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test]
async fn passing_smoke_test() {
    let fx = Fixture::new();
    let runtime = engine().smoke_status(ContainerStatus::Exited(0));
    let mut config = Config::default();
    config.verify.smoke_secs = 1;
    let plan = fx.plan_with(&config, PlanOverrides::default());

    let report = build(&fx, &runtime, &plan).await.unwrap();
    assert!(report.image.is_some());
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test]
async fn builder_timeout_cleans_up() {
    let fx = Fixture::new();
    let runtime = engine().exec_delay(Duration::from_secs(5));
    let mut plan = fx.plan();
    plan.builder_budget = Duration::from_millis(200);

    let run = RunId::new();
    let err = Pipeline::new(&runtime, fx.state.path(), &NullProgress)
        .run_with_id(&plan, run)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        KilnError::StageTimeout {
            stage: Stage::Builder,
            ..
        }
    ));
    assert!(runtime.did(&format!("rm kiln-build-{}", run.short())));
    assert_eq!(runtime.live_containers(), 0);
    assert!(no_locks_held(&fx, &plan));
    assert!(!runtime.did("build "));
    assert!(!fx.state.path().join("staging").join(run.short()).exists());
}

#[tokio::test]
async fn caching_disabled_mounts_nothing() {
    let fx = Fixture::new();
    let runtime = engine();
    let plan = fx.plan_with(
        &Config::default(),
        PlanOverrides {
            no_cache: true,
            ..PlanOverrides::default()
        },
    );

    let report = build(&fx, &runtime, &plan).await.unwrap();
    assert!(report.caches.is_empty());
    assert!(report.outcome(Step::AcquireCaches).is_none());
    assert!(runtime.volume_names().is_empty());
}

#[tokio::test]
async fn isolated_run_leaves_only_shared_volumes() {
    let fx = Fixture::new();
    let runtime = engine();
    let plan = fx.plan_with(
        &Config::default(),
        PlanOverrides {
            isolated: true,
            ..PlanOverrides::default()
        },
    );

    build(&fx, &runtime, &plan).await.unwrap();
    assert!(runtime.did("volume create kiln-run-"));
    assert!(runtime.did("volume copy kiln-run-"));

    let names = runtime.volume_names();
    assert_eq!(names.len(), CacheKind::all().len());
    assert!(names.iter().all(|n| n.starts_with("kiln-cache-")));

    // Second isolated run seeds from the promoted volumes
    let report = build(&fx, &runtime, &plan).await.unwrap();
    assert!(report.is_warm());
    assert!(runtime
        .volume_names()
        .iter()
        .all(|n| n.starts_with("kiln-cache-")));
}

#[tokio::test]
async fn isolated_failure_discards_private_volumes() {
    let fx = Fixture::new();
    let runtime = engine().fail_exec_matching("cargo build", 101, &["error: could not compile"]);
    let plan = fx.plan_with(
        &Config::default(),
        PlanOverrides {
            isolated: true,
            ..PlanOverrides::default()
        },
    );

    build(&fx, &runtime, &plan).await.unwrap_err();
    assert!(runtime.volume_names().is_empty());
    assert!(!runtime.did("volume copy"));
}

#[tokio::test]
async fn explicit_tag_is_used() {
    let fx = Fixture::new();
    let runtime = engine();
    let plan = fx.plan_with(
        &Config::default(),
        PlanOverrides {
            tag: Some("registry.local:5000/shim:1.4.0".to_string()),
            ..PlanOverrides::default()
        },
    );

    let report = build(&fx, &runtime, &plan).await.unwrap();
    assert_eq!(report.image.unwrap().tag, "registry.local:5000/shim:1.4.0");
    assert!(runtime.image("registry.local:5000/shim:1.4.0").is_some());
}

#[tokio::test]
async fn local_toolchain_is_not_pulled() {
    let fx = Fixture::new();
    let runtime = FakeRuntime::new()
        .with_local_image(TOOLCHAIN)
        .with_registry_image(BASE);

    build(&fx, &runtime, &fx.plan()).await.unwrap();
    assert!(!runtime.did(&format!("pull {}", TOOLCHAIN)));
    assert!(runtime.did(&format!("pull {}", BASE)));
}

#[tokio::test]
async fn isolated_timeout_while_waiting_for_cache_discards_private_volumes() {
    let fx = Fixture::new();
    let runtime = engine();
    let mut plan = fx.plan_with(
        &Config::default(),
        PlanOverrides {
            isolated: true,
            ..PlanOverrides::default()
        },
    );
    plan.builder_budget = Duration::from_millis(500);

    // Another build writes the first cache in lock order
    let project = plan.cache.as_ref().unwrap().project.clone();
    let mut shared: Vec<String> = CacheKind::all()
        .iter()
        .map(|kind| CacheVolume::volume_name(&project, *kind))
        .collect();
    shared.sort();
    let held = CacheLock::try_acquire(&fx.store().lock_path(&shared[0]), LockMode::Exclusive)
        .unwrap()
        .unwrap();

    let err = build(&fx, &runtime, &plan).await.unwrap_err();
    assert!(matches!(
        err,
        KilnError::StageTimeout {
            stage: Stage::Builder,
            ..
        }
    ));
    assert!(runtime.did("volume create kiln-run-"));
    assert!(runtime.volume_names().is_empty());
    assert!(!runtime.did("create kiln-build-"));

    drop(held);
    assert!(no_locks_held(&fx, &plan));
}

#[tokio::test]
async fn runtime_timeout_withdraws_staging_image() {
    let fx = Fixture::new();
    let runtime = engine().build_delay(Duration::from_secs(5));
    let mut plan = fx.plan();
    plan.runtime_budget = Duration::from_millis(200);

    let run = RunId::new();
    let err = Pipeline::new(&runtime, fx.state.path(), &NullProgress)
        .run_with_id(&plan, run)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        KilnError::StageTimeout {
            stage: Stage::Runtime,
            ..
        }
    ));
    let staging_tag = format!("kiln-staging-{}", run.short());
    assert!(runtime.did(&format!("build {}", staging_tag)));
    assert!(runtime.image(&staging_tag).is_none());
    assert!(!runtime.did("tag "));
    assert!(runtime.image(&plan.final_tag(&run)).is_none());
    assert!(!fx.state.path().join("staging").join(run.short()).exists());
    assert!(no_locks_held(&fx, &plan));
}

#[tokio::test]
async fn failed_publish_withdraws_final_tag() {
    let fx = Fixture::new();
    let runtime = engine().fail_inspect_of("shim:1.0.0");
    let plan = fx.plan_with(
        &Config::default(),
        PlanOverrides {
            tag: Some("shim:1.0.0".to_string()),
            ..PlanOverrides::default()
        },
    );

    build(&fx, &runtime, &plan).await.unwrap_err();
    assert!(runtime.did("tag kiln-staging-"));
    assert!(runtime.did("rmi shim:1.0.0"));
    assert!(runtime.image("shim:1.0.0").is_none());
    assert!(runtime
        .ops()
        .iter()
        .filter(|op| op.starts_with("build "))
        .all(|op| runtime.image(&op["build ".len()..]).is_none()));
}
