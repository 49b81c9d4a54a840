//! Integration tests for kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// kiln with global config, state and cwd confined to `home`
    fn kiln(home: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("kiln");
        cmd.current_dir(home.path())
            .env("KILN_CONFIG", home.path().join("config.toml"))
            .env("KILN_STATE_DIR", home.path().join("state"))
            .env_remove("RUST_LOG");
        cmd
    }

    fn service(home: &TempDir) -> std::path::PathBuf {
        let dir = home.path().join("svc");
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(
            dir.join("Cargo.toml"),
            "[package]\nname = \"shim\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        std::fs::write(dir.join("src/main.rs"), "fn main() {}\n").unwrap();
        dir
    }

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("two-stage container image builds"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn config_path_uses_override() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_defaults() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[toolchain]"))
            .stdout(predicate::str::contains("bookworm-slim"));
    }

    #[test]
    fn config_set_then_show() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .args(["config", "set", "cache.sharing", "isolated"])
            .assert()
            .success();
        kiln(&home)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("sharing = \"isolated\""));
    }

    #[test]
    fn config_set_rejects_unknown_key() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .args(["config", "set", "vm.name", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn init_writes_project_config() {
        let home = TempDir::new().unwrap();
        let svc = service(&home);
        kiln(&home)
            .args(["init", "--path"])
            .arg(&svc)
            .assert()
            .success();

        let content = std::fs::read_to_string(svc.join("kiln.toml")).unwrap();
        assert!(content.contains("binary = \"shim\""));

        kiln(&home)
            .args(["init", "--path"])
            .arg(&svc)
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn dry_run_prints_plan() {
        let home = TempDir::new().unwrap();
        let svc = service(&home);
        kiln(&home)
            .args(["build", "--dry-run", "--source"])
            .arg(&svc)
            .assert()
            .success()
            .stdout(predicate::str::contains("cargo build --release --bin shim"))
            .stdout(predicate::str::contains("objcopy --compress-debug-sections"))
            .stdout(predicate::str::contains("ENTRYPOINT [\"./shim\"]"));
    }

    #[test]
    fn dry_run_json() {
        let home = TempDir::new().unwrap();
        let svc = service(&home);
        let output = kiln(&home)
            .args(["build", "--dry-run", "--format", "json", "--source"])
            .arg(&svc)
            .output()
            .unwrap();
        assert!(output.status.success());

        let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(plan["binary"], "shim");
        assert_eq!(plan["caches"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn dry_run_picks_up_project_config() {
        let home = TempDir::new().unwrap();
        let svc = service(&home);
        std::fs::write(svc.join("kiln.toml"), "[cache]\nenabled = false\n").unwrap();

        kiln(&home)
            .current_dir(&svc)
            .args(["build", "--dry-run", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"caches\": []"));

        kiln(&home)
            .current_dir(&svc)
            .args(["--no-local", "build", "--dry-run", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln-cache-"));
    }

    #[test]
    fn floating_toolchain_rejected() {
        let home = TempDir::new().unwrap();
        let svc = service(&home);
        kiln(&home)
            .args(["build", "--dry-run", "--toolchain", "rust:latest", "--source"])
            .arg(&svc)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn floating_channel_rejected() {
        let home = TempDir::new().unwrap();
        let svc = service(&home);
        kiln(&home)
            .args(["build", "--dry-run", "--channel", "stable", "--source"])
            .arg(&svc)
            .assert()
            .failure()
            .stderr(predicate::str::contains("stable"));
    }

    #[test]
    fn missing_source_fails() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .args(["build", "--dry-run", "--source", "does-not-exist"])
            .assert()
            .failure();
    }

    #[test]
    fn completions_generate() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn missing_engine_reported() {
        let home = TempDir::new().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            "[engine]\nprogram = \"kiln-no-such-engine\"\n",
        )
        .unwrap();
        kiln(&home).arg("status").assert().failure();
    }
}
