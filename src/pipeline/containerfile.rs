//! Runtime image Containerfile rendering

use crate::pipeline::plan::BuildPlan;

/// Image label keys set on the final image
pub mod labels {
    pub const RUN_ID: &str = "io.kiln.run-id";
    pub const TOOLCHAIN: &str = "io.kiln.toolchain";
    pub const CHANNEL: &str = "io.kiln.channel";
    pub const BINARY_SHA256: &str = "io.kiln.binary-sha256";
}

/// Entrypoint of the final image in exec form
pub fn entrypoint(binary: &str) -> Vec<String> {
    vec![format!("./{}", binary)]
}

/// Render the runtime Containerfile.
///
/// Exactly one `COPY`, of the binary, and an argument-less exec-form
/// entrypoint. Nothing from the builder other than the binary is named.
pub fn render(plan: &BuildPlan, run_id: &str, sha256: &str) -> String {
    let entrypoint = entrypoint(&plan.binary)
        .iter()
        .map(|part| format!("\"{}\"", part))
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = String::new();
    out.push_str(&format!("FROM {}\n", plan.base));
    out.push_str(&format!("WORKDIR {}\n", plan.runtime_workdir));
    out.push_str(&format!("COPY {bin} ./{bin}\n", bin = plan.binary));
    out.push_str(&format!("LABEL {}=\"{}\"\n", labels::RUN_ID, run_id));
    out.push_str(&format!("LABEL {}=\"{}\"\n", labels::TOOLCHAIN, plan.toolchain));
    out.push_str(&format!("LABEL {}=\"{}\"\n", labels::CHANNEL, plan.channel));
    out.push_str(&format!("LABEL {}=\"{}\"\n", labels::BINARY_SHA256, sha256));
    out.push_str(&format!("ENTRYPOINT [{}]\n", entrypoint));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::plan::PlanOverrides;
    use tempfile::TempDir;

    #[test]
    fn renders_single_copy_and_fixed_entrypoint() {
        let dir = TempDir::new().unwrap();
        let overrides = PlanOverrides {
            source: Some(dir.path().to_path_buf()),
            binary: Some("shim".to_string()),
            ..PlanOverrides::default()
        };
        let plan = BuildPlan::resolve(&Config::default(), &overrides).unwrap();
        let text = render(&plan, "run-1", "ab12");

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "FROM docker.io/library/debian:bookworm-slim");
        assert_eq!(lines[1], "WORKDIR /app");
        assert_eq!(lines.last(), Some(&"ENTRYPOINT [\"./shim\"]"));

        let copies: Vec<_> = lines.iter().filter(|l| l.starts_with("COPY")).collect();
        assert_eq!(copies, vec![&"COPY shim ./shim"]);

        assert!(!text.contains("CMD"));
        assert!(!text.contains("--mount"));
        assert!(!text.contains("RUN"));
        assert!(text.contains("io.kiln.binary-sha256=\"ab12\""));
    }
}
