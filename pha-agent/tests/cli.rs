//! Exercises the compiled `phagentd` binary's CLI surface (SPEC_FULL §11
//! test tooling).
#![allow(clippy::unwrap_used, clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;

const SAMPLE_POLICY: &str = r#"
policy_id = "tel-001"
version = "1.0.0"
name = "Disable diagnostic telemetry"
description = "Sets telemetry reporting to the minimum level"
category = "telemetry"
risk_level = "low"
support_status = "supported"

[mechanism]
mechanism = "script"
apply_command = "true"
revert_command = "true"
probe_command = "true"

[applicability]
min_build = 10240
supported_skus = ["Professional"]

[reversibility]
reversible = true
how = "re-run with the previous telemetry level"
"#;

#[test]
fn help_lists_serve_and_doctor() {
    Command::cargo_bin("phagentd")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("doctor"));
}

#[test]
fn version_flag_prints_crate_version() {
    Command::cargo_bin("phagentd")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn doctor_succeeds_against_a_valid_catalog() {
    let catalog_dir = tempfile::tempdir().unwrap();
    std::fs::write(catalog_dir.path().join("tel-001.toml"), SAMPLE_POLICY).unwrap();
    let store_dir = tempfile::tempdir().unwrap();

    Command::cargo_bin("phagentd")
        .unwrap()
        .env("PHAGENT_CATALOG_DIR", catalog_dir.path())
        .env("PHAGENT_STORE_DB", store_dir.path().join("store.db"))
        .arg("doctor")
        .assert()
        .success()
        .stdout(predicate::str::contains("catalog:"))
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn doctor_fails_against_a_missing_catalog_dir() {
    let missing = tempfile::tempdir().unwrap().path().join("does-not-exist");

    Command::cargo_bin("phagentd")
        .unwrap()
        .env("PHAGENT_CATALOG_DIR", &missing)
        .arg("doctor")
        .assert()
        .failure();
}

#[test]
fn doctor_rejects_a_cyclic_dependency_catalog() {
    let catalog_dir = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        catalog_dir.path().join("a.toml"),
        r#"
policy_id = "tel-001"
version = "1.0.0"
name = "A"
description = "A"
category = "telemetry"
risk_level = "low"
support_status = "supported"

[mechanism]
mechanism = "script"
apply_command = "true"
revert_command = "true"
probe_command = "true"

[applicability]
min_build = 0
supported_skus = ["Professional"]

[reversibility]
reversible = true
how = "n/a"

[[dependencies]]
other_policy_id = "tel-002"
kind = "required"
user_overridable = false
optional = false
auto_select = true
reason = "needs tel-002"
"#,
    )
    .unwrap();
    std::fs::write(
        catalog_dir.path().join("b.toml"),
        r#"
policy_id = "tel-002"
version = "1.0.0"
name = "B"
description = "B"
category = "telemetry"
risk_level = "low"
support_status = "supported"

[mechanism]
mechanism = "script"
apply_command = "true"
revert_command = "true"
probe_command = "true"

[applicability]
min_build = 0
supported_skus = ["Professional"]

[reversibility]
reversible = true
how = "n/a"

[[dependencies]]
other_policy_id = "tel-001"
kind = "required"
user_overridable = false
optional = false
auto_select = true
reason = "needs tel-001"
"#,
    )
    .unwrap();

    Command::cargo_bin("phagentd")
        .unwrap()
        .env("PHAGENT_CATALOG_DIR", catalog_dir.path())
        .env("PHAGENT_STORE_DB", store_dir.path().join("store.db"))
        .arg("doctor")
        .assert()
        .failure()
        .stdout(predicate::str::contains("dependency graph:"));
}
