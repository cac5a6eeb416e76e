use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn run(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cohort-registry"))
        .args(args)
        .env_remove("REGISTRY_CONFIG")
        .env("REGISTRY_BACKEND", "workbook")
        .env("REGISTRY_DATA_PATH", dir.join("registry.json"))
        .env("REGISTRY_LOG_DIR", dir.join("logs"))
        .output()
        .expect("run cohort-registry")
}

fn envelope(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("envelope json")
}

#[test]
fn add_cohort_then_list_cohorts() {
    let dir = tempfile::tempdir().expect("tempdir");

    let added = run(dir.path(), &["add-cohort", "C4"]);
    assert!(added.status.success());
    assert_eq!(envelope(&added)["data"]["table"], "cohort_c4");

    let listed = envelope(&run(dir.path(), &["cohorts"]));
    assert_eq!(listed["data"], serde_json::json!(["C4"]));
}

#[test]
fn failed_command_exits_non_zero_with_error_envelope() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = run(dir.path(), &["add-cohort", "Spring"]);
    assert!(!output.status.success());

    let body = envelope(&output);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().is_some_and(|error| error.starts_with("VALIDATION")));
}

#[test]
fn import_then_filter_and_verify() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/import-batch.json");

    let imported = run(
        dir.path(),
        &["import", "--file", fixture.to_str().expect("utf-8 path"), "--cohort", "C2"],
    );
    assert!(imported.status.success());
    let report = envelope(&imported);
    assert_eq!(report["data"]["inserted"], 3);
    assert_eq!(report["data"]["skipped"], 2);

    let listed = envelope(&run(dir.path(), &["list", "--filter", "district=Kaski"]));
    assert_eq!(listed["data"]["pagination"]["total"], 1);
    assert_eq!(listed["data"]["data"][0]["fullName"], "Sita Adhikari");

    let verified = envelope(&run(dir.path(), &["verify"]));
    assert_eq!(verified["data"]["mismatches"], serde_json::json!([]));

    let sequence = envelope(&run(dir.path(), &["fix-sequence", "--check"]));
    assert_eq!(sequence["data"]["drift"], false);
    assert_eq!(sequence["data"]["maxId"], 3);
}
