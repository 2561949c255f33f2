mod support;

use assert_cmd::assert::OutputAssertExt;

use predicates::prelude::*;
use std::fs;
use support::{fhirpipe_cmd, only_job_dir, write_config};
use tempfile::tempdir;

#[test]
fn local_import_copies_all_files_byte_identical() {
    let workspace = tempdir().unwrap();
    let config = write_config(workspace.path(), "import", "  {}\n");

    let source = workspace.path().join("source");
    fs::create_dir(&source).unwrap();
    let patient = "{\"resourceType\":\"Patient\",\"id\":\"1\"}\n\
                   {\"resourceType\":\"Patient\",\"id\":\"2\"}\n\
                   {\"resourceType\":\"Patient\",\"id\":\"3\"}\n";
    let observation = "{\"resourceType\":\"Observation\",\"id\":\"1\"}\n\
                       {\"resourceType\":\"Observation\",\"id\":\"2\"}\n";
    let encounter = "{\"resourceType\":\"Encounter\",\"id\":\"1\"}\n";
    fs::write(source.join("Patient_001.ndjson"), patient).unwrap();
    fs::write(source.join("Observation_001.ndjson"), observation).unwrap();
    fs::write(source.join("Encounter_001.ndjson"), encounter).unwrap();

    fhirpipe_cmd()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&source)
        .assert()
        .success()
        .stdout(predicate::str::contains("import completed: 3 file(s)"));

    let job_dir = only_job_dir(workspace.path());
    let import_dir = job_dir.join("import");
    assert_eq!(
        fs::read_to_string(import_dir.join("Patient_001.ndjson")).unwrap(),
        patient
    );
    assert_eq!(
        fs::read_to_string(import_dir.join("Observation_001.ndjson")).unwrap(),
        observation
    );
    assert_eq!(
        fs::read_to_string(import_dir.join("Encounter_001.ndjson")).unwrap(),
        encounter
    );

    // The persisted state reflects the completed run.
    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(job_dir.join("state.json")).unwrap()).unwrap();
    assert_eq!(state["status"], serde_json::json!("completed"));
    assert_eq!(state["current_step"], serde_json::json!(""));
    assert_eq!(state["total_files"], serde_json::json!(3));
    assert_eq!(state["steps"][0]["status"], serde_json::json!("completed"));
    assert_eq!(state["steps"][0]["files_processed"], serde_json::json!(3));
}
