mod support;

use assert_cmd::assert::OutputAssertExt;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::{fhirpipe_cmd, only_job_dir, spawn_server, write_config};
use tempfile::tempdir;

#[test]
fn http_import_survives_two_503s() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_in_handler = hits.clone();
    let base_url = spawn_server(move |request| {
        let n = hits_in_handler.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            let _ = request.respond(tiny_http::Response::empty(503));
        } else {
            let body = "{\"resourceType\":\"Patient\",\"id\":\"1\"}\n\
                        {\"resourceType\":\"Patient\",\"id\":\"2\"}\n";
            let _ = request.respond(tiny_http::Response::from_string(body));
        }
    });

    let workspace = tempdir().unwrap();
    let config = write_config(workspace.path(), "import", "  {}\n");

    fhirpipe_cmd()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(format!("{}/data/records.ndjson", base_url))
        .assert()
        .success();

    // Two failures, one success: the transport's own retry budget covered
    // the 503s without failing the step.
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    let job_dir = only_job_dir(workspace.path());
    let content = fs::read_to_string(job_dir.join("import/records.ndjson")).unwrap();
    assert_eq!(content.lines().count(), 2);
}
