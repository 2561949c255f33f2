// Not every test binary uses every helper.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;

use assert_cmd::prelude::*;

/// Path to the compiled `fhirpipe` binary.
pub fn fhirpipe_cmd() -> Command {
    Command::cargo_bin("fhirpipe").unwrap()
}

/// Starts a stub HTTP server on an ephemeral port; the handler owns each
/// request and must respond to it. The serving thread lives for the rest
/// of the test process.
pub fn spawn_server<F>(mut handler: F) -> String
where
    F: FnMut(tiny_http::Request) + Send + 'static,
{
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let url = format!("http://{}", server.server_addr().to_ip().unwrap());
    thread::spawn(move || {
        for request in server.incoming_requests() {
            handler(request);
        }
    });
    url
}

/// Writes a config file for the given steps and services into `dir` and
/// returns its path. Backoffs are kept tiny so tests stay fast.
pub fn write_config(dir: &Path, enabled_steps: &str, services_yaml: &str) -> PathBuf {
    let config_path = dir.join("fhirpipe.yml");
    let jobs_dir = dir.join("jobs");
    let yaml = format!(
        "enabled_steps: [{}]\n\
         jobs_dir: {}\n\
         retry:\n\
         \x20 max_attempts: 5\n\
         \x20 initial_backoff_ms: 10\n\
         \x20 max_backoff_ms: 50\n\
         http:\n\
         \x20 request_timeout_seconds: 10\n\
         \x20 request_retries: 4\n\
         \x20 request_retry_backoff_ms: 10\n\
         services:\n{}",
        enabled_steps,
        jobs_dir.display(),
        services_yaml
    );
    std::fs::write(&config_path, yaml).unwrap();
    config_path
}

/// The single job directory created under `<dir>/jobs`.
pub fn only_job_dir(dir: &Path) -> PathBuf {
    let jobs_dir = dir.join("jobs");
    let mut entries: Vec<PathBuf> = std::fs::read_dir(&jobs_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(entries.len(), 1, "expected exactly one job under {}", jobs_dir.display());
    entries.remove(0)
}
