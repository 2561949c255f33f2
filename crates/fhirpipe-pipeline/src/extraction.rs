//! Client for the remote extraction service: submit a cohort definition,
//! poll for completion, download the result files.

use crate::transport::{BasicAuth, Transport};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use fhirpipe_core::config::ExtractionConfig;
use fhirpipe_core::error::PipelineError;
use fhirpipe_core::logging::JobLogger;
use fhirpipe_core::retry::classify_status;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

pub struct ExtractionClient<'a> {
    transport: &'a Transport,
    config: &'a ExtractionConfig,
}

impl<'a> ExtractionClient<'a> {
    pub fn new(transport: &'a Transport, config: &'a ExtractionConfig) -> Self {
        ExtractionClient { transport, config }
    }

    fn auth(&self) -> BasicAuth {
        BasicAuth {
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        }
    }

    /// Submits the cohort definition and returns the polling URL from the
    /// `Content-Location` header of the 202 response.
    pub fn submit(&self, cohort_path: &Path) -> Result<String, PipelineError> {
        let cohort = fs::read(cohort_path).map_err(|e| {
            PipelineError::non_transient(format!(
                "reading cohort definition {}: {}",
                cohort_path.display(),
                e
            ))
        })?;
        // The service accepts the cohort definition base64-wrapped in a
        // FHIR Parameters resource.
        let body = json!({
            "resourceType": "Parameters",
            "parameter": [{
                "name": "crtdl",
                "valueBase64Binary": STANDARD.encode(cohort),
            }],
        });

        let url = format!(
            "{}/fhir/$extract-data",
            self.config.base_url.trim_end_matches('/')
        );
        let auth = self.auth();
        let response = self.transport.post_json(&url, &body, Some(&auth))?;
        let status = response.status().as_u16();
        if status != 202 {
            return Err(PipelineError::new(
                classify_status(status),
                format!("extraction submit to {} was not accepted", url),
            )
            .with_status(status));
        }

        let location = response
            .headers()
            .get("Content-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::non_transient(
                    "extraction submit response carried no Content-Location header",
                )
            })?;
        Ok(self.absolutize(&location))
    }

    /// Polls the extraction URL until the service reports completion,
    /// returning the result file URLs in service order.
    ///
    /// The schedule is independent of the retry engine: it starts at the
    /// configured polling interval, doubles per iteration, clamps at the
    /// configured maximum, and gives up once the wall-clock budget is
    /// exhausted. A zero-minute budget fails after the first non-200 poll.
    pub fn poll(&self, poll_url: &str, logger: &mut JobLogger) -> Result<Vec<String>, PipelineError> {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.extraction_timeout_minutes * 60);
        let mut interval = Duration::from_secs(self.config.polling_interval_seconds.max(1));
        let max_interval = Duration::from_secs(
            self.config
                .max_polling_interval_seconds
                .max(self.config.polling_interval_seconds.max(1)),
        );
        let auth = self.auth();

        loop {
            let response = self.transport.get(poll_url, Some(&auth))?;
            let status = response.status().as_u16();
            match status {
                200 => {
                    let body: Value = response.json().map_err(|e| {
                        PipelineError::non_transient(format!(
                            "extraction status body is not valid JSON: {}",
                            e
                        ))
                    })?;
                    return Ok(collect_file_urls(&body));
                }
                202 => {
                    if started.elapsed() >= timeout {
                        return Err(PipelineError::transient(format!(
                            "extraction did not finish within {} minute(s)",
                            self.config.extraction_timeout_minutes
                        )));
                    }
                    logger.log(&format!(
                        "extraction still running, next poll in {}s",
                        interval.as_secs()
                    ));
                    thread::sleep(interval);
                    interval = (interval * 2).min(max_interval);
                }
                _ => {
                    return Err(PipelineError::new(
                        classify_status(status),
                        format!("unexpected extraction poll status from {}", poll_url),
                    )
                    .with_status(status));
                }
            }
        }
    }

    /// Downloads every result file into `dest_dir`. All-or-fail: the first
    /// file that exhausts its retry budget fails the operation, and every
    /// file this invocation wrote (partial or complete) is removed.
    pub fn download_files(
        &self,
        file_urls: &[String],
        dest_dir: &Path,
        logger: &mut JobLogger,
    ) -> Result<(u64, u64), PipelineError> {
        fs::create_dir_all(dest_dir)
            .map_err(|e| PipelineError::non_transient(format!("creating {}: {}", dest_dir.display(), e)))?;

        let auth = self.auth();
        let mut completed: Vec<PathBuf> = Vec::new();
        let mut total_bytes: u64 = 0;

        for (index, url) in file_urls.iter().enumerate() {
            let name = derive_filename(url, index);
            let final_path = dest_dir.join(&name);
            let part_path = dest_dir.join(format!("{}.part", name));

            let result = (|| -> Result<u64, PipelineError> {
                let mut file = fs::File::create(&part_path).map_err(|e| {
                    PipelineError::non_transient(format!("creating {}: {}", part_path.display(), e))
                })?;
                let written =
                    self.transport
                        .download(url, Some(&auth), &mut file, &mut |_bytes| {})?;
                fs::rename(&part_path, &final_path).map_err(|e| {
                    PipelineError::non_transient(format!("renaming {}: {}", part_path.display(), e))
                })?;
                Ok(written)
            })();

            match result {
                Ok(written) => {
                    logger.log(&format!("downloaded {} ({} bytes)", name, written));
                    total_bytes += written;
                    completed.push(final_path);
                }
                Err(e) => {
                    let _ = fs::remove_file(&part_path);
                    for path in &completed {
                        let _ = fs::remove_file(path);
                    }
                    return Err(e.wrap(format!("downloading result file {}", url)));
                }
            }
        }

        Ok((completed.len() as u64, total_bytes))
    }

    /// Content-Location may be relative; resolve it against the base URL.
    fn absolutize(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!(
                "{}/{}",
                self.config.base_url.trim_end_matches('/'),
                location.trim_start_matches('/')
            )
        }
    }
}

/// Walks a `Parameters` resource and collects
/// `parameter[].part[name="url"].valueUrl` entries in document order.
fn collect_file_urls(parameters: &Value) -> Vec<String> {
    let mut urls = Vec::new();
    let Some(parameter) = parameters.get("parameter").and_then(Value::as_array) else {
        return urls;
    };
    for param in parameter {
        let Some(parts) = param.get("part").and_then(Value::as_array) else {
            continue;
        };
        for part in parts {
            if part.get("name").and_then(Value::as_str) == Some("url") {
                if let Some(url) = part.get("valueUrl").and_then(Value::as_str) {
                    urls.push(url.to_string());
                }
            }
        }
    }
    urls
}

/// Derives a destination filename from a result file URL. Path segments
/// are scanned right to left for a non-empty one; a URL with no usable
/// segment falls back to a name derived from its list position, which is
/// stable across retries.
fn derive_filename(url: &str, index: usize) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query
        .strip_prefix("https://")
        .or_else(|| without_query.strip_prefix("http://"))
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or("");
    let segment = path.rsplit('/').find(|s| !s.is_empty());
    match segment {
        Some(name) => name.to_string(),
        None => format!("download-{}.ndjson", index),
    }
}
