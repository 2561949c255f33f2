//! The validation step: gates pseudonymized records through the external
//! validator service. Inputs that pass are copied through unchanged.

use crate::steps::{input_dir_for, list_ndjson_files, StepOutcome};
use crate::transport::Transport;
use fhirpipe_core::error::PipelineError;
use fhirpipe_core::job::{Job, STEP_VALIDATE};
use fhirpipe_core::logging::JobLogger;
use fhirpipe_core::retry::classify_status;
use fhirpipe_core::state;
use serde_json::Value;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub fn run(
    job: &Job,
    jobs_dir: &Path,
    transport: &Transport,
    logger: &mut JobLogger,
) -> Result<StepOutcome, PipelineError> {
    let base_url = &job.config.services.validator.url;
    if base_url.is_empty() {
        return Err(PipelineError::non_transient("validator URL is not configured"));
    }
    let endpoint = format!("{}/validate", base_url.trim_end_matches('/'));

    let input_dir = input_dir_for(job, jobs_dir, STEP_VALIDATE)?;
    let output_dir = state::step_output_dir(jobs_dir, &job.job_id, STEP_VALIDATE)
        .map_err(|e| PipelineError::non_transient(e.to_string()))?;
    fs::create_dir_all(&output_dir).map_err(|e| {
        PipelineError::non_transient(format!("creating {}: {}", output_dir.display(), e))
    })?;

    let inputs = list_ndjson_files(&input_dir)
        .map_err(|e| PipelineError::non_transient(format!("listing {}: {}", input_dir.display(), e)))?;
    if inputs.is_empty() {
        return Err(PipelineError::non_transient(format!(
            "no input files in {}",
            input_dir.display()
        )));
    }

    let mut outcome = StepOutcome::default();
    for input_path in inputs {
        let basename = input_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let output_path = output_dir.join(&basename);
        if output_path.exists() {
            logger.log(&format!("{} already validated, skipping", basename));
            outcome.files_processed += 1;
            outcome.bytes_processed += fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
            continue;
        }

        let bytes = validate_file(&input_path, &output_path, &endpoint, transport)
            .map_err(|e| e.wrap(format!("validating {}", basename)))?;
        logger.log(&format!("validated {} ({} bytes)", basename, bytes));
        outcome.files_processed += 1;
        outcome.bytes_processed += bytes;
    }
    Ok(outcome)
}

fn validate_file(
    input_path: &Path,
    output_path: &Path,
    endpoint: &str,
    transport: &Transport,
) -> Result<u64, PipelineError> {
    let input = fs::File::open(input_path).map_err(|e| {
        PipelineError::non_transient(format!("opening {}: {}", input_path.display(), e))
    })?;
    let mut record = 0u64;
    for line in BufReader::new(input).lines() {
        let line = line
            .map_err(|e| PipelineError::non_transient(format!("reading input: {}", e)))?;
        if line.trim().is_empty() {
            continue;
        }
        record += 1;
        let resource: Value = serde_json::from_str(&line).map_err(|e| {
            PipelineError::non_transient(format!("record {} is not valid JSON: {}", record, e))
        })?;
        let response = transport.post_json(endpoint, &resource, None)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(PipelineError::new(
                classify_status(status),
                format!("validator rejected record {}", record),
            )
            .with_status(status));
        }
    }

    // Validation is a gate, not a transform: pass the file through as-is.
    let part_path = output_path.with_extension("ndjson.part");
    let result = fs::copy(input_path, &part_path)
        .and_then(|bytes| fs::rename(&part_path, output_path).map(|_| bytes));
    match result {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            let _ = fs::remove_file(&part_path);
            Err(PipelineError::non_transient(format!(
                "copying validated file: {}",
                e
            )))
        }
    }
}
