//! Format conversion steps: thin request/response shims around the CSV
//! and Parquet conversion services.

use crate::steps::{input_dir_for, list_ndjson_files, StepOutcome};
use crate::transport::Transport;
use fhirpipe_core::error::PipelineError;
use fhirpipe_core::job::{Job, STEP_CONVERT_CSV, STEP_CONVERT_PARQUET};
use fhirpipe_core::logging::JobLogger;
use fhirpipe_core::retry::classify_status;
use fhirpipe_core::state;
use std::fs;
use std::io::Read;
use std::path::Path;

pub fn run_csv(
    job: &Job,
    jobs_dir: &Path,
    transport: &Transport,
    logger: &mut JobLogger,
) -> Result<StepOutcome, PipelineError> {
    let base_url = job.config.services.conversion.csv_url.clone();
    convert(job, jobs_dir, transport, logger, STEP_CONVERT_CSV, &base_url, "csv")
}

pub fn run_parquet(
    job: &Job,
    jobs_dir: &Path,
    transport: &Transport,
    logger: &mut JobLogger,
) -> Result<StepOutcome, PipelineError> {
    let base_url = job.config.services.conversion.parquet_url.clone();
    convert(
        job,
        jobs_dir,
        transport,
        logger,
        STEP_CONVERT_PARQUET,
        &base_url,
        "parquet",
    )
}

fn convert(
    job: &Job,
    jobs_dir: &Path,
    transport: &Transport,
    logger: &mut JobLogger,
    step_name: &str,
    base_url: &str,
    format: &str,
) -> Result<StepOutcome, PipelineError> {
    if base_url.is_empty() {
        return Err(PipelineError::non_transient(format!(
            "{} conversion URL is not configured",
            format
        )));
    }
    let endpoint = format!("{}/convert/{}", base_url.trim_end_matches('/'), format);

    let input_dir = input_dir_for(job, jobs_dir, step_name)?;
    let output_dir = state::step_output_dir(jobs_dir, &job.job_id, step_name)
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
        let stem = input_path
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let output_path = output_dir.join(format!("{}.{}", stem, format));
        if output_path.exists() {
            logger.log(&format!("{}.{} already converted, skipping", stem, format));
            outcome.files_processed += 1;
            outcome.bytes_processed += fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
            continue;
        }

        let body = fs::read(&input_path).map_err(|e| {
            PipelineError::non_transient(format!("reading {}: {}", input_path.display(), e))
        })?;
        let mut response = transport.post_bytes(&endpoint, "application/x-ndjson", body, None)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(PipelineError::new(
                classify_status(status),
                format!("{} conversion of {} rejected", format, stem),
            )
            .with_status(status));
        }

        let part_path = output_dir.join(format!("{}.{}.part", stem, format));
        let written = (|| -> Result<u64, PipelineError> {
            let mut out = Vec::new();
            response
                .read_to_end(&mut out)
                .map_err(|e| PipelineError::transient(format!("reading conversion response: {}", e)))?;
            fs::write(&part_path, &out).map_err(|e| {
                PipelineError::non_transient(format!("writing {}: {}", part_path.display(), e))
            })?;
            fs::rename(&part_path, &output_path).map_err(|e| {
                PipelineError::non_transient(format!("renaming {}: {}", part_path.display(), e))
            })?;
            Ok(out.len() as u64)
        })()
        .map_err(|e| {
            let _ = fs::remove_file(&part_path);
            e.wrap(format!("converting {} to {}", stem, format))
        })?;

        logger.log(&format!("converted {} to {} ({} bytes)", stem, format, written));
        outcome.files_processed += 1;
        outcome.bytes_processed += written;
    }
    Ok(outcome)
}
