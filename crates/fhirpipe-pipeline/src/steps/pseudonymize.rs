//! The pseudonymization step: streams every imported NDJSON file through
//! the pseudonymization service, splitting oversized Bundles on the way.

use crate::bundle::{
    chunk_to_bundle, json_size, oversized_resource_error, reassemble, split_bundle, split_stats,
};
use crate::pseudonym::PseudonymizerClient;
use crate::steps::{count_records, input_dir_for, list_ndjson_files, StepOutcome};
use crate::transport::Transport;
use fhirpipe_core::error::PipelineError;
use fhirpipe_core::job::{Job, STEP_PSEUDONYMIZE};
use fhirpipe_core::logging::JobLogger;
use fhirpipe_core::state;
use serde_json::Value;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub const OUTPUT_PREFIX: &str = "dimped_";

pub fn run(
    job: &Job,
    jobs_dir: &Path,
    transport: &Transport,
    logger: &mut JobLogger,
) -> Result<StepOutcome, PipelineError> {
    if !job
        .config
        .enabled_steps
        .iter()
        .any(|s| s == STEP_PSEUDONYMIZE)
    {
        return Ok(StepOutcome::default());
    }
    let base_url = &job.config.services.pseudonymizer.url;
    if base_url.is_empty() {
        return Err(PipelineError::non_transient(
            "pseudonymizer URL is not configured",
        ));
    }

    let input_dir = input_dir_for(job, jobs_dir, STEP_PSEUDONYMIZE)?;
    let output_dir = state::step_output_dir(jobs_dir, &job.job_id, STEP_PSEUDONYMIZE)
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

    let client = PseudonymizerClient::new(transport, base_url);
    let threshold = job.config.bundle_split_threshold_bytes();

    let mut outcome = StepOutcome::default();
    let mut resource_count: u64 = 0;

    for input_path in inputs {
        let basename = input_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let output_path = output_dir.join(format!("{}{}", OUTPUT_PREFIX, basename));

        if output_path.exists() {
            // Completed by an earlier run; count it, do not resend.
            let records = count_records(&output_path).unwrap_or(0);
            logger.log(&format!("{} already processed, skipping", basename));
            resource_count += records;
            outcome.files_processed += 1;
            outcome.bytes_processed += fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
            continue;
        }

        let written = process_file(&input_path, &output_path, &client, threshold, logger)
            .map_err(|e| e.wrap(format!("pseudonymizing {}", basename)))?;
        resource_count += written.records;
        outcome.files_processed += 1;
        outcome.bytes_processed += written.bytes;
    }

    logger.log(&format!(
        "pseudonymization finished: {} file(s), {} resource(s)",
        outcome.files_processed, resource_count
    ));
    Ok(outcome)
}

struct FileResult {
    records: u64,
    bytes: u64,
}

fn process_file(
    input_path: &Path,
    output_path: &Path,
    client: &PseudonymizerClient,
    threshold: usize,
    logger: &mut JobLogger,
) -> Result<FileResult, PipelineError> {
    let part_path = output_path.with_extension("ndjson.part");

    let result = (|| -> Result<FileResult, PipelineError> {
        let input = fs::File::open(input_path).map_err(|e| {
            PipelineError::non_transient(format!("opening {}: {}", input_path.display(), e))
        })?;
        let out_file = fs::File::create(&part_path).map_err(|e| {
            PipelineError::non_transient(format!("creating {}: {}", part_path.display(), e))
        })?;
        let mut writer = BufWriter::new(out_file);
        let mut records = 0u64;
        let mut bytes = 0u64;

        for line in BufReader::new(input).lines() {
            let line = line.map_err(|e| {
                PipelineError::non_transient(format!("reading {}: {}", input_path.display(), e))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let resource: Value = serde_json::from_str(&line).map_err(|e| {
                PipelineError::non_transient(format!("record {} is not valid JSON: {}", records + 1, e))
            })?;

            let transformed = process_resource(&resource, client, threshold, logger)?;
            let serialized = serde_json::to_string(&transformed)?;
            writeln!(writer, "{}", serialized)
                .map_err(|e| PipelineError::non_transient(format!("writing output: {}", e)))?;
            records += 1;
            bytes += serialized.len() as u64 + 1;
        }

        writer
            .flush()
            .map_err(|e| PipelineError::non_transient(format!("flushing output: {}", e)))?;
        Ok(FileResult { records, bytes })
    })();

    match result {
        Ok(file_result) => {
            fs::rename(&part_path, output_path).map_err(|e| {
                PipelineError::non_transient(format!("renaming {}: {}", part_path.display(), e))
            })?;
            Ok(file_result)
        }
        Err(e) => {
            let _ = fs::remove_file(&part_path);
            Err(e)
        }
    }
}

fn process_resource(
    resource: &Value,
    client: &PseudonymizerClient,
    threshold: usize,
    logger: &mut JobLogger,
) -> Result<Value, PipelineError> {
    let resource_type = resource
        .get("resourceType")
        .and_then(Value::as_str)
        .unwrap_or("<unknown>");
    let size = json_size(resource);

    if resource_type == "Bundle" && size > threshold {
        let result = split_bundle(resource, threshold)?;
        let stats = split_stats(&result);
        logger.log(&format!(
            "bundle {} ({} bytes) split into {} chunk(s), sizes {}..{} avg {}",
            stats.bundle_id,
            stats.original_size,
            stats.chunks_created,
            stats.smallest_chunk_size,
            stats.largest_chunk_size,
            stats.average_chunk_size
        ));

        let mut processed_chunks = Vec::with_capacity(result.chunks.len());
        for chunk in &result.chunks {
            let chunk_bundle = chunk_to_bundle(chunk, &result.metadata);
            processed_chunks.push(client.pseudonymize(&chunk_bundle)?);
        }
        return reassemble(&result.metadata, &processed_chunks);
    }

    if resource_type != "Bundle" && size > threshold {
        // Only Bundles can be split; anything else this large is unsendable.
        let id = resource.get("id").and_then(Value::as_str).unwrap_or("<unknown>");
        return Err(oversized_resource_error(resource_type, id, size, threshold));
    }

    client.pseudonymize(resource)
}
