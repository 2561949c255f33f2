//! The import step: brings source data into `<job>/import/`, dispatching
//! on the detected input type.

use crate::extraction::ExtractionClient;
use crate::steps::{count_records, StepOutcome};
use crate::transport::Transport;
use fhirpipe_core::error::PipelineError;
use fhirpipe_core::job::{InputType, Job, STEP_IMPORT};
use fhirpipe_core::logging::JobLogger;
use fhirpipe_core::state;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Runs the import step. For cohort-definition inputs the polling URL is
/// persisted onto the job before polling starts, so an interrupted run
/// resumes at poll instead of re-submitting.
pub fn run(
    job: &mut Job,
    jobs_dir: &Path,
    transport: &Transport,
    logger: &mut JobLogger,
) -> Result<StepOutcome, PipelineError> {
    let import_dir = state::step_output_dir(jobs_dir, &job.job_id, STEP_IMPORT)
        .map_err(|e| PipelineError::non_transient(e.to_string()))?;
    fs::create_dir_all(&import_dir).map_err(|e| {
        PipelineError::non_transient(format!("creating {}: {}", import_dir.display(), e))
    })?;

    match job.input_type {
        InputType::LocalDirectory => import_local_directory(job, &import_dir, logger),
        InputType::HttpUrl => import_http_url(job, &import_dir, transport, logger),
        InputType::ExtractionResultUrl => {
            let poll_url = job.input_source.clone();
            import_extraction(job, jobs_dir, &import_dir, transport, logger, Some(poll_url))
        }
        InputType::CohortDefinitionFile => {
            import_extraction(job, jobs_dir, &import_dir, transport, logger, None)
        }
    }
}

fn import_local_directory(
    job: &Job,
    import_dir: &Path,
    logger: &mut JobLogger,
) -> Result<StepOutcome, PipelineError> {
    let source = Path::new(&job.input_source);
    if !source.exists() {
        return Err(PipelineError::non_transient(format!(
            "source path {} does not exist",
            source.display()
        )));
    }
    if !source.is_dir() {
        return Err(PipelineError::non_transient(format!(
            "source path {} is not a directory",
            source.display()
        )));
    }

    let mut sources: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| {
            PipelineError::non_transient(format!("scanning {}: {}", source.display(), e))
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("ndjson") {
            sources.push(path.to_path_buf());
        }
    }
    sources.sort();
    if sources.is_empty() {
        return Err(PipelineError::non_transient(format!(
            "no NDJSON files found under {}",
            source.display()
        )));
    }

    let mut outcome = StepOutcome::default();
    for path in sources {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let dest = import_dir.join(&basename);
        fs::copy(&path, &dest).map_err(|e| {
            PipelineError::non_transient(format!("copying {}: {}", path.display(), e))
        })?;

        let file_size = fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
        let line_count = count_records(&dest)
            .map_err(|e| PipelineError::non_transient(format!("counting records: {}", e)))?;
        logger.log(&format!(
            "imported {} ({} bytes, {} records, resource type {})",
            basename,
            file_size,
            line_count,
            infer_resource_type(&basename)
        ));
        outcome.files_processed += 1;
        outcome.bytes_processed += file_size;
    }
    Ok(outcome)
}

fn import_http_url(
    job: &Job,
    import_dir: &Path,
    transport: &Transport,
    logger: &mut JobLogger,
) -> Result<StepOutcome, PipelineError> {
    let url = &job.input_source;
    let name = single_url_filename(url);
    let final_path = import_dir.join(&name);
    let part_path = import_dir.join(format!("{}.part", name));

    let result = (|| -> Result<u64, PipelineError> {
        let mut file = fs::File::create(&part_path).map_err(|e| {
            PipelineError::non_transient(format!("creating {}: {}", part_path.display(), e))
        })?;
        let written = transport.download(url, None, &mut file, &mut |_| {})?;
        fs::rename(&part_path, &final_path).map_err(|e| {
            PipelineError::non_transient(format!("renaming {}: {}", part_path.display(), e))
        })?;
        Ok(written)
    })();

    match result {
        Ok(written) => {
            let records = count_records(&final_path).unwrap_or(0);
            logger.log(&format!(
                "downloaded {} ({} bytes, {} records)",
                name, written, records
            ));
            Ok(StepOutcome {
                files_processed: 1,
                bytes_processed: written,
            })
        }
        Err(e) => {
            let _ = fs::remove_file(&part_path);
            Err(e.wrap(format!("downloading {}", url)))
        }
    }
}

fn import_extraction(
    job: &mut Job,
    jobs_dir: &Path,
    import_dir: &Path,
    transport: &Transport,
    logger: &mut JobLogger,
    poll_url: Option<String>,
) -> Result<StepOutcome, PipelineError> {
    let extraction_config = job.config.services.extraction.clone();
    if extraction_config.base_url.is_empty() && poll_url.is_none() && job.extraction_url.is_empty()
    {
        return Err(PipelineError::non_transient(
            "extraction service base_url is not configured",
        ));
    }
    let client = ExtractionClient::new(transport, &extraction_config);

    let poll_url = if let Some(url) = poll_url {
        url
    } else if !job.extraction_url.is_empty() {
        // A previous run already submitted; pick up at poll.
        logger.log("resuming extraction at saved polling URL");
        job.extraction_url.clone()
    } else {
        let cohort_path = PathBuf::from(&job.input_source);
        let url = client.submit(&cohort_path)?;
        logger.log(&format!("cohort definition accepted, polling {}", url));
        job.extraction_url = url.clone();
        // Persist before polling so a crash mid-poll can resume here.
        state::save(jobs_dir, job)
            .map_err(|e| PipelineError::non_transient(format!("saving job state: {}", e)))?;
        url
    };

    let file_urls = client.poll(&poll_url, logger)?;
    if file_urls.is_empty() {
        return Err(PipelineError::non_transient(
            "extraction finished but produced no result files",
        ));
    }
    let (files, bytes) = client.download_files(&file_urls, import_dir, logger)?;
    Ok(StepOutcome {
        files_processed: files,
        bytes_processed: bytes,
    })
}

/// Destination filename for a single-URL import: the last path segment,
/// with `.ndjson` appended when missing; a bare or trailing-slash path
/// falls back to the previous segment.
fn single_url_filename(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query
        .strip_prefix("https://")
        .or_else(|| without_query.strip_prefix("http://"))
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or("");
    let name = path
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("download");
    if name.ends_with(".ndjson") {
        name.to_string()
    } else {
        format!("{}.ndjson", name)
    }
}

/// Best-effort resource type from a file name like `Patient_001.ndjson`.
fn infer_resource_type(basename: &str) -> &str {
    let stem = basename.split('.').next().unwrap_or(basename);
    let prefix = stem.split('_').next().unwrap_or(stem);
    if prefix.is_empty() {
        "unknown"
    } else {
        prefix
    }
}
