//! Step executors. Each takes the job and its directories, does the work,
//! and reports files/bytes processed; status bookkeeping and persistence
//! happen in the orchestrator.

pub mod convert;
pub mod import;
pub mod pseudonymize;
pub mod validate;

use fhirpipe_core::error::PipelineError;
use fhirpipe_core::job::Job;
use fhirpipe_core::state;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub files_processed: u64,
    pub bytes_processed: u64,
}

/// Counts newline-terminated NDJSON records in a file.
pub(crate) fn count_records(path: &Path) -> io::Result<u64> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut count = 0u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        if buf.ends_with(b"\n") {
            count += 1;
        }
    }
    Ok(count)
}

/// NDJSON files directly inside `dir`, sorted by name for deterministic
/// processing order.
pub(crate) fn list_ndjson_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("ndjson") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// The directory a step reads from: the output of the preceding enabled
/// step.
pub(crate) fn input_dir_for(
    job: &Job,
    jobs_dir: &Path,
    step_name: &str,
) -> Result<PathBuf, PipelineError> {
    let enabled = &job.config.enabled_steps;
    let idx = enabled
        .iter()
        .position(|s| s == step_name)
        .ok_or_else(|| {
            PipelineError::non_transient(format!("step '{}' is not enabled", step_name))
        })?;
    if idx == 0 {
        return Err(PipelineError::non_transient(format!(
            "step '{}' has no preceding step to read from",
            step_name
        )));
    }
    state::step_output_dir(jobs_dir, &job.job_id, &enabled[idx - 1])
        .map_err(|e| PipelineError::non_transient(e.to_string()))
}
