//! Drives a job through its configured steps, persisting state around
//! every transition so an interrupted run can resume from disk.

use crate::steps::{self, StepOutcome};
use crate::transport::Transport;
use fhirpipe_core::config::Config;
use fhirpipe_core::detect::detect_input_type;
use fhirpipe_core::error::PipelineError;
use fhirpipe_core::job::{
    Job, JobStatus, StepStatus, STEP_CONVERT_CSV, STEP_CONVERT_PARQUET, STEP_IMPORT,
    STEP_PSEUDONYMIZE, STEP_VALIDATE,
};
use fhirpipe_core::logging::JobLogger;
use fhirpipe_core::retry::{backoff_delay, check_retry_allowed};
use fhirpipe_core::state;
use std::path::Path;
use std::thread;

/// Validates the configuration, classifies the input and persists a fresh
/// pending job. Configuration errors fail fast: no job is written.
pub fn create_job(input_source: &str, config: Config) -> Result<Job, PipelineError> {
    config.validate()?;
    let input_type = detect_input_type(input_source)?;
    let job = Job::new(input_source, input_type, config);
    update_job(&job.config.jobs_dir, &job)?;
    Ok(job)
}

/// Transitions a pending job to in-progress.
pub fn start_job(jobs_dir: &Path, job: &mut Job) -> Result<(), PipelineError> {
    if job.status == JobStatus::Pending {
        job.status = JobStatus::InProgress;
        job.updated_at = chrono::Utc::now();
        update_job(jobs_dir, job)?;
    }
    Ok(())
}

/// Executes one named step: marks it in-progress, saves, runs the
/// executor, then saves the outcome. Already-completed steps are skipped,
/// which makes resumption idempotent. On failure the returned job value
/// and the state on disk both reflect it.
pub fn execute_step(jobs_dir: &Path, job: &mut Job, step_name: &str) -> Result<(), PipelineError> {
    {
        let step = job.step(step_name).ok_or_else(|| {
            PipelineError::non_transient(format!("job has no step named '{}'", step_name))
        })?;
        if step.status == StepStatus::Completed {
            return Ok(());
        }
    }

    job.status = JobStatus::InProgress;
    job.current_step = step_name.to_string();
    job.updated_at = chrono::Utc::now();
    if let Some(step) = job.step_mut(step_name) {
        step.begin();
    }
    update_job(jobs_dir, job)?;

    let job_dir = state::job_dir(jobs_dir, &job.job_id);
    let mut logger = JobLogger::new(&job_dir)
        .map_err(|e| PipelineError::non_transient(format!("opening job log: {}", e)))?;
    logger.log(&format!("step '{}' started", step_name));

    let transport = Transport::from_config(&job.config)?;
    let result = dispatch(job, jobs_dir, step_name, &transport, &mut logger);

    match result {
        Ok(outcome) => {
            if let Some(step) = job.step_mut(step_name) {
                step.complete(outcome.files_processed, outcome.bytes_processed);
            }
            job.absorb_step_totals(step_name);
            job.updated_at = chrono::Utc::now();
            update_job(jobs_dir, job)?;
            logger.log(&format!(
                "step '{}' completed ({} file(s), {} byte(s))",
                step_name, outcome.files_processed, outcome.bytes_processed
            ));
            Ok(())
        }
        Err(e) => {
            logger.log(&format!("step '{}' failed: {}", step_name, e));
            if let Some(step) = job.step_mut(step_name) {
                step.fail(e.clone());
            }
            job.status = JobStatus::Failed;
            job.error_message = format!("step '{}' failed: {}", step_name, e);
            job.updated_at = chrono::Utc::now();
            // Best effort: the in-memory job value is the fallback if the
            // state store itself is the problem.
            let _ = update_job(jobs_dir, job);
            Err(e)
        }
    }
}

fn dispatch(
    job: &mut Job,
    jobs_dir: &Path,
    step_name: &str,
    transport: &Transport,
    logger: &mut JobLogger,
) -> Result<StepOutcome, PipelineError> {
    match step_name {
        STEP_IMPORT => steps::import::run(job, jobs_dir, transport, logger),
        STEP_PSEUDONYMIZE => steps::pseudonymize::run(job, jobs_dir, transport, logger),
        STEP_VALIDATE => steps::validate::run(job, jobs_dir, transport, logger),
        STEP_CONVERT_CSV => steps::convert::run_csv(job, jobs_dir, transport, logger),
        STEP_CONVERT_PARQUET => steps::convert::run_parquet(job, jobs_dir, transport, logger),
        other => Err(PipelineError::non_transient(format!(
            "no executor for step '{}'",
            other
        ))),
    }
}

/// Positions the job at the next enabled step, or marks it completed when
/// none remains.
pub fn advance_to_next_step(jobs_dir: &Path, job: &mut Job) -> Result<(), PipelineError> {
    let next = job.next_step_after(&job.current_step).map(str::to_string);
    match next {
        Some(next) => job.current_step = next,
        None => {
            job.status = JobStatus::Completed;
            job.current_step.clear();
        }
    }
    job.updated_at = chrono::Utc::now();
    update_job(jobs_dir, job)
}

/// Retries a failed step after the configured backoff. Refusals (unknown
/// step, no recorded error, non-transient error, attempt cap reached)
/// leave the input job untouched; the function never mutates its input.
/// The backoff is computed from the pre-increment retry count.
pub fn retry_step(jobs_dir: &Path, job: &Job, step_name: &str) -> Result<Job, PipelineError> {
    let step = job.step(step_name).ok_or_else(|| {
        PipelineError::non_transient(format!(
            "retry not allowed: job has no step named '{}'",
            step_name
        ))
    })?;
    check_retry_allowed(step, job.config.retry.max_attempts)?;

    let delay = backoff_delay(
        step.retry_count,
        job.config.retry.initial_backoff_ms,
        job.config.retry.max_backoff_ms,
    );
    thread::sleep(delay);

    let mut retried = job.clone();
    retried.status = JobStatus::InProgress;
    retried.error_message.clear();
    if let Some(step) = retried.step_mut(step_name) {
        step.retry_count += 1;
    }
    execute_step(jobs_dir, &mut retried, step_name)?;
    Ok(retried)
}

/// Runs the job from its current position to the end of the pipeline.
pub fn run_job(jobs_dir: &Path, job: &mut Job) -> Result<(), PipelineError> {
    start_job(jobs_dir, job)?;
    while job.status != JobStatus::Completed && !job.current_step.is_empty() {
        let step_name = job.current_step.clone();
        execute_step(jobs_dir, job, &step_name)?;
        advance_to_next_step(jobs_dir, job)?;
    }
    if job.current_step.is_empty() && job.status != JobStatus::Completed {
        job.status = JobStatus::Completed;
        update_job(jobs_dir, job)?;
    }
    Ok(())
}

pub fn load_job(jobs_dir: &Path, job_id: &str) -> Result<Job, PipelineError> {
    state::load(jobs_dir, job_id).map_err(|e| PipelineError::non_transient(e.to_string()))
}

pub fn update_job(jobs_dir: &Path, job: &Job) -> Result<(), PipelineError> {
    state::save(jobs_dir, job)
        .map_err(|e| PipelineError::non_transient(format!("saving job state: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn base_config(jobs_dir: &Path) -> Config {
        let mut config = Config::default();
        config.jobs_dir = jobs_dir.to_path_buf();
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 10;
        config
    }

    #[test]
    fn create_job_persists_a_pending_job() {
        let jobs = tempdir().unwrap();
        let source = tempdir().unwrap();
        let job = create_job(source.path().to_str().unwrap(), base_config(jobs.path())).unwrap();

        let loaded = state::load(jobs.path(), &job.job_id).unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.current_step, STEP_IMPORT);
        assert_eq!(loaded.steps.len(), 2);
    }

    #[test]
    fn create_job_rejects_bad_config_without_persisting() {
        let jobs = tempdir().unwrap();
        let mut config = base_config(jobs.path());
        config.enabled_steps = vec![STEP_PSEUDONYMIZE.to_string()];
        assert!(create_job("/tmp", config).is_err());
        assert!(state::list(jobs.path()).unwrap().is_empty());
    }

    #[test]
    fn full_run_completes_job_and_clears_current_step() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/$de-identify");
            then.status(200)
                .json_body(json!({"resourceType": "Patient", "id": "masked"}));
        });

        let source = tempdir().unwrap();
        fs::write(
            source.path().join("Patient_001.ndjson"),
            "{\"resourceType\":\"Patient\",\"id\":\"a\"}\n",
        )
        .unwrap();

        let jobs = tempdir().unwrap();
        let mut config = base_config(jobs.path());
        config.services.pseudonymizer.url = server.base_url();
        let mut job = create_job(source.path().to_str().unwrap(), config).unwrap();

        run_job(jobs.path(), &mut job).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.current_step.is_empty());
        assert!(job
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Completed));
        assert!(job.total_files >= 2);

        let loaded = state::load(jobs.path(), &job.job_id).unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        let import_step = loaded.step(STEP_IMPORT).unwrap();
        assert!(import_step.files_processed > 0);
        assert!(import_step.started_at.unwrap() <= import_step.completed_at.unwrap());
    }

    #[test]
    fn failed_step_marks_job_failed_and_is_persisted() {
        let jobs = tempdir().unwrap();
        let mut job = create_job("/missing/source/dir", base_config(jobs.path())).unwrap();

        let err = run_job(jobs.path(), &mut job).unwrap_err();
        assert!(!err.is_transient());

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.contains("import"));
        let step = job.step(STEP_IMPORT).unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.last_error.is_some());

        let loaded = state::load(jobs.path(), &job.job_id).unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
    }

    #[test]
    fn retry_of_non_transient_failure_is_refused_and_pure() {
        let jobs = tempdir().unwrap();
        let mut job = create_job("/missing/source/dir", base_config(jobs.path())).unwrap();
        let _ = run_job(jobs.path(), &mut job);

        let before = job.clone();
        let err = retry_step(jobs.path(), &job, STEP_IMPORT).unwrap_err();
        assert!(err.message.contains("retry not allowed"));
        assert_eq!(job, before);
    }

    #[test]
    fn retry_of_unknown_step_is_refused() {
        let jobs = tempdir().unwrap();
        let source = tempdir().unwrap();
        let job =
            create_job(source.path().to_str().unwrap(), base_config(jobs.path())).unwrap();
        let err = retry_step(jobs.path(), &job, "no-such-step").unwrap_err();
        assert!(err.message.contains("retry not allowed"));
    }

    #[test]
    fn advance_walks_enabled_steps_then_completes() {
        let jobs = tempdir().unwrap();
        let source = tempdir().unwrap();
        let mut config = base_config(jobs.path());
        config.enabled_steps = vec![
            STEP_IMPORT.to_string(),
            STEP_PSEUDONYMIZE.to_string(),
            STEP_VALIDATE.to_string(),
        ];
        let mut job = create_job(source.path().to_str().unwrap(), config).unwrap();
        assert_eq!(job.current_step, STEP_IMPORT);

        advance_to_next_step(jobs.path(), &mut job).unwrap();
        assert_eq!(job.current_step, STEP_PSEUDONYMIZE);
        advance_to_next_step(jobs.path(), &mut job).unwrap();
        assert_eq!(job.current_step, STEP_VALIDATE);
        advance_to_next_step(jobs.path(), &mut job).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.current_step.is_empty());
    }

    #[test]
    fn completed_steps_are_skipped_on_resume() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/$de-identify");
            then.status(200).json_body(json!({"resourceType": "Patient"}));
        });

        let source = tempdir().unwrap();
        fs::write(
            source.path().join("Patient_001.ndjson"),
            "{\"resourceType\":\"Patient\"}\n",
        )
        .unwrap();

        let jobs = tempdir().unwrap();
        let mut config = base_config(jobs.path());
        config.services.pseudonymizer.url = server.base_url();
        let mut job = create_job(source.path().to_str().unwrap(), config).unwrap();
        run_job(jobs.path(), &mut job).unwrap();

        // Re-executing a completed step is a no-op.
        let before = job.step(STEP_IMPORT).unwrap().clone();
        execute_step(jobs.path(), &mut job, STEP_IMPORT).unwrap();
        assert_eq!(job.step(STEP_IMPORT).unwrap(), &before);
    }
}
