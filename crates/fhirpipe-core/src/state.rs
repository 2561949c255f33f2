//! On-disk job state: one `state.json` per job, written atomically.

use crate::job::{step_output_dir_name, Job};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "state.json";

pub fn job_dir(jobs_dir: &Path, job_id: &str) -> PathBuf {
    jobs_dir.join(job_id)
}

pub fn state_path(jobs_dir: &Path, job_id: &str) -> PathBuf {
    job_dir(jobs_dir, job_id).join(STATE_FILE)
}

/// Output directory for a step, e.g. `<jobs_dir>/<job_id>/pseudonymized`.
pub fn step_output_dir(jobs_dir: &Path, job_id: &str, step_name: &str) -> io::Result<PathBuf> {
    let dir_name = step_output_dir_name(step_name).ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("no output directory known for step '{}'", step_name),
        )
    })?;
    Ok(job_dir(jobs_dir, job_id).join(dir_name))
}

fn validate_job(job: &Job) -> io::Result<()> {
    if job.job_id.trim().is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "refusing to save job with empty job_id",
        ));
    }
    let step_names: Vec<&str> = job.steps.iter().map(|s| s.name.as_str()).collect();
    let enabled: Vec<&str> = job.config.enabled_steps.iter().map(|s| s.as_str()).collect();
    if step_names != enabled {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!(
                "job step list {:?} does not match enabled_steps {:?}",
                step_names, enabled
            ),
        ));
    }
    Ok(())
}

/// Saves the job state atomically: the JSON is written to `state.json.tmp`
/// and renamed over `state.json`, so a crash mid-save never leaves a
/// half-written state file visible.
pub fn save(jobs_dir: &Path, job: &Job) -> io::Result<()> {
    validate_job(job)?;

    let dir = job_dir(jobs_dir, &job.job_id);
    fs::create_dir_all(&dir)?;

    let content = serde_json::to_string_pretty(job)
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;

    let final_path = dir.join(STATE_FILE);
    let tmp_path = dir.join(format!("{}.tmp", STATE_FILE));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

/// Loads a job by id. A missing job surfaces as `ErrorKind::NotFound`, a
/// present but unreadable state file as `ErrorKind::InvalidData`.
pub fn load(jobs_dir: &Path, job_id: &str) -> io::Result<Job> {
    let path = state_path(jobs_dir, job_id);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(io::Error::new(
                ErrorKind::NotFound,
                format!("job '{}' not found under {}", job_id, jobs_dir.display()),
            ));
        }
        Err(e) => return Err(e),
    };
    // Unknown fields are ignored on purpose so newer state files still load.
    serde_json::from_str(&content).map_err(|e| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("state file for job '{}' is corrupt: {}", job_id, e),
        )
    })
}

/// Lists all jobs under `jobs_dir`, newest first. Directories without a
/// readable state file are skipped.
pub fn list(jobs_dir: &Path) -> io::Result<Vec<Job>> {
    let mut jobs = Vec::new();
    let entries = match fs::read_dir(jobs_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(jobs),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let job_id = entry.file_name().to_string_lossy().to_string();
        if let Ok(job) = load(jobs_dir, &job_id) {
            jobs.push(job);
        }
    }
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::PipelineError;
    use crate::job::{InputType, JobStatus, STEP_IMPORT, STEP_PSEUDONYMIZE};
    use tempfile::tempdir;

    fn test_job() -> Job {
        let mut config = Config::default();
        config.enabled_steps = vec![STEP_IMPORT.to_string(), STEP_PSEUDONYMIZE.to_string()];
        Job::new("/data/ndjson", InputType::LocalDirectory, config)
    }

    #[test]
    fn save_then_load_round_trips_every_field() {
        let dir = tempdir().unwrap();
        let mut job = test_job();
        job.status = JobStatus::InProgress;
        job.extraction_url = "https://dex.example/fhir/__status/42".to_string();
        job.total_files = 3;
        job.total_bytes = 12345;
        job.step_mut(STEP_IMPORT)
            .unwrap()
            .fail(PipelineError::transient("connection reset").with_status(503));

        save(dir.path(), &job).unwrap();
        let loaded = load(dir.path(), &job.job_id).unwrap();
        assert_eq!(loaded, job);
    }

    #[test]
    fn save_leaves_no_tmp_file_behind() {
        let dir = tempdir().unwrap();
        let job = test_job();
        save(dir.path(), &job).unwrap();
        let tmp = job_dir(dir.path(), &job.job_id).join("state.json.tmp");
        assert!(!tmp.exists());
        assert!(state_path(dir.path(), &job.job_id).exists());
    }

    #[test]
    fn load_distinguishes_missing_from_corrupt() {
        let dir = tempdir().unwrap();
        let err = load(dir.path(), "no-such-job").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let job = test_job();
        save(dir.path(), &job).unwrap();
        fs::write(state_path(dir.path(), &job.job_id), "{not json").unwrap();
        let err = load(dir.path(), &job.job_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn load_ignores_unknown_fields() {
        let dir = tempdir().unwrap();
        let job = test_job();
        save(dir.path(), &job).unwrap();

        let path = state_path(dir.path(), &job.job_id);
        let mut raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        raw["added_by_future_version"] = serde_json::json!({"x": 1});
        fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

        let loaded = load(dir.path(), &job.job_id).unwrap();
        assert_eq!(loaded.job_id, job.job_id);
    }

    #[test]
    fn rejects_invalid_jobs_before_writing() {
        let dir = tempdir().unwrap();
        let mut job = test_job();
        job.job_id = "  ".to_string();
        assert!(save(dir.path(), &job).is_err());

        let mut job = test_job();
        job.steps.pop();
        assert!(save(dir.path(), &job).is_err());
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn list_sorts_newest_first_and_skips_junk() {
        let dir = tempdir().unwrap();
        let older = test_job();
        save(dir.path(), &older).unwrap();
        let mut newer = test_job();
        newer.created_at = older.created_at + chrono::Duration::seconds(5);
        save(dir.path(), &newer).unwrap();
        fs::create_dir(dir.path().join("not-a-job")).unwrap();

        let jobs = list(dir.path()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, newer.job_id);
        assert_eq!(jobs[1].job_id, older.job_id);
    }
}
