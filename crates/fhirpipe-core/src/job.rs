//! The job and step records that make up a pipeline run.

use crate::config::Config;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const STEP_IMPORT: &str = "import";
pub const STEP_PSEUDONYMIZE: &str = "pseudonymize";
pub const STEP_VALIDATE: &str = "validate";
pub const STEP_CONVERT_CSV: &str = "convert-csv";
pub const STEP_CONVERT_PARQUET: &str = "convert-parquet";

/// All recognized step names, in their canonical pipeline order.
pub const ALL_STEPS: &[&str] = &[
    STEP_IMPORT,
    STEP_PSEUDONYMIZE,
    STEP_VALIDATE,
    STEP_CONVERT_CSV,
    STEP_CONVERT_PARQUET,
];

/// Maps a step name to the name of its output directory inside the job dir.
pub fn step_output_dir_name(step: &str) -> Option<&'static str> {
    match step {
        STEP_IMPORT => Some("import"),
        STEP_PSEUDONYMIZE => Some("pseudonymized"),
        STEP_VALIDATE => Some("validated"),
        STEP_CONVERT_CSV => Some("csv"),
        STEP_CONVERT_PARQUET => Some("parquet"),
        _ => None,
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// How an input string was classified by the detector.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InputType {
    LocalDirectory,
    HttpUrl,
    ExtractionResultUrl,
    CohortDefinitionFile,
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalDirectory => write!(f, "local-directory"),
            Self::HttpUrl => write!(f, "http-url"),
            Self::ExtractionResultUrl => write!(f, "extraction-result-url"),
            Self::CohortDefinitionFile => write!(f, "cohort-definition-file"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files_processed: u64,
    #[serde(default)]
    pub bytes_processed: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<PipelineError>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Step {
            name: name.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            files_processed: 0,
            bytes_processed: 0,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Marks the step as running. On a retry the previous error stays
    /// recorded until the attempt resolves.
    pub fn begin(&mut self) {
        self.status = StepStatus::InProgress;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
    }

    pub fn complete(&mut self, files_processed: u64, bytes_processed: u64) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.files_processed = files_processed;
        self.bytes_processed = bytes_processed;
        self.last_error = None;
    }

    pub fn fail(&mut self, error: PipelineError) {
        self.status = StepStatus::Failed;
        self.completed_at = None;
        self.last_error = Some(error);
    }
}

/// One pipeline run, created per user invocation.
///
/// The job embeds a snapshot of the configuration taken at creation time,
/// so a state file on disk is self-contained and a resumed run does not
/// depend on the current config file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub input_source: String,
    pub input_type: InputType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Name of the step the job is positioned at; empty once completed.
    #[serde(default)]
    pub current_step: String,
    pub steps: Vec<Step>,
    /// Polling URL returned by the extraction service; lets a reloaded job
    /// resume mid-poll without re-submitting the cohort definition.
    #[serde(default)]
    pub extraction_url: String,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub error_message: String,
    pub config: Config,
}

impl Job {
    /// Creates a pending job with one pending step per enabled step.
    pub fn new(input_source: impl Into<String>, input_type: InputType, config: Config) -> Self {
        let now = Utc::now();
        let steps = config.enabled_steps.iter().map(Step::new).collect();
        let current_step = config
            .enabled_steps
            .first()
            .cloned()
            .unwrap_or_default();
        Job {
            job_id: Uuid::new_v4().to_string(),
            input_source: input_source.into(),
            input_type,
            created_at: now,
            updated_at: now,
            status: JobStatus::Pending,
            current_step,
            steps,
            extraction_url: String::new(),
            total_files: 0,
            total_bytes: 0,
            error_message: String::new(),
            config,
        }
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// The enabled step following `current`, or None past the last one.
    pub fn next_step_after(&self, current: &str) -> Option<&str> {
        let steps = &self.config.enabled_steps;
        let idx = steps.iter().position(|s| s == current)?;
        steps.get(idx + 1).map(|s| s.as_str())
    }

    /// Rolls the completed step's counters into the job-level aggregates.
    pub fn absorb_step_totals(&mut self, step_name: &str) {
        if let Some(step) = self.step(step_name) {
            let files_processed = step.files_processed;
            let bytes_processed = step.bytes_processed;
            self.total_files += files_processed;
            self.total_bytes += bytes_processed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.enabled_steps = vec![STEP_IMPORT.to_string(), STEP_PSEUDONYMIZE.to_string()];
        config
    }

    #[test]
    fn new_job_mirrors_enabled_steps() {
        let job = Job::new("/data/in", InputType::LocalDirectory, test_config());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_step, STEP_IMPORT);
        assert_eq!(job.steps.len(), 2);
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(job.steps[1].name, STEP_PSEUDONYMIZE);
    }

    #[test]
    fn next_step_walks_enabled_steps_in_order() {
        let job = Job::new("/data/in", InputType::LocalDirectory, test_config());
        assert_eq!(job.next_step_after(STEP_IMPORT), Some(STEP_PSEUDONYMIZE));
        assert_eq!(job.next_step_after(STEP_PSEUDONYMIZE), None);
        assert_eq!(job.next_step_after("no-such-step"), None);
    }

    #[test]
    fn status_serialization_uses_kebab_case() {
        let json = serde_json::to_string(&JobStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
        let json = serde_json::to_string(&InputType::ExtractionResultUrl).unwrap();
        assert_eq!(json, "\"extraction-result-url\"");
    }
}
