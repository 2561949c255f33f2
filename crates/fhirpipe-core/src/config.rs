//! Project configuration: YAML file, environment overrides, validation.

use crate::error::PipelineError;
use crate::job::{ALL_STEPS, STEP_IMPORT};
use serde::{Deserialize, Serialize};
use std::env;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::{fs, time::Duration};

pub const DEFAULT_CONFIG_FILE: &str = "fhirpipe.yml";
pub const CONFIG_PATH_ENV: &str = "FHIRPIPE_CONFIG";

const DEFAULT_BUNDLE_SPLIT_THRESHOLD_MB: i64 = 10;
const MAX_BUNDLE_SPLIT_THRESHOLD_MB: i64 = 100;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Overall timeout applied to every single HTTP request.
    pub request_timeout_seconds: u64,
    /// Retry budget internal to one logical request. Independent of the
    /// step-level retry budget.
    pub request_retries: u32,
    pub request_retry_backoff_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            request_timeout_seconds: 300,
            request_retries: 3,
            request_retry_backoff_ms: 250,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ExtractionConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub polling_interval_seconds: u64,
    pub max_polling_interval_seconds: u64,
    pub extraction_timeout_minutes: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct PseudonymizerConfig {
    pub url: String,
    /// Bundles whose compact JSON exceeds this many megabytes are split
    /// before being sent. Values outside 1..=100 fall back to the default.
    pub bundle_split_threshold_mb: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ValidatorConfig {
    pub url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ConversionConfig {
    pub csv_url: String,
    pub parquet_url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ServicesConfig {
    pub extraction: ExtractionConfig,
    pub pseudonymizer: PseudonymizerConfig,
    pub validator: ValidatorConfig,
    pub conversion: ConversionConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub enabled_steps: Vec<String>,
    pub jobs_dir: PathBuf,
    pub retry: RetryConfig,
    pub http: HttpConfig,
    pub services: ServicesConfig,
    /// Path the configuration was loaded from, if any.
    pub source_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled_steps: vec![STEP_IMPORT.to_string(), "pseudonymize".to_string()],
            jobs_dir: PathBuf::from("jobs"),
            retry: RetryConfig::default(),
            http: HttpConfig::default(),
            services: ServicesConfig::default(),
            source_path: None,
        }
    }
}

impl Config {
    /// Loads the configuration from a YAML file.
    pub fn load(path: &Path) -> io::Result<Config> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Resolves the configuration: an explicit path wins, then the
    /// `FHIRPIPE_CONFIG` variable, then `./fhirpipe.yml` if present, then
    /// built-in defaults. Environment overrides apply on top in all cases.
    pub fn discover(explicit: Option<&Path>) -> io::Result<Config> {
        let mut config = if let Some(path) = explicit {
            Config::load(path)?
        } else if let Ok(path) = env::var(CONFIG_PATH_ENV) {
            Config::load(Path::new(&path))?
        } else if Path::new(DEFAULT_CONFIG_FILE).is_file() {
            Config::load(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `FHIRPIPE_*` environment variable overrides to scalar
    /// settings. Unset variables leave the file values untouched;
    /// unparseable numeric values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("FHIRPIPE_ENABLED_STEPS") {
            let steps: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !steps.is_empty() {
                self.enabled_steps = steps;
            }
        }
        if let Ok(v) = env::var("FHIRPIPE_JOBS_DIR") {
            self.jobs_dir = PathBuf::from(v);
        }
        override_num(&mut self.retry.max_attempts, "FHIRPIPE_RETRY_MAX_ATTEMPTS");
        override_num(&mut self.retry.initial_backoff_ms, "FHIRPIPE_RETRY_INITIAL_BACKOFF_MS");
        override_num(&mut self.retry.max_backoff_ms, "FHIRPIPE_RETRY_MAX_BACKOFF_MS");
        override_num(
            &mut self.http.request_timeout_seconds,
            "FHIRPIPE_HTTP_REQUEST_TIMEOUT_SECONDS",
        );
        override_num(&mut self.http.request_retries, "FHIRPIPE_HTTP_REQUEST_RETRIES");

        let extraction = &mut self.services.extraction;
        override_str(&mut extraction.base_url, "FHIRPIPE_EXTRACTION_BASE_URL");
        override_str(&mut extraction.username, "FHIRPIPE_EXTRACTION_USERNAME");
        override_str(&mut extraction.password, "FHIRPIPE_EXTRACTION_PASSWORD");
        override_num(
            &mut extraction.polling_interval_seconds,
            "FHIRPIPE_EXTRACTION_POLLING_INTERVAL_SECONDS",
        );
        override_num(
            &mut extraction.max_polling_interval_seconds,
            "FHIRPIPE_EXTRACTION_MAX_POLLING_INTERVAL_SECONDS",
        );
        override_num(
            &mut extraction.extraction_timeout_minutes,
            "FHIRPIPE_EXTRACTION_TIMEOUT_MINUTES",
        );

        override_str(&mut self.services.pseudonymizer.url, "FHIRPIPE_PSEUDONYMIZER_URL");
        override_num(
            &mut self.services.pseudonymizer.bundle_split_threshold_mb,
            "FHIRPIPE_BUNDLE_SPLIT_THRESHOLD_MB",
        );
        override_str(&mut self.services.validator.url, "FHIRPIPE_VALIDATOR_URL");
        override_str(&mut self.services.conversion.csv_url, "FHIRPIPE_CONVERSION_CSV_URL");
        override_str(
            &mut self.services.conversion.parquet_url,
            "FHIRPIPE_CONVERSION_PARQUET_URL",
        );
    }

    /// Checks the invariants required before a job may be created from
    /// this configuration.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.enabled_steps.is_empty() {
            return Err(PipelineError::non_transient("enabled_steps must not be empty"));
        }
        if self.enabled_steps[0] != STEP_IMPORT {
            return Err(PipelineError::non_transient(format!(
                "the first enabled step must be '{}', got '{}'",
                STEP_IMPORT, self.enabled_steps[0]
            )));
        }
        for name in &self.enabled_steps {
            if !ALL_STEPS.contains(&name.as_str()) {
                return Err(PipelineError::non_transient(format!(
                    "unrecognized step name '{}'",
                    name
                )));
            }
        }
        if self.retry.max_attempts < 1 || self.retry.max_attempts > 10 {
            return Err(PipelineError::non_transient(format!(
                "retry.max_attempts must be in [1,10], got {}",
                self.retry.max_attempts
            )));
        }
        if self.retry.initial_backoff_ms == 0 {
            return Err(PipelineError::non_transient("retry.initial_backoff_ms must be > 0"));
        }
        if self.retry.max_backoff_ms == 0 {
            return Err(PipelineError::non_transient("retry.max_backoff_ms must be > 0"));
        }
        if self.retry.initial_backoff_ms >= self.retry.max_backoff_ms {
            return Err(PipelineError::non_transient(format!(
                "retry.initial_backoff_ms ({}) must be smaller than retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if self.jobs_dir.as_os_str().is_empty() {
            return Err(PipelineError::non_transient("jobs_dir must not be empty"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http.request_timeout_seconds)
    }

    /// Effective bundle split threshold in bytes. Out-of-range settings
    /// fall back to the 10 MB default.
    pub fn bundle_split_threshold_bytes(&self) -> usize {
        let mb = self.services.pseudonymizer.bundle_split_threshold_mb;
        let mb = if mb < 1 || mb > MAX_BUNDLE_SPLIT_THRESHOLD_MB {
            DEFAULT_BUNDLE_SPLIT_THRESHOLD_MB
        } else {
            mb
        };
        (mb as usize) * 1024 * 1024
    }
}

fn override_str(target: &mut String, var: &str) {
    if let Ok(v) = env::var(var) {
        *target = v;
    }
}

fn override_num<T: std::str::FromStr>(target: &mut T, var: &str) {
    if let Ok(v) = env::var(var) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        }
    }
}
