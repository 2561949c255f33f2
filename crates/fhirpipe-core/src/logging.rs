//! A simple per-job file logger.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

fn log_path(job_dir: &Path) -> io::Result<std::path::PathBuf> {
    let log_dir = job_dir.join("logs");
    fs::create_dir_all(&log_dir)?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Ok(log_dir.join(format!("run-{}.log", timestamp)))
}

pub struct JobLogger {
    file: File,
}

impl JobLogger {
    pub fn new(job_dir: &Path) -> io::Result<Self> {
        let path = log_path(job_dir)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JobLogger { file })
    }

    pub fn log(&mut self, message: &str) {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(self.file, "[{}] {}", timestamp, message);
    }
}
