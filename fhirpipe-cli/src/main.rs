use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fhirpipe_core::config::Config;
use fhirpipe_core::job::{Job, JobStatus, StepStatus};
use fhirpipe_core::state;
use fhirpipe_pipeline::orchestrator;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Resumable processing pipeline for FHIR NDJSON datasets", long_about = None)]
struct Cli {
    /// Path to the configuration file (default: ./fhirpipe.yml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the jobs directory from the configuration
    #[arg(long, global = true)]
    jobs_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a job for the given input and run it to completion
    Run {
        /// A local NDJSON directory, an HTTP(S) URL, an extraction result
        /// URL, or a cohort-definition file
        input: Option<String>,
        /// Resume an existing job instead of creating a new one
        #[arg(long, value_name = "JOB_ID")]
        resume: Option<String>,
    },
    /// Show the state of a job
    Status {
        job_id: String,
    },
    /// List all jobs, newest first
    List,
    /// Retry the failed step of a job
    Retry {
        job_id: String,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = Config::discover(cli.config.as_deref())
        .context("loading configuration")?;
    if let Some(jobs_dir) = &cli.jobs_dir {
        config.jobs_dir = jobs_dir.clone();
    }
    let jobs_dir = config.jobs_dir.clone();

    match &cli.command {
        Commands::Run { input, resume } => {
            let mut job = match (input, resume) {
                (_, Some(job_id)) => {
                    let job = orchestrator::load_job(&jobs_dir, job_id)?;
                    println!("Resuming job {} at step '{}'", job.job_id, job.current_step);
                    job
                }
                (Some(input), None) => {
                    let job = orchestrator::create_job(input, config)?;
                    println!("Created job {} (input type: {})", job.job_id, job.input_type);
                    job
                }
                (None, None) => bail!("either an input or --resume <JOB_ID> is required"),
            };

            orchestrator::start_job(&jobs_dir, &mut job)?;
            while !job.current_step.is_empty() {
                let step_name = job.current_step.clone();
                println!("Running step '{}'...", step_name);
                orchestrator::execute_step(&jobs_dir, &mut job, &step_name).with_context(|| {
                    format!("job {} failed at step '{}'", job.job_id, step_name)
                })?;
                if let Some(step) = job.step(&step_name) {
                    println!(
                        "  {} completed: {} file(s), {} byte(s)",
                        step_name, step.files_processed, step.bytes_processed
                    );
                }
                orchestrator::advance_to_next_step(&jobs_dir, &mut job)?;
            }
            println!(
                "Job {} completed ({} file(s), {} byte(s) total)",
                job.job_id, job.total_files, job.total_bytes
            );
        }
        Commands::Status { job_id } => {
            let job = orchestrator::load_job(&jobs_dir, job_id)?;
            print_job(&job, true);
        }
        Commands::List => {
            let jobs = state::list(&jobs_dir)
                .with_context(|| format!("listing jobs under {}", jobs_dir.display()))?;
            if jobs.is_empty() {
                println!("No jobs found under {}.", jobs_dir.display());
            } else {
                for job in jobs {
                    print_job(&job, false);
                }
            }
        }
        Commands::Retry { job_id } => {
            let job = orchestrator::load_job(&jobs_dir, job_id)?;
            let failed_step = job
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Failed)
                .map(|s| s.name.clone());
            let Some(step_name) = failed_step else {
                bail!("job {} has no failed step to retry", job_id);
            };
            println!("Retrying step '{}' of job {}...", step_name, job_id);
            let mut job = orchestrator::retry_step(&jobs_dir, &job, &step_name)
                .with_context(|| format!("retry of step '{}' failed", step_name))?;
            orchestrator::advance_to_next_step(&jobs_dir, &mut job)?;
            while !job.current_step.is_empty() {
                let step_name = job.current_step.clone();
                println!("Running step '{}'...", step_name);
                orchestrator::execute_step(&jobs_dir, &mut job, &step_name).with_context(|| {
                    format!("job {} failed at step '{}'", job.job_id, step_name)
                })?;
                orchestrator::advance_to_next_step(&jobs_dir, &mut job)?;
            }
            println!("Job {} completed", job.job_id);
        }
    }
    Ok(())
}

fn print_job(job: &Job, verbose: bool) {
    println!(
        "{}  {}  created {}  input {}",
        job.job_id,
        job.status,
        job.created_at.format("%Y-%m-%d %H:%M:%S"),
        job.input_source
    );
    if job.status == JobStatus::Failed && !job.error_message.is_empty() {
        println!("  error: {}", job.error_message);
    }
    if verbose {
        for step in &job.steps {
            let marker = if step.name == job.current_step { "*" } else { " " };
            print!(
                "{} {:<18} {:<12} {} file(s), {} byte(s)",
                marker, step.name, step.status, step.files_processed, step.bytes_processed
            );
            if step.retry_count > 0 {
                print!("  retries: {}", step.retry_count);
            }
            if let Some(err) = &step.last_error {
                print!("  last error ({}): {}", err.kind, err);
            }
            println!();
        }
        println!(
            "  totals: {} file(s), {} byte(s)",
            job.total_files, job.total_bytes
        );
    }
}
