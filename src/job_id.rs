//! Numeric job id discovery for the current pipeline job.
//!
//! The runner only exposes the job key (`GITHUB_JOB`) to steps. The numeric
//! id is recovered by reading the display name from the newest worker log and
//! matching it against the jobs of the current run.

use crate::release::IndexError;
use serde::Deserialize;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};

const DISPLAY_NAME_FIELD: &str = "\"jobDisplayName\"";

#[derive(Debug, Error)]
pub enum JobLookupError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no worker log found in {0}")]
    NoWorkerLog(PathBuf),
    #[error("no job display name in {0}")]
    NoDisplayName(PathBuf),
    #[error("no job named {0:?} in the current run")]
    NoMatch(String),
    #[error("{0} is not set")]
    MissingContext(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    pub name: String,
}

pub trait JobDirectory {
    fn list_jobs(&self, repository: &str, run_id: u64) -> Result<Vec<WorkflowJob>, JobLookupError>;
}

pub trait JobIdSource {
    fn job_id(&self) -> Result<String, JobLookupError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub repository: String,
    pub run_id: u64,
}

impl RunContext {
    pub fn from_env() -> Result<Self, JobLookupError> {
        let repository = env::var("GITHUB_REPOSITORY")
            .ok()
            .filter(|value| !value.is_empty())
            .ok_or(JobLookupError::MissingContext("GITHUB_REPOSITORY"))?;
        let run_id = env::var("GITHUB_RUN_ID")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .ok_or(JobLookupError::MissingContext("GITHUB_RUN_ID"))?;
        Ok(Self { repository, run_id })
    }
}

pub struct WorkerLogLookup<'a> {
    diag_dir: PathBuf,
    run: Option<RunContext>,
    directory: &'a dyn JobDirectory,
}

impl<'a> WorkerLogLookup<'a> {
    pub fn new(
        diag_dir: impl Into<PathBuf>,
        run: Option<RunContext>,
        directory: &'a dyn JobDirectory,
    ) -> Self {
        Self {
            diag_dir: diag_dir.into(),
            run,
            directory,
        }
    }
}

impl JobIdSource for WorkerLogLookup<'_> {
    fn job_id(&self) -> Result<String, JobLookupError> {
        let log = newest_worker_log(&self.diag_dir)?;
        let content = fs::read_to_string(&log).map_err(|source| JobLookupError::Io {
            path: log.clone(),
            source,
        })?;
        let name = last_display_name(&content).ok_or(JobLookupError::NoDisplayName(log))?;
        debug!("job display name from worker log: {name}");

        let run = self
            .run
            .as_ref()
            .ok_or(JobLookupError::MissingContext("GITHUB_RUN_ID"))?;
        let jobs = self.directory.list_jobs(&run.repository, run.run_id)?;
        jobs.into_iter()
            .find(|job| job.name == name)
            .map(|job| job.id.to_string())
            .ok_or(JobLookupError::NoMatch(name))
    }
}

pub fn newest_worker_log(dir: &Path) -> Result<PathBuf, JobLookupError> {
    let entries = fs::read_dir(dir).map_err(|source| JobLookupError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("Worker_") || !name.ends_with(".log") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let path = entry.path();
        let replace = match &newest {
            None => true,
            Some((time, current)) => (modified, &path) > (*time, current),
        };
        if replace {
            newest = Some((modified, path));
        }
    }
    newest
        .map(|(_, path)| path)
        .ok_or_else(|| JobLookupError::NoWorkerLog(dir.to_path_buf()))
}

/// Value of the last `"jobDisplayName": "..."` field in a worker log.
pub fn last_display_name(log: &str) -> Option<String> {
    log.match_indices(DISPLAY_NAME_FIELD)
        .filter_map(|(index, _)| {
            let rest = log[index + DISPLAY_NAME_FIELD.len()..].trim_start();
            let rest = rest.strip_prefix(':')?.trim_start();
            serde_json::Deserializer::from_str(rest)
                .into_iter::<String>()
                .next()?
                .ok()
        })
        .last()
}

/// Derived job id, or `fallback` with a warning when lookup fails.
pub fn resolve_job_id(source: &dyn JobIdSource, fallback: Option<String>) -> Option<String> {
    match source.job_id() {
        Ok(id) => {
            debug!("resolved job id {id}");
            Some(id)
        }
        Err(err) => {
            warn!("could not determine job id ({err}), falling back to GITHUB_JOB");
            fallback
        }
    }
}
