use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to write {path}: {source}")]
pub struct OutputError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

/// Runner command files. Each is optional; writes to an unset file are
/// skipped.
#[derive(Debug, Clone, Default)]
pub struct PipelineFiles {
    pub output: Option<PathBuf>,
    pub path: Option<PathBuf>,
    pub env: Option<PathBuf>,
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn append(path: &Path, content: &str) -> Result<(), OutputError> {
    let err = |source| OutputError {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(err)?;
    file.write_all(content.as_bytes()).map_err(err)
}

fn key_value(name: &str, value: &str) -> String {
    if !value.contains('\n') {
        return format!("{name}={value}\n");
    }
    let mut delimiter = String::from("ORBIT_EOF");
    while value.contains(&delimiter) {
        delimiter.push('_');
    }
    format!("{name}<<{delimiter}\n{value}\n{delimiter}\n")
}

impl PipelineFiles {
    pub fn from_env() -> Self {
        Self {
            output: env_path("GITHUB_OUTPUT"),
            path: env_path("GITHUB_PATH"),
            env: env_path("GITHUB_ENV"),
        }
    }

    pub fn set_output(&self, name: &str, value: &str) -> Result<(), OutputError> {
        match &self.output {
            Some(file) => append(file, &key_value(name, value)),
            None => Ok(()),
        }
    }

    pub fn add_path(&self, dir: &Path) -> Result<(), OutputError> {
        match &self.path {
            Some(file) => append(file, &format!("{}\n", dir.display())),
            None => Ok(()),
        }
    }

    pub fn export_var(&self, name: &str, value: &str) -> Result<(), OutputError> {
        match &self.env {
            Some(file) => append(file, &key_value(name, value)),
            None => Ok(()),
        }
    }
}
