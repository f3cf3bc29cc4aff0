use crate::process::CommandRunner;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    JobStart,
    JobEnd,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::JobStart => "job-start",
            LifecycleEvent::JobEnd => "job-end",
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("orbit command failed with exit code {code}{}", stderr_suffix(.stderr))]
    Failed { code: i32, stderr: String },
    #[error("failed to execute orbit command: {0}")]
    Spawn(#[from] io::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// Details passed along with an event. A known `job_id` selects the
/// `event fire` form.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub job_id: Option<String>,
    pub server_addr: Option<String>,
    pub api_token: Option<String>,
}

pub struct CompanionCli<'a> {
    program: PathBuf,
    env: BTreeMap<String, String>,
    runner: &'a dyn CommandRunner,
}

impl<'a> CompanionCli<'a> {
    pub fn new(program: impl Into<PathBuf>, runner: &'a dyn CommandRunner) -> Self {
        Self {
            program: program.into(),
            env: BTreeMap::new(),
            runner,
        }
    }

    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.env.insert(name.to_string(), value.to_string());
        self
    }

    pub fn event_args(event: LifecycleEvent, context: &EventContext) -> Vec<String> {
        let mut args = vec!["event".to_string()];
        let Some(job_id) = context.job_id.as_deref() else {
            args.push(event.as_str().to_string());
            return args;
        };
        args.extend([
            "fire".to_string(),
            event.as_str().to_string(),
            "--job-id".to_string(),
            job_id.to_string(),
        ]);
        if let Some(addr) = context.server_addr.as_deref() {
            args.extend(["--server-addr".to_string(), addr.to_string()]);
        }
        if let Some(token) = context.api_token.as_deref() {
            args.extend(["--token".to_string(), token.to_string()]);
        }
        args
    }

    pub fn signal(&self, event: LifecycleEvent, context: &EventContext) -> Result<(), SignalError> {
        self.invoke(&Self::event_args(event, context))
    }

    pub fn start_server(&self) -> Result<(), SignalError> {
        self.invoke(&["server".to_string(), "start".to_string()])
    }

    pub fn stop_server(&self) -> Result<(), SignalError> {
        self.invoke(&["server".to_string(), "stop".to_string()])
    }

    fn invoke(&self, args: &[String]) -> Result<(), SignalError> {
        let output = self.runner.run(&self.program, args, &self.env)?;
        let stderr = output.stderr_text();
        if !stderr.is_empty() {
            debug!("orbit command stderr: {stderr}");
        }
        if !output.success() {
            return Err(SignalError::Failed {
                code: output.status_code,
                stderr,
            });
        }
        debug!("orbit command output: {}", output.stdout_text());
        Ok(())
    }
}

pub fn read_server_pid(pid_file: &Path) -> Option<u32> {
    let raw = fs::read_to_string(pid_file).ok()?;
    raw.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}
