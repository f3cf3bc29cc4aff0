use crate::process::{elevate, find_program, CommandOutput, CommandRunner};
use crate::state::{StateError, StateKey, StateStore};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    fn flag(&self) -> &'static str {
        match self {
            Signal::Terminate => "-TERM",
            Signal::Kill => "-KILL",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Terminate => f.write_str("SIGTERM"),
            Signal::Kill => f.write_str("SIGKILL"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalFailure {
    #[error("no such process")]
    NoSuchProcess,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("{signal} to pid {pid} was rejected: {failure}")]
    Rejected {
        pid: u32,
        signal: Signal,
        #[source]
        failure: SignalFailure,
    },
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Nothing was recorded; no signal sent.
    NotFound,
    /// The process was gone before SIGTERM.
    AlreadyGone,
    /// The process exited inside the grace period.
    Confirmed,
    ForceKilled,
}

impl ShutdownOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownOutcome::NotFound => "not_found",
            ShutdownOutcome::AlreadyGone => "already_gone",
            ShutdownOutcome::Confirmed => "confirmed",
            ShutdownOutcome::ForceKilled => "force_killed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownPolicy {
    pub grace_period: Duration,
    pub poll_interval: Duration,
    pub process_group: bool,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            process_group: true,
        }
    }
}

pub trait ProcessControl {
    fn signal(&self, pid: u32, group: bool, signal: Signal) -> Result<(), SignalFailure>;
    fn is_alive(&self, pid: u32) -> bool;
}

/// Delivers signals through the `kill` utility so a root-owned daemon can be
/// reached with `sudo -n`.
pub struct KillCommand<'a> {
    runner: &'a dyn CommandRunner,
    privileged: bool,
}

impl<'a> KillCommand<'a> {
    pub fn new(runner: &'a dyn CommandRunner, privileged: bool) -> Self {
        Self { runner, privileged }
    }

    fn kill(&self, args: Vec<String>) -> Result<CommandOutput, SignalFailure> {
        let (program, args) = elevate(self.privileged, &["-n"], &find_program("kill"), args);
        self.runner
            .run(&program, &args, &BTreeMap::new())
            .map_err(|err| SignalFailure::Other(format!("failed to run kill: {err}")))
    }
}

fn classify(output: &CommandOutput) -> SignalFailure {
    let stderr = output.stderr_text();
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("no such process") {
        SignalFailure::NoSuchProcess
    } else if lowered.contains("operation not permitted") {
        SignalFailure::NotPermitted
    } else if stderr.is_empty() {
        SignalFailure::Other(format!("kill exited with code {}", output.status_code))
    } else {
        SignalFailure::Other(stderr)
    }
}

pub fn parse_proc_state(stat: &str) -> Option<char> {
    // The command name may itself contain ')', so split on the last one.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

impl ProcessControl for KillCommand<'_> {
    fn signal(&self, pid: u32, group: bool, signal: Signal) -> Result<(), SignalFailure> {
        let target = if group {
            format!("-{pid}")
        } else {
            pid.to_string()
        };
        let output = self.kill(vec![signal.flag().to_string(), "--".to_string(), target])?;
        if output.success() {
            Ok(())
        } else {
            Err(classify(&output))
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => return parse_proc_state(&stat) != Some('Z'),
            Err(_) if Path::new("/proc/self/stat").exists() => return false,
            Err(_) => {}
        }
        match self.kill(vec!["-0".to_string(), pid.to_string()]) {
            Ok(output) if output.success() => true,
            Ok(output) => classify(&output) == SignalFailure::NotPermitted,
            Err(_) => true,
        }
    }
}

pub fn shutdown(
    control: &dyn ProcessControl,
    pid: Option<u32>,
    policy: &ShutdownPolicy,
) -> Result<ShutdownOutcome, ShutdownError> {
    let Some(pid) = pid else {
        debug!("no daemon pid recorded, nothing to stop");
        return Ok(ShutdownOutcome::NotFound);
    };
    let group = policy.process_group;

    match control.signal(pid, group, Signal::Terminate) {
        Ok(()) => info!("sent SIGTERM to process {pid}"),
        Err(SignalFailure::NoSuchProcess) => {
            info!("process {pid} already terminated");
            return Ok(ShutdownOutcome::AlreadyGone);
        }
        Err(failure) => {
            return Err(ShutdownError::Rejected {
                pid,
                signal: Signal::Terminate,
                failure,
            })
        }
    }

    let deadline = Instant::now() + policy.grace_period;
    loop {
        if !control.is_alive(pid) {
            debug!("process {pid} exited after SIGTERM");
            return Ok(ShutdownOutcome::Confirmed);
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(policy.poll_interval.min(deadline - now));
    }

    warn!(
        "process {pid} still running after {:?}, sending SIGKILL",
        policy.grace_period
    );
    match control.signal(pid, group, Signal::Kill) {
        Ok(()) => {
            info!("process {pid} force killed with SIGKILL");
            Ok(ShutdownOutcome::ForceKilled)
        }
        Err(SignalFailure::NoSuchProcess) => Ok(ShutdownOutcome::Confirmed),
        Err(failure) => Err(ShutdownError::Rejected {
            pid,
            signal: Signal::Kill,
            failure,
        }),
    }
}

/// Stops the pid recorded under `key` and removes the key whatever happens.
pub fn shutdown_recorded(
    control: &dyn ProcessControl,
    store: &dyn StateStore,
    key: StateKey,
    policy: &ShutdownPolicy,
) -> Result<ShutdownOutcome, ShutdownError> {
    let result = match store.load_pid(key) {
        Ok(pid) => shutdown(control, pid, policy),
        Err(err) => Err(ShutdownError::State(err)),
    };
    let cleared = store.remove(key);
    let outcome = result?;
    cleared?;
    Ok(outcome)
}
