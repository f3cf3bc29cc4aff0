//! Starts the daemon detached from the supervisor and waits for it to settle.
//!
//! Launch is a race between three observations against one deadline: the OS
//! confirming the process exists, the process exiting, and the deadline
//! itself. The first one seen decides the [`SpawnOutcome`].

use crate::process::elevate;
use crate::state::{DaemonHandle, StateError, StateStore};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Code(i32),
    Signal(i32),
}

impl ExitReason {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitReason::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitReason::Signal(signal);
            }
        }
        ExitReason::Code(-1)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Code(code) => write!(f, "exited with code {code}"),
            ExitReason::Signal(signal) => write!(f, "was terminated by signal {signal}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("daemon {reason}. Check {} for errors", log_file.display())]
    DaemonExitedEarly {
        reason: ExitReason,
        log_file: PathBuf,
    },
    #[error("timeout waiting for daemon to start after {0:?}")]
    LaunchTimeout(Duration),
    #[error("failed to record daemon state: {0}")]
    State(#[from] StateError),
}

/// A fully formed daemon invocation. The launcher does not interpret `args`.
#[derive(Debug, Clone)]
pub struct DaemonCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Run through `sudo -E` so the daemon gets root with the caller's env.
    pub privileged: bool,
    /// Where the daemon writes its own log; quoted in early-exit errors.
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct LaunchPolicy {
    pub spawn_timeout: Duration,
    pub ready_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for LaunchPolicy {
    fn default() -> Self {
        Self {
            spawn_timeout: Duration::from_secs(5),
            ready_delay: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
pub enum SpawnOutcome {
    Spawned(u32),
    ExitedEarly(ExitReason),
    TimedOut,
    SpawnFailed(io::Error),
}

pub trait SpawnedProcess {
    fn pid(&self) -> Option<u32>;
    fn try_exit(&mut self) -> io::Result<Option<ExitReason>>;
    fn kill(&mut self) -> io::Result<()>;
    fn disown(self: Box<Self>);
}

pub trait Spawner {
    fn spawn(&self, command: &DaemonCommand) -> io::Result<Box<dyn SpawnedProcess>>;
}

pub struct SystemSpawner;

struct ChildProcess {
    child: Child,
}

impl SpawnedProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitReason>> {
        Ok(self.child.try_wait()?.map(ExitReason::from_status))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()?;
        self.child.wait().map(|_| ())
    }

    fn disown(self: Box<Self>) {
        // Dropping a Child neither kills nor waits on it.
        drop(self.child);
    }
}

impl Spawner for SystemSpawner {
    fn spawn(&self, command: &DaemonCommand) -> io::Result<Box<dyn SpawnedProcess>> {
        let (program, args) = elevate(
            command.privileged,
            &["-n", "-E"],
            &command.program,
            command.args.clone(),
        );
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        // Arguments may carry the API token; only the program is logged.
        debug!("spawning {}", command.program.display());
        let child = cmd.spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }
}

fn abandon(process: &mut dyn SpawnedProcess) {
    match process.kill() {
        Ok(()) => debug!("stopped abandoned daemon process"),
        Err(err) => warn!("failed to stop abandoned daemon process: {err}"),
    }
}

fn remaining(deadline: Instant, poll: Duration) -> Duration {
    poll.min(deadline.saturating_duration_since(Instant::now()))
}

pub fn race_spawn(process: &mut dyn SpawnedProcess, policy: &LaunchPolicy) -> SpawnOutcome {
    let deadline = Instant::now() + policy.spawn_timeout;
    loop {
        match process.try_exit() {
            Ok(Some(reason)) => return SpawnOutcome::ExitedEarly(reason),
            Ok(None) => {}
            Err(err) => return SpawnOutcome::SpawnFailed(err),
        }
        if let Some(pid) = process.pid() {
            return SpawnOutcome::Spawned(pid);
        }
        if Instant::now() >= deadline {
            return SpawnOutcome::TimedOut;
        }
        thread::sleep(remaining(deadline, policy.poll_interval));
    }
}

/// Waits out the readiness delay, returning the exit reason if the process
/// dies during it.
fn settle(
    process: &mut dyn SpawnedProcess,
    policy: &LaunchPolicy,
) -> io::Result<Option<ExitReason>> {
    let deadline = Instant::now() + policy.ready_delay;
    loop {
        if let Some(reason) = process.try_exit()? {
            return Ok(Some(reason));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(remaining(deadline, policy.poll_interval));
    }
}

pub fn launch(
    spawner: &dyn Spawner,
    command: &DaemonCommand,
    policy: &LaunchPolicy,
    store: &dyn StateStore,
) -> Result<DaemonHandle, LaunchError> {
    let program = command.program.display().to_string();
    let spawn_err = |source| LaunchError::Spawn {
        program: program.clone(),
        source,
    };
    let mut process = spawner.spawn(command).map_err(spawn_err)?;

    let pid = match race_spawn(process.as_mut(), policy) {
        SpawnOutcome::Spawned(pid) => pid,
        SpawnOutcome::ExitedEarly(reason) => {
            return Err(LaunchError::DaemonExitedEarly {
                reason,
                log_file: command.log_file.clone(),
            })
        }
        SpawnOutcome::TimedOut => {
            abandon(process.as_mut());
            return Err(LaunchError::LaunchTimeout(policy.spawn_timeout));
        }
        SpawnOutcome::SpawnFailed(source) => {
            abandon(process.as_mut());
            return Err(spawn_err(source));
        }
    };
    debug!("daemon spawned (pid {pid})");

    let mut handle = DaemonHandle {
        pid,
        started_at: Utc::now(),
        ready_confirmed: false,
    };
    debug!("waiting {:?} for daemon to be ready", policy.ready_delay);
    match settle(process.as_mut(), policy) {
        Ok(None) => {}
        Ok(Some(reason)) => {
            return Err(LaunchError::DaemonExitedEarly {
                reason,
                log_file: command.log_file.clone(),
            })
        }
        Err(source) => {
            abandon(process.as_mut());
            return Err(spawn_err(source));
        }
    }
    handle.ready_confirmed = true;
    process.disown();

    handle.persist(store)?;
    info!("daemon ready (pid {pid})");
    Ok(handle)
}
