use crate::config::Config;
use crate::error::SidecarError;
use crate::events::{read_server_pid, CompanionCli, EventContext, LifecycleEvent};
use crate::installer::{install_with_retry, InstallError, InstallManifest};
use crate::job_id::{resolve_job_id, JobDirectory, RunContext, WorkerLogLookup};
use crate::launcher::{launch, DaemonCommand, Spawner};
use crate::logging;
use crate::outputs::PipelineFiles;
use crate::process::{find_program, CommandRunner};
use crate::release::ReleaseIndex;
use crate::resolver::{
    resolve_for_target, AssetLayout, Component, ReleaseDescriptor, Target, VersionSelector,
};
use crate::shutdown::{
    shutdown, shutdown_recorded, ProcessControl, ShutdownOutcome, ShutdownPolicy,
};
use crate::state::{DaemonHandle, StateKey, StateStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const API_TOKEN_ENV: &str = "ORBITCI_API_TOKEN";

pub struct Host<'a> {
    pub runner: &'a dyn CommandRunner,
    pub spawner: &'a dyn Spawner,
    pub control: &'a dyn ProcessControl,
    pub store: &'a dyn StateStore,
    pub files: &'a PipelineFiles,
}

#[derive(Debug, Serialize)]
pub struct ResolveReport {
    pub version: String,
    pub target: String,
    pub layout: AssetLayout,
    pub assets: Vec<String>,
    pub checksums: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DownloadReport {
    pub version: String,
    pub binary_path: PathBuf,
    pub assets: Vec<String>,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct SetupReport {
    pub version: String,
    pub binary_path: PathBuf,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub job_id: Option<String>,
    pub server_pid: Option<u32>,
    pub job_start_sent: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct TeardownReport {
    pub daemon_pid: Option<u32>,
    pub daemon_started_at: Option<DateTime<Utc>>,
    pub daemon: Option<&'static str>,
    pub server: Option<&'static str>,
    pub job_end_sent: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ShutdownReport {
    pub daemon_pid: Option<u32>,
    pub daemon_started_at: Option<DateTime<Utc>>,
    pub daemon: Option<&'static str>,
    pub warnings: Vec<String>,
}

fn note(warnings: &mut Vec<String>, message: String) {
    warn!("{message}");
    warnings.push(message);
}

fn resolve_descriptor(
    cfg: &Config,
    index: &dyn ReleaseIndex,
    target: Target,
) -> Result<ReleaseDescriptor, SidecarError> {
    let selector = cfg
        .version
        .parse::<VersionSelector>()
        .unwrap_or(VersionSelector::Latest);
    let descriptor = resolve_for_target(index, &selector, target, cfg.asset_layout)?;
    info!("Using Orbit agent version: {}", descriptor.tag);
    Ok(descriptor)
}

fn absolute(path: PathBuf) -> Result<PathBuf, InstallError> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = env::current_dir().map_err(|source| InstallError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(cwd.join(path))
}

/// Resolve, install, and publish `version`, `binary_path` and the `PATH`
/// entry.
fn fetch(
    cfg: &Config,
    index: &dyn ReleaseIndex,
    target: Target,
    files: &PipelineFiles,
) -> Result<(ReleaseDescriptor, InstallManifest), SidecarError> {
    let descriptor = resolve_descriptor(cfg, index, target)?;
    let install_dir = absolute(cfg.install_dir_path())?;
    let manifest = install_with_retry(index, &descriptor, &install_dir, cfg.retry_policy())?;
    files.add_path(&manifest.install_dir)?;
    files.set_output("version", &descriptor.tag)?;
    files.set_output("binary_path", &manifest.install_dir.to_string_lossy())?;
    Ok((descriptor, manifest))
}

pub fn resolve_release(
    cfg: &Config,
    index: &dyn ReleaseIndex,
    target: Target,
) -> Result<ResolveReport, SidecarError> {
    let descriptor = resolve_descriptor(cfg, index, target)?;
    Ok(ResolveReport {
        target: descriptor.target.to_string(),
        layout: descriptor.layout,
        assets: descriptor.asset_names().iter().map(|s| s.to_string()).collect(),
        checksums: descriptor
            .checksums
            .values()
            .map(|sum| sum.name.clone())
            .collect(),
        version: descriptor.tag,
    })
}

pub fn download(
    cfg: &Config,
    index: &dyn ReleaseIndex,
    target: Target,
    files: &PipelineFiles,
) -> Result<DownloadReport, SidecarError> {
    let (descriptor, manifest) = fetch(cfg, index, target, files)?;
    Ok(DownloadReport {
        assets: descriptor.asset_names().iter().map(|s| s.to_string()).collect(),
        version: descriptor.tag,
        binary_path: manifest.install_dir,
        files: manifest.files.into_keys().collect(),
    })
}

pub fn daemon_command(cfg: &Config, daemon: &Path, cli: &Path, api_token: &str) -> DaemonCommand {
    let log_file = cfg.log_file_path();
    let mut args = vec![
        format!("-client-bin-path={}", cli.display()),
        format!("-server-addr={}", cfg.server_addr),
        format!("-log-level={}", cfg.daemon.log_level),
    ];
    if cfg.daemon.debug {
        args.push("-debug".to_string());
    }
    args.push(format!("-log-file={}", log_file.display()));
    let provider = cfg.daemon.ci_provider.trim();
    if !provider.is_empty() {
        args.push(format!("-ci-provider={provider}"));
    }
    if cfg.daemon.token_in_args {
        args.push(format!("-api-token={api_token}"));
    }
    args.extend(cfg.daemon.extra_args.iter().cloned());

    DaemonCommand {
        program: daemon.to_path_buf(),
        args,
        env: BTreeMap::from([(API_TOKEN_ENV.to_string(), api_token.to_string())]),
        privileged: cfg.privileged,
        log_file,
    }
}

fn required_binary(manifest: &InstallManifest, component: Component) -> Result<PathBuf, InstallError> {
    let name = component.binary_name();
    manifest
        .binary(name)
        .ok_or_else(|| InstallError::MissingBinary(name.to_string()))
}

fn companion<'a>(
    cfg: &Config,
    program: impl Into<PathBuf>,
    runner: &'a dyn CommandRunner,
) -> CompanionCli<'a> {
    let cli = CompanionCli::new(program, runner);
    match cfg.api_token.trim() {
        "" => cli,
        token => cli.with_env(API_TOKEN_ENV, token),
    }
}

fn event_context(cfg: &Config, job_id: Option<String>) -> EventContext {
    let non_empty = |value: &str| {
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    };
    EventContext {
        job_id,
        server_addr: non_empty(&cfg.server_addr),
        api_token: non_empty(&cfg.api_token),
    }
}

/// Numeric job id from the runner logs when a diagnostics directory is
/// configured, else none.
fn derive_job_id(cfg: &Config, jobs: &dyn JobDirectory) -> Option<String> {
    let diag_dir = cfg.runner_diag_dir()?;
    let fallback = env::var("GITHUB_JOB").ok().filter(|job| !job.is_empty());
    let run = match RunContext::from_env() {
        Ok(run) => Some(run),
        Err(err) => {
            debug!("run context unavailable: {err}");
            None
        }
    };
    let lookup = WorkerLogLookup::new(diag_dir, run, jobs);
    resolve_job_id(&lookup, fallback)
}

fn start_event_server(
    cfg: &Config,
    companion: &CompanionCli<'_>,
    store: &dyn StateStore,
) -> Option<u32> {
    if let Err(err) = companion.start_server() {
        warn!("failed to start event server: {err}");
        return None;
    }
    let pid_file = cfg.server_pid_file();
    let Some(pid) = read_server_pid(&pid_file) else {
        warn!("event server pid file {} not found", pid_file.display());
        return None;
    };
    if let Err(err) = store.save(StateKey::ServerPid, &pid.to_string()) {
        warn!("failed to record event server pid: {err}");
    }
    info!("event server started (pid {pid})");
    Some(pid)
}

pub fn setup(
    cfg: &Config,
    index: &dyn ReleaseIndex,
    jobs: &dyn JobDirectory,
    target: Target,
    host: &Host<'_>,
) -> Result<SetupReport, SidecarError> {
    let api_token = cfg.require_api_token()?;
    let (descriptor, manifest) = fetch(cfg, index, target, host.files)?;
    host.files.export_var(API_TOKEN_ENV, api_token)?;

    let daemon = required_binary(&manifest, Component::Daemon)?;
    let cli = required_binary(&manifest, Component::Cli)?;
    let command = daemon_command(cfg, &daemon, &cli, api_token);
    let handle = launch(host.spawner, &command, &cfg.launch_policy(), host.store)?;
    info!("Orbit agent started successfully (pid {})", handle.pid);

    host.store.save(
        StateKey::InstallDir,
        &manifest.install_dir.to_string_lossy(),
    )?;
    host.store.save(StateKey::Version, &descriptor.tag)?;
    host.files.set_output("pid", &handle.pid.to_string())?;

    let companion = companion(cfg, &cli, host.runner);
    let server_pid = if cfg.events.server {
        start_event_server(cfg, &companion, host.store)
    } else {
        None
    };

    let job_id = derive_job_id(cfg, jobs);
    if let Some(id) = &job_id {
        host.store.save(StateKey::JobId, id)?;
    }
    let job_start_sent = match companion.signal(
        LifecycleEvent::JobStart,
        &event_context(cfg, job_id.clone()),
    ) {
        Ok(()) => {
            info!("Job start event sent successfully");
            true
        }
        Err(err) => {
            warn!("Failed to send job start event: {err}");
            false
        }
    };

    Ok(SetupReport {
        version: descriptor.tag,
        binary_path: manifest.install_dir,
        pid: handle.pid,
        started_at: handle.started_at,
        job_id,
        server_pid,
        job_start_sent,
    })
}

fn companion_program(store: &dyn StateStore, warnings: &mut Vec<String>) -> PathBuf {
    match store.load(StateKey::InstallDir) {
        Ok(Some(dir)) => {
            let candidate = Path::new(&dir).join(Component::Cli.binary_name());
            if candidate.is_file() {
                return candidate;
            }
        }
        Ok(None) => {}
        Err(err) => note(warnings, format!("failed to read install dir from state: {err}")),
    }
    find_program(Component::Cli.binary_name())
}

fn dump_daemon_log(path: &Path, warnings: &mut Vec<String>) {
    match fs::read_to_string(path) {
        Ok(content) => logging::group("Orbit CI agent logs", content.lines()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("log file not found: {}", path.display())
        }
        Err(err) => note(warnings, format!("failed to read log file: {err}")),
    }
}

fn load_handle(store: &dyn StateStore, warnings: &mut Vec<String>) -> Option<DaemonHandle> {
    match DaemonHandle::load(store) {
        Ok(handle) => handle,
        Err(err) => {
            note(warnings, format!("failed to read daemon pid: {err}"));
            None
        }
    }
}

/// Stops `pid` and forgets the recorded handle whatever the outcome.
fn stop_daemon(
    control: &dyn ProcessControl,
    store: &dyn StateStore,
    pid: Option<u32>,
    policy: &ShutdownPolicy,
    warnings: &mut Vec<String>,
) -> Option<ShutdownOutcome> {
    let outcome = match shutdown(control, pid, policy) {
        Ok(outcome) => Some(outcome),
        Err(err) => {
            note(warnings, format!("failed to stop daemon: {err}"));
            None
        }
    };
    if let Err(err) = DaemonHandle::forget(store) {
        note(warnings, format!("failed to clear daemon state: {err}"));
    }
    match outcome {
        Some(ShutdownOutcome::NotFound) => info!("no daemon pid recorded, orbitd may not be running"),
        Some(_) => info!("Orbit agent stopped successfully"),
        None => {}
    }
    outcome
}

/// Never fails: every problem is reported as a warning.
pub fn teardown(cfg: &Config, host: &Host<'_>) -> TeardownReport {
    let mut report = TeardownReport::default();
    let warnings = &mut report.warnings;

    let handle = load_handle(host.store, warnings);
    match &handle {
        Some(handle) => debug!("found daemon pid {}", handle.pid),
        None => note(warnings, "no Orbit daemon pid found".to_string()),
    }
    report.daemon_pid = handle.as_ref().map(|handle| handle.pid);
    report.daemon_started_at = handle.as_ref().map(|handle| handle.started_at);

    let companion = companion(cfg, companion_program(host.store, warnings), host.runner);
    let job_id = match host.store.load(StateKey::JobId) {
        Ok(job_id) => job_id,
        Err(err) => {
            note(warnings, format!("failed to read job id: {err}"));
            None
        }
    };
    match companion.signal(LifecycleEvent::JobEnd, &event_context(cfg, job_id)) {
        Ok(()) => {
            info!("Job end event sent successfully");
            report.job_end_sent = true;
        }
        Err(err) => note(warnings, format!("Failed to send job end event: {err}")),
    }

    let server_recorded = matches!(host.store.load(StateKey::ServerPid), Ok(Some(_)));
    if cfg.events.server || server_recorded {
        if let Err(err) = companion.stop_server() {
            note(warnings, format!("failed to stop event server: {err}"));
        }
        let policy = ShutdownPolicy {
            process_group: false,
            ..cfg.shutdown_policy()
        };
        match shutdown_recorded(host.control, host.store, StateKey::ServerPid, &policy) {
            Ok(outcome) => report.server = Some(outcome.as_str()),
            Err(err) => note(warnings, format!("failed to stop event server: {err}")),
        }
    }

    report.daemon = stop_daemon(
        host.control,
        host.store,
        report.daemon_pid,
        &cfg.shutdown_policy(),
        warnings,
    )
    .map(|outcome| outcome.as_str());

    if logging::debug_enabled() {
        dump_daemon_log(&cfg.log_file_path(), warnings);
    }
    if let Err(err) = host.store.clear() {
        note(warnings, format!("failed to clear state: {err}"));
    }
    report
}

pub fn shutdown_daemon(cfg: &Config, host: &Host<'_>) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    let handle = load_handle(host.store, &mut report.warnings);
    report.daemon_pid = handle.as_ref().map(|handle| handle.pid);
    report.daemon_started_at = handle.map(|handle| handle.started_at);
    report.daemon = stop_daemon(
        host.control,
        host.store,
        report.daemon_pid,
        &cfg.shutdown_policy(),
        &mut report.warnings,
    )
    .map(|outcome| outcome.as_str());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::testing::tarball;
    use crate::launcher::testing::FakeSpawner;
    use crate::launcher::ExitReason;
    use crate::process::testing::MockRunner;
    use crate::resolver::testing::StubIndex;
    use crate::shutdown::testing::FakeControl;
    use crate::shutdown::Signal;
    use crate::state::testing::MemoryStateStore;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct NoJobs;

    impl JobDirectory for NoJobs {
        fn list_jobs(
            &self,
            _repository: &str,
            _run_id: u64,
        ) -> Result<Vec<crate::job_id::WorkflowJob>, crate::job_id::JobLookupError> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        dir: TempDir,
        cfg: Config,
        files: PipelineFiles,
        runner: MockRunner,
        store: MemoryStateStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let mut cfg = Config::default();
            cfg.api_token = "api-secret".to_string();
            cfg.install_dir = dir.path().join("bin").to_string_lossy().to_string();
            cfg.log_file = dir.path().join("orbitd.log").to_string_lossy().to_string();
            cfg.privileged = false;
            cfg.launch.spawn_timeout_ms = 300;
            cfg.launch.ready_delay_ms = 50;
            cfg.shutdown.grace_period_ms = 300;
            cfg.shutdown.poll_interval_ms = 20;
            cfg.install.retry_backoff_ms = 1;
            let files = PipelineFiles {
                output: Some(dir.path().join("github_output")),
                path: Some(dir.path().join("github_path")),
                env: Some(dir.path().join("github_env")),
            };
            Self {
                dir,
                cfg,
                files,
                runner: MockRunner::default(),
                store: MemoryStateStore::default(),
            }
        }

        fn index(&self) -> StubIndex {
            let scratch = self.dir.path().join("scratch");
            fs::create_dir_all(&scratch).unwrap();
            let cli = tarball(&scratch, "orbit-v1.4.0", &[("orbit", "#!/bin/sh\n")]);
            let daemon = tarball(&scratch, "orbitd-v1.4.0", &[("orbitd", "#!/bin/sh\n")]);
            StubIndex::with_release(
                "v1.4.0",
                &[
                    (10, "orbit-v1.4.0-linux-x64.tar.gz", cli),
                    (11, "orbitd-v1.4.0-linux-x64.tar.gz", daemon),
                ],
            )
        }

        fn host<'a>(&'a self, spawner: &'a FakeSpawner, control: &'a FakeControl) -> Host<'a> {
            Host {
                runner: &self.runner,
                spawner,
                control,
                store: &self.store,
                files: &self.files,
            }
        }

        fn read(&self, name: &str) -> String {
            fs::read_to_string(self.dir.path().join(name)).unwrap_or_default()
        }
    }

    fn linux_x64() -> Target {
        Target::parse("linux", "x64").unwrap()
    }

    #[test]
    fn setup_installs_launches_and_signals_job_start() {
        let fx = Fixture::new();
        let index = fx.index();
        let spawner = FakeSpawner::new(Some(Duration::ZERO), None);
        let control = FakeControl::new(true, None);

        let report = setup(&fx.cfg, &index, &NoJobs, linux_x64(), &fx.host(&spawner, &control))
            .unwrap();

        let bin = fx.dir.path().join("bin");
        assert_eq!(report.version, "v1.4.0");
        assert_eq!(report.binary_path, bin);
        assert_eq!(report.pid, 4321);
        assert!(report.job_start_sent);
        assert_eq!(report.job_id, None);

        let commands = spawner.commands.borrow();
        assert_eq!(commands[0].program, bin.join("orbitd"));
        assert_eq!(
            commands[0].args[..3],
            [
                format!("-client-bin-path={}", bin.join("orbit").display()),
                "-server-addr=localhost:5000".to_string(),
                "-log-level=1".to_string(),
            ]
        );
        assert_eq!(commands[0].env[API_TOKEN_ENV], "api-secret");

        assert_eq!(fx.store.load_pid(StateKey::DaemonPid).unwrap(), Some(4321));
        assert_eq!(
            fx.store.load(StateKey::Version).unwrap().as_deref(),
            Some("v1.4.0")
        );
        let calls = fx.runner.calls();
        assert_eq!(calls[0].program, bin.join("orbit"));
        assert_eq!(calls[0].args, vec!["event", "job-start"]);
        assert_eq!(calls[0].env_overrides[API_TOKEN_ENV], "api-secret");

        let outputs = fx.read("github_output");
        assert!(outputs.contains("version=v1.4.0\n"));
        assert!(outputs.contains(&format!("binary_path={}\n", bin.display())));
        assert!(outputs.contains("pid=4321\n"));
        assert_eq!(fx.read("github_path"), format!("{}\n", bin.display()));
        assert!(control.sent().is_empty());
    }

    #[test]
    fn setup_without_api_token_fails_before_any_release_call() {
        let mut fx = Fixture::new();
        fx.cfg.api_token = String::new();
        let index = fx.index();
        let spawner = FakeSpawner::new(Some(Duration::ZERO), None);
        let control = FakeControl::new(true, None);
        let err = setup(&fx.cfg, &index, &NoJobs, linux_x64(), &fx.host(&spawner, &control))
            .unwrap_err();
        assert_eq!(err.stage(), "config");
        assert_eq!(index.calls.get(), 0);
        assert_eq!(spawner.spawned.get(), 0);
    }

    #[test]
    fn early_daemon_exit_fails_setup_and_records_nothing() {
        let fx = Fixture::new();
        let index = fx.index();
        let spawner = FakeSpawner::new(None, Some((Duration::ZERO, ExitReason::Code(137))));
        let control = FakeControl::new(true, None);
        let err = setup(&fx.cfg, &index, &NoJobs, linux_x64(), &fx.host(&spawner, &control))
            .unwrap_err();
        assert_eq!(err.stage(), "launch");
        assert!(err.to_string().contains("exited with code 137"));
        assert_eq!(fx.store.load(StateKey::DaemonPid).unwrap(), None);
        assert!(fx.runner.calls().is_empty());
    }

    #[test]
    fn job_start_failure_is_only_a_warning() {
        let fx = Fixture::new();
        fx.runner.push_output(1, "", "connection refused");
        let index = fx.index();
        let spawner = FakeSpawner::new(Some(Duration::ZERO), None);
        let control = FakeControl::new(true, None);
        let report = setup(&fx.cfg, &index, &NoJobs, linux_x64(), &fx.host(&spawner, &control))
            .unwrap();
        assert!(!report.job_start_sent);
        assert_eq!(fx.store.load_pid(StateKey::DaemonPid).unwrap(), Some(4321));
    }

    #[test]
    fn missing_asset_stops_setup_before_launch() {
        let fx = Fixture::new();
        let mut index = fx.index();
        index.releases[0]
            .assets
            .retain(|asset| !asset.name.starts_with("orbitd-"));
        let spawner = FakeSpawner::new(Some(Duration::ZERO), None);
        let control = FakeControl::new(true, None);
        let err = setup(&fx.cfg, &index, &NoJobs, linux_x64(), &fx.host(&spawner, &control))
            .unwrap_err();
        assert_eq!(err.stage(), "resolve");
        assert_eq!(
            err.to_string(),
            "required asset not found: orbitd-v1.4.0-linux-x64.tar.gz"
        );
        assert_eq!(spawner.spawned.get(), 0);
    }

    #[test]
    fn teardown_signals_job_end_then_stops_the_daemon() {
        let fx = Fixture::new();
        fx.store.save(StateKey::DaemonPid, "4321").unwrap();
        fx.store
            .save(StateKey::DaemonStartedAt, "2026-03-01T10:00:00+00:00")
            .unwrap();
        fx.store.save(StateKey::JobId, "991").unwrap();
        let spawner = FakeSpawner::new(None, None);
        let control = FakeControl::new(true, Some(Duration::ZERO));

        let report = teardown(&fx.cfg, &fx.host(&spawner, &control));

        assert!(report.job_end_sent);
        assert_eq!(report.daemon_pid, Some(4321));
        assert_eq!(
            report.daemon_started_at.map(|at| at.to_rfc3339()).as_deref(),
            Some("2026-03-01T10:00:00+00:00")
        );
        assert_eq!(report.daemon, Some("confirmed"));
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(control.sent(), vec![Signal::Terminate]);
        assert_eq!(
            fx.runner.calls()[0].args,
            vec![
                "event",
                "fire",
                "job-end",
                "--job-id",
                "991",
                "--server-addr",
                "localhost:5000",
                "--token",
                "api-secret"
            ]
        );
        assert_eq!(fx.store.load(StateKey::JobId).unwrap(), None);
        assert_eq!(
            fx.runner.calls()[0].env_overrides[API_TOKEN_ENV],
            "api-secret"
        );
    }

    #[test]
    fn teardown_without_state_warns_and_still_signals() {
        let fx = Fixture::new();
        let spawner = FakeSpawner::new(None, None);
        let control = FakeControl::new(false, None);
        let report = teardown(&fx.cfg, &fx.host(&spawner, &control));
        assert_eq!(report.daemon, Some("not_found"));
        assert_eq!(report.warnings, vec!["no Orbit daemon pid found"]);
        assert_eq!(fx.runner.calls()[0].args, vec!["event", "job-end"]);
        assert!(control.sent().is_empty());
    }

    #[test]
    fn failed_job_end_does_not_block_shutdown() {
        let fx = Fixture::new();
        fx.store.save(StateKey::DaemonPid, "4321").unwrap();
        fx.runner.push_spawn_error(io::ErrorKind::NotFound);
        let spawner = FakeSpawner::new(None, None);
        let control = FakeControl::new(true, None);
        let report = teardown(&fx.cfg, &fx.host(&spawner, &control));
        assert!(!report.job_end_sent);
        assert_eq!(report.daemon, Some("force_killed"));
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("Failed to send job end event"));
        assert_eq!(fx.store.load(StateKey::DaemonPid).unwrap(), None);
    }

    #[test]
    fn teardown_stops_a_recorded_event_server() {
        let fx = Fixture::new();
        fx.store.save(StateKey::ServerPid, "5150").unwrap();
        let spawner = FakeSpawner::new(None, None);
        let control = FakeControl::new(false, None);
        let report = teardown(&fx.cfg, &fx.host(&spawner, &control));
        assert_eq!(report.server, Some("already_gone"));
        let calls = fx.runner.calls();
        assert_eq!(calls[1].args, vec!["server", "stop"]);
        assert_eq!(control.signals.borrow()[0], (5150, false, Signal::Terminate));
    }

    #[test]
    fn shutdown_twice_is_harmless() {
        let fx = Fixture::new();
        fx.store.save(StateKey::DaemonPid, "4321").unwrap();
        fx.store
            .save(StateKey::DaemonStartedAt, "2026-03-01T10:00:00+00:00")
            .unwrap();
        let spawner = FakeSpawner::new(None, None);
        let control = FakeControl::new(true, Some(Duration::ZERO));
        let first = shutdown_daemon(&fx.cfg, &fx.host(&spawner, &control));
        assert_eq!(first.daemon, Some("confirmed"));
        assert!(first.daemon_started_at.is_some());
        assert_eq!(fx.store.load(StateKey::DaemonPid).unwrap(), None);
        assert_eq!(fx.store.load(StateKey::DaemonStartedAt).unwrap(), None);
        let second = shutdown_daemon(&fx.cfg, &fx.host(&spawner, &control));
        assert_eq!(second.daemon, Some("not_found"));
        assert!(second.warnings.is_empty());
        assert!(fx.runner.calls().is_empty());
    }

    #[test]
    fn download_exports_outputs_without_launching() {
        let fx = Fixture::new();
        let index = fx.index();
        let report = download(&fx.cfg, &index, linux_x64(), &fx.files).unwrap();
        assert_eq!(report.version, "v1.4.0");
        assert!(report.files.contains(&fx.dir.path().join("bin/orbitd")));
        assert!(fx.read("github_output").contains("version=v1.4.0\n"));
        assert!(!fx.read("github_output").contains("pid="));
    }

    #[test]
    fn resolve_lists_assets_for_latest() {
        let fx = Fixture::new();
        let index = fx.index();
        let report = resolve_release(&fx.cfg, &index, linux_x64()).unwrap();
        assert_eq!(report.version, "v1.4.0");
        assert_eq!(report.target, "linux-x64");
        assert_eq!(
            report.assets,
            vec![
                "orbit-v1.4.0-linux-x64.tar.gz",
                "orbitd-v1.4.0-linux-x64.tar.gz"
            ]
        );
    }

    #[test]
    fn daemon_command_honours_daemon_options() {
        let mut cfg = Config::default();
        cfg.daemon.debug = false;
        cfg.daemon.ci_provider = "github".to_string();
        cfg.daemon.token_in_args = true;
        cfg.daemon.extra_args = vec!["-metrics".to_string()];
        let command = daemon_command(&cfg, Path::new("/b/orbitd"), Path::new("/b/orbit"), "t0k");
        assert_eq!(
            command.args,
            vec![
                "-client-bin-path=/b/orbit",
                "-server-addr=localhost:5000",
                "-log-level=1",
                "-log-file=/var/log/orbitd.log",
                "-ci-provider=github",
                "-api-token=t0k",
                "-metrics",
            ]
        );
        assert!(command.privileged);
        assert_eq!(command.log_file, PathBuf::from("/var/log/orbitd.log"));
    }
}
