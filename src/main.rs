use clap::{Parser, Subcommand};
use orbit_sidecar::config::{load_config, Config, Overrides};
use orbit_sidecar::github::GithubClient;
use orbit_sidecar::launcher::SystemSpawner;
use orbit_sidecar::logging::{self, LogFormat};
use orbit_sidecar::outputs::PipelineFiles;
use orbit_sidecar::phases::{self, Host};
use orbit_sidecar::process::SystemRunner;
use orbit_sidecar::resolver::{ResolveError, Target};
use orbit_sidecar::shutdown::KillCommand;
use orbit_sidecar::state::FileStateStore;
use orbit_sidecar::SidecarError;
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use tracing::{error, warn};

#[derive(Parser, Debug)]
#[command(
    name = "orbit-sidecar",
    version,
    about = "Runs the Orbit CI agent alongside a pipeline job"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long = "log-format", global = true, value_enum, default_value_t = LogFormat::Workflow)]
    log_format: LogFormat,
    /// Release tag to install, or "latest".
    #[arg(long = "agent-version", global = true, env = "INPUT_VERSION")]
    agent_version: Option<String>,
    #[arg(long, global = true, env = "INPUT_GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,
    #[arg(long, global = true, env = "INPUT_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,
    #[arg(long, global = true, env = "INPUT_SERVER_ADDR")]
    server_addr: Option<String>,
    #[arg(long, global = true, env = "INPUT_LOG_FILE")]
    log_file: Option<PathBuf>,
    #[arg(long, global = true)]
    install_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true, hide = true)]
    platform: Option<String>,
    #[arg(long, global = true, hide = true)]
    arch: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Install the agent, start the daemon and signal job start.
    Setup,
    /// Signal job end and stop the daemon. Failures are warnings.
    Teardown,
    /// Install the agent binaries without starting anything.
    Download,
    /// Stop the recorded daemon without signaling job end.
    Shutdown,
    /// Print the release tag and asset names that would be installed.
    Resolve,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'static str>,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.json);

    if let Err(err) = run(&cli) {
        if cli.json {
            print_json(&JsonResult::<()> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                stage: Some(err.stage()),
            });
        } else {
            error!("{} failed: {err}", err.stage());
        }
        std::process::exit(1);
    }
}

fn overrides(cli: &Cli) -> Overrides {
    let path = |value: &Option<PathBuf>| {
        value
            .as_ref()
            .map(|path| path.to_string_lossy().to_string())
    };
    Overrides {
        version: cli.agent_version.clone(),
        github_token: cli.github_token.clone(),
        api_token: cli.api_token.clone(),
        server_addr: cli.server_addr.clone(),
        log_file: path(&cli.log_file),
        install_dir: path(&cli.install_dir),
        state_dir: path(&cli.state_dir),
    }
}

fn target(cli: &Cli) -> Result<Target, ResolveError> {
    if cli.platform.is_none() && cli.arch.is_none() {
        return Target::host();
    }
    Target::parse(
        cli.platform.as_deref().unwrap_or(env::consts::OS),
        cli.arch.as_deref().unwrap_or(env::consts::ARCH),
    )
}

/// Cleanup commands must not fail on a bad config file.
fn lenient_config(cli: &Cli, overrides: &Overrides) -> Config {
    match load_config(cli.config.as_deref(), overrides) {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!("{err}; continuing with default configuration");
            let mut cfg = Config::default();
            cfg.apply(overrides);
            cfg
        }
    }
}

fn with_host<T>(cfg: &Config, run: impl FnOnce(&Host<'_>) -> T) -> T {
    let runner = SystemRunner;
    let control = KillCommand::new(&runner, cfg.privileged);
    let store = FileStateStore::in_dir(&cfg.state_dir_path());
    let files = PipelineFiles::from_env();
    let host = Host {
        runner: &runner,
        spawner: &SystemSpawner,
        control: &control,
        store: &store,
        files: &files,
    };
    run(&host)
}

fn run(cli: &Cli) -> Result<(), SidecarError> {
    let overrides = overrides(cli);
    match cli.command {
        Commands::Setup => {
            let cfg = load_config(cli.config.as_deref(), &overrides)?;
            let target = target(cli)?;
            let client = GithubClient::new(&cfg.release, cfg.require_github_token()?)?;
            let report =
                with_host(&cfg, |host| phases::setup(&cfg, &client, &client, target, host))?;
            output(cli.json, &report);
        }
        Commands::Download => {
            let cfg = load_config(cli.config.as_deref(), &overrides)?;
            let target = target(cli)?;
            let client = GithubClient::new(&cfg.release, cfg.require_github_token()?)?;
            let files = PipelineFiles::from_env();
            let report = phases::download(&cfg, &client, target, &files)?;
            output(cli.json, &report);
        }
        Commands::Resolve => {
            let cfg = load_config(cli.config.as_deref(), &overrides)?;
            let target = target(cli)?;
            let client = GithubClient::new(&cfg.release, cfg.github_token.trim())?;
            let report = phases::resolve_release(&cfg, &client, target)?;
            output(cli.json, &report);
        }
        Commands::Teardown => {
            let cfg = lenient_config(cli, &overrides);
            let report = with_host(&cfg, |host| phases::teardown(&cfg, host));
            output(cli.json, &report);
        }
        Commands::Shutdown => {
            let cfg = lenient_config(cli, &overrides);
            let report = with_host(&cfg, |host| phases::shutdown_daemon(&cfg, host));
            output(cli.json, &report);
        }
    }
    Ok(())
}

fn output<T: Serialize>(json: bool, result: &T) {
    if json {
        print_json(&JsonResult {
            ok: true,
            result: Some(result),
            error: None,
            stage: None,
        });
    } else {
        match serde_json::to_string(result) {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("failed to encode result: {err}"),
        }
    }
}

fn print_json<T: Serialize>(payload: &T) {
    match serde_json::to_string_pretty(payload) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("failed to encode result: {err}"),
    }
}
