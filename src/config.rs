use crate::installer::RetryPolicy;
use crate::launcher::LaunchPolicy;
use crate::resolver::AssetLayout;
use crate::shutdown::ShutdownPolicy;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("{field} is required (set --{flag} or {env})")]
    Missing {
        field: &'static str,
        flag: &'static str,
        env: &'static str,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: String,
    pub github_token: String,
    pub api_token: String,
    pub server_addr: String,
    pub log_file: String,
    pub install_dir: String,
    pub state_dir: String,
    pub asset_layout: AssetLayout,
    pub privileged: bool,
    pub release: ReleaseSource,
    pub launch: LaunchConfig,
    pub shutdown: ShutdownConfig,
    pub install: InstallConfig,
    pub daemon: DaemonConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReleaseSource {
    pub owner: String,
    pub repo: String,
    pub api_base: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    pub spawn_timeout_ms: u64,
    pub ready_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
    pub poll_interval_ms: u64,
    pub process_group: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct InstallConfig {
    pub attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub log_level: u8,
    pub debug: bool,
    pub ci_provider: String,
    pub token_in_args: bool,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EventsConfig {
    pub server: bool,
    pub server_pid_file: String,
    pub runner_diag_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "latest".to_string(),
            github_token: String::new(),
            api_token: String::new(),
            server_addr: "localhost:5000".to_string(),
            log_file: "/var/log/orbitd.log".to_string(),
            install_dir: "./bin".to_string(),
            state_dir: String::new(),
            asset_layout: AssetLayout::default(),
            privileged: true,
            release: ReleaseSource::default(),
            launch: LaunchConfig::default(),
            shutdown: ShutdownConfig::default(),
            install: InstallConfig::default(),
            daemon: DaemonConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl Default for ReleaseSource {
    fn default() -> Self {
        Self {
            owner: "orbitci".to_string(),
            repo: "orbit-ebpf".to_string(),
            api_base: "https://api.github.com".to_string(),
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_ms: 5_000,
            ready_delay_ms: 5_000,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            poll_interval_ms: 500,
            process_group: true,
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_backoff_ms: 2_000,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: 1,
            debug: true,
            ci_provider: String::new(),
            token_in_args: false,
            extra_args: Vec::new(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            server: false,
            server_pid_file: "/tmp/orbit-server.pid".to_string(),
            runner_diag_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub version: Option<String>,
    pub github_token: Option<String>,
    pub api_token: Option<String>,
    pub server_addr: Option<String>,
    pub log_file: Option<String>,
    pub install_dir: Option<String>,
    pub state_dir: Option<String>,
}

pub fn read_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_config_from_str(&content)
}

pub fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<Config, ConfigError> {
    let mut cfg = match path {
        Some(path) => read_config(path)?,
        None => read_config_from_str(DEFAULT_CONFIG_YAML)?,
    };
    cfg.apply(overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
    if cfg.release.owner.trim().is_empty() {
        return invalid("release.owner must be non-empty");
    }
    if cfg.release.repo.trim().is_empty() {
        return invalid("release.repo must be non-empty");
    }
    if cfg.release.api_base.trim().is_empty() {
        return invalid("release.api_base must be non-empty");
    }
    if cfg.launch.spawn_timeout_ms == 0 {
        return invalid("launch.spawn_timeout_ms must be greater than 0");
    }
    if cfg.shutdown.grace_period_ms == 0 {
        return invalid("shutdown.grace_period_ms must be greater than 0");
    }
    if cfg.shutdown.poll_interval_ms == 0 {
        return invalid("shutdown.poll_interval_ms must be greater than 0");
    }
    if cfg.install.attempts == 0 {
        return invalid("install.attempts must be greater than 0");
    }
    if cfg.log_file.trim().is_empty() {
        return invalid("log_file must be non-empty");
    }
    if cfg.install_dir.trim().is_empty() {
        return invalid("install_dir must be non-empty");
    }
    if cfg.server_addr.contains(char::is_whitespace) {
        return invalid("server_addr must not contain whitespace");
    }
    Ok(())
}

pub fn expand_path(input: &str) -> PathBuf {
    if input == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    }
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn apply(&mut self, overrides: &Overrides) {
        let fields = [
            (&overrides.version, &mut self.version),
            (&overrides.github_token, &mut self.github_token),
            (&overrides.api_token, &mut self.api_token),
            (&overrides.server_addr, &mut self.server_addr),
            (&overrides.log_file, &mut self.log_file),
            (&overrides.install_dir, &mut self.install_dir),
            (&overrides.state_dir, &mut self.state_dir),
        ];
        for (value, slot) in fields {
            if let Some(value) = non_empty(value) {
                *slot = value.to_string();
            }
        }
    }

    pub fn require_github_token(&self) -> Result<&str, ConfigError> {
        required(&self.github_token, "github_token", "github-token", "INPUT_GITHUB_TOKEN")
    }

    pub fn require_api_token(&self) -> Result<&str, ConfigError> {
        required(&self.api_token, "api_token", "api-token", "INPUT_API_TOKEN")
    }

    pub fn install_dir_path(&self) -> PathBuf {
        expand_path(&self.install_dir)
    }

    pub fn log_file_path(&self) -> PathBuf {
        expand_path(&self.log_file)
    }

    pub fn server_pid_file(&self) -> PathBuf {
        expand_path(&self.events.server_pid_file)
    }

    pub fn runner_diag_dir(&self) -> Option<PathBuf> {
        let dir = self.events.runner_diag_dir.trim();
        (!dir.is_empty()).then(|| expand_path(dir))
    }

    /// Configured state dir, else `$RUNNER_TEMP`, else the system temp dir.
    pub fn state_dir_path(&self) -> PathBuf {
        if !self.state_dir.trim().is_empty() {
            return expand_path(&self.state_dir);
        }
        match env::var("RUNNER_TEMP") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => env::temp_dir(),
        }
    }

    pub fn launch_policy(&self) -> LaunchPolicy {
        LaunchPolicy {
            spawn_timeout: Duration::from_millis(self.launch.spawn_timeout_ms),
            ready_delay: Duration::from_millis(self.launch.ready_delay_ms),
            poll_interval: LAUNCH_POLL_INTERVAL,
        }
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            grace_period: Duration::from_millis(self.shutdown.grace_period_ms),
            poll_interval: Duration::from_millis(self.shutdown.poll_interval_ms),
            process_group: self.shutdown.process_group,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.install.attempts,
            backoff: Duration::from_millis(self.install.retry_backoff_ms),
        }
    }
}

fn required<'a>(
    value: &'a str,
    field: &'static str,
    flag: &'static str,
    env: &'static str,
) -> Result<&'a str, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Missing { field, flag, env });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_yaml_matches_default_struct() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = read_config_from_str(
            "version: v1.2.0\nasset_layout: combined\nshutdown:\n  grace_period_ms: 1000\n",
        )
        .unwrap();
        assert_eq!(cfg.version, "v1.2.0");
        assert_eq!(cfg.asset_layout, AssetLayout::Combined);
        assert_eq!(cfg.shutdown.grace_period_ms, 1000);
        assert_eq!(cfg.shutdown.poll_interval_ms, 500);
        assert_eq!(cfg.release.owner, "orbitci");
        assert!(cfg.privileged);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = read_config_from_str("launch:\n  spawn_timeout: 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("spawn_timeout"));
    }

    #[test]
    fn zero_limits_are_rejected() {
        for yaml in [
            "launch:\n  spawn_timeout_ms: 0\n",
            "shutdown:\n  grace_period_ms: 0\n",
            "shutdown:\n  poll_interval_ms: 0\n",
            "install:\n  attempts: 0\n",
            "release:\n  owner: ' '\n",
        ] {
            assert!(
                matches!(read_config_from_str(yaml), Err(ConfigError::Invalid(_))),
                "{yaml}"
            );
        }
    }

    #[test]
    fn overrides_replace_only_non_empty_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sidecar.yaml");
        fs::write(&path, "api_token: from-file\nserver_addr: 10.0.0.1:9000\n").unwrap();
        let overrides = Overrides {
            version: Some("v2.0.0".to_string()),
            api_token: Some(String::new()),
            server_addr: Some("127.0.0.1:7000".to_string()),
            ..Overrides::default()
        };
        let cfg = load_config(Some(&path), &overrides).unwrap();
        assert_eq!(cfg.version, "v2.0.0");
        assert_eq!(cfg.api_token, "from-file");
        assert_eq!(cfg.server_addr, "127.0.0.1:7000");
    }

    #[test]
    fn missing_tokens_name_the_flag_and_variable() {
        let cfg = Config::default();
        let err = cfg.require_api_token().unwrap_err();
        assert_eq!(
            err.to_string(),
            "api_token is required (set --api-token or INPUT_API_TOKEN)"
        );
        assert!(cfg.require_github_token().is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.yaml")), &Overrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = home_dir() {
            assert_eq!(expand_path("~/orbit/bin"), home.join("orbit/bin"));
        }
        assert_eq!(expand_path("./bin"), PathBuf::from("./bin"));
    }

    #[test]
    fn policies_follow_config() {
        let mut cfg = Config::default();
        cfg.shutdown.process_group = false;
        cfg.launch.ready_delay_ms = 0;
        let shutdown = cfg.shutdown_policy();
        assert_eq!(shutdown.grace_period, Duration::from_secs(5));
        assert!(!shutdown.process_group);
        assert_eq!(cfg.launch_policy().ready_delay, Duration::ZERO);
        assert_eq!(cfg.retry_policy().attempts, 3);
        assert_eq!(cfg.runner_diag_dir(), None);
    }
}
