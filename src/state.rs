use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("state value for {key} is invalid: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKey {
    /// Process id of the launched daemon (also its process group id).
    DaemonPid,
    DaemonStartedAt,
    ServerPid,
    InstallDir,
    Version,
    /// Job id used for the job-start event, reused for job-end.
    JobId,
}

impl StateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::DaemonPid => "daemon_pid",
            StateKey::DaemonStartedAt => "daemon_started_at",
            StateKey::ServerPid => "server_pid",
            StateKey::InstallDir => "install_dir",
            StateKey::Version => "version",
            StateKey::JobId => "job_id",
        }
    }
}

pub trait StateStore {
    fn save(&self, key: StateKey, value: &str) -> Result<(), StateError>;
    /// `Ok(None)` when the key was never written.
    fn load(&self, key: StateKey) -> Result<Option<String>, StateError>;
    fn remove(&self, key: StateKey) -> Result<(), StateError>;
    fn clear(&self) -> Result<(), StateError>;

    fn load_pid(&self, key: StateKey) -> Result<Option<u32>, StateError> {
        match self.load(key)? {
            None => Ok(None),
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(pid) if pid > 0 => Ok(Some(pid)),
                _ => Err(StateError::InvalidValue {
                    key: key.as_str(),
                    value: raw,
                }),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonHandle {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub ready_confirmed: bool,
}

impl DaemonHandle {
    pub fn persist(&self, store: &dyn StateStore) -> Result<(), StateError> {
        store.save(StateKey::DaemonPid, &self.pid.to_string())?;
        store.save(StateKey::DaemonStartedAt, &self.started_at.to_rfc3339())
    }

    pub fn load(store: &dyn StateStore) -> Result<Option<Self>, StateError> {
        let Some(pid) = store.load_pid(StateKey::DaemonPid)? else {
            return Ok(None);
        };
        let started_at = store
            .load(StateKey::DaemonStartedAt)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(Some(Self {
            pid,
            started_at,
            ready_confirmed: true,
        }))
    }

    pub fn forget(store: &dyn StateStore) -> Result<(), StateError> {
        store.remove(StateKey::DaemonPid)?;
        store.remove(StateKey::DaemonStartedAt)
    }
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub const FILE_NAME: &'static str = "state.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("orbit-sidecar").join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(self.io_err(err)),
        };
        serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), StateError> {
        if values.is_empty() {
            return self.clear();
        }
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| self.io_err(err))?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let tmp_path = parent.join(format!(
            ".{}.tmp.{}.{}",
            Self::FILE_NAME,
            std::process::id(),
            nanos
        ));
        let body = serde_json::to_string_pretty(values).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        fs::write(&tmp_path, format!("{body}\n")).map_err(|err| self.io_err(err))?;
        fs::rename(&tmp_path, &self.path).map_err(|err| self.io_err(err))
    }
}

impl StateStore for FileStateStore {
    fn save(&self, key: StateKey, value: &str) -> Result<(), StateError> {
        let mut values = self.read_all()?;
        values.insert(key.as_str().to_string(), value.to_string());
        self.write_all(&values)
    }

    fn load(&self, key: StateKey) -> Result<Option<String>, StateError> {
        Ok(self.read_all()?.remove(key.as_str()))
    }

    fn remove(&self, key: StateKey) -> Result<(), StateError> {
        let mut values = self.read_all()?;
        if values.remove(key.as_str()).is_some() {
            self.write_all(&values)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StateError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_err(err)),
        }
    }
}
