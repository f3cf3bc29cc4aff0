use crate::config::ConfigError;
use crate::events::SignalError;
use crate::installer::InstallError;
use crate::launcher::LaunchError;
use crate::outputs::OutputError;
use crate::release::IndexError;
use crate::resolver::ResolveError;
use crate::shutdown::ShutdownError;
use crate::state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    #[error(transparent)]
    State(#[from] StateError),
}

impl SidecarError {
    pub fn stage(&self) -> &'static str {
        match self {
            SidecarError::Config(_) => "config",
            SidecarError::Index(_) | SidecarError::Resolve(_) => "resolve",
            SidecarError::Install(_) | SidecarError::Output(_) => "install",
            SidecarError::Launch(_) => "launch",
            SidecarError::Signal(_) => "signal",
            SidecarError::Shutdown(_) => "shutdown",
            SidecarError::State(_) => "state",
        }
    }
}
