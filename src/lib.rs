//! Supervisor for the Orbit CI agent: installs the `orbitd` daemon and its
//! `orbit` companion CLI from a GitHub release, runs the daemon for the
//! lifetime of a pipeline job, and stops it afterwards.

pub mod config;
pub mod error;
pub mod events;
pub mod github;
pub mod installer;
pub mod job_id;
pub mod launcher;
pub mod logging;
pub mod outputs;
pub mod phases;
pub mod process;
pub mod release;
pub mod resolver;
pub mod shutdown;
pub mod state;

pub use error::SidecarError;
