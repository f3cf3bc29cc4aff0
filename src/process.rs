use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

pub trait CommandRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        env_overrides: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, io::Error>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        env_overrides: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        let output = cmd.output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Locates `name` on `PATH`, falling back to the bare name so the spawn
/// error names the missing program.
pub fn find_program(name: &str) -> PathBuf {
    which::which(name).unwrap_or_else(|_| PathBuf::from(name))
}

pub fn elevate(
    privileged: bool,
    sudo_flags: &[&str],
    program: &Path,
    args: Vec<String>,
) -> (PathBuf, Vec<String>) {
    if !privileged {
        return (program.to_path_buf(), args);
    }
    let mut wrapped: Vec<String> = sudo_flags.iter().map(|flag| flag.to_string()).collect();
    wrapped.push(program.to_string_lossy().to_string());
    wrapped.extend(args);
    (find_program("sudo"), wrapped)
}
