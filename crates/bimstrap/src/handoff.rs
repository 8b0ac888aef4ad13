//! Terminal handoff to the primary server.
//!
//! The orchestrator's last act is to become the primary server: on Unix the
//! process image is replaced outright, so the server inherits the
//! entrypoint's PID and the container supervisor keeps watching the same
//! process. On platforms without `exec` the server is spawned and waited
//! on, and the orchestrator exits with the child's status only after the
//! child terminates.

use std::io;

use thiserror::Error;
use tracing::info;

use crate::launcher::CommandSpec;

/// Tracing target for handoff operations.
pub(crate) const HANDOFF_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::handoff");

/// Transfers control to the primary server.
///
/// The production implementation is [`ExecHandoff`]. Test code implements
/// this trait to observe the invocation without giving up the test process.
pub trait Handoff {
    /// Hands control to the process described by `spec`.
    ///
    /// On Unix this only returns on failure: success replaces the process
    /// image. The `Ok` value is the exit code the orchestrator should
    /// terminate with where a return is possible at all.
    ///
    /// # Errors
    ///
    /// Returns a [`HandoffError`] when the primary server could not be
    /// started or the process image could not be replaced.
    fn execute(&self, spec: &CommandSpec) -> Result<u8, HandoffError>;
}

/// Errors surfaced while handing off to the primary server.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The invocation contained bytes the OS cannot accept.
    #[error("invalid primary server invocation: {detail}")]
    InvalidInvocation {
        /// Description of the offending component.
        detail: String,
    },
    /// Switching to the configured working directory failed.
    #[error("failed to enter working directory '{path}': {source}")]
    WorkingDirectory {
        /// Directory that could not be entered.
        path: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Replacing the process image failed.
    #[error("failed to replace process image with '{program}': {source}")]
    Exec {
        /// Program that failed to exec.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Spawning the primary server failed (non-exec platforms).
    #[error("failed to start '{program}': {source}")]
    Spawn {
        /// Program that failed to spawn.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Waiting on the primary server failed (non-exec platforms).
    #[error("failed to wait for '{program}': {source}")]
    Wait {
        /// Program that failed to report a status.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Production handoff performing true process replacement where available.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecHandoff;

#[cfg(unix)]
impl Handoff for ExecHandoff {
    fn execute(&self, spec: &CommandSpec) -> Result<u8, HandoffError> {
        use std::ffi::CString;

        use nix::unistd::execvp;

        info!(
            target: HANDOFF_TARGET,
            invocation = %spec.rendered(),
            "replacing process image with primary server"
        );

        // The boot sequence is single-threaded and this is its terminal act,
        // so mutating the process environment before exec is sound.
        for (key, value) in spec.env_overrides() {
            unsafe { std::env::set_var(key, value) };
        }
        if let Some(dir) = spec.working_dir() {
            std::env::set_current_dir(dir).map_err(|source| HandoffError::WorkingDirectory {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let program = to_cstring(spec.program())?;
        let mut argv = Vec::with_capacity(spec.args().len() + 1);
        argv.push(program.clone());
        for arg in spec.args() {
            argv.push(to_cstring(arg)?);
        }

        match execvp(&program, &argv) {
            Ok(never) => match never {},
            Err(errno) => Err(HandoffError::Exec {
                program: spec.program().to_owned(),
                source: io::Error::from_raw_os_error(errno as i32),
            }),
        }
    }
}

#[cfg(not(unix))]
impl Handoff for ExecHandoff {
    fn execute(&self, spec: &CommandSpec) -> Result<u8, HandoffError> {
        use std::process::Command;

        info!(
            target: HANDOFF_TARGET,
            invocation = %spec.rendered(),
            "process replacement unavailable; spawning primary server"
        );

        let mut command = Command::new(spec.program());
        command.args(spec.args()).envs(spec.env_overrides());
        if let Some(dir) = spec.working_dir() {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|source| HandoffError::Spawn {
            program: spec.program().to_owned(),
            source,
        })?;
        let status = child.wait().map_err(|source| HandoffError::Wait {
            program: spec.program().to_owned(),
            source,
        })?;
        let code = status.code().unwrap_or(1);
        Ok(u8::try_from(code).unwrap_or(1))
    }
}

#[cfg(unix)]
fn to_cstring(value: &str) -> Result<std::ffi::CString, HandoffError> {
    std::ffi::CString::new(value).map_err(|_| HandoffError::InvalidInvocation {
        detail: format!("'{value}' contains an interior NUL byte"),
    })
}

#[cfg(test)]
mod tests {
    #![expect(clippy::expect_used, reason = "tests assert failure paths directly")]

    use super::*;

    #[cfg(unix)]
    #[test]
    fn interior_nul_is_rejected_before_exec() {
        let spec = CommandSpec::new("python3", vec!["bad\0arg".to_owned()]);
        let error = ExecHandoff
            .execute(&spec)
            .expect_err("invocation should be rejected");
        assert!(matches!(error, HandoffError::InvalidInvocation { .. }));
    }
}
