//! Launches external processes with captured output.
//!
//! Every service started during boot gets its stdout and stderr appended to
//! a per-service log file under the diagnostics directory. Capturing to
//! files rather than pipes keeps long-lived background services from ever
//! blocking on a full pipe buffer once the orchestrator stops reading, and
//! lets diagnostic records quote the output after the fact.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use thiserror::Error;
use tracing::{debug, warn};

use bimstrap_config::DiagnosticsPaths;

/// Tracing target for launcher operations.
pub(crate) const LAUNCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::launcher");

/// Upper bound on the captured output quoted into diagnostic records.
const CAPTURE_TAIL_BYTES: usize = 16 * 1024;

/// One concrete way to invoke a service: command, arguments, environment
/// overrides, and working directory.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Creates a spec for the given program and arguments.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Adds an environment override applied on top of the inherited
    /// environment.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory for the launched process.
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program name as declared.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Declared arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Declared environment overrides.
    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Declared working directory, if any.
    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Renders the invocation for diagnostics, e.g. `Xvfb :99 -screen 0 …`.
    pub fn rendered(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

/// Errors surfaced while creating a process.
///
/// The two variants matter to fallback handling only through diagnostics:
/// both mean "try the next candidate", but operators need to know whether
/// the executable was absent or the OS refused to create the process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The executable could not be found.
    #[error("executable '{program}' not found")]
    NotFound {
        /// Program that failed to resolve.
        program: String,
    },
    /// The operating system refused to create the process.
    #[error("failed to spawn '{program}': {source}")]
    Refused {
        /// Program that failed to spawn.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// Handle to a launched process, exclusively owned by the stage that
/// created it.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    child: Child,
    output_path: PathBuf,
}

impl ProcessHandle {
    /// OS process identifier.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Service name the handle was launched under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Polls the exit status without blocking.
    pub fn try_exit_status(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Kills the process and reaps it. Errors are logged rather than
    /// surfaced: the process may already have exited, and cleanup must not
    /// derail the boot sequence that triggered it.
    pub fn terminate(&mut self) {
        if let Err(error) = self.child.kill() {
            if error.kind() != io::ErrorKind::InvalidInput {
                warn!(
                    target: LAUNCH_TARGET,
                    service = %self.name,
                    pid = self.child.id(),
                    %error,
                    "failed to kill process"
                );
            }
        }
        if let Err(error) = self.child.wait() {
            warn!(
                target: LAUNCH_TARGET,
                service = %self.name,
                pid = self.child.id(),
                %error,
                "failed to reap process"
            );
        }
    }

    /// Reads the tail of the captured output for diagnostics.
    pub fn captured_output(&self) -> String {
        read_output_tail(&self.output_path)
    }

    /// Promotes the process to a fire-and-forget background service. The
    /// orchestrator stops monitoring it; long-term supervision belongs to
    /// the container runtime.
    pub fn detach(self) {
        debug!(
            target: LAUNCH_TARGET,
            service = %self.name,
            pid = self.child.id(),
            "detaching background service"
        );
    }
}

fn read_output_tail(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim_end();
            let start = trimmed.len().saturating_sub(CAPTURE_TAIL_BYTES);
            let mut cut = start;
            while cut < trimmed.len() && !trimmed.is_char_boundary(cut) {
                cut += 1;
            }
            trimmed.get(cut..).unwrap_or_default().to_owned()
        }
        Err(error) => format!("<captured output unavailable: {error}>"),
    }
}

/// Starts named processes with their output captured under the diagnostics
/// directory. Never blocks beyond process creation.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    paths: DiagnosticsPaths,
}

impl ProcessLauncher {
    /// Creates a launcher writing captured output under the given paths.
    pub fn new(paths: DiagnosticsPaths) -> Self {
        Self { paths }
    }

    /// Launches the process described by `spec`, appending its stdout and
    /// stderr to the log file named after `service`.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::NotFound`] when the executable is absent and
    /// [`LaunchError::Refused`] when the OS rejects process creation.
    pub fn launch(&self, service: &str, spec: &CommandSpec) -> Result<ProcessHandle, LaunchError> {
        let output_path = self.paths.service_log_path(service);
        let (stdout, stderr) = capture_stdio(service, &output_path);

        let mut command = Command::new(spec.program());
        command
            .args(spec.args())
            .envs(spec.env_overrides())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(dir) = spec.working_dir() {
            command.current_dir(dir);
        }

        debug!(
            target: LAUNCH_TARGET,
            service,
            invocation = %spec.rendered(),
            "launching process"
        );

        let child = command.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                LaunchError::NotFound {
                    program: spec.program().to_owned(),
                }
            } else {
                LaunchError::Refused {
                    program: spec.program().to_owned(),
                    source,
                }
            }
        })?;

        Ok(ProcessHandle {
            name: service.to_owned(),
            child,
            output_path,
        })
    }
}

/// Opens the capture log twice, once per stream. Falls back to discarding
/// the output when the log cannot be opened: losing capture must not stop a
/// service from starting.
fn capture_stdio(service: &str, path: &Path) -> (Stdio, Stdio) {
    let opened = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|stdout| stdout.try_clone().map(|stderr| (stdout, stderr)));
    match opened {
        Ok((stdout, stderr)) => (Stdio::from(stdout), Stdio::from(stderr)),
        Err(error) => {
            warn!(
                target: LAUNCH_TARGET,
                service,
                path = %path.display(),
                %error,
                "failed to open capture log; discarding service output"
            );
            (Stdio::null(), Stdio::null())
        }
    }
}
