//! Bounded liveness probing for launched services.
//!
//! A probe answers one question: did this process become ready to serve its
//! role within the allotted window? Three verdicts are possible, not two. A
//! process that exited before signalling readiness is `Crashed` and the
//! caller moves on immediately; a process that is still running but silent
//! is `NotReady` only once the whole window has elapsed. Polling happens at
//! a bounded cadence, never in a busy loop.

use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use bimstrap_config::Config;

use crate::launcher::ProcessHandle;

/// Tracing target for probe operations.
pub(crate) const PROBE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::probe");

/// Connection timeout for a single TCP readiness check.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-stage readiness signal, declared as deployment configuration.
#[derive(Debug, Clone)]
pub enum ReadinessSignal {
    /// A local TCP port accepts connections.
    TcpPort(u16),
    /// A recognisable marker appears in the captured output.
    OutputMarker(String),
    /// A filesystem artefact appears, e.g. the X display socket.
    PathExists(PathBuf),
    /// The process itself completes with status zero. Used by one-shot
    /// stages that finish rather than serve.
    CleanExit,
}

/// Probe verdict for one liveness window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The readiness signal appeared within the window.
    Ready,
    /// The process is still running but never signalled readiness.
    NotReady,
    /// The process exited before signalling readiness.
    Crashed {
        /// Exit code, when the OS reported one.
        status: Option<i32>,
    },
}

impl ProbeVerdict {
    /// Renders the verdict for diagnostic records.
    pub fn describe(&self) -> String {
        match self {
            Self::Ready => "ready".to_owned(),
            Self::NotReady => "not ready before timeout".to_owned(),
            Self::Crashed { status: Some(code) } => format!("crashed (exit code {code})"),
            Self::Crashed { status: None } => "crashed (killed by signal)".to_owned(),
        }
    }
}

/// Time budget for one liveness window.
#[derive(Debug, Clone, Copy)]
pub struct ProbeBudget {
    timeout: Duration,
    poll_interval: Duration,
}

impl ProbeBudget {
    /// Creates a budget from an explicit timeout and polling cadence.
    pub const fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    /// Derives the budget from the shared configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.probe_timeout(), config.poll_interval())
    }

    /// Total liveness window.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Probes the process until the signal appears, the process exits, or the
/// budget runs out.
///
/// Re-probing after a `Ready` verdict within the same liveness window yields
/// `Ready` again: an open port stays connectable, a written marker stays in
/// the log, and a clean exit status is reported repeatedly by the OS.
pub fn probe(
    handle: &mut ProcessHandle,
    signal: &ReadinessSignal,
    budget: ProbeBudget,
) -> ProbeVerdict {
    let deadline = Instant::now() + budget.timeout;
    loop {
        match handle.try_exit_status() {
            Ok(Some(status)) => {
                let verdict = if ready_after_exit(handle, signal, &status) {
                    ProbeVerdict::Ready
                } else {
                    ProbeVerdict::Crashed {
                        status: status.code(),
                    }
                };
                debug!(
                    target: PROBE_TARGET,
                    service = handle.name(),
                    verdict = %verdict.describe(),
                    "process exited during liveness window"
                );
                return verdict;
            }
            Ok(None) => {}
            Err(error) => {
                warn!(
                    target: PROBE_TARGET,
                    service = handle.name(),
                    %error,
                    "failed to poll exit status"
                );
                return ProbeVerdict::Crashed { status: None };
            }
        }

        if signal_present(handle, signal) {
            return ProbeVerdict::Ready;
        }
        if Instant::now() >= deadline {
            return ProbeVerdict::NotReady;
        }
        thread::sleep(budget.poll_interval);
    }
}

fn signal_present(handle: &ProcessHandle, signal: &ReadinessSignal) -> bool {
    match signal {
        ReadinessSignal::TcpPort(port) => port_accepting(*port),
        ReadinessSignal::OutputMarker(marker) => handle.captured_output().contains(marker),
        ReadinessSignal::PathExists(path) => path.exists(),
        // Only the exit status itself proves readiness for one-shot stages.
        ReadinessSignal::CleanExit => false,
    }
}

/// Whether an exit observed during the window still counts as readiness.
///
/// Only evidence produced by the process itself qualifies: a clean exit
/// status, or a marker it wrote to its own captured output. A port or
/// filesystem artefact found after the process died may be a stale leftover
/// of an earlier instance, so for those signals the exit is a crash.
fn ready_after_exit(handle: &ProcessHandle, signal: &ReadinessSignal, status: &ExitStatus) -> bool {
    match signal {
        ReadinessSignal::CleanExit => status.success(),
        ReadinessSignal::OutputMarker(marker) => handle.captured_output().contains(marker),
        ReadinessSignal::TcpPort(_) | ReadinessSignal::PathExists(_) => false,
    }
}

fn port_accepting(port: u16) -> bool {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&address, CONNECT_TIMEOUT).is_ok()
}
