//! Forward-only sequencing of the boot stages.
//!
//! The sequencer runs each stage to a terminal outcome before the next one
//! begins, applies the stage's fatality policy when it fails, and finishes
//! by handing control to the primary server. There is no retry and no
//! rollback: the sequence runs exactly once per container lifetime, and a
//! fatal failure terminates the boot with that stage's exit code before any
//! later stage is started.

use thiserror::Error;
use tracing::{error, info, warn};

use crate::chain::{ChainError, FallbackChain};
use crate::diagnostics::{DiagnosticRecord, DiagnosticsSink};
use crate::handoff::Handoff;
use crate::launcher::{CommandSpec, LaunchError, ProcessLauncher};
use crate::probe::{ProbeBudget, ProbeVerdict, ReadinessSignal, probe};

/// Tracing target for sequencer operations.
pub(crate) const SEQUENCER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::sequencer");

/// Whether a stage's failure aborts the whole boot or is merely logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalityPolicy {
    /// Failure terminates the boot with the given exit code.
    Fatal {
        /// Process exit code identifying this stage to external schedulers.
        exit_code: u8,
    },
    /// Failure is recorded and the boot proceeds.
    Tolerated,
}

/// Startup action a stage performs.
#[derive(Debug, Clone)]
pub enum StageAction {
    /// Launch a long-lived service and promote it to the background once
    /// its readiness signal appears.
    Daemon {
        /// Invocation to launch.
        spec: CommandSpec,
        /// Readiness signal to wait for.
        signal: ReadinessSignal,
    },
    /// Run a process to completion; status zero within the window counts
    /// as success.
    OneShot {
        /// Invocation to run.
        spec: CommandSpec,
    },
    /// Resolve a fallback chain and promote the winning process.
    Resolve {
        /// Chain to resolve.
        chain: FallbackChain,
    },
}

/// One ordered step of the boot sequence.
#[derive(Debug, Clone)]
pub struct Stage {
    name: String,
    action: StageAction,
    policy: FatalityPolicy,
    budget: Option<ProbeBudget>,
}

impl Stage {
    /// Creates a stage with the shared probe budget.
    pub fn new(name: impl Into<String>, action: StageAction, policy: FatalityPolicy) -> Self {
        Self {
            name: name.into(),
            action,
            policy,
            budget: None,
        }
    }

    /// Overrides the liveness budget for this stage alone.
    #[must_use]
    pub const fn with_budget(mut self, budget: ProbeBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Stage name as it appears in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The action the stage performs.
    pub const fn action(&self) -> &StageAction {
        &self.action
    }

    /// The stage's fatality policy.
    pub const fn policy(&self) -> FatalityPolicy {
        self.policy
    }
}

/// The primary server the boot sequence exists to start.
#[derive(Debug, Clone)]
pub struct PrimaryServer {
    name: String,
    spec: CommandSpec,
    exit_code: u8,
}

impl PrimaryServer {
    /// Declares the primary server invocation and the exit code reported
    /// when the handoff itself fails.
    pub fn new(name: impl Into<String>, spec: CommandSpec, exit_code: u8) -> Self {
        Self {
            name: name.into(),
            spec,
            exit_code,
        }
    }

    /// Invocation handed to the handoff.
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}

/// Observable sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// No stage has run yet.
    NotStarted,
    /// The indexed stage is executing.
    RunningStage(usize),
    /// Every stage reached a terminal outcome without a fatal failure.
    Succeeded,
    /// A fatal-policy stage failed; the boot is over.
    FailedFatal,
}

/// Terminal outcome of the whole boot sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapResult {
    /// The primary server was launched. On Unix this value is only
    /// observable through test doubles, since the real handoff replaces the
    /// process image.
    Launched {
        /// Exit code the orchestrator should terminate with, where a
        /// return is possible.
        exit_code: u8,
    },
    /// A fatal stage failed before the primary server was started.
    FatalStageFailed {
        /// Stage that failed.
        stage: String,
        /// Stage-specific exit code.
        exit_code: u8,
    },
}

/// Ways a single stage can fail.
#[derive(Debug, Error)]
pub enum StageFailure {
    /// The stage's process could not be created.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// The process stayed alive but never signalled readiness.
    #[error("not ready within {timeout_secs}s")]
    NotReady {
        /// Liveness window that elapsed.
        timeout_secs: u64,
    },
    /// The process exited before signalling readiness.
    #[error("exited before readiness (status {status:?})")]
    Crashed {
        /// Exit code, when the OS reported one.
        status: Option<i32>,
    },
    /// Every candidate in the stage's chain failed.
    #[error(transparent)]
    Exhausted(#[from] ChainError),
}

/// Drives the boot stages in order and performs the final handoff.
#[derive(Debug)]
pub struct BootstrapSequencer<H> {
    stages: Vec<Stage>,
    primary: PrimaryServer,
    budget: ProbeBudget,
    handoff: H,
    state: SequencerState,
}

impl<H> BootstrapSequencer<H> {
    /// Creates a sequencer over the given stages and primary server.
    pub const fn new(
        stages: Vec<Stage>,
        primary: PrimaryServer,
        budget: ProbeBudget,
        handoff: H,
    ) -> Self {
        Self {
            stages,
            primary,
            budget,
            handoff,
            state: SequencerState::NotStarted,
        }
    }

    /// Current sequencer state.
    pub const fn state(&self) -> SequencerState {
        self.state
    }
}

impl<H: Handoff> BootstrapSequencer<H> {
    /// Runs every stage in order and hands off to the primary server.
    ///
    /// Tolerated failures are recorded and the boot proceeds; the first
    /// fatal failure ends the sequence immediately with the stage's exit
    /// code and no later stage is started.
    pub fn run(
        &mut self,
        launcher: &ProcessLauncher,
        diagnostics: &mut DiagnosticsSink,
    ) -> BootstrapResult {
        for index in 0..self.stages.len() {
            self.state = SequencerState::RunningStage(index);
            let Some(stage) = self.stages.get(index) else {
                break;
            };
            let stage_name = stage.name.clone();
            let policy = stage.policy;
            let budget = stage.budget.unwrap_or(self.budget);

            info!(
                target: SEQUENCER_TARGET,
                stage = %stage_name,
                "running boot stage"
            );
            let outcome = execute_stage(stage, launcher, budget, diagnostics);

            match outcome {
                Ok(()) => {
                    info!(
                        target: SEQUENCER_TARGET,
                        stage = %stage_name,
                        "stage succeeded"
                    );
                }
                Err(failure) => match policy {
                    FatalityPolicy::Tolerated => {
                        warn!(
                            target: SEQUENCER_TARGET,
                            stage = %stage_name,
                            %failure,
                            "tolerated stage failed; boot proceeds"
                        );
                        diagnostics.record(DiagnosticRecord::new(
                            stage_name,
                            format!("tolerated failure: {failure}"),
                        ));
                    }
                    FatalityPolicy::Fatal { exit_code } => {
                        error!(
                            target: SEQUENCER_TARGET,
                            stage = %stage_name,
                            %failure,
                            exit_code,
                            "fatal stage failed; aborting boot"
                        );
                        diagnostics.record(DiagnosticRecord::new(
                            stage_name.clone(),
                            format!("fatal failure: {failure}"),
                        ));
                        self.state = SequencerState::FailedFatal;
                        return BootstrapResult::FatalStageFailed {
                            stage: stage_name,
                            exit_code,
                        };
                    }
                },
            }
        }

        self.state = SequencerState::Succeeded;
        diagnostics.record(DiagnosticRecord::new(
            self.primary.name.clone(),
            "handing off to primary server",
        ));
        match self.handoff.execute(&self.primary.spec) {
            Ok(exit_code) => BootstrapResult::Launched { exit_code },
            Err(error) => {
                error!(
                    target: SEQUENCER_TARGET,
                    stage = %self.primary.name,
                    %error,
                    "handoff failed"
                );
                diagnostics.record(DiagnosticRecord::new(
                    self.primary.name.clone(),
                    format!("handoff failed: {error}"),
                ));
                self.state = SequencerState::FailedFatal;
                BootstrapResult::FatalStageFailed {
                    stage: self.primary.name.clone(),
                    exit_code: self.primary.exit_code,
                }
            }
        }
    }
}

/// Runs one stage to a terminal outcome, cleaning up any process that did
/// not become ready.
fn execute_stage(
    stage: &Stage,
    launcher: &ProcessLauncher,
    budget: ProbeBudget,
    diagnostics: &mut DiagnosticsSink,
) -> Result<(), StageFailure> {
    match &stage.action {
        StageAction::Daemon { spec, signal } => {
            launch_and_probe(&stage.name, spec, signal, launcher, budget, diagnostics)
        }
        StageAction::OneShot { spec } => launch_and_probe(
            &stage.name,
            spec,
            &ReadinessSignal::CleanExit,
            launcher,
            budget,
            diagnostics,
        ),
        StageAction::Resolve { chain } => {
            let resolution = chain.resolve(launcher, budget, diagnostics)?;
            resolution.handle.detach();
            Ok(())
        }
    }
}

fn launch_and_probe(
    stage_name: &str,
    spec: &CommandSpec,
    signal: &ReadinessSignal,
    launcher: &ProcessLauncher,
    budget: ProbeBudget,
    diagnostics: &mut DiagnosticsSink,
) -> Result<(), StageFailure> {
    let mut handle = launcher.launch(stage_name, spec)?;
    match probe(&mut handle, signal, budget) {
        ProbeVerdict::Ready => {
            diagnostics.record(DiagnosticRecord::new(stage_name, "ready"));
            handle.detach();
            Ok(())
        }
        ProbeVerdict::NotReady => {
            handle.terminate();
            diagnostics.record(
                DiagnosticRecord::new(stage_name, "not ready before timeout")
                    .with_output(handle.captured_output()),
            );
            Err(StageFailure::NotReady {
                timeout_secs: budget.timeout().as_secs(),
            })
        }
        ProbeVerdict::Crashed { status } => {
            handle.terminate();
            diagnostics.record(
                DiagnosticRecord::new(stage_name, ProbeVerdict::Crashed { status }.describe())
                    .with_output(handle.captured_output()),
            );
            Err(StageFailure::Crashed { status })
        }
    }
}

#[cfg(test)]
mod tests;
