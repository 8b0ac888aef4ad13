//! Boot orchestrator for the BIM backend container.
//!
//! The binary runs once per container start and drives four steps in order:
//! bring up the virtual display, enable the BIM addon, resolve the auxiliary
//! control server through a fallback chain, then replace its own process
//! image with the primary API server. Each step is a [`sequencer::Stage`]
//! with an explicit fatality policy, so a broken display aborts the boot
//! with a distinctive exit code while a missing control server merely
//! degrades it. Everything that happens on the way is appended to the
//! diagnostics log for post-mortem inspection.

pub mod chain;
pub mod diagnostics;
pub mod handoff;
pub mod launcher;
pub mod plan;
pub mod probe;
pub mod sequencer;
pub mod telemetry;

use std::io::{self, Write};
use std::process::ExitCode;

use tracing::{error, warn};

use bimstrap_config::{Config, DiagnosticsPaths};

use crate::diagnostics::DiagnosticsSink;
use crate::handoff::ExecHandoff;
use crate::launcher::ProcessLauncher;
use crate::probe::ProbeBudget;
use crate::sequencer::{BootstrapResult, BootstrapSequencer};

/// Tracing target for top-level boot orchestration.
const BOOT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::boot");

/// Runs the whole boot sequence and reports the process exit code.
///
/// On Unix a fully successful boot never returns: the final handoff
/// replaces the process image with the primary server. Every returned value
/// therefore describes either a fatal stage failure or a non-exec platform.
pub fn run(config: &Config) -> ExitCode {
    if let Err(error) = telemetry::initialise(config) {
        // Telemetry is not up yet, so this is the one place that writes to
        // stderr by hand.
        let _ = writeln!(io::stderr(), "bimstrap: {error}");
        return ExitCode::FAILURE;
    }

    let paths = match DiagnosticsPaths::from_config(config) {
        Ok(paths) => paths,
        Err(error) => {
            let fallback = std::env::temp_dir().join("bimstrap");
            warn!(
                target: BOOT_TARGET,
                %error,
                fallback = %fallback.display(),
                "diagnostics directory unavailable; using fallback"
            );
            let _ = std::fs::create_dir_all(&fallback);
            DiagnosticsPaths::in_directory(fallback)
        }
    };

    let mut sink = DiagnosticsSink::open(&paths);
    sink.record_config(config);
    sink.record_environment(plan::DISCOVERY_ENV_KEYS);
    sink.record_interpreters(&[config.python_bin(), config.blender_bin(), config.xvfb_bin()]);
    sink.record_directory(config.app_dir().as_std_path());

    let launcher = ProcessLauncher::new(paths);
    let (stages, primary) = plan::build(config).into_parts();
    let mut sequencer = BootstrapSequencer::new(
        stages,
        primary,
        ProbeBudget::from_config(config),
        ExecHandoff,
    );

    match sequencer.run(&launcher, &mut sink) {
        BootstrapResult::Launched { exit_code } => ExitCode::from(exit_code),
        BootstrapResult::FatalStageFailed { stage, exit_code } => {
            error!(
                target: BOOT_TARGET,
                stage = %stage,
                exit_code,
                records = %sink.records_path().display(),
                "boot failed; diagnostics record the full sequence"
            );
            ExitCode::from(exit_code)
        }
    }
}
