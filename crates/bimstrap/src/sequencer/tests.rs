//! Behavioural tests for the boot sequencer.
//!
//! Process-backed stages use cheap real binaries so the sequencing logic is
//! exercised end to end; the handoff is replaced with a recording double so
//! the test runner keeps its own process image.

use std::cell::RefCell;
use std::io;
use std::time::Duration;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use bimstrap_config::{Config, DiagnosticsPaths};

use super::*;
use crate::chain::Candidate;
use crate::handoff::HandoffError;

/// Handoff double that records the invocation instead of exec'ing.
#[derive(Default)]
struct RecordingHandoff {
    invocations: RefCell<Vec<String>>,
}

impl RecordingHandoff {
    fn invocation_count(&self) -> usize {
        self.invocations.borrow().len()
    }
}

impl Handoff for RecordingHandoff {
    fn execute(&self, spec: &CommandSpec) -> Result<u8, HandoffError> {
        self.invocations.borrow_mut().push(spec.rendered());
        Ok(0)
    }
}

/// Handoff double that always fails.
struct FailingHandoff;

impl Handoff for FailingHandoff {
    fn execute(&self, spec: &CommandSpec) -> Result<u8, HandoffError> {
        Err(HandoffError::Spawn {
            program: spec.program().to_owned(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        })
    }
}

struct Harness {
    temp: TempDir,
    launcher: ProcessLauncher,
    sink: DiagnosticsSink,
}

#[fixture]
fn harness() -> Harness {
    let temp = TempDir::new().unwrap_or_else(|error| panic!("tempdir: {error}"));
    let dir = temp
        .path()
        .to_str()
        .unwrap_or_else(|| panic!("utf-8 temp dir"));
    let config = Config::load_from_iter(["bimstrap", "--diagnostics-dir", dir])
        .unwrap_or_else(|error| panic!("load config: {error}"));
    let paths = DiagnosticsPaths::from_config(&config)
        .unwrap_or_else(|error| panic!("derive paths: {error}"));
    Harness {
        launcher: ProcessLauncher::new(paths.clone()),
        sink: DiagnosticsSink::open(&paths),
        temp,
    }
}

fn budget() -> ProbeBudget {
    ProbeBudget::new(Duration::from_secs(5), Duration::from_millis(20))
}

fn short_budget() -> ProbeBudget {
    ProbeBudget::new(Duration::from_millis(200), Duration::from_millis(20))
}

#[cfg(unix)]
fn shell(script: &str) -> CommandSpec {
    CommandSpec::new("/bin/sh", vec!["-c".to_owned(), script.to_owned()])
}

fn primary() -> PrimaryServer {
    PrimaryServer::new(
        "api",
        CommandSpec::new(
            "python3",
            vec!["-m".to_owned(), "uvicorn".to_owned(), "main:app".to_owned()],
        ),
        11,
    )
}

#[cfg(unix)]
#[rstest]
fn all_stages_succeeding_reaches_handoff(mut harness: Harness) {
    let stages = vec![
        Stage::new(
            "display",
            StageAction::OneShot {
                spec: shell("exit 0"),
            },
            FatalityPolicy::Fatal { exit_code: 10 },
        ),
        Stage::new(
            "addon",
            StageAction::OneShot {
                spec: shell("echo addon enabled"),
            },
            FatalityPolicy::Tolerated,
        ),
    ];
    let handoff = RecordingHandoff::default();
    let mut sequencer = BootstrapSequencer::new(stages, primary(), budget(), handoff);

    let result = sequencer.run(&harness.launcher, &mut harness.sink);

    assert_eq!(result, BootstrapResult::Launched { exit_code: 0 });
    assert_eq!(sequencer.state(), SequencerState::Succeeded);
    assert_eq!(sequencer.handoff.invocation_count(), 1);
}

#[cfg(unix)]
#[rstest]
fn tolerated_failure_never_blocks_the_primary_server(mut harness: Harness) {
    let stages = vec![
        Stage::new(
            "display",
            StageAction::OneShot {
                spec: shell("exit 0"),
            },
            FatalityPolicy::Fatal { exit_code: 10 },
        ),
        Stage::new(
            "control",
            StageAction::Resolve {
                chain: FallbackChain::new(
                    "control",
                    ReadinessSignal::OutputMarker("listening".to_owned()),
                    vec![
                        Candidate::new(
                            "missing",
                            CommandSpec::new("/nonexistent/control-server", Vec::new()),
                        ),
                        Candidate::new("crasher", shell("exit 1")),
                    ],
                ),
            },
            FatalityPolicy::Tolerated,
        )
        .with_budget(short_budget()),
    ];
    let handoff = RecordingHandoff::default();
    let mut sequencer = BootstrapSequencer::new(stages, primary(), budget(), handoff);

    let result = sequencer.run(&harness.launcher, &mut harness.sink);

    assert_eq!(result, BootstrapResult::Launched { exit_code: 0 });
    assert_eq!(sequencer.state(), SequencerState::Succeeded);
    assert_eq!(sequencer.handoff.invocation_count(), 1);
    assert!(
        harness
            .sink
            .dump()
            .iter()
            .any(|record| record.outcome().starts_with("tolerated failure")),
        "tolerated failure should be recorded"
    );
}

#[cfg(unix)]
#[rstest]
fn fatal_failure_stops_the_boot_before_later_stages(mut harness: Harness) {
    // The later stage would create this marker if it ever ran.
    let witness = harness.temp.path().join("later-stage-ran");
    let witness_script = format!("touch {}", witness.display());

    let stages = vec![
        Stage::new(
            "display",
            StageAction::Daemon {
                spec: CommandSpec::new("/nonexistent/Xvfb", vec![":99".to_owned()]),
                signal: ReadinessSignal::PathExists(harness.temp.path().join("X99")),
            },
            FatalityPolicy::Fatal { exit_code: 10 },
        ),
        Stage::new(
            "control",
            StageAction::OneShot {
                spec: shell(&witness_script),
            },
            FatalityPolicy::Tolerated,
        ),
    ];
    let handoff = RecordingHandoff::default();
    let mut sequencer = BootstrapSequencer::new(stages, primary(), budget(), handoff);

    let result = sequencer.run(&harness.launcher, &mut harness.sink);

    assert_eq!(
        result,
        BootstrapResult::FatalStageFailed {
            stage: "display".to_owned(),
            exit_code: 10,
        }
    );
    assert_eq!(sequencer.state(), SequencerState::FailedFatal);
    assert_eq!(sequencer.handoff.invocation_count(), 0);
    assert!(!witness.exists(), "no stage after the fatal one may start");
}

#[cfg(unix)]
#[rstest]
fn crashed_fatal_stage_reports_its_exit_code(mut harness: Harness) {
    let stages = vec![Stage::new(
        "display",
        StageAction::Daemon {
            spec: shell("exit 5"),
            signal: ReadinessSignal::PathExists(harness.temp.path().join("X99")),
        },
        FatalityPolicy::Fatal { exit_code: 10 },
    )];
    let handoff = RecordingHandoff::default();
    let mut sequencer = BootstrapSequencer::new(stages, primary(), budget(), handoff);

    let result = sequencer.run(&harness.launcher, &mut harness.sink);

    assert_eq!(
        result,
        BootstrapResult::FatalStageFailed {
            stage: "display".to_owned(),
            exit_code: 10,
        }
    );
}

#[cfg(unix)]
#[rstest]
fn handoff_failure_is_fatal_with_the_primary_exit_code(mut harness: Harness) {
    let stages = vec![Stage::new(
        "display",
        StageAction::OneShot {
            spec: shell("exit 0"),
        },
        FatalityPolicy::Fatal { exit_code: 10 },
    )];
    let mut sequencer = BootstrapSequencer::new(stages, primary(), budget(), FailingHandoff);

    let result = sequencer.run(&harness.launcher, &mut harness.sink);

    assert_eq!(
        result,
        BootstrapResult::FatalStageFailed {
            stage: "api".to_owned(),
            exit_code: 11,
        }
    );
    assert_eq!(sequencer.state(), SequencerState::FailedFatal);
}

#[cfg(unix)]
#[rstest]
fn daemon_stage_promotes_a_ready_service(mut harness: Harness) {
    let socket = harness.temp.path().join("X99");
    let script = format!("touch {} && sleep 3", socket.display());
    let stages = vec![Stage::new(
        "display",
        StageAction::Daemon {
            spec: shell(&script),
            signal: ReadinessSignal::PathExists(socket),
        },
        FatalityPolicy::Fatal { exit_code: 10 },
    )];
    let handoff = RecordingHandoff::default();
    let mut sequencer = BootstrapSequencer::new(stages, primary(), budget(), handoff);

    let result = sequencer.run(&harness.launcher, &mut harness.sink);

    assert_eq!(result, BootstrapResult::Launched { exit_code: 0 });
    assert!(
        harness
            .sink
            .dump()
            .iter()
            .any(|record| record.stage() == "display" && record.outcome() == "ready")
    );
}

#[rstest]
fn sequencer_starts_in_not_started(harness: Harness) {
    let sequencer =
        BootstrapSequencer::new(Vec::new(), primary(), budget(), RecordingHandoff::default());
    assert_eq!(sequencer.state(), SequencerState::NotStarted);
    drop(harness);
}
