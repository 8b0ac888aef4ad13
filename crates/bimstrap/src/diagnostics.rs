//! Append-only boot diagnostics for post-mortem inspection.
//!
//! Every attempt, failure, and resolution during boot is recorded here and
//! mirrored to a human-readable log at a well-known path. Recording never
//! fails the caller: an orchestrator that aborts because it could not write
//! a diagnostic would defeat the point of diagnosing the boot it is part
//! of, so I/O errors are swallowed and reported on the orchestrator's own
//! tracing channel instead.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use bimstrap_config::{Config, DiagnosticsPaths};

/// Tracing target for diagnostics operations.
pub(crate) const DIAGNOSTICS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::diagnostics");

/// One entry in the boot diagnostics log. Never mutated after append.
#[derive(Debug, Clone)]
pub struct DiagnosticRecord {
    timestamp: u64,
    stage: String,
    candidate: Option<String>,
    output: Option<String>,
    outcome: String,
}

impl DiagnosticRecord {
    /// Creates a record for the named stage with the given outcome.
    pub fn new(stage: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            timestamp: unix_timestamp(),
            stage: stage.into(),
            candidate: None,
            output: None,
            outcome: outcome.into(),
        }
    }

    /// Attaches the candidate this record describes.
    #[must_use]
    pub fn with_candidate(mut self, candidate: impl Into<String>) -> Self {
        self.candidate = Some(candidate.into());
        self
    }

    /// Attaches captured process output.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        let output = output.into();
        if !output.is_empty() {
            self.output = Some(output);
        }
        self
    }

    /// Stage the record belongs to.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Candidate attempted, if the record describes one.
    pub fn candidate(&self) -> Option<&str> {
        self.candidate.as_deref()
    }

    /// Captured output attached to the record, if any.
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// Outcome description.
    pub fn outcome(&self) -> &str {
        &self.outcome
    }

    /// Seconds since the Unix epoch at append time.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn render(&self) -> String {
        let mut line = format!("[{}] stage={}", self.timestamp, self.stage);
        if let Some(candidate) = &self.candidate {
            line.push_str(" candidate=");
            line.push_str(candidate);
        }
        line.push_str(" outcome=");
        line.push_str(&self.outcome);
        if let Some(output) = &self.output {
            for captured in output.lines() {
                line.push_str("\n    | ");
                line.push_str(captured);
            }
        }
        line.push('\n');
        line
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Single-writer, append-only diagnostics store backing the boot sequence.
#[derive(Debug)]
pub struct DiagnosticsSink {
    records: Vec<DiagnosticRecord>,
    writer: Option<File>,
    records_path: PathBuf,
}

impl DiagnosticsSink {
    /// Opens the sink at the well-known records path, truncating any log
    /// left over from a previous container instance. Failure to open the
    /// backing file degrades to in-memory recording with a warning.
    pub fn open(paths: &DiagnosticsPaths) -> Self {
        let records_path = paths.records_path().to_path_buf();
        let writer = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&records_path)
            .map_err(|error| {
                warn!(
                    target: DIAGNOSTICS_TARGET,
                    path = %records_path.display(),
                    %error,
                    "failed to open diagnostics log; records stay in memory only"
                );
            })
            .ok();
        Self {
            records: Vec::new(),
            writer,
            records_path,
        }
    }

    /// Path of the backing record log, for operator-facing messages.
    pub fn records_path(&self) -> &Path {
        self.records_path.as_path()
    }

    /// Appends a record. Never fails the caller; write errors are logged on
    /// the secondary channel.
    pub fn record(&mut self, record: DiagnosticRecord) {
        if let Some(writer) = &mut self.writer {
            if let Err(error) = writer.write_all(record.render().as_bytes()) {
                warn!(
                    target: DIAGNOSTICS_TARGET,
                    path = %self.records_path.display(),
                    %error,
                    "failed to append diagnostic record"
                );
            }
        }
        self.records.push(record);
    }

    /// Returns the records appended so far, in order.
    pub fn dump(&self) -> &[DiagnosticRecord] {
        &self.records
    }

    /// Snapshots the resolved configuration so operators can see exactly
    /// which ports, paths, and binaries this boot ran with.
    pub fn record_config(&mut self, config: &Config) {
        let rendered = serde_json::to_string(config)
            .unwrap_or_else(|error| format!("<unserialisable configuration: {error}>"));
        self.record(DiagnosticRecord::new("environment", "resolved configuration").with_output(rendered));
    }

    /// Captures the environment variables relevant to process discovery.
    pub fn record_environment(&mut self, keys: &[&str]) {
        let mut lines = Vec::with_capacity(keys.len());
        for key in keys {
            match env::var(key) {
                Ok(value) => lines.push(format!("{key}={value}")),
                Err(_) => lines.push(format!("{key}=<unset>")),
            }
        }
        self.record(
            DiagnosticRecord::new("environment", "process discovery variables")
                .with_output(lines.join("\n")),
        );
    }

    /// Captures a directory listing of a location the candidates depend on.
    pub fn record_directory(&mut self, path: &Path) {
        let outcome = format!("listing of {}", path.display());
        let listing = match fs::read_dir(path) {
            Ok(entries) => {
                let mut names: Vec<String> = entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                if names.is_empty() {
                    "<empty>".to_owned()
                } else {
                    names.join("\n")
                }
            }
            Err(error) => format!("<unreadable: {error}>"),
        };
        self.record(DiagnosticRecord::new("environment", outcome).with_output(listing));
    }

    /// Captures which concrete binaries the declared programs resolve to on
    /// the search path. This is what lets an operator see that a candidate
    /// failed because its interpreter was missing, without re-running the
    /// container interactively.
    pub fn record_interpreters(&mut self, programs: &[&str]) {
        let mut lines = Vec::with_capacity(programs.len());
        for program in programs {
            match resolve_on_path(program) {
                Some(resolved) => lines.push(format!("{program} -> {}", resolved.display())),
                None => lines.push(format!("{program} -> <not on PATH>")),
            }
        }
        self.record(
            DiagnosticRecord::new("environment", "interpreter resolution")
                .with_output(lines.join("\n")),
        );
    }
}

/// Resolves a program name against `PATH`, mirroring what process creation
/// will do. Absolute and relative invocations bypass the search.
fn resolve_on_path(program: &str) -> Option<PathBuf> {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
