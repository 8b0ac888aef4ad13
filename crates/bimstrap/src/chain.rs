//! Ordered candidate resolution for a single logical service.
//!
//! A fallback chain holds every known way of invoking one service, in
//! caller-declared priority order: the most likely correct invocation comes
//! first. Resolution walks the list once, launching and probing each
//! candidate, and hands back the first one whose liveness probe reports
//! `Ready`. Everything else is terminated on the way out; a candidate that
//! failed is never retried within one resolution.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::diagnostics::{DiagnosticRecord, DiagnosticsSink};
use crate::launcher::{CommandSpec, ProcessHandle, ProcessLauncher};
use crate::probe::{ProbeBudget, ProbeVerdict, ReadinessSignal, probe};

/// Tracing target for chain resolution.
pub(crate) const CHAIN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::chain");

/// One named invocation variant belonging to a chain.
#[derive(Debug, Clone)]
pub struct Candidate {
    name: String,
    spec: CommandSpec,
}

impl Candidate {
    /// Creates a candidate with a short operator-facing name.
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    /// Operator-facing candidate name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The invocation the candidate performs.
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}

/// Ordered list of candidates for one logical service.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    service: String,
    signal: ReadinessSignal,
    candidates: Vec<Candidate>,
}

/// Successful resolution: the live handle and the candidate that produced it.
#[derive(Debug)]
pub struct Resolution {
    /// Handle to the ready process.
    pub handle: ProcessHandle,
    /// The candidate that passed its liveness probe.
    pub candidate: Candidate,
}

/// Errors surfaced by chain resolution.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Every candidate in the chain failed.
    #[error("all {attempts} candidates for '{service}' exhausted")]
    Exhausted {
        /// Service the chain belongs to.
        service: String,
        /// Number of candidates attempted.
        attempts: usize,
    },
}

impl FallbackChain {
    /// Creates a chain for the named service. Candidate order is priority
    /// order and is fixed at declaration time.
    pub fn new(
        service: impl Into<String>,
        signal: ReadinessSignal,
        candidates: Vec<Candidate>,
    ) -> Self {
        Self {
            service: service.into(),
            signal,
            candidates,
        }
    }

    /// Service the chain resolves.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Declared candidates, in priority order.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Walks the candidates in declared order until one passes its liveness
    /// probe.
    ///
    /// Each non-`Ready` attempt terminates the spawned process before moving
    /// on, so no orphan survives resolution. Every attempt is recorded as it
    /// happens; exhaustion appends exactly one consolidated record
    /// enumerating all attempts.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Exhausted`] when no candidate becomes ready.
    pub fn resolve(
        &self,
        launcher: &ProcessLauncher,
        budget: ProbeBudget,
        diagnostics: &mut DiagnosticsSink,
    ) -> Result<Resolution, ChainError> {
        let mut attempts: Vec<String> = Vec::with_capacity(self.candidates.len());

        for candidate in &self.candidates {
            let log_name = format!("{}-{}", self.service, candidate.name());
            debug!(
                target: CHAIN_TARGET,
                service = %self.service,
                candidate = candidate.name(),
                invocation = %candidate.spec().rendered(),
                "attempting candidate"
            );

            let mut handle = match launcher.launch(&log_name, candidate.spec()) {
                Ok(handle) => handle,
                Err(error) => {
                    let outcome = error.to_string();
                    diagnostics.record(
                        DiagnosticRecord::new(self.service.clone(), outcome.clone())
                            .with_candidate(candidate.name()),
                    );
                    attempts.push(format!("{}: {outcome}", candidate.name()));
                    continue;
                }
            };

            match probe(&mut handle, &self.signal, budget) {
                ProbeVerdict::Ready => {
                    info!(
                        target: CHAIN_TARGET,
                        service = %self.service,
                        candidate = candidate.name(),
                        pid = handle.id(),
                        "candidate ready"
                    );
                    diagnostics.record(
                        DiagnosticRecord::new(self.service.clone(), "ready")
                            .with_candidate(candidate.name()),
                    );
                    return Ok(Resolution {
                        handle,
                        candidate: candidate.clone(),
                    });
                }
                verdict => {
                    handle.terminate();
                    let outcome = verdict.describe();
                    let output = handle.captured_output();
                    warn!(
                        target: CHAIN_TARGET,
                        service = %self.service,
                        candidate = candidate.name(),
                        outcome = %outcome,
                        "candidate failed; trying next"
                    );
                    diagnostics.record(
                        DiagnosticRecord::new(self.service.clone(), outcome.clone())
                            .with_candidate(candidate.name())
                            .with_output(output),
                    );
                    attempts.push(format!("{}: {outcome}", candidate.name()));
                }
            }
        }

        diagnostics.record(
            DiagnosticRecord::new(
                self.service.clone(),
                format!("all {} candidates exhausted", attempts.len()),
            )
            .with_output(attempts.join("\n")),
        );
        Err(ChainError::Exhausted {
            service: self.service.clone(),
            attempts: attempts.len(),
        })
    }
}
