//! Derives diagnostics artefact paths shared by the boot stages.
//!
//! The diagnostics directory houses the append-only record log written by
//! the orchestrator together with the captured output of every launched
//! service. Operators inspect these files after a failed or degraded boot,
//! so the layout is fixed here rather than scattered across the stages.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;

/// Canonical paths for diagnostics artefacts written during boot.
#[derive(Debug, Clone)]
pub struct DiagnosticsPaths {
    diagnostics_dir: PathBuf,
    records_path: PathBuf,
}

impl DiagnosticsPaths {
    /// Derives diagnostics paths from the shared configuration, creating the
    /// backing directory when missing.
    pub fn from_config(config: &Config) -> Result<Self, DiagnosticsPathsError> {
        let diagnostics_dir = config.diagnostics_dir().as_std_path().to_path_buf();
        fs::create_dir_all(&diagnostics_dir).map_err(|source| {
            DiagnosticsPathsError::DiagnosticsDirectory {
                path: diagnostics_dir.clone(),
                source,
            }
        })?;
        Ok(Self {
            records_path: diagnostics_dir.join("boot-records.log"),
            diagnostics_dir,
        })
    }

    /// Derives diagnostics paths under an arbitrary directory without
    /// touching the filesystem. Used as a fallback when the configured
    /// directory cannot be prepared; consumers already degrade gracefully
    /// when the paths turn out to be unwritable.
    pub fn in_directory(dir: impl Into<PathBuf>) -> Self {
        let diagnostics_dir = dir.into();
        Self {
            records_path: diagnostics_dir.join("boot-records.log"),
            diagnostics_dir,
        }
    }

    /// Directory holding diagnostics artefacts.
    pub fn diagnostics_dir(&self) -> &Path {
        self.diagnostics_dir.as_path()
    }

    /// Path to the append-only diagnostic record log.
    pub fn records_path(&self) -> &Path {
        self.records_path.as_path()
    }

    /// Path of the captured-output log for a named service.
    pub fn service_log_path(&self, service: &str) -> PathBuf {
        self.diagnostics_dir.join(format!("{service}.log"))
    }
}

/// Errors raised while deriving diagnostics paths.
#[derive(Debug, Error)]
pub enum DiagnosticsPathsError {
    /// Creating the diagnostics directory failed.
    #[error("failed to prepare diagnostics directory '{path}': {source}")]
    DiagnosticsDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn config_with_dir(dir: &Path) -> Config {
        let dir = dir.to_str().unwrap_or_else(|| panic!("utf-8 temp dir"));
        Config::load_from_iter(["bimstrap", "--diagnostics-dir", dir])
            .unwrap_or_else(|error| panic!("load config: {error}"))
    }

    #[rstest]
    fn creates_missing_directory() {
        let temp = TempDir::new().unwrap_or_else(|error| panic!("tempdir: {error}"));
        let nested = temp.path().join("diag");
        let config = config_with_dir(&nested);
        let paths = DiagnosticsPaths::from_config(&config)
            .unwrap_or_else(|error| panic!("derive paths: {error}"));
        assert!(nested.is_dir());
        assert_eq!(paths.records_path(), nested.join("boot-records.log"));
    }

    #[rstest]
    fn service_logs_live_beside_the_record_log() {
        let temp = TempDir::new().unwrap_or_else(|error| panic!("tempdir: {error}"));
        let config = config_with_dir(temp.path());
        let paths = DiagnosticsPaths::from_config(&config)
            .unwrap_or_else(|error| panic!("derive paths: {error}"));
        assert_eq!(
            paths.service_log_path("display"),
            temp.path().join("display.log")
        );
    }
}
