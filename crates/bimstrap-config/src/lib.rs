//! Shared configuration for the bimstrap entrypoint.
//!
//! The entrypoint runs inside a container, so configuration is
//! environment-first: every knob has a default, environment variables with
//! the `BIMSTRAP_` prefix override the defaults, and command-line flags
//! override the environment. There is no configuration file; the candidate
//! lists and stage ordering are deployment data declared in the orchestrator
//! crate, not discovered at runtime.

use std::ffi::OsString;
use std::process::ExitCode;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use serde::Serialize;
use thiserror::Error;

mod defaults;
mod logging;
mod paths;

pub use defaults::{
    DEFAULT_API_PORT, DEFAULT_CONTROL_PORT, DEFAULT_DISPLAY_NUMBER, DEFAULT_LOG_FILTER,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_PROBE_TIMEOUT_SECS, default_app_dir,
    default_diagnostics_dir,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use paths::{DiagnosticsPaths, DiagnosticsPathsError};

/// Resolved entrypoint configuration.
#[derive(Debug, Clone, Parser, Serialize)]
#[command(
    name = "bimstrap",
    about = "Container entrypoint orchestrating the BIM backend boot sequence"
)]
pub struct Config {
    /// TCP port the primary API server binds after handoff.
    #[arg(long, env = "BIMSTRAP_API_PORT", default_value_t = DEFAULT_API_PORT)]
    api_port: u16,

    /// TCP port the auxiliary MCP control server binds.
    #[arg(long, env = "BIMSTRAP_CONTROL_PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// Per-stage liveness timeout in seconds.
    #[arg(long, env = "BIMSTRAP_PROBE_TIMEOUT_SECS", default_value_t = DEFAULT_PROBE_TIMEOUT_SECS)]
    probe_timeout_secs: u64,

    /// Probe polling cadence in milliseconds.
    #[arg(long, env = "BIMSTRAP_POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,

    /// Directory receiving boot diagnostics and captured service output.
    #[arg(long, env = "BIMSTRAP_DIAGNOSTICS_DIR", default_value = defaults::default_diagnostics_dir().into_string())]
    diagnostics_dir: Utf8PathBuf,

    /// X display number served by the virtual display.
    #[arg(long, env = "BIMSTRAP_DISPLAY_NUMBER", default_value_t = DEFAULT_DISPLAY_NUMBER)]
    display_number: u16,

    /// Directory holding the application sources launched by the stages.
    #[arg(long, env = "BIMSTRAP_APP_DIR", default_value = defaults::default_app_dir().into_string())]
    app_dir: Utf8PathBuf,

    /// Virtual display server binary.
    #[arg(long, env = "BIMSTRAP_XVFB_BIN", default_value = "Xvfb")]
    xvfb_bin: String,

    /// Blender binary used for addon activation and embedded fallbacks.
    #[arg(long, env = "BIMSTRAP_BLENDER_BIN", default_value = "blender")]
    blender_bin: String,

    /// Python interpreter used for the control and API servers.
    #[arg(long, env = "BIMSTRAP_PYTHON_BIN", default_value = "python3")]
    python_bin: String,

    /// Log filter expression for the orchestrator's own telemetry.
    #[arg(long, env = "BIMSTRAP_LOG_FILTER", default_value = DEFAULT_LOG_FILTER)]
    log_filter: String,

    /// Log output format for the orchestrator's own telemetry.
    #[arg(long, env = "BIMSTRAP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

impl Config {
    /// Loads configuration from the process environment and arguments.
    pub fn load() -> Result<Self, ConfigError> {
        Self::try_parse().map_err(ConfigError::from)
    }

    /// Loads configuration from an explicit argument iterator.
    ///
    /// Environment variables still apply; tests clear or set them explicitly.
    pub fn load_from_iter<I, T>(iter: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(iter).map_err(ConfigError::from)
    }

    /// TCP port of the primary API server.
    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    /// TCP port of the auxiliary control server.
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// Per-stage liveness timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Probe polling cadence.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Directory receiving boot diagnostics.
    pub fn diagnostics_dir(&self) -> &Utf8Path {
        self.diagnostics_dir.as_path()
    }

    /// X display number served by the virtual display.
    pub fn display_number(&self) -> u16 {
        self.display_number
    }

    /// X display name exported to later stages, e.g. `:99`.
    pub fn display_name(&self) -> String {
        format!(":{}", self.display_number)
    }

    /// Directory holding the application sources.
    pub fn app_dir(&self) -> &Utf8Path {
        self.app_dir.as_path()
    }

    /// Virtual display server binary.
    pub fn xvfb_bin(&self) -> &str {
        &self.xvfb_bin
    }

    /// Blender binary.
    pub fn blender_bin(&self) -> &str {
        &self.blender_bin
    }

    /// Python interpreter.
    pub fn python_bin(&self) -> &str {
        &self.python_bin
    }

    /// Log filter expression.
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Log output format.
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

/// Errors surfaced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The arguments or environment values failed to parse.
    #[error("invalid configuration: {source}")]
    Invalid {
        /// Underlying parser error.
        #[from]
        source: clap::Error,
    },
}

impl ConfigError {
    /// Renders the error the way the parser intends (help and version text
    /// go to stdout, genuine errors to stderr) and returns the matching
    /// process exit code.
    pub fn report(self) -> ExitCode {
        match self {
            Self::Invalid { source } => {
                let code = source.exit_code();
                drop(source.print());
                ExitCode::from(u8::try_from(code).unwrap_or(1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn defaults_apply_without_arguments() {
        let config = Config::load_from_iter(["bimstrap"])
            .unwrap_or_else(|error| panic!("load config: {error}"));
        assert_eq!(config.api_port(), DEFAULT_API_PORT);
        assert_eq!(config.control_port(), DEFAULT_CONTROL_PORT);
        assert_eq!(config.display_name(), ":99");
        assert_eq!(config.log_format(), LogFormat::Json);
        assert_eq!(config.probe_timeout(), Duration::from_secs(20));
        assert_eq!(config.diagnostics_dir(), default_diagnostics_dir());
        assert_eq!(config.app_dir(), default_app_dir());
    }

    #[rstest]
    fn cli_flags_override_defaults() {
        let config = Config::load_from_iter([
            "bimstrap",
            "--api-port",
            "9090",
            "--display-number",
            "7",
            "--log-format",
            "compact",
        ])
        .unwrap_or_else(|error| panic!("load config: {error}"));
        assert_eq!(config.api_port(), 9090);
        assert_eq!(config.display_name(), ":7");
        assert_eq!(config.log_format(), LogFormat::Compact);
    }

    #[rstest]
    fn rejects_malformed_port() {
        assert!(Config::load_from_iter(["bimstrap", "--api-port", "not-a-port"]).is_err());
    }
}
