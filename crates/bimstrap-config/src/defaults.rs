use camino::Utf8PathBuf;

/// Default TCP port served by the primary API server after handoff.
pub const DEFAULT_API_PORT: u16 = 8080;

/// Default TCP port served by the auxiliary MCP control server.
pub const DEFAULT_CONTROL_PORT: u16 = 7777;

/// Default per-stage liveness timeout, in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 20;

/// Default probe polling cadence, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Default X display number for the virtual display.
pub const DEFAULT_DISPLAY_NUMBER: u16 = 99;

/// Default log filter expression used by the entrypoint.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Directory holding the application sources launched by the boot stages.
pub fn default_app_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("/app")
}

/// Directory holding the boot diagnostics artefacts.
///
/// Operators read this location after a failed or degraded boot, so it must
/// stay stable across releases.
pub fn default_diagnostics_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("/var/log/bimstrap")
}
