//! The concrete boot plan for the BIM backend container.
//!
//! Everything here is deployment data: which services start, in which
//! order, how each one is invoked, and which fallbacks exist. Candidate
//! order within a chain is priority order and deliberately fixed at
//! declaration time rather than discovered at runtime.

use bimstrap_config::Config;

use crate::chain::{Candidate, FallbackChain};
use crate::launcher::CommandSpec;
use crate::probe::ReadinessSignal;
use crate::sequencer::{FatalityPolicy, PrimaryServer, Stage, StageAction};

/// Exit code reported when the virtual display fails to come up.
pub const DISPLAY_EXIT_CODE: u8 = 10;

/// Exit code reported when the handoff to the API server fails.
pub const HANDOFF_EXIT_CODE: u8 = 11;

/// Environment variables captured into diagnostics because process
/// discovery depends on them.
pub const DISCOVERY_ENV_KEYS: &[&str] = &[
    "PATH",
    "DISPLAY",
    "PYTHONPATH",
    "PYTHONHOME",
    "BLENDER_USER_SCRIPTS",
];

/// Python expression enabling the BIM addon and persisting preferences.
const ADDON_ENABLE_EXPR: &str = "import bpy; \
    bpy.ops.preferences.addon_enable(module='blenderbim'); \
    bpy.ops.wm.save_userpref()";

/// Ordered stages plus the primary server the boot exists to start.
#[derive(Debug, Clone)]
pub struct BootPlan {
    stages: Vec<Stage>,
    primary: PrimaryServer,
}

impl BootPlan {
    /// Declared stages, in execution order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The primary server invocation.
    pub fn primary(&self) -> &PrimaryServer {
        &self.primary
    }

    /// Splits the plan into the pieces the sequencer consumes.
    pub fn into_parts(self) -> (Vec<Stage>, PrimaryServer) {
        (self.stages, self.primary)
    }
}

/// Builds the boot plan from the resolved configuration.
pub fn build(config: &Config) -> BootPlan {
    let display = config.display_name();
    let stages = vec![
        display_stage(config),
        addon_stage(config, &display),
        control_stage(config, &display),
    ];
    BootPlan {
        stages,
        primary: primary_server(config, &display),
    }
}

/// Virtual display server. Fatal: nothing downstream renders without it.
fn display_stage(config: &Config) -> Stage {
    let display = config.display_name();
    let socket = format!("/tmp/.X11-unix/X{}", config.display_number());
    let spec = CommandSpec::new(
        config.xvfb_bin(),
        vec![
            display,
            "-screen".to_owned(),
            "0".to_owned(),
            "1920x1080x24".to_owned(),
            "-nolisten".to_owned(),
            "tcp".to_owned(),
        ],
    );
    Stage::new(
        "display",
        StageAction::Daemon {
            spec,
            signal: ReadinessSignal::PathExists(socket.into()),
        },
        FatalityPolicy::Fatal {
            exit_code: DISPLAY_EXIT_CODE,
        },
    )
}

/// One-shot addon activation. Tolerated: the API server can generate
/// models without the addon, only the Blender-backed tools degrade.
fn addon_stage(config: &Config, display: &str) -> Stage {
    let spec = CommandSpec::new(
        config.blender_bin(),
        vec![
            "--background".to_owned(),
            "--python-expr".to_owned(),
            ADDON_ENABLE_EXPR.to_owned(),
        ],
    )
    .env("DISPLAY", display);
    Stage::new("addon", StageAction::OneShot { spec }, FatalityPolicy::Tolerated)
}

/// Auxiliary MCP control server, resolved through a fallback chain.
/// Tolerated: the primary server serves tool definitions from a static
/// fallback when the control server is absent.
fn control_stage(config: &Config, display: &str) -> Stage {
    let port = config.control_port().to_string();
    let app_dir = config.app_dir();
    let source_path = app_dir.join("mcp_server.py");

    let module_server = Candidate::new(
        "module-server",
        CommandSpec::new(
            config.python_bin(),
            vec![
                "-m".to_owned(),
                "mcp_bonsai".to_owned(),
                "--port".to_owned(),
                port.clone(),
            ],
        )
        .env("DISPLAY", display)
        .cwd(app_dir.as_std_path()),
    );
    let source_server = Candidate::new(
        "source-server",
        CommandSpec::new(
            config.python_bin(),
            vec![
                source_path.to_string(),
                "--port".to_owned(),
                port.clone(),
            ],
        )
        .env("DISPLAY", display)
        .cwd(app_dir.as_std_path()),
    );
    let blender_embedded = Candidate::new(
        "blender-embedded",
        CommandSpec::new(
            config.blender_bin(),
            vec![
                "--background".to_owned(),
                "--python".to_owned(),
                source_path.to_string(),
            ],
        )
        .env("DISPLAY", display)
        .env("MCP_PORT", port)
        .cwd(app_dir.as_std_path()),
    );

    Stage::new(
        "control",
        StageAction::Resolve {
            chain: FallbackChain::new(
                "control",
                ReadinessSignal::TcpPort(config.control_port()),
                vec![module_server, source_server, blender_embedded],
            ),
        },
        FatalityPolicy::Tolerated,
    )
}

/// The API server the container exists to run. Replaces the orchestrator's
/// process image at handoff.
fn primary_server(config: &Config, display: &str) -> PrimaryServer {
    let spec = CommandSpec::new(
        config.python_bin(),
        vec![
            "-m".to_owned(),
            "uvicorn".to_owned(),
            "main:app".to_owned(),
            "--host".to_owned(),
            "0.0.0.0".to_owned(),
            "--port".to_owned(),
            config.api_port().to_string(),
        ],
    )
    .env("DISPLAY", display)
    .env("PORT", config.api_port().to_string())
    .env("MCP_SERVER_URL", format!("http://localhost:{}", config.control_port()))
    .cwd(config.app_dir().as_std_path());
    PrimaryServer::new("api", spec, HANDOFF_EXIT_CODE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn default_config() -> Config {
        Config::load_from_iter(["bimstrap"]).unwrap_or_else(|error| panic!("load config: {error}"))
    }

    #[rstest]
    fn stages_run_display_then_addon_then_control() {
        let plan = build(&default_config());
        let names: Vec<&str> = plan.stages().iter().map(Stage::name).collect();
        assert_eq!(names, vec!["display", "addon", "control"]);
    }

    #[rstest]
    fn only_the_display_stage_is_fatal() {
        let plan = build(&default_config());
        let policies: Vec<FatalityPolicy> =
            plan.stages().iter().map(Stage::policy).collect();
        assert_eq!(
            policies,
            vec![
                FatalityPolicy::Fatal {
                    exit_code: DISPLAY_EXIT_CODE
                },
                FatalityPolicy::Tolerated,
                FatalityPolicy::Tolerated,
            ]
        );
    }

    #[rstest]
    fn control_candidates_prefer_the_module_invocation() {
        let plan = build(&default_config());
        let control = plan
            .stages()
            .iter()
            .find(|stage| stage.name() == "control")
            .unwrap_or_else(|| panic!("control stage expected"));
        let StageAction::Resolve { chain } = control.action() else {
            panic!("control stage should resolve a chain");
        };
        let names: Vec<&str> = chain.candidates().iter().map(Candidate::name).collect();
        assert_eq!(names, vec!["module-server", "source-server", "blender-embedded"]);
    }

    #[rstest]
    fn primary_invocation_targets_the_configured_port() {
        let config = Config::load_from_iter(["bimstrap", "--api-port", "9000"])
            .unwrap_or_else(|error| panic!("load config: {error}"));
        let plan = build(&config);
        let rendered = plan.primary().spec().rendered();
        assert!(rendered.contains("uvicorn"));
        assert!(rendered.contains("--port 9000"));
    }

    #[rstest]
    fn display_export_follows_the_configured_number() {
        let config = Config::load_from_iter(["bimstrap", "--display-number", "42"])
            .unwrap_or_else(|error| panic!("load config: {error}"));
        let plan = build(&config);
        let rendered = plan
            .stages()
            .first()
            .map(|stage| match stage.action() {
                StageAction::Daemon { spec, .. } => spec.rendered(),
                _ => String::new(),
            })
            .unwrap_or_default();
        assert!(rendered.contains(":42"));
    }
}
