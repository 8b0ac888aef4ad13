//! Container entrypoint binary.

use std::process::ExitCode;

use bimstrap_config::Config;

fn main() -> ExitCode {
    match Config::load() {
        Ok(config) => bimstrap::run(&config),
        Err(error) => error.report(),
    }
}
