//! ipvl plugin entry point.

use std::process::ExitCode;

use ipvl::cli::{CNI_VERSION, Cli};
use ipvl_common::{ErrorReport, IpvlResult};
use ipvl_network::pin_current_thread;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> ExitCode {
    // Namespace switches are per-thread: pin before anything else runs.
    let result = pin_current_thread().and_then(|pin| {
        init_tracing()?;
        Cli::from_env()?.execute(pin)
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Command failed");
            let report = ErrorReport::from_error(&err, Some(CNI_VERSION.to_string()));
            println!("{}", serde_json::to_string(&report).unwrap_or_default());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() -> IpvlResult<()> {
    // stdout carries the protocol, logs go to stderr.
    let filter = EnvFilter::try_from_env("IPVL_LOG")
        .or_else(|_| EnvFilter::try_new("ipvl=info"))
        .map_err(|e| ipvl_common::IpvlError::config(format!("invalid IPVL_LOG filter: {e}")))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
    Ok(())
}
