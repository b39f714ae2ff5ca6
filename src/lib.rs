//! HyperTool command-line host around the `hypertool-hyperv` core.

pub mod cli;
pub mod commands;
pub mod config;
pub mod logging;

use clap::Parser;
use cli::Cli;
use commands::App;
use hypertool_hyperv::elevation::PrivilegedAction;
use hypertool_hyperv::{CancellationToken, HyperVError, HyperVService, HyperVServiceState};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

/// Exit code reported when the user interrupts an operation.
const EXIT_CANCELLED: u8 = 130;

pub async fn run() -> anyhow::Result<ExitCode> {
    if let Some(action) = PrivilegedAction::from_args(std::env::args().skip(1)) {
        logging::init_logging(false);
        return Ok(run_privileged(action).await);
    }

    let cli = Cli::parse();
    logging::init_logging(cli.log_json);

    let loaded = config::load(&config::resolve_config_path(cli.config.as_deref()));
    let service: HyperVServiceState =
        Arc::new(HyperVService::with_config(loaded.config.hyperv.clone()));

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let app = App::new(service, loaded.config, cancel, cli.json);
    match app.execute(cli.command).await {
        Ok(code) => Ok(code),
        Err(e) if is_cancelled(&e) => {
            warn!("Operation cancelled");
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
        Err(e) => Err(e),
    }
}

/// Elevated helper mode: perform the action and report through the exit
/// code only.
async fn run_privileged(action: PrivilegedAction) -> ExitCode {
    let loaded = config::load(&config::resolve_config_path(None));
    let service = HyperVService::with_config(loaded.config.hyperv);
    let outcome = service
        .run_privileged_action(action, &CancellationToken::new())
        .await;
    info!("Helper finished: {}", outcome.message);
    ExitCode::from(u8::try_from(outcome.exit_code()).unwrap_or(1))
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling");
            cancel.cancel();
        }
    });
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<HyperVError>()
        .map_or(false, HyperVError::is_cancelled)
}
