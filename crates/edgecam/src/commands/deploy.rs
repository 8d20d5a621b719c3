//! `edgecam deploy`: push one module and wait for the device's verdict.

use std::time::Duration;

use crate::cli::{DeployArgs, GlobalOpts};
use crate::commands::ActiveDevice;
use crate::commands::run::{build_session, log_state_changes};
use crate::error::CliError;

const PROTOCOL_POLL: Duration = Duration::from_millis(100);

pub async fn handle(args: DeployArgs, global: &GlobalOpts) -> Result<(), CliError> {
    if !args.module.is_file() {
        return Err(CliError::Validation {
            field: "module".into(),
            reason: format!("{} is not a file", args.module.display()),
        });
    }

    let device = ActiveDevice::resolve(global)?;
    let session = build_session(device.session_config()?);
    log_state_changes(&session);
    session.startup().await?;

    let result = deploy(&session, &args).await;
    session.shutdown().await;

    let outcome = result?;
    println!(
        "deployed {} from {} ({})",
        outcome.module, outcome.download_url, outcome.deployment_id
    );
    Ok(())
}

async fn deploy(
    session: &edgecam_core::DeviceSession,
    args: &DeployArgs,
) -> Result<edgecam_core::DeployOutcome, CliError> {
    let state = session.state();
    let known = tokio::time::timeout(Duration::from_secs(args.wait), async {
        while state.protocol().is_none() {
            tokio::time::sleep(PROTOCOL_POLL).await;
        }
    })
    .await;
    if known.is_err() {
        return Err(CliError::Timeout {
            what: "the device to report its protocol version".into(),
            seconds: args.wait,
        });
    }

    Ok(session.do_app_deployment(&args.module).await?)
}
