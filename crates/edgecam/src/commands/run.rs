//! `edgecam run`: keep a session up and log what the device does.

use std::sync::Arc;

use bytesize::ByteSize;
use tokio::sync::broadcast;

use edgecam_api::PortRegistry;
use edgecam_core::{Collaborators, DeviceSession, FlatcDecoder, SessionConfig};

use crate::cli::{GlobalOpts, RunArgs};
use crate::commands::ActiveDevice;
use crate::commands::sink::LogSink;
use crate::error::CliError;

/// Session wired to the real broker, `flatc`, and the log sink.
pub fn build_session(config: SessionConfig) -> DeviceSession {
    let collaborators = Collaborators::mqtt(
        &config,
        Arc::new(LogSink),
        Arc::new(FlatcDecoder::default()),
        PortRegistry::new(),
    );
    DeviceSession::new(config, collaborators)
}

/// Log state changes until the session is dropped.
pub fn log_state_changes(session: &DeviceSession) {
    let state = session.state();
    state.stream_status.subscribe_async(|new, old| async move {
        tracing::info!(status = ?new, previous = ?old, "stream status");
    });
    state.deploy_stage.subscribe_async(|new, _| async move {
        tracing::info!(stage = %new, "deployment stage");
    });
    state.device_config.subscribe_async(|new, _| async move {
        tracing::info!(sensor = %new.status.sensor, "device configuration updated");
    });
}

pub async fn handle(args: RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let device = ActiveDevice::resolve(global)?;
    let session = build_session(device.session_config()?);
    log_state_changes(&session);

    let mut notices = session.notifications();
    let mut frames = session.state().last_frame.stream();
    session.startup().await?;
    eprintln!("session for '{}' running, Ctrl-C to stop", device.name);

    if args.stream {
        session.streaming_rpc_start().await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(frame) = frames.changed() => {
                tracing::info!(image = %frame.image.display(), "frame received");
            }
            notice = notices.recv() => match notice {
                Ok(notice) => tracing::warn!(kind = %notice.kind, detail = %notice.detail, "session notice"),
                Err(broadcast::error::RecvError::Lagged(n)) => tracing::debug!(skipped = n, "notices lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if args.stream {
        if let Err(e) = session.streaming_rpc_stop().await {
            tracing::warn!(error = %e, "could not stop streaming");
        }
    }
    let used = ByteSize::b(session.storage().total_bytes());
    session.shutdown().await;
    eprintln!("session stopped, {used} stored");
    Ok(())
}
