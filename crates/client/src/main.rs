mod cli;

use std::sync::Arc;

use anyhow::Context;
use dispatch_client::config::load_config;
use dispatch_client::media::{MediaSource, SampleTrackDevice};
use dispatch_client::peer::RtcPeerConnector;
use dispatch_client::{
    CallSessionController, CallState, CoreEvent, DriverRoster, SessionHandle, SignalingTransport,
};
use dispatch_protocol::{DriverStatus, Role, SessionConfig};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (needed for wss:// signaling)
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = cli::parse_args()?;
    let mut config = load_config(&args.config_path)?;
    args.apply(&mut config);

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{}", issue);
            } else {
                warn!("{}", issue);
            }
        }
        if has_errors {
            error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let transport = Arc::new(SignalingTransport::connect(&config.signaling).await?);

    let media = Arc::new(MediaSource::new(
        Arc::new(SampleTrackDevice),
        config.media.clone(),
    ));
    if args.role != Role::Caller
        && let Err(e) = media.acquire().await
    {
        warn!("Joining without local media: {e}");
    }
    let connector =
        Arc::new(RtcPeerConnector::new(&config.ice).context("Failed to set up WebRTC")?);

    let controller = CallSessionController::new(
        args.role,
        config.session.clone(),
        transport.clone(),
        media,
        connector,
    )
    .with_roster(DriverRoster::from_config(&config.drivers));
    let mut events = controller.events().subscribe();

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let _forward = transport.forward_to(inbound_tx);
    let (handle, controller_task) = controller.spawn(inbound_rx);

    info!(role = %args.role, url = transport.url(), "Dispatch client running");

    tokio::select! {
        result = drive(&handle, &mut events, &args, &config.session) => {
            if let Err(e) = result {
                error!("{e:#}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
    }

    if let Err(e) = handle.end_call().await {
        debug!("End call on shutdown: {e}");
    }
    drop(handle);
    if let Err(e) = controller_task.await {
        warn!("Controller task panicked: {e:?}");
    }
    transport.close();

    info!("Client shutdown complete");
    Ok(())
}

/// Perform the role's start action, then log core events until the session ends.
async fn drive(
    handle: &SessionHandle,
    events: &mut broadcast::Receiver<CoreEvent>,
    args: &cli::Args,
    session: &SessionConfig,
) -> anyhow::Result<()> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Core event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        };

        match event {
            CoreEvent::IdentityAssigned { id } => {
                info!(id = %id, "Assigned participant id");
                match args.role {
                    Role::Caller => handle.start_call().await?,
                    Role::Agent => {
                        info!(room = %session.default_room, "Joining room");
                        handle
                            .join_room(session.default_room.as_str(), Some(Role::Agent))
                            .await?;
                    }
                    Role::Driver => info!("Waiting for dispatch"),
                }
            }
            CoreEvent::JoinRequested { room } if args.role == Role::Driver => {
                info!(room = %room, "Dispatched to room, joining");
                handle.accept_join_request().await?;
                set_driver_status(handle, args, DriverStatus::Busy).await?;
            }
            CoreEvent::IncomingCall { caller_id, name } if !session.auto_answer => {
                info!(caller_id = %caller_id, name = %name, "Incoming call, answering");
                handle.answer_call(caller_id).await?;
            }
            CoreEvent::SessionState { from, to } => {
                info!(%from, %to, "Call state changed");
                if to == CallState::Ended {
                    set_driver_status(handle, args, DriverStatus::Available).await?;
                    if args.role == Role::Caller {
                        return Ok(());
                    }
                }
            }
            CoreEvent::StreamReady {
                remote_id,
                stream_id,
            } => {
                info!(remote_id = %remote_id, stream_id = %stream_id, "Remote stream ready");
            }
            CoreEvent::TransportLost { reason } => {
                anyhow::bail!("Signaling connection lost: {reason}");
            }
            CoreEvent::Error { message } => warn!("{message}"),
            other => debug!(event = ?other, "Core event"),
        }
    }
}

/// Report the driver's roster status when it differs from `status`.
async fn set_driver_status(
    handle: &SessionHandle,
    args: &cli::Args,
    status: DriverStatus,
) -> anyhow::Result<()> {
    let Some(employee_id) = args.employee_id.as_deref() else {
        return Ok(());
    };
    let snapshot = handle.snapshot().await?;
    let current = snapshot
        .drivers
        .iter()
        .find(|d| d.employee_id == employee_id)
        .map(|d| d.status);
    match current {
        Some(current) if current != status => {
            handle.toggle_driver_status(employee_id).await?;
        }
        Some(_) => {}
        None => warn!(employee_id, "Employee id is not in the driver roster"),
    }
    Ok(())
}
