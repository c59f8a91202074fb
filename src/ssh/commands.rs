//! Bridge between a front-end message stream and a registry session.

use super::connection::ConnectParams;
use super::protocol::{ClientMessage, ServerMessage};
use super::session::{PtySize, ReadOutcome, Session};
use super::SessionRegistry;
use crate::error::EngineResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Open a session for `params` and pump messages until either side goes away.
///
/// The session is closed when the inbound stream ends, the outbound receiver
/// is dropped, or the remote shell exits.
pub async fn serve_session(
    registry: Arc<SessionRegistry>,
    params: ConnectParams,
    size: PtySize,
    mut inbound: mpsc::Receiver<ClientMessage>,
    outbound: mpsc::Sender<ServerMessage>,
    read_timeout: Duration,
) -> EngineResult<()> {
    let session = match registry.create(&params, size).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("Session open failed for host {}: {}", params.host_id, e);
            let _ = outbound.send(ServerMessage::error(&e)).await;
            return Err(e);
        }
    };

    let session_id = session.id().to_string();
    if outbound
        .send(ServerMessage::Connected {
            session_id: session_id.clone(),
        })
        .await
        .is_ok()
    {
        pump(&session, &mut inbound, &outbound, read_timeout).await;
    }

    // Already gone if the reaper got there first
    if registry.close(&session_id).await.is_err() {
        session.close().await;
    }
    tracing::info!("Bridge for session {} finished", session_id);
    Ok(())
}

async fn pump(
    session: &Session,
    inbound: &mut mpsc::Receiver<ClientMessage>,
    outbound: &mpsc::Sender<ServerMessage>,
    read_timeout: Duration,
) {
    let mut stderr_open = true;

    loop {
        let reply = tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => handle_client_message(session, message).await,
                None => {
                    tracing::debug!("Client left session {}", session.id());
                    return;
                }
            },
            outcome = session.read(read_timeout) => match outcome {
                ReadOutcome::Data(data) => Some(ServerMessage::output(data)),
                ReadOutcome::NoData => None,
                ReadOutcome::Eof => {
                    tracing::debug!("Session {} reached end of output", session.id());
                    return;
                }
            },
            outcome = session.read_error(read_timeout), if stderr_open => match outcome {
                ReadOutcome::Data(data) => Some(ServerMessage::output(data)),
                ReadOutcome::NoData => None,
                ReadOutcome::Eof => {
                    stderr_open = false;
                    None
                }
            },
        };

        if let Some(reply) = reply {
            if outbound.send(reply).await.is_err() {
                return;
            }
        }
    }
}

async fn handle_client_message(session: &Session, message: ClientMessage) -> Option<ServerMessage> {
    match message {
        ClientMessage::Input { data } => match session.write(&data.0).await {
            Ok(written) if written < data.0.len() => {
                tracing::debug!(
                    "Partial write on session {}: {} of {} bytes",
                    session.id(),
                    written,
                    data.0.len()
                );
                None
            }
            Ok(_) => None,
            Err(e) => Some(ServerMessage::error(&e)),
        },
        ClientMessage::Resize { rows, cols } => session
            .resize(rows, cols)
            .await
            .err()
            .map(|e| ServerMessage::error(&e)),
        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}
