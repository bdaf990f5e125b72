//! WebSocket connection handler
//!
//! Upgrades `/signaling/{id}` requests, turns the socket into a
//! [`SessionHandle`] for the lifecycle coordinator, and pumps frames between
//! the two until either side goes away.

use crate::signaling::protocol::IncomingSignalingMessage;
use crate::signaling::session::SessionHandle;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Route prefix for signaling upgrades
pub const SIGNALING_PATH: &str = "/signaling/";

/// Extract the session id from a `/signaling/{id}` path
pub fn session_id_from_path(path: &str) -> Option<String> {
    let id = path.strip_prefix(SIGNALING_PATH)?.trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id.to_string())
}

fn not_found(path: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("no signaling route for {}", path)));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Handle a single WebSocket connection
pub async fn handle_connection(
    stream: TcpStream,
    sessions: mpsc::Sender<SessionHandle>,
    session_buffer: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = stream.peer_addr()?;

    let mut session_id = None;
    let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        let path = request.uri().path();
        match session_id_from_path(path) {
            Some(id) => {
                session_id = Some(id);
                Ok(response)
            }
            None => Err(not_found(path)),
        }
    })
    .await
    .map_err(|e| Error::WebSocketError(format!("handshake with {} failed: {}", addr, e)))?;

    let session_id = session_id
        .ok_or_else(|| Error::SignalingError("upgrade accepted without a session id".to_string()))?;
    info!(session_id = %session_id, %addr, "Signaling connection opened");

    let (handle, transport) = SessionHandle::pair(session_id.clone(), session_buffer);
    if sessions.send(handle).await.is_err() {
        warn!(session_id = %session_id, "Session intake closed, dropping connection");
        return Ok(());
    }

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let inbound = transport.inbound;
    let mut outbound = transport.outbound;

    // Forward outbound messages to the socket
    let forward_id = session_id.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(session_id = %forward_id, error = %e, "Failed to encode signaling message");
                    continue;
                }
            };
            debug!(session_id = %forward_id, kind = message.kind(), "Sending signaling message");
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                debug!(session_id = %forward_id, error = %e, "Signaling socket write failed");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(session_id = %session_id, "Signaling connection shutting down");
                break;
            }
            frame = ws_rx.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let message = match IncomingSignalingMessage::from_json(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Malformed signaling envelope");
                        continue;
                    }
                };
                debug!(session_id = %session_id, kind = %message.kind, "Received signaling message");
                if inbound.send(message).await.is_err() {
                    debug!(session_id = %session_id, "Session released its inbound channel");
                    break;
                }
            }
            Some(Ok(Message::Close(_))) => {
                info!(session_id = %session_id, "Signaling connection closed by client");
                break;
            }
            Some(Ok(Message::Binary(_))) => {
                debug!(session_id = %session_id, "Ignoring binary signaling frame");
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "Signaling socket error");
                break;
            }
            None => break,
        }
    }

    // Ends the session's inbound sequence
    drop(inbound);
    forward_task.abort();

    info!(session_id = %session_id, "Signaling connection finished");
    Ok(())
}
