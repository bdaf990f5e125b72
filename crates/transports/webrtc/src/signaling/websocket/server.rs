//! WebSocket signaling server
//!
//! Accepts upgrades on `/signaling/{id}` and hands each connection to the
//! lifecycle coordinator as a [`SessionHandle`].

use super::handler::handle_connection;
use crate::signaling::session::SessionHandle;
use crate::Result;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// WebSocket signaling server
pub struct SignalingServer {
    listener: TcpListener,
    session_buffer: usize,
}

impl SignalingServer {
    /// Bind the listener
    pub async fn bind(addr: &str, session_buffer: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "WebSocket signaling server listening on ws://{}/signaling/{{id}}",
            listener.local_addr()?
        );
        Ok(Self {
            listener,
            session_buffer,
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until `shutdown` fires.
    ///
    /// Every accepted connection produces one [`SessionHandle`] on `sessions`.
    /// Cancelling `shutdown` also closes every open connection.
    pub fn serve(
        self,
        sessions: mpsc::Sender<SessionHandle>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let listener = self.listener;
        let session_buffer = self.session_buffer;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                debug!("Accepted TCP connection from {}", peer_addr);
                                let sessions = sessions.clone();
                                let connection_shutdown = shutdown.child_token();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(
                                        stream,
                                        sessions,
                                        session_buffer,
                                        connection_shutdown,
                                    )
                                    .await
                                    {
                                        error!("WebSocket connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept WebSocket connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("WebSocket signaling server received shutdown signal");
                        break;
                    }
                }
            }

            info!("WebSocket signaling server accept loop exited");
        })
    }
}
