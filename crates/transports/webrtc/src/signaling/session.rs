//! Per-connection signaling handle
//!
//! The transport creates one [`SessionHandle`] per signaling connection and
//! keeps the opposite ends ([`SessionTransport`]). Closing the transport's
//! inbound sender ends the session's inbound sequence.

use super::protocol::{IncomingSignalingMessage, OutgoingSignalingMessage};
use tokio::sync::mpsc;

/// Core-facing half of a signaling connection
#[derive(Debug)]
pub struct SessionHandle {
    /// Unique per signaling connection
    pub id: String,

    /// Messages received from the remote peer; ends when the transport closes
    pub inbound: mpsc::Receiver<IncomingSignalingMessage>,

    /// Messages to send to the remote peer
    pub outbound: mpsc::Sender<OutgoingSignalingMessage>,
}

/// Transport-facing half of a signaling connection
#[derive(Debug)]
pub struct SessionTransport {
    pub id: String,

    /// Feed received messages to the core
    pub inbound: mpsc::Sender<IncomingSignalingMessage>,

    /// Messages the core wants sent
    pub outbound: mpsc::Receiver<OutgoingSignalingMessage>,
}

impl SessionHandle {
    /// Create a connected handle/transport pair with `capacity` slots per direction
    ///
    /// # Example
    ///
    /// ```
    /// use intercom_webrtc::signaling::{IncomingSignalingMessage, SessionHandle};
    ///
    /// # tokio_test::block_on(async {
    /// let (mut handle, transport) = SessionHandle::pair("peer-1", 10);
    /// let message = IncomingSignalingMessage::from_json(r#"{"type":"bogus"}"#).unwrap();
    /// transport.inbound.send(message).await.unwrap();
    /// assert_eq!(handle.inbound.recv().await.unwrap().kind, "bogus");
    /// # });
    /// ```
    pub fn pair(id: impl Into<String>, capacity: usize) -> (SessionHandle, SessionTransport) {
        let id = id.into();
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));

        (
            SessionHandle {
                id: id.clone(),
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            SessionTransport {
                id,
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_connected_both_ways() {
        let (mut handle, mut transport) = SessionHandle::pair("peer-1", 10);
        assert_eq!(handle.id, transport.id);

        let message = IncomingSignalingMessage::from_json(r#"{"type":"bogus"}"#).unwrap();
        transport.inbound.send(message).await.unwrap();
        assert_eq!(handle.inbound.recv().await.unwrap().kind, "bogus");

        drop(transport.inbound);
        assert!(handle.inbound.recv().await.is_none());

        drop(handle.outbound);
        assert!(transport.outbound.recv().await.is_none());
    }
}
