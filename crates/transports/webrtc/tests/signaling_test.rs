//! WebSocket signaling transport tests
//!
//! Run a real [`SignalingServer`] on a loopback port and talk to it with a
//! tungstenite client.

mod harness;

use futures::{SinkExt, StreamExt};
use harness::init_test_tracing;
use intercom_webrtc::signaling::protocol::ICE_CANDIDATE;
use intercom_webrtc::{OutgoingSignalingMessage, SessionHandle, SignalingServer};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> (SocketAddr, mpsc::Receiver<SessionHandle>, CancellationToken) {
    init_test_tracing();
    let server = SignalingServer::bind("127.0.0.1:0", 10).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (session_tx, session_rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();
    server.serve(session_tx, shutdown.clone());
    (addr, session_rx, shutdown)
}

#[tokio::test]
async fn test_connection_becomes_session() {
    let (addr, mut sessions, shutdown) = start_server().await;

    let (mut ws, _) = connect_async(format!("ws://{}/signaling/kitchen-1", addr))
        .await
        .unwrap();
    let mut session = tokio::time::timeout(WAIT, sessions.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.id, "kitchen-1");

    // Client → core, payload left raw
    ws.send(Message::Text(
        r#"{"type":"new-ice-candidate","data":{"candidate":"candidate:1 1 udp 1 127.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#
            .to_string(),
    ))
    .await
    .unwrap();
    let received = tokio::time::timeout(WAIT, session.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.kind, ICE_CANDIDATE);
    assert!(received.data.is_some());

    // Malformed frames are skipped, the next one still arrives
    ws.send(Message::Text("not json".to_string())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"bogus"}"#.to_string()))
        .await
        .unwrap();
    let received = tokio::time::timeout(WAIT, session.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.kind, "bogus");

    // Core → client
    let candidate = RTCIceCandidateInit {
        candidate: "candidate:2 1 udp 1 127.0.0.1 6000 typ host".to_string(),
        ..Default::default()
    };
    session
        .outbound
        .send(OutgoingSignalingMessage::ice_candidate(candidate))
        .await
        .unwrap();
    let frame = tokio::time::timeout(WAIT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = match frame {
        Message::Text(text) => text,
        other => panic!("expected a text frame, got {:?}", other),
    };
    let wire: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(wire["type"], ICE_CANDIDATE);
    assert_eq!(wire["data"]["candidate"], "candidate:2 1 udp 1 127.0.0.1 6000 typ host");

    // Closing the socket ends the inbound sequence
    ws.close(None).await.unwrap();
    let end = tokio::time::timeout(WAIT, session.inbound.recv()).await.unwrap();
    assert!(end.is_none());

    shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_path_is_rejected() {
    let (addr, mut sessions, shutdown) = start_server().await;

    assert!(connect_async(format!("ws://{}/ws", addr)).await.is_err());
    assert!(connect_async(format!("ws://{}/signaling/", addr)).await.is_err());
    assert!(sessions.try_recv().is_err());

    shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_closes_open_sessions() {
    let (addr, mut sessions, shutdown) = start_server().await;

    let (_ws, _) = connect_async(format!("ws://{}/signaling/hall", addr))
        .await
        .unwrap();
    let mut session = tokio::time::timeout(WAIT, sessions.recv())
        .await
        .unwrap()
        .unwrap();

    shutdown.cancel();
    let end = tokio::time::timeout(WAIT, session.inbound.recv()).await.unwrap();
    assert!(end.is_none());
}
