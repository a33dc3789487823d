//! STT adapter tests against a local WebSocket fixture.
//!
//! Covers the send path (audio forwarding, keepalive), the receive path
//! (frame parsing into events), clean disconnect, and reconnection after
//! transport loss.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use voxloop::config::SttConfig;
use voxloop::stt::{RealtimeSttClient, SpeechToText, SttEvent, SttStatus};

/// One accepted server-side connection.
struct Connection {
    incoming: mpsc::UnboundedReceiver<Message>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl Connection {
    async fn next_message(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(3), self.incoming.recv())
            .await
            .expect("timed out waiting for server-side message")
            .expect("server connection closed")
    }

    fn send_text(&self, text: &str) {
        let _ = self.outgoing.send(Message::Text(text.to_owned()));
    }
}

/// Accepts connections and exposes each as channel pairs.
async fn spawn_server() -> (String, mpsc::UnboundedReceiver<Connection>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let Ok(ws) = accept_async(stream).await else {
                continue;
            };
            let (mut write, mut read) = ws.split();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(msg)) => {
                                let _ = in_tx.send(msg);
                            }
                            _ => break,
                        },
                        out = out_rx.recv() => match out {
                            Some(msg) => {
                                if write.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            // Dropped by the test: close the socket.
                            None => {
                                let _ = write.close().await;
                                break;
                            }
                        },
                    }
                }
            });
            if conn_tx
                .send(Connection {
                    incoming: in_rx,
                    outgoing: out_tx,
                })
                .is_err()
            {
                break;
            }
        }
    });

    (format!("ws://{addr}"), conn_rx)
}

async fn next_connection(conn_rx: &mut mpsc::UnboundedReceiver<Connection>) -> Connection {
    tokio::time::timeout(Duration::from_secs(3), conn_rx.recv())
        .await
        .expect("timed out waiting for connection")
        .expect("server stopped")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SttEvent>) -> SttEvent {
    tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("timed out waiting for STT event")
        .expect("event channel closed")
}

fn config_for(endpoint: &str, keepalive_interval_ms: u64) -> SttConfig {
    SttConfig {
        endpoint: endpoint.to_owned(),
        api_key: "test-key".to_owned(),
        keepalive_interval_ms,
        ..Default::default()
    }
}

#[tokio::test]
async fn forwards_audio_and_parses_transcripts() {
    let (endpoint, mut connections) = spawn_server().await;
    let mut client = RealtimeSttClient::new(&config_for(&endpoint, 5_000));
    let (events_tx, mut events) = mpsc::unbounded_channel();

    client.connect(events_tx).await.unwrap();
    assert!(client.status() == SttStatus::Connected);
    let mut connection = next_connection(&mut connections).await;

    client.send_audio(Bytes::from_static(b"pcm-audio")).await;
    let message = connection.next_message().await;
    assert!(message == Message::Binary(b"pcm-audio".to_vec()));

    connection.send_text(
        r#"{"channel":{"alternatives":[{"transcript":"hello","confidence":0.5}]},"is_final":false}"#,
    );
    assert!(
        next_event(&mut events).await
            == SttEvent::Partial {
                text: "hello".to_owned(),
                confidence: 0.5
            }
    );

    connection.send_text(
        r#"{"channel":{"alternatives":[{"transcript":"hello there","confidence":0.95}]},"speech_final":true}"#,
    );
    assert!(
        next_event(&mut events).await
            == SttEvent::Final {
                text: "hello there".to_owned(),
                confidence: 0.95
            }
    );

    client.disconnect().await;
    assert!(client.status() == SttStatus::Closing);
    // Disconnecting again is a no-op.
    client.disconnect().await;
}

#[tokio::test]
async fn emits_keepalive_when_no_audio_flows() {
    let (endpoint, mut connections) = spawn_server().await;
    let mut client = RealtimeSttClient::new(&config_for(&endpoint, 150));
    let (events_tx, _events) = mpsc::unbounded_channel();

    client.connect(events_tx).await.unwrap();
    let mut connection = next_connection(&mut connections).await;

    let message = connection.next_message().await;
    let Message::Text(text) = message else {
        panic!("expected keepalive text frame");
    };
    assert!(text.contains("KeepAlive"));

    client.disconnect().await;
}

#[tokio::test]
async fn close_frame_is_sent_on_disconnect() {
    let (endpoint, mut connections) = spawn_server().await;
    let mut client = RealtimeSttClient::new(&config_for(&endpoint, 5_000));
    let (events_tx, _events) = mpsc::unbounded_channel();

    client.connect(events_tx).await.unwrap();
    let mut connection = next_connection(&mut connections).await;

    client.disconnect().await;
    let message = connection.next_message().await;
    let Message::Text(text) = message else {
        panic!("expected close text frame");
    };
    assert!(text.contains("CloseStream"));
}

#[tokio::test]
async fn reconnects_after_transport_loss() {
    let (endpoint, mut connections) = spawn_server().await;
    let mut client = RealtimeSttClient::new(&config_for(&endpoint, 5_000));
    let (events_tx, mut events) = mpsc::unbounded_channel();

    client.connect(events_tx).await.unwrap();
    let first = next_connection(&mut connections).await;

    // Server drops the socket; the first backoff step is immediate.
    drop(first.outgoing);
    let second = next_connection(&mut connections).await;

    second.send_text(
        r#"{"channel":{"alternatives":[{"transcript":"still here","confidence":0.9}]},"is_final":true}"#,
    );
    assert!(
        next_event(&mut events).await
            == SttEvent::Final {
                text: "still here".to_owned(),
                confidence: 0.9
            }
    );

    client.disconnect().await;
}
