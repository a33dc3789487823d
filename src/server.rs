//! Client transport: health check and the `/ws/voice` WebSocket endpoint.
//!
//! Each WebSocket connection gets its own session: a fresh turn controller
//! wired to the configured STT/LLM/TTS providers, with client frames bridged
//! to controller commands and controller events bridged back out.

use crate::config::OrchestratorConfig;
use crate::error::{AgentError, Result};
use crate::llm::ChatApiClient;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::stt::RealtimeSttClient;
use crate::tts::StreamingTtsClient;
use crate::turn::{SettingsUpdate, TurnController, TurnHandle};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared state for axum handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<OrchestratorConfig>,
    active_sessions: Arc<AtomicUsize>,
}

/// The running voice server.
pub struct VoiceServer {
    addr: SocketAddr,
    serve_task: JoinHandle<()>,
}

impl VoiceServer {
    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid or unavailable.
    pub async fn start(config: OrchestratorConfig) -> Result<Self> {
        let bind = format!("{}:{}", config.server.host, config.server.port);
        let state = AppState {
            config: Arc::new(config),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .route("/health", get(handle_health))
            .route("/ws/voice", get(handle_ws_upgrade))
            .with_state(state);

        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| AgentError::Transport(format!("failed to bind {bind}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| AgentError::Transport(format!("failed to read local addr: {e}")))?;
        info!("voice server listening on {addr}");

        let serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("voice server error: {e}");
            }
        });

        Ok(Self { addr, serve_task })
    }

    /// The bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop serving.
    pub fn shutdown(&self) {
        self.serve_task.abort();
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.active_sessions.load(Ordering::Relaxed),
    }))
}

async fn handle_ws_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(state, socket))
}

/// Run one voice session over its WebSocket.
async fn handle_session(state: AppState, socket: WebSocket) {
    let session_id = Uuid::new_v4().to_string();
    state.active_sessions.fetch_add(1, Ordering::Relaxed);
    info!("new voice session: {session_id}");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let controller = build_controller(&state.config, &session_id);
    let (controller, handle, mut event_rx) = match controller {
        Ok(parts) => parts,
        Err(e) => {
            error!("failed to set up session {session_id}: {e}");
            let frame = ServerFrame::Error {
                code: "internal_error".to_owned(),
                message: e.to_string(),
                recoverable: false,
            };
            let _ = ws_tx.send(Message::Text(frame.to_json().into())).await;
            state.active_sessions.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };
    let controller_task = tokio::spawn(controller.run());

    let ready = ServerFrame::SessionReady {
        session_id: session_id.clone(),
    };
    let _ = ws_tx.send(Message::Text(ready.to_json().into())).await;

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let frame = ServerFrame::from_event(event);
                if ws_tx.send(Message::Text(frame.to_json().into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !dispatch_frame(&session_id, text.as_str(), &handle, &mut ws_tx).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("session {session_id} socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    handle.stop();
    let _ = controller_task.await;
    state.active_sessions.fetch_sub(1, Ordering::Relaxed);
    info!("session {session_id} cleaned up");
}

fn build_controller(
    config: &OrchestratorConfig,
    session_id: &str,
) -> Result<(
    TurnController,
    TurnHandle,
    mpsc::UnboundedReceiver<crate::turn::TurnEvent>,
)> {
    let stt = Box::new(RealtimeSttClient::new(&config.stt));
    let llm = Arc::new(ChatApiClient::new(&config.llm)?);
    let tts = Arc::new(StreamingTtsClient::new(&config.tts)?);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (controller, handle) =
        TurnController::new(session_id, &config.turn, stt, llm, tts, event_tx);
    Ok((controller, handle, event_rx))
}

/// Route one parsed client frame; returns `false` when the session should end.
async fn dispatch_frame(
    session_id: &str,
    raw: &str,
    handle: &TurnHandle,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> bool {
    let frame = match ClientFrame::parse(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("session {session_id}: {e}");
            return true;
        }
    };

    match frame {
        // Transport is already set up by the time frames arrive.
        ClientFrame::Connect => {}
        ClientFrame::Ping => {
            let _ = ws_tx
                .send(Message::Text(ServerFrame::Pong {}.to_json().into()))
                .await;
        }
        ClientFrame::Pong => debug!("session {session_id} heartbeat"),
        ClientFrame::AudioChunk {
            audio,
            format,
            sample_rate,
        } => handle.audio_chunk(audio, format, sample_rate),
        ClientFrame::TextInput { text } => {
            if !text.is_empty() {
                info!("session {session_id} text input: {text}");
                handle.final_transcript(text, 1.0);
            }
        }
        ClientFrame::Interrupt => {
            info!("session {session_id} interrupted");
            handle.interrupt();
        }
        ClientFrame::PlaybackComplete => handle.playback_complete(),
        ClientFrame::UpdateSettings {
            silence_debounce_ms,
            cancellation_threshold,
            adaptive_debounce_enabled,
        } => handle.update_settings(SettingsUpdate {
            silence_debounce_ms,
            cancellation_threshold,
            adaptive_debounce_enabled,
        }),
        ClientFrame::Disconnect => {
            info!("session {session_id} requested disconnect");
            return false;
        }
    }
    true
}
