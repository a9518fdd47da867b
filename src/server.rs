//! Gateway server and per-connection session orchestration
//!
//! Each device connection gets one socket task that owns its
//! [`SessionState`]. The task splits the socket, drains a bounded outbound
//! channel through a send task (preserving emission order), and selects over
//! inbound frames and pipeline completion events — so control messages like
//! `abort` are handled while a pipeline run for the same session is awaiting
//! a provider.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::audio::{AudioCodec, Pcm16Codec};
use crate::config::Config;
use crate::pipeline::{ConversationPipeline, PipelineEvent};
use crate::protocol::{
    self, ClientMessage, ListenEvent, Outbound, ServerMessage,
};
use crate::providers::ProviderSet;
use crate::session::{Role, SessionState};
use crate::{Error, Result};

/// Outbound channel depth per session
const OUTBOUND_BUFFER: usize = 64;

/// Shared state handed to every connection
#[derive(Clone)]
struct GatewayState {
    config: Arc<Config>,
    pipeline: Arc<ConversationPipeline>,
}

/// Identity a device presents in its upgrade request headers
#[derive(Debug, Clone)]
struct ConnectionMeta {
    device_id: String,
    client_id: String,
    protocol_version: u32,
}

impl ConnectionMeta {
    fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string()
        };

        let protocol_version = headers
            .get("protocol-version")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        Self {
            device_id: header("device-id"),
            client_id: header("client-id"),
            protocol_version,
        }
    }
}

/// The Chime gateway server
pub struct Gateway {
    state: GatewayState,
}

impl Gateway {
    /// Create a gateway with providers built from configuration
    ///
    /// # Errors
    ///
    /// Returns error if provider construction fails (unknown backend,
    /// missing API key).
    pub fn new(config: Config) -> Result<Self> {
        let providers = ProviderSet::from_config(&config)?;
        Ok(Self::with_providers(config, providers))
    }

    /// Create a gateway with explicit provider implementations
    #[must_use]
    pub fn with_providers(config: Config, providers: ProviderSet) -> Self {
        let pipeline = Arc::new(ConversationPipeline::new(providers, &config));
        Self {
            state: GatewayState {
                config: Arc::new(config),
                pipeline,
            },
        }
    }

    /// Build the router with the WebSocket and health routes
    #[must_use]
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/ws", get(ws_upgrade))
            .route("/health", get(health))
            .with_state(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the gateway on the configured address until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(addr = %addr, "gateway listening");
        self.serve(listener).await
    }

    /// Run the gateway on an existing listener
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
            })
            .await
            .map_err(|e| Error::Config(format!("server error: {e}")))?;

        Ok(())
    }
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Handle a WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let meta = ConnectionMeta::from_headers(&headers);
    tracing::info!(
        device_id = %meta.device_id,
        protocol_version = meta.protocol_version,
        "device connecting"
    );
    ws.on_upgrade(move |socket| handle_socket(socket, state, meta))
}

/// Run one device session until the connection closes
async fn handle_socket(socket: WebSocket, state: GatewayState, meta: ConnectionMeta) {
    let (mut sender, mut receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);

    // Send task: serialize the outbound channel onto the wire in order
    let send_task = tokio::spawn(async move {
        while let Some(out) = outbound_rx.recv().await {
            let message = match out {
                Outbound::Control(control) => match serde_json::to_string(&control) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize outbound message");
                        continue;
                    }
                },
                Outbound::Audio(frame) => Message::Binary(frame.into()),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let (events_tx, mut events_rx) = mpsc::channel::<PipelineEvent>(8);
    let mut handler = SessionHandler::new(state, meta, outbound_tx);

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(message)) => {
                    if handler.handle_frame(message, &events_tx).await.is_break() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        session_id = %handler.session.id(),
                        error = %e,
                        "websocket protocol error"
                    );
                    break;
                }
                None => break,
            },
            Some(event) = events_rx.recv() => {
                handler.handle_pipeline_event(event);
            }
        }
    }

    // Transport gone: cancel any in-flight pipeline and release the session
    handler.session.abort();
    send_task.abort();
    tracing::info!(
        session_id = %handler.session.id(),
        device_id = %handler.session.device_id(),
        "session closed"
    );
}

/// Per-connection message router and state machine
struct SessionHandler {
    state: GatewayState,
    session: SessionState,
    outbound: mpsc::Sender<Outbound>,
    codec: Pcm16Codec,
    protocol_version: u32,
}

impl SessionHandler {
    fn new(state: GatewayState, meta: ConnectionMeta, outbound: mpsc::Sender<Outbound>) -> Self {
        let session = SessionState::new(
            meta.device_id,
            meta.client_id,
            state.config.session.max_history,
        );
        let codec = Pcm16Codec::new(state.config.audio_in);

        Self {
            state,
            session,
            outbound,
            codec,
            protocol_version: meta.protocol_version,
        }
    }

    /// Classify and dispatch one transport frame
    async fn handle_frame(
        &mut self,
        message: Message,
        events: &mpsc::Sender<PipelineEvent>,
    ) -> std::ops::ControlFlow<()> {
        match message {
            Message::Text(text) => self.handle_text(text.as_str(), events).await,
            Message::Binary(data) => self.handle_binary(&data),
            Message::Close(reason) => {
                tracing::info!(
                    session_id = %self.session.id(),
                    reason = ?reason,
                    "device closed connection"
                );
                return std::ops::ControlFlow::Break(());
            }
            // axum answers pings; pongs need no action
            Message::Ping(_) | Message::Pong(_) => {}
        }
        std::ops::ControlFlow::Continue(())
    }

    /// Parse and dispatch a JSON control message.
    ///
    /// Malformed JSON and unknown message types are logged and skipped —
    /// neither ever closes the connection.
    async fn handle_text(&mut self, text: &str, events: &mpsc::Sender<PipelineEvent>) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session.id(),
                    error = %e,
                    payload = %text.chars().take(100).collect::<String>(),
                    "malformed JSON message"
                );
                return;
            }
        };

        let message: ClientMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session.id(),
                    error = %e,
                    "unrecognized message, ignoring"
                );
                return;
            }
        };

        match message {
            ClientMessage::Hello {
                transport,
                audio_params,
                ..
            } => self.handle_hello(&transport, audio_params.as_ref()).await,
            ClientMessage::Listen { state, mode, text } => {
                self.handle_listen(state, mode.as_deref(), text.as_deref(), events);
            }
            ClientMessage::Abort { reason } => {
                self.session.abort();
                tracing::info!(
                    session_id = %self.session.id(),
                    reason = reason.as_deref().unwrap_or("none"),
                    "turn aborted by device"
                );
            }
            ClientMessage::Mcp { .. } => {
                tracing::debug!(
                    session_id = %self.session.id(),
                    "mcp passthrough message ignored"
                );
            }
        }
    }

    /// Acknowledge the handshake. The ack is queued before anything else —
    /// the device disconnects if it doesn't arrive within its own timeout.
    async fn handle_hello(
        &mut self,
        transport: &str,
        requested: Option<&protocol::AudioParams>,
    ) {
        let ack = ServerMessage::hello(self.session.id(), self.state.config.audio_out);
        if self.outbound.send(Outbound::Control(ack)).await.is_err() {
            return;
        }

        // The audio contract is server-authoritative; a transport mismatch
        // is logged but doesn't fail the session
        if transport != "websocket" {
            tracing::warn!(
                session_id = %self.session.id(),
                transport,
                "unsupported transport declared, proceeding with websocket contract"
            );
        }

        tracing::info!(
            session_id = %self.session.id(),
            device_id = %self.session.device_id(),
            requested = ?requested,
            sample_rate_out = self.state.config.audio_out.sample_rate,
            "handshake complete"
        );
    }

    /// Listen state transitions (§ start/stop/detect)
    fn handle_listen(
        &mut self,
        state: ListenEvent,
        mode: Option<&str>,
        text: Option<&str>,
        events: &mpsc::Sender<PipelineEvent>,
    ) {
        match state {
            ListenEvent::Start => {
                self.session.start_listening();
                tracing::info!(
                    session_id = %self.session.id(),
                    mode = mode.unwrap_or("auto"),
                    "listening started"
                );
            }
            ListenEvent::Stop => {
                let Some(samples) = self.session.stop_listening() else {
                    tracing::debug!(
                        session_id = %self.session.id(),
                        "listen stop outside listening, ignoring"
                    );
                    return;
                };

                tracing::info!(
                    session_id = %self.session.id(),
                    samples = samples.len(),
                    "listening stopped, starting pipeline"
                );

                let pipeline = Arc::clone(&self.state.pipeline);
                let turn = self.session.current_turn();
                let session_id = self.session.id().to_string();
                let history = self.session.history().to_vec();
                let outbound = self.outbound.clone();
                let events = events.clone();
                let abort = self.session.abort_flag();

                tokio::spawn(async move {
                    pipeline
                        .run(turn, session_id, samples, history, outbound, events, abort)
                        .await;
                });
            }
            ListenEvent::Detect => {
                // Wake word heard on-device: informational only, a hook
                // point for future voice-activity triggering
                tracing::info!(
                    session_id = %self.session.id(),
                    wake_word = text.unwrap_or(""),
                    "wake word reported"
                );
            }
        }
    }

    /// Decode one binary audio frame and buffer it while listening
    fn handle_binary(&mut self, data: &[u8]) {
        let Some(payload) = protocol::extract_audio_payload(data, self.protocol_version) else {
            tracing::warn!(
                session_id = %self.session.id(),
                len = data.len(),
                "truncated binary frame dropped"
            );
            return;
        };

        match self.codec.decode(payload) {
            Ok(samples) => {
                if !self.session.append_audio(&samples) {
                    tracing::trace!(
                        session_id = %self.session.id(),
                        "audio outside listening interval discarded"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session.id(),
                    error = %e,
                    "audio frame decode failed"
                );
            }
        }
    }

    /// Apply a pipeline completion signal to the session state
    fn handle_pipeline_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Transcribed { turn, text } => {
                if turn == self.session.current_turn() {
                    self.session.push_turn(Role::User, text);
                    self.session.mark_responding(turn);
                }
            }
            PipelineEvent::Finished { turn, response } => {
                if self.session.finish_turn(turn) {
                    if let Some(response) = response {
                        self.session.push_turn(Role::Assistant, response);
                    }
                    tracing::info!(
                        session_id = %self.session.id(),
                        history_len = self.session.history().len(),
                        "turn complete"
                    );
                } else {
                    // Superseded by a newer listening interval: the partial
                    // response is dropped, not recorded
                    tracing::debug!(
                        session_id = %self.session.id(),
                        turn,
                        "stale pipeline completion dropped"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_meta_parses_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("device-id", "aa:bb:cc".parse().unwrap());
        headers.insert("protocol-version", "3".parse().unwrap());

        let meta = ConnectionMeta::from_headers(&headers);
        assert_eq!(meta.device_id, "aa:bb:cc");
        assert_eq!(meta.client_id, "unknown");
        assert_eq!(meta.protocol_version, 3);
    }

    #[test]
    fn connection_meta_defaults() {
        let meta = ConnectionMeta::from_headers(&HeaderMap::new());
        assert_eq!(meta.device_id, "unknown");
        assert_eq!(meta.protocol_version, 1);
    }
}
