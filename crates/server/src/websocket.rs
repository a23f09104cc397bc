//! WebSocket transport: binary frames carry PCM16 audio, text frames carry
//! the JSON control events. Fallback and testing path; WebRTC is the
//! latency-target path.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use dhwani_core::{AudioFrame, SampleRate, FRAME_SAMPLES};
use dhwani_transport::{ControlEvent, Transport, TransportError};

use crate::session::spawn_bridge;
use crate::state::AppState;

enum Outbound {
    Audio(Vec<u8>),
    Event(String),
}

/// WebSocket-backed implementation of the shared transport capability.
pub struct WsTransport {
    outbound: mpsc::Sender<Outbound>,
    inbound_audio: AsyncMutex<mpsc::Receiver<AudioFrame>>,
    inbound_events: AsyncMutex<mpsc::Receiver<ControlEvent>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Audio(frame.to_pcm16()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv_audio(&self) -> Result<Option<AudioFrame>, TransportError> {
        Ok(self.inbound_audio.lock().await.recv().await)
    }

    async fn send_event(&self, event: &ControlEvent) -> Result<(), TransportError> {
        let json =
            serde_json::to_string(event).map_err(|e| TransportError::Internal(e.to_string()))?;
        self.outbound
            .send(Outbound::Event(json))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv_event(&self) -> Result<Option<ControlEvent>, TransportError> {
        Ok(self.inbound_events.lock().await.recv().await)
    }
}

/// Upgrade handler for `GET /ws/{session_id}`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, axum::http::StatusCode> {
    if !(state.auth_hook)(&headers) {
        return Err(axum::http::StatusCode::UNAUTHORIZED);
    }
    if !state.rate_limiter.try_acquire() {
        return Err(axum::http::StatusCode::TOO_MANY_REQUESTS);
    }
    let session = state
        .sessions
        .get(&session_id)
        .ok_or(axum::http::StatusCode::NOT_FOUND)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, session)))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    session: Arc<crate::session::Session>,
) {
    let (mut sink, mut stream) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(256);
    let (audio_tx, audio_rx) = mpsc::channel::<AudioFrame>(512);
    let (event_tx, event_rx) = mpsc::channel::<ControlEvent>(64);

    let transport = Arc::new(WsTransport {
        outbound: outbound_tx,
        inbound_audio: AsyncMutex::new(audio_rx),
        inbound_events: AsyncMutex::new(event_rx),
    });

    // Announce the session before audio flows.
    let _ = transport
        .send_event(&ControlEvent::SessionInfo {
            session_id: session.id.clone(),
        })
        .await;

    spawn_bridge(session.clone(), transport.clone());

    // Writer: serialize outbound traffic onto the socket.
    let writer_cancel = session.cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                item = outbound_rx.recv() => match item {
                    Some(Outbound::Audio(bytes)) => {
                        if sink.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Event(json)) => {
                        if sink.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        let _ = sink.close().await;
    });

    // Reader: decode socket traffic into frames and events. Timestamps are
    // stamped at ingress from the connection's monotonic clock.
    let started = Instant::now();
    let mut sequence = 0u64;
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(bytes)) => {
                let frame = AudioFrame::from_pcm16(
                    &bytes,
                    SampleRate::Hz16000,
                    sequence,
                    started.elapsed().as_micros() as u64,
                );
                for sub in frame.split(FRAME_SAMPLES) {
                    sequence = sub.sequence + 1;
                    if audio_tx.send(sub).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Text(text)) => match serde_json::from_str::<ControlEvent>(&text) {
                Ok(event) => {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("malformed control event dropped: {}", e);
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Client went away: end the session cleanly.
    session.cancel.cancel();
    state.sessions.remove(&session.id);
    let _ = writer.await;
    tracing::info!(session = %session.id, "websocket closed");
}
