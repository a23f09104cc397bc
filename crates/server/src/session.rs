//! Session lifecycle: creation, the transport↔pipeline bridge, idle
//! reaping. A session owns its agent, orchestrator, and cancellation
//! token; dropping the transport or hitting the idle timeout tears the
//! whole thing down deterministically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use dhwani_agent::memory::{HierarchicalMemory, LlmSummarizer, MemoryConfig};
use dhwani_agent::VoiceAgent;
use dhwani_config::SessionSettings;
use dhwani_core::{frame_channel, FrameSender};
use dhwani_pipeline::{
    Orchestrator, PipelineEvent, StreamingStt, StreamingTts, TurnDetector, VadEngine,
};
use dhwani_transport::{ControlEvent, Transport};

use crate::state::AppState;

pub struct Session {
    pub id: String,
    pub created: Instant,
    last_activity: Mutex<Instant>,
    pub cancel: CancellationToken,
    pub frames: FrameSender,
    pub orchestrator: Arc<Orchestrator>,
    pub agent: Arc<VoiceAgent>,
}

impl Session {
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    settings: SessionSettings,
}

impl SessionStore {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            sessions: DashMap::new(),
            settings,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn remove(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Create a session: fresh VAD/STT/turn/TTS state over the shared
    /// model handles, a fresh agent, and a running orchestrator loop.
    pub fn create(&self, state: &Arc<AppState>) -> Result<Arc<Session>, dhwani_core::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        let agent = VoiceAgent::new(
            id.clone(),
            state.settings.clone(),
            state.domain.clone(),
            HierarchicalMemory::new(
                MemoryConfig {
                    working_turns: state.settings.session.working_memory_turns,
                    ..MemoryConfig::default()
                },
                Some(LlmSummarizer::new(state.slm_backend.clone())),
            ),
            state.executor.clone(),
            state.registry.clone(),
            state.catalog.clone(),
            Some(state.retriever.clone()),
        )?;

        let orchestrator = Orchestrator::new(
            id.clone(),
            VadEngine::new(
                std::path::Path::new(&state.settings.models.dir).join(&state.settings.models.vad),
                state.settings.vad.clone(),
            )
            .map_err(dhwani_core::Error::from)?,
            Arc::new(StreamingStt::new(
                state.stt_backend.clone(),
                state.settings.stt.clone(),
            )),
            Arc::new(TurnDetector::new(state.settings.turn.clone())),
            Arc::new(StreamingTts::new(
                state.tts_backend.clone(),
                state.settings.tts.clone(),
            )),
            agent.clone(),
            cancel.clone(),
        );

        let (frames_tx, frames_rx) = frame_channel(512);
        tokio::spawn(orchestrator.clone().run(frames_rx));

        let session = Arc::new(Session {
            id: id.clone(),
            created: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            cancel,
            frames: frames_tx,
            orchestrator,
            agent,
        });
        self.sessions.insert(id, session.clone());
        metrics::gauge!("sessions_active").set(self.sessions.len() as f64);
        Ok(session)
    }

    /// Periodically evict idle sessions.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let store = self.clone();
        let idle_timeout = Duration::from_secs(store.settings.idle_timeout_secs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            loop {
                tick.tick().await;
                let expired: Vec<String> = store
                    .sessions
                    .iter()
                    .filter(|entry| entry.value().idle_for() > idle_timeout)
                    .map(|entry| entry.key().clone())
                    .collect();
                for id in expired {
                    tracing::info!(session = %id, "reaping idle session");
                    store.remove(&id);
                }
                metrics::gauge!("sessions_active").set(store.sessions.len() as f64);
            }
        });
    }
}

/// Bind a transport to a session: inbound audio and events flow into the
/// pipeline, pipeline events flow back out. Works identically for the
/// WebSocket and WebRTC transports.
pub fn spawn_bridge(session: Arc<Session>, transport: Arc<dyn Transport>) {
    // Inbound audio pump.
    {
        let session = session.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    frame = transport.recv_audio() => match frame {
                        Ok(Some(frame)) => {
                            session.touch();
                            if session.frames.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }
            session.cancel.cancel();
        });
    }

    // Inbound control events.
    {
        let session = session.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    event = transport.recv_event() => match event {
                        Ok(Some(ControlEvent::Ping)) => {
                            let _ = transport.send_event(&ControlEvent::Pong).await;
                        }
                        Ok(Some(ControlEvent::EndSession)) => {
                            session.cancel.cancel();
                            break;
                        }
                        Ok(Some(ControlEvent::Text { content })) => {
                            session.touch();
                            handle_text_turn(&session, &transport, content).await;
                        }
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        });
    }

    // Outbound pipeline events.
    {
        let session = session.clone();
        tokio::spawn(async move {
            let mut events = session.orchestrator.subscribe();
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    event = events.recv() => {
                        let Ok(event) = event else { break };
                        if forward_event(&session, &transport, event).await.is_err() {
                            session.cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });
    }
}

async fn forward_event(
    session: &Arc<Session>,
    transport: &Arc<dyn Transport>,
    event: PipelineEvent,
) -> Result<(), dhwani_transport::TransportError> {
    match event {
        PipelineEvent::Partial(t) => {
            transport
                .send_event(&ControlEvent::Transcript {
                    text: t.text,
                    is_final: false,
                })
                .await
        }
        PipelineEvent::Final(t) => {
            transport
                .send_event(&ControlEvent::Transcript {
                    text: t.text,
                    is_final: true,
                })
                .await
        }
        PipelineEvent::AssistantAudio(chunk) => {
            let frame = dhwani_core::AudioFrame::new(
                chunk.samples.to_vec(),
                chunk.sample_rate,
                0,
                0,
            );
            transport.send_audio(&frame).await
        }
        PipelineEvent::AssistantText { text, .. } => {
            transport.send_event(&ControlEvent::Response { text }).await
        }
        PipelineEvent::StateChanged(state) => {
            transport
                .send_event(&ControlEvent::Status {
                    state: state.as_str().to_string(),
                    stage: session.agent.current_stage().name().to_string(),
                })
                .await
        }
        PipelineEvent::Degraded { reason } => {
            tracing::warn!(session = %session.id, %reason, "session degraded");
            transport
                .send_event(&ControlEvent::Status {
                    state: "degraded".to_string(),
                    stage: session.agent.current_stage().name().to_string(),
                })
                .await
        }
        PipelineEvent::SpeechStarted | PipelineEvent::BargeIn { .. } => Ok(()),
    }
}

/// Typed text input (debug clients): run the agent directly and return the
/// response as a control event.
async fn handle_text_turn(
    session: &Arc<Session>,
    transport: &Arc<dyn Transport>,
    content: String,
) {
    use dhwani_pipeline::TurnResponder;

    let transcript = dhwani_core::Transcript::partial(content, 1.0, 0, 0).into_final();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(64);
    let agent = session.agent.clone();
    let cancel = session.cancel.child_token();

    let respond = tokio::spawn(async move { agent.respond(&transcript, tx, cancel).await });

    let mut response = String::new();
    while let Some(token) = rx.recv().await {
        response.push_str(&token);
    }
    match respond.await {
        Ok(Ok(())) => {
            let _ = transport
                .send_event(&ControlEvent::Response { text: response })
                .await;
        }
        Ok(Err(e)) => {
            tracing::warn!(session = %session.id, "text turn failed: {}", e);
            let _ = transport
                .send_event(&ControlEvent::Error {
                    message: "processing failed".to_string(),
                })
                .await;
        }
        Err(e) => {
            tracing::warn!(session = %session.id, "text turn panicked: {}", e);
        }
    }
}
