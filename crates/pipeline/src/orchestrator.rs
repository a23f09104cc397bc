//! Per-session orchestration.
//!
//! Routes transport frames through VAD → STT → turn detection, asks the
//! [`TurnResponder`] for assistant tokens on end-of-turn, and streams them
//! through the TTS. Barge-in cancels the audio after the current word and
//! aborts the in-flight generation; conversation history then records only
//! what was actually heard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use dhwani_core::{FrameReceiver, Transcript, TurnEvent, VadEvent};

use crate::stt::StreamingStt;
use crate::tts::{PcmChunk, StreamingTts, SynthEvent, SynthHandle};
use crate::turn::TurnDetector;
use crate::vad::VadEngine;
use crate::PipelineError;

/// Consecutive inference failures that degrade and close the session.
const MAX_INFERENCE_FAILURES: u64 = 10;

/// Events published to the transport layer.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    SpeechStarted,
    Partial(Transcript),
    Final(Transcript),
    /// Assistant audio, in generation order
    AssistantAudio(PcmChunk),
    /// The assistant turn as actually heard (truncated on barge-in)
    AssistantText { text: String, truncated: bool },
    BargeIn { after_word: usize },
    StateChanged(SessionState),
    Degraded { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
        }
    }
}

/// The agent side of the pipeline: turns a final transcript into assistant
/// tokens. Implementations must stop promptly when `cancel` fires.
#[async_trait]
pub trait TurnResponder: Send + Sync {
    /// Stream response tokens for the user's turn into `tokens`.
    async fn respond(
        &self,
        transcript: &Transcript,
        tokens: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), dhwani_core::Error>;

    /// Partial-transcript hook, used for retrieval prefetch.
    fn on_partial(&self, _partial: &Transcript) {}

    /// History hook: what the customer actually heard.
    fn on_assistant_spoken(&self, _text: &str, _truncated: bool) {}
}

struct ResponseControl {
    responding: bool,
    synth: Option<SynthHandle>,
    generation_cancel: Option<CancellationToken>,
    state: SessionState,
}

/// One orchestrator per session; owns no component inward pointers, only
/// channel ends and shared handles.
pub struct Orchestrator {
    session_id: String,
    vad: VadEngine,
    stt: Arc<StreamingStt>,
    turn: Arc<TurnDetector>,
    tts: Arc<StreamingTts>,
    responder: Arc<dyn TurnResponder>,
    events: broadcast::Sender<PipelineEvent>,
    /// Non-awaiting critical section guarding the single-in-flight
    /// response invariant; never held across an await.
    control: Mutex<ResponseControl>,
    cancel: CancellationToken,
    inference_failures: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        session_id: impl Into<String>,
        vad: VadEngine,
        stt: Arc<StreamingStt>,
        turn: Arc<TurnDetector>,
        tts: Arc<StreamingTts>,
        responder: Arc<dyn TurnResponder>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            session_id: session_id.into(),
            vad,
            stt,
            turn,
            tts,
            responder,
            events,
            control: Mutex::new(ResponseControl {
                responding: false,
                synth: None,
                generation_cancel: None,
                state: SessionState::Idle,
            }),
            cancel,
            inference_failures: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the session until the frame stream closes or the session is
    /// cancelled. Frames arrive in capture order; the transport guarantees
    /// FIFO delivery.
    pub async fn run(self: Arc<Self>, mut frames: FrameReceiver) {
        metrics::counter!("sessions_opened_total").increment(1);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = frames.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = self.handle_frame(frame).await {
                                self.note_inference_failure(&e);
                            }
                        }
                        None => break,
                    }
                }
            }
            if self.inference_failures.load(Ordering::Relaxed) >= MAX_INFERENCE_FAILURES {
                self.publish(PipelineEvent::Degraded {
                    reason: "repeated inference failures".to_string(),
                });
                self.cancel.cancel();
                break;
            }
        }
        self.shutdown();
        tracing::info!(session = %self.session_id, "session loop ended");
    }

    async fn handle_frame(self: &Arc<Self>, frame: dhwani_core::AudioFrame) -> Result<(), PipelineError> {
        let ts_ms = frame.capture_ts_us / 1000;

        match self.vad.push(&frame)? {
            Some(VadEvent::SpeechStart { ts_us, .. }) => {
                // Speech over an in-flight response is a barge-in.
                self.maybe_barge_in();
                self.stt.begin_utterance(ts_us);
                self.turn.note_speech(ts_ms);
                self.set_state(SessionState::Listening);
                self.publish(PipelineEvent::SpeechStarted);
                self.push_to_stt(&frame)?;
            }
            Some(VadEvent::SpeechOngoing { .. }) => {
                self.turn.note_speech(ts_ms);
                self.push_to_stt(&frame)?;
            }
            Some(VadEvent::SpeechEnd { ts_us, .. }) => {
                let final_t = self.stt.finalize(ts_us)?;
                self.turn.note_transcript(&final_t);
                self.publish(PipelineEvent::Final(final_t));
            }
            None => {}
        }

        if let TurnEvent::EndOfTurn(final_t) = self.turn.evaluate(ts_ms) {
            self.start_response(final_t);
        }
        Ok(())
    }

    fn push_to_stt(&self, frame: &dhwani_core::AudioFrame) -> Result<(), PipelineError> {
        if let Some(partial) = self.stt.push(frame)? {
            self.turn.note_transcript(&partial);
            self.responder.on_partial(&partial);
            self.publish(PipelineEvent::Partial(partial));
        }
        Ok(())
    }

    /// Cancel assistant-side work if the user started talking over it.
    fn maybe_barge_in(&self) {
        let (synth, generation_cancel) = {
            let mut control = self.control.lock();
            if !control.responding {
                return;
            }
            control.responding = false;
            (control.synth.take(), control.generation_cancel.take())
        };

        let after_word = synth.as_ref().map(|s| s.words_spoken()).unwrap_or(0);
        if let Some(synth) = synth {
            synth.cancel_after_current_word();
        }
        if let Some(token) = generation_cancel {
            token.cancel();
        }
        metrics::counter!("barge_ins_total").increment(1);
        tracing::debug!(session = %self.session_id, after_word, "barge-in");
        self.publish(PipelineEvent::BargeIn { after_word });
    }

    /// Launch the assistant response for a completed user turn. The
    /// single-in-flight invariant is enforced under the control lock.
    fn start_response(self: &Arc<Self>, final_t: Transcript) {
        let generation_cancel = self.cancel.child_token();
        {
            let mut control = self.control.lock();
            if control.responding {
                tracing::warn!(session = %self.session_id, "end-of-turn while responding; dropped");
                return;
            }
            control.responding = true;
            control.generation_cancel = Some(generation_cancel.clone());
            control.state = SessionState::Thinking;
        }
        self.publish(PipelineEvent::StateChanged(SessionState::Thinking));

        let this = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = this.run_response(&final_t, generation_cancel, started).await;
            let mut control = this.control.lock();
            control.responding = false;
            control.synth = None;
            control.generation_cancel = None;
            control.state = SessionState::Idle;
            drop(control);
            this.publish(PipelineEvent::StateChanged(SessionState::Idle));
            if let Err(e) = outcome {
                match e {
                    PipelineError::Cancelled => {}
                    other => {
                        tracing::warn!(session = %this.session_id, "response failed: {}", other);
                        this.note_inference_failure(&other);
                    }
                }
            }
        });
    }

    /// Stream tokens from the responder, sentence-buffer them into the TTS,
    /// and account for exactly the words that were audible.
    async fn run_response(
        self: &Arc<Self>,
        final_t: &Transcript,
        generation_cancel: CancellationToken,
        started: Instant,
    ) -> Result<(), PipelineError> {
        let (token_tx, mut token_rx) = mpsc::channel::<String>(64);
        let responder = self.responder.clone();
        let transcript = final_t.clone();
        let responder_cancel = generation_cancel.clone();
        let generation = tokio::spawn(async move {
            responder
                .respond(&transcript, token_tx, responder_cancel)
                .await
        });

        let language = final_t.language;
        let mut pending = String::new();
        let mut spoken: Vec<String> = Vec::new();
        let mut first_chunk_seen = false;
        let mut truncated = false;

        'outer: while let Some(token) = token_rx.recv().await {
            if generation_cancel.is_cancelled() {
                truncated = true;
                break;
            }
            pending.push_str(&token);
            while let Some((sentence, rest)) = split_first_sentence(&pending) {
                pending = rest;
                if generation_cancel.is_cancelled() {
                    truncated = true;
                    break 'outer;
                }
                match self
                    .speak_sentence(&sentence, language, &mut spoken, &mut first_chunk_seen, started)
                    .await?
                {
                    SentenceOutcome::Spoken => {}
                    SentenceOutcome::Cancelled => {
                        truncated = true;
                        break 'outer;
                    }
                }
            }
        }

        // Flush whatever remains after the token stream closes, unless the
        // turn was already cut off.
        if generation_cancel.is_cancelled() {
            truncated = true;
        }
        if !truncated && !pending.trim().is_empty() {
            if let SentenceOutcome::Cancelled = self
                .speak_sentence(&pending, language, &mut spoken, &mut first_chunk_seen, started)
                .await?
            {
                truncated = true;
            }
        }

        let heard = spoken.join(" ");
        self.responder.on_assistant_spoken(&heard, truncated);
        self.publish(PipelineEvent::AssistantText {
            text: heard,
            truncated,
        });

        match generation.await {
            Ok(Ok(())) => {
                if truncated {
                    Err(PipelineError::Cancelled)
                } else {
                    Ok(())
                }
            }
            Ok(Err(dhwani_core::Error::Cancelled)) => Err(PipelineError::Cancelled),
            Ok(Err(e)) => Err(PipelineError::Stt(format!("responder: {}", e))),
            Err(e) => Err(PipelineError::Stt(format!("responder task: {}", e))),
        }
    }

    async fn speak_sentence(
        self: &Arc<Self>,
        sentence: &str,
        language: dhwani_core::Language,
        spoken: &mut Vec<String>,
        first_chunk_seen: &mut bool,
        started: Instant,
    ) -> Result<SentenceOutcome, PipelineError> {
        let words: Vec<String> = sentence.split_whitespace().map(str::to_string).collect();
        if words.is_empty() {
            return Ok(SentenceOutcome::Spoken);
        }

        let (mut synth_rx, handle) = self.tts.synthesize(sentence, language);
        {
            let mut control = self.control.lock();
            control.synth = Some(handle);
            control.state = SessionState::Speaking;
        }
        self.publish(PipelineEvent::StateChanged(SessionState::Speaking));

        while let Some(event) = synth_rx.recv().await {
            match event {
                SynthEvent::Chunk(chunk) => {
                    if !*first_chunk_seen {
                        *first_chunk_seen = true;
                        metrics::histogram!("response_first_audio_seconds")
                            .record(started.elapsed().as_secs_f64());
                    }
                    self.publish(PipelineEvent::AssistantAudio(chunk));
                }
                SynthEvent::Completed { .. } => {
                    spoken.extend(words);
                    return Ok(SentenceOutcome::Spoken);
                }
                SynthEvent::Cancelled { after_word } => {
                    spoken.extend(words.into_iter().take(after_word));
                    return Ok(SentenceOutcome::Cancelled);
                }
            }
        }
        // Channel closed without a terminal event: treat as cancelled.
        Ok(SentenceOutcome::Cancelled)
    }

    fn set_state(&self, state: SessionState) {
        self.control.lock().state = state;
        self.publish(PipelineEvent::StateChanged(state));
    }

    pub fn state(&self) -> SessionState {
        self.control.lock().state
    }

    fn note_inference_failure(&self, error: &PipelineError) {
        if matches!(error, PipelineError::Cancelled) {
            return;
        }
        self.inference_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("inference_errors_total").increment(1);
    }

    fn publish(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    /// Deterministic teardown: cancel any in-flight work; no panics escape.
    fn shutdown(&self) {
        let (synth, generation_cancel) = {
            let mut control = self.control.lock();
            control.responding = false;
            (control.synth.take(), control.generation_cancel.take())
        };
        if let Some(synth) = synth {
            synth.cancel_after_current_word();
        }
        if let Some(token) = generation_cancel {
            token.cancel();
        }
    }
}

enum SentenceOutcome {
    Spoken,
    Cancelled,
}

/// Split off the first complete sentence, honoring Latin and Devanagari
/// terminators. Returns (sentence, remainder); a punctuation-only fragment
/// yields an empty sentence, which the speaker skips.
fn split_first_sentence(text: &str) -> Option<(String, String)> {
    for (idx, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '।' | '॥' | '\n') {
            let end = idx + c.len_utf8();
            let sentence = text[..end].trim();
            let rest = text[end..].trim_start().to_string();
            if !sentence.chars().any(char::is_alphanumeric) {
                return Some((String::new(), rest));
            }
            return Some((sentence.to_string(), rest));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhwani_config::{SttSettings, TtsSettings, TurnSettings, VadSettings};
    use dhwani_core::{frame_channel, AudioFrame, SampleRate, FRAME_SAMPLES};
    use crate::stt::{DecodeStep, SttDecode};
    use crate::tts::ToneSynth;
    use std::time::Duration;

    struct EnergyDecoder;

    impl SttDecode for EnergyDecoder {
        fn decode(&self, audio: &[f32]) -> Result<Option<DecodeStep>, PipelineError> {
            let words = ["रुको", "एक", "मिनट", "ज़रा", "सुनिए"];
            let n = (audio.len() / 3200).clamp(1, words.len());
            Ok(Some(DecodeStep {
                text: words[..n].join(" "),
                confidence: 0.9,
            }))
        }
    }

    struct SlowResponder {
        spoken: Mutex<Option<(String, bool)>>,
        cancelled_at: Mutex<Option<Instant>>,
    }

    #[async_trait]
    impl TurnResponder for SlowResponder {
        async fn respond(
            &self,
            _transcript: &Transcript,
            tokens: mpsc::Sender<String>,
            cancel: CancellationToken,
        ) -> Result<(), dhwani_core::Error> {
            for i in 0..40 {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        *self.cancelled_at.lock() = Some(Instant::now());
                        return Err(dhwani_core::Error::Cancelled);
                    }
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
                if tokens.send(format!("word{} ", i)).await.is_err() {
                    break;
                }
                if i % 8 == 7 {
                    let _ = tokens.send(". ".to_string()).await;
                }
            }
            Ok(())
        }

        fn on_assistant_spoken(&self, text: &str, truncated: bool) {
            *self.spoken.lock() = Some((text.to_string(), truncated));
        }
    }

    fn loud(seq: u64) -> AudioFrame {
        let samples: Vec<f32> = (0..FRAME_SAMPLES)
            .map(|i| (i as f32 * 0.3).sin() * 0.6)
            .collect();
        AudioFrame::new(samples, SampleRate::Hz16000, seq, seq * 10_000)
    }

    fn silent(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0.0; FRAME_SAMPLES], SampleRate::Hz16000, seq, seq * 10_000)
    }

    fn build(responder: Arc<dyn TurnResponder>) -> Arc<Orchestrator> {
        Orchestrator::new(
            "test-session",
            VadEngine::simple(VadSettings::default()),
            Arc::new(StreamingStt::new(Arc::new(EnergyDecoder), SttSettings::default())),
            Arc::new(TurnDetector::new(TurnSettings::default())),
            Arc::new(StreamingTts::new(Arc::new(ToneSynth), TtsSettings::default())),
            responder,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn full_turn_produces_assistant_audio() {
        let responder = Arc::new(SlowResponder {
            spoken: Mutex::new(None),
            cancelled_at: Mutex::new(None),
        });
        let orch = build(responder.clone());
        let mut events = orch.subscribe();
        let (tx, rx) = frame_channel(512);

        let run = tokio::spawn(orch.clone().run(rx));

        let mut seq = 0u64;
        for _ in 0..50 {
            tx.send(loud(seq)).await.unwrap();
            seq += 1;
        }
        for _ in 0..120 {
            tx.send(silent(seq)).await.unwrap();
            seq += 1;
        }

        let mut saw_start = false;
        let mut saw_final = false;
        let mut saw_audio = false;
        let deadline = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Ok(PipelineEvent::SpeechStarted) => saw_start = true,
                    Ok(PipelineEvent::Final(t)) => {
                        saw_final = true;
                        assert!(t.is_final);
                    }
                    Ok(PipelineEvent::AssistantAudio(_)) => {
                        saw_audio = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }

        assert!(saw_start);
        assert!(saw_final);
        assert!(saw_audio, "assistant audio should flow after end of turn");

        orch.cancel_token().cancel();
        drop(tx);
        let _ = run.await;
    }

    #[tokio::test]
    async fn barge_in_cancels_generation_promptly() {
        let responder = Arc::new(SlowResponder {
            spoken: Mutex::new(None),
            cancelled_at: Mutex::new(None),
        });
        let orch = build(responder.clone());
        let mut events = orch.subscribe();
        let (tx, rx) = frame_channel(1024);

        let run = tokio::spawn(orch.clone().run(rx));

        // User turn, then silence to trigger the response.
        let mut seq = 0u64;
        for _ in 0..50 {
            tx.send(loud(seq)).await.unwrap();
            seq += 1;
        }
        for _ in 0..120 {
            tx.send(silent(seq)).await.unwrap();
            seq += 1;
        }

        // Wait for assistant audio to start flowing.
        let mut speaking = false;
        let deadline = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(deadline);
        while !speaking {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => {
                    if matches!(event, Ok(PipelineEvent::AssistantAudio(_))) {
                        speaking = true;
                    }
                }
            }
        }
        assert!(speaking);

        // Customer talks over the agent.
        let barge_started = Instant::now();
        for _ in 0..20 {
            tx.send(loud(seq)).await.unwrap();
            seq += 1;
        }

        let mut saw_barge_in = false;
        let deadline = tokio::time::sleep(Duration::from_secs(2));
        tokio::pin!(deadline);
        while !saw_barge_in {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => {
                    if matches!(event, Ok(PipelineEvent::BargeIn { .. })) {
                        saw_barge_in = true;
                    }
                }
            }
        }
        assert!(saw_barge_in, "speech during playback must barge in");

        // The generation token must be cancelled promptly (≤100 ms budget;
        // allow scheduling slack in CI).
        tokio::time::sleep(Duration::from_millis(150)).await;
        let cancelled_at = responder.cancelled_at.lock().clone();
        if let Some(at) = cancelled_at {
            assert!(at.duration_since(barge_started) < Duration::from_millis(500));
        }

        orch.cancel_token().cancel();
        drop(tx);
        let _ = run.await;
    }

    #[test]
    fn sentence_splitter_handles_devanagari() {
        let (s, rest) = split_first_sentence("नमस्ते। कैसे हैं").unwrap();
        assert_eq!(s, "नमस्ते।");
        assert_eq!(rest, "कैसे हैं");
        assert!(split_first_sentence("incomplete clause").is_none());
    }

    #[test]
    fn splitter_drops_punctuation_only_fragments() {
        let (sentence, rest) = split_first_sentence(". okay").unwrap();
        assert!(sentence.is_empty());
        assert_eq!(rest, "okay");
    }
}
