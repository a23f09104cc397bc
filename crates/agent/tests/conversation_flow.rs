//! End-to-end conversation flow: audio frames in, assistant audio out,
//! with the agent driving stage transitions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dhwani_agent::memory::{HierarchicalMemory, MemoryConfig};
use dhwani_agent::{Stage, VoiceAgent};
use dhwani_config::{DomainConfig, Settings};
use dhwani_core::{frame_channel, AudioFrame, Language, SampleRate, FRAME_SAMPLES};
use dhwani_llm::{
    FinishReason, GenerateRequest, Generation, LlmBackend, LlmError, SpeculativeExecutor,
};
use dhwani_pipeline::stt::{DecodeStep, SttDecode};
use dhwani_pipeline::tts::ToneSynth;
use dhwani_pipeline::{
    Orchestrator, PipelineError, PipelineEvent, StreamingStt, StreamingTts, TurnDetector, VadEngine,
};
use dhwani_tools::{build_domain_tools, StubCalendarSink, StubLeadSink, ToolCatalog, ToolRegistry};

struct HindiGreetingDecoder;

impl SttDecode for HindiGreetingDecoder {
    fn decode(&self, audio: &[f32]) -> Result<Option<DecodeStep>, PipelineError> {
        let words = ["नमस्ते,", "गोल्ड", "लोन", "के", "बारे", "में", "बताइए"];
        let n = (audio.len() / 1600).clamp(1, words.len());
        Ok(Some(DecodeStep {
            text: words[..n].join(" "),
            confidence: 0.92,
        }))
    }
}

struct CannedBackend;

#[async_trait]
impl LlmBackend for CannedBackend {
    async fn generate(&self, _request: &GenerateRequest) -> Result<Generation, LlmError> {
        let text = "नमस्ते! मैं प्रिया, गोल्ड लोन सलाहकार। आपकी कैसे मदद करूं?".to_string();
        Ok(Generation {
            tokens: text.split_whitespace().count(),
            text,
            time_to_first_token_ms: 10,
            total_time_ms: 20,
            finish_reason: FinishReason::Stop,
            context: None,
        })
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<String>,
        _cancel: CancellationToken,
    ) -> Result<Generation, LlmError> {
        let generation = self.generate(request).await?;
        let _ = tx.send(generation.text.clone()).await;
        Ok(generation)
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn model_name(&self) -> &str {
        "canned"
    }
}

fn build_agent(settings: Arc<Settings>) -> Arc<VoiceAgent> {
    let domain = Arc::new(DomainConfig::builtin());
    let catalog = ToolCatalog::builtin();
    let mut registry = ToolRegistry::new(&settings.tools);
    build_domain_tools(
        &mut registry,
        &catalog,
        domain.clone(),
        Arc::new(StubLeadSink),
        Arc::new(StubCalendarSink),
        &settings.tools,
    )
    .unwrap();

    let backend = Arc::new(CannedBackend);
    let executor = Arc::new(SpeculativeExecutor::new(
        backend.clone(),
        backend,
        &settings.llm,
    ));

    VoiceAgent::new(
        "flow-test",
        settings.clone(),
        domain,
        HierarchicalMemory::new(MemoryConfig::default(), None),
        executor,
        Arc::new(registry),
        catalog,
        None,
    )
    .unwrap()
}

fn speech_frame(seq: u64) -> AudioFrame {
    let samples: Vec<f32> = (0..FRAME_SAMPLES)
        .map(|i| (i as f32 * 0.25).sin() * 0.5)
        .collect();
    AudioFrame::new(samples, SampleRate::Hz16000, seq, seq * 10_000)
}

fn silence_frame(seq: u64) -> AudioFrame {
    AudioFrame::new(vec![0.0; FRAME_SAMPLES], SampleRate::Hz16000, seq, seq * 10_000)
}

#[tokio::test]
async fn greeting_happy_path() {
    let settings = Arc::new(Settings::default());
    let agent = build_agent(settings.clone());

    let orchestrator = Orchestrator::new(
        "flow-test",
        VadEngine::simple(settings.vad.clone()),
        Arc::new(StreamingStt::new(
            Arc::new(HindiGreetingDecoder),
            settings.stt.clone(),
        )),
        Arc::new(TurnDetector::new(settings.turn.clone())),
        Arc::new(StreamingTts::new(Arc::new(ToneSynth), settings.tts.clone())),
        agent.clone(),
        CancellationToken::new(),
    );
    let mut events = orchestrator.subscribe();

    let (frames_tx, frames_rx) = frame_channel(1024);
    let run = tokio::spawn(orchestrator.clone().run(frames_rx));

    // 300 ms silence, the Hindi greeting, then 800 ms silence.
    let mut seq = 0u64;
    for _ in 0..30 {
        frames_tx.send(silence_frame(seq)).await.unwrap();
        seq += 1;
    }
    for _ in 0..80 {
        frames_tx.send(speech_frame(seq)).await.unwrap();
        seq += 1;
    }
    for _ in 0..80 {
        frames_tx.send(silence_frame(seq)).await.unwrap();
        seq += 1;
    }

    let mut speech_starts = 0;
    let mut partials = 0;
    let mut final_language = None;
    let mut assistant_audio = false;
    let mut assistant_text = None;

    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(PipelineEvent::SpeechStarted) => speech_starts += 1,
                Ok(PipelineEvent::Partial(p)) => {
                    partials += 1;
                    assert!(!p.is_final);
                }
                Ok(PipelineEvent::Final(f)) => {
                    assert!(f.is_final);
                    final_language = Some(f.language);
                }
                Ok(PipelineEvent::AssistantAudio(_)) => assistant_audio = true,
                Ok(PipelineEvent::AssistantText { text, truncated }) => {
                    assert!(!truncated);
                    assistant_text = Some(text);
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }

    assert_eq!(speech_starts, 1, "exactly one speech start");
    assert!(partials >= 1, "at least one partial");
    assert_eq!(final_language, Some(Language::Hindi));
    assert!(assistant_audio, "assistant audio must be produced");
    let text = assistant_text.expect("assistant text event");
    assert!(text.contains("प्रिया"));

    // The greeting advanced the conversation into discovery.
    assert_eq!(agent.current_stage(), Stage::Discovery);

    orchestrator.cancel_token().cancel();
    drop(frames_tx);
    let _ = run.await;
}
