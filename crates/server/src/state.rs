//! Process-wide application state.
//!
//! Model handles are loaded once at startup, immutable afterwards, and
//! shared by reference across sessions. Per-session state lives in
//! [`crate::session::Session`].

use std::sync::Arc;

use axum::http::HeaderMap;
use metrics_exporter_prometheus::PrometheusHandle;

use dhwani_config::{DomainConfig, Settings};
use dhwani_llm::{OllamaBackend, SpeculativeExecutor};
use dhwani_pipeline::stt::SttDecode;
use dhwani_pipeline::tts::TtsSynth;
use dhwani_rag::{CascadeReranker, HashEmbedder, HybridRetriever, MemoryVectorStore, SparseIndex};
use dhwani_tools::{
    build_domain_tools, StubCalendarSink, StubLeadSink, ToolCatalog, ToolRegistry,
};

use crate::rate_limit::RateLimiter;
use crate::session::SessionStore;

/// Authentication extension point. The core ships allow-all; deployments
/// install their own closure.
pub type AuthHook = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

pub struct AppState {
    pub settings: Arc<Settings>,
    pub domain: Arc<DomainConfig>,
    pub catalog: ToolCatalog,
    pub stt_backend: Arc<dyn SttDecode>,
    pub tts_backend: Arc<dyn TtsSynth>,
    /// Small model shared with background summarization
    pub slm_backend: Arc<dyn dhwani_llm::LlmBackend>,
    pub executor: Arc<SpeculativeExecutor>,
    pub retriever: Arc<HybridRetriever>,
    pub registry: Arc<ToolRegistry>,
    pub sessions: Arc<SessionStore>,
    pub rate_limiter: RateLimiter,
    pub auth_hook: AuthHook,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    /// Build everything that outlives a session. Model-load failures are
    /// fatal and map to exit code 2 in the binary.
    pub fn build(
        settings: Arc<Settings>,
        domain: Arc<DomainConfig>,
    ) -> Result<Arc<Self>, dhwani_core::Error> {
        let (stt_backend, tts_backend) = build_speech_backends(&settings)?;

        let slm = Arc::new(OllamaBackend::new(&settings.llm, settings.llm.slm_model.clone())?);
        let llm = Arc::new(OllamaBackend::new(&settings.llm, settings.llm.llm_model.clone())?);
        let executor = Arc::new(SpeculativeExecutor::new(slm.clone(), llm, &settings.llm));

        let sparse = Arc::new(
            SparseIndex::in_ram().map_err(|e| dhwani_core::Error::config(e.to_string()))?,
        );
        let retriever = Arc::new(HybridRetriever::new(
            Arc::new(HashEmbedder::default()),
            Arc::new(MemoryVectorStore::new()),
            sparse,
            Arc::new(CascadeReranker::lexical()),
            settings.retrieval.clone(),
        ));

        let catalog = ToolCatalog::builtin();
        let mut registry = ToolRegistry::new(&settings.tools);
        build_domain_tools(
            &mut registry,
            &catalog,
            domain.clone(),
            Arc::new(StubLeadSink),
            Arc::new(StubCalendarSink),
            &settings.tools,
        )?;

        let rate_limiter = RateLimiter::new(
            settings.server.rate_limit_burst,
            settings.server.rate_limit_per_sec,
        );

        Ok(Arc::new(Self {
            sessions: Arc::new(SessionStore::new(settings.session.clone())),
            rate_limiter,
            auth_hook: Arc::new(|_headers| true),
            metrics_handle: None,
            catalog,
            stt_backend,
            tts_backend,
            slm_backend: slm,
            executor,
            retriever,
            registry: Arc::new(registry),
            settings,
            domain,
        }))
    }
}

#[cfg(feature = "onnx")]
fn build_speech_backends(
    settings: &Settings,
) -> Result<(Arc<dyn SttDecode>, Arc<dyn TtsSynth>), dhwani_core::Error> {
    use std::path::Path;

    let dir = Path::new(&settings.models.dir);
    let stt = dhwani_pipeline::stt::OnnxDecoder::new(
        dir.join(&settings.models.stt),
        dir.join("tokenizer.json"),
        settings.stt.beam_width,
    )
    .map_err(dhwani_core::Error::from)?;
    let tts = dhwani_pipeline::tts::OnnxSynth::new(
        dir.join(&settings.models.tts),
        settings.tts.speaking_rate,
    )
    .map_err(dhwani_core::Error::from)?;
    Ok((Arc::new(stt), Arc::new(tts)))
}

/// Model-free backends: the scripted decoder emits nothing and the tone
/// synth stands in for a voice. Lets the server run end to end without
/// weights.
#[cfg(not(feature = "onnx"))]
fn build_speech_backends(
    _settings: &Settings,
) -> Result<(Arc<dyn SttDecode>, Arc<dyn TtsSynth>), dhwani_core::Error> {
    Ok((
        Arc::new(dhwani_pipeline::stt::NullDecoder),
        Arc::new(dhwani_pipeline::tts::ToneSynth),
    ))
}
