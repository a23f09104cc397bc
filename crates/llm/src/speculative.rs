//! Speculative SLM/LLM execution.
//!
//! Four strategies trade latency for quality:
//!
//! - **SlmFirst** — the small model answers within a deadline; a quality
//!   gate decides whether the large model must take over. Default.
//! - **Race** — both models run in parallel; the first acceptable answer
//!   wins and the loser is cancelled and awaited, leaving no orphaned work.
//! - **Hybrid** — the small model streams to the caller in checkpointed
//!   batches; on mid-stream quality degradation the large model continues
//!   from the already-forwarded prefix. The caller never sees two competing
//!   answers side by side.
//! - **DraftVerify** — the small model drafts a short response and the
//!   large model judges it, overwriting on rejection. This ADDS a full
//!   large-model pass, so it raises latency; it exists for quality
//!   experiments and is disabled by default.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use dhwani_config::{LlmSettings, LlmStrategy};

use crate::backend::{FinishReason, GenerateRequest, Generation, LlmBackend};
use crate::quality::QualityEstimator;
use crate::LlmError;

/// Tokens forwarded between quality checkpoints in Hybrid mode.
const HYBRID_CHECKPOINT_TOKENS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelUsed {
    Slm,
    Llm,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct SpeculativeResult {
    pub text: String,
    pub model_used: ModelUsed,
    pub used_fallback: bool,
    pub generation: Generation,
}

#[derive(Debug, Clone, Default)]
pub struct SpeculativeStats {
    pub slm_calls: usize,
    pub llm_calls: usize,
    pub slm_wins: usize,
    pub fallbacks: usize,
    pub avg_slm_ms: f32,
    pub avg_llm_ms: f32,
}

pub struct SpeculativeExecutor {
    slm: Arc<dyn LlmBackend>,
    llm: Arc<dyn LlmBackend>,
    estimator: QualityEstimator,
    strategy: LlmStrategy,
    slm_timeout: Duration,
    quality_threshold: f32,
    stats: Mutex<SpeculativeStats>,
}

impl SpeculativeExecutor {
    pub fn new(
        slm: Arc<dyn LlmBackend>,
        llm: Arc<dyn LlmBackend>,
        settings: &LlmSettings,
    ) -> Self {
        Self {
            slm,
            llm,
            estimator: QualityEstimator::new(settings.stop_phrases.clone()),
            strategy: settings.strategy,
            slm_timeout: Duration::from_millis(settings.slm_timeout_ms),
            quality_threshold: settings.quality_threshold,
            stats: Mutex::new(SpeculativeStats::default()),
        }
    }

    /// Override the configured strategy (per stage, e.g. Race in Closing).
    pub fn with_strategy(mut self, strategy: LlmStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Execute the configured strategy, streaming the winning answer's
    /// tokens into `tx`.
    pub async fn execute(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<SpeculativeResult, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        match self.strategy {
            LlmStrategy::SlmFirst => self.slm_first(request, tx, cancel).await,
            LlmStrategy::Race => self.race(request, tx, cancel).await,
            LlmStrategy::Hybrid => self.hybrid(request, tx, cancel).await,
            LlmStrategy::DraftVerify => self.draft_verify(request, tx, cancel).await,
        }
    }

    /// SLM within a deadline; LLM on timeout, error, or low quality. The
    /// losing answer is never surfaced.
    async fn slm_first(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<SpeculativeResult, LlmError> {
        let started = Instant::now();
        let slm_outcome = timeout(self.slm_timeout, self.slm.generate(request)).await;
        self.note_slm(started.elapsed());

        if let Ok(Ok(generation)) = slm_outcome {
            let quality = self.estimator.score(&generation.text, None);
            if quality >= self.quality_threshold {
                self.note_win();
                send_text(&tx, &generation.text).await;
                return Ok(SpeculativeResult {
                    text: generation.text.clone(),
                    model_used: ModelUsed::Slm,
                    used_fallback: false,
                    generation,
                });
            }
            tracing::debug!(quality, "slm answer below threshold, falling back");
        }

        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let llm_started = Instant::now();
        let generation = self
            .llm
            .generate_stream(request, tx, cancel.clone())
            .await?;
        self.note_llm(llm_started.elapsed());
        self.note_fallback();
        if generation.finish_reason == FinishReason::Cancelled {
            return Err(LlmError::Cancelled);
        }
        Ok(SpeculativeResult {
            text: generation.text.clone(),
            model_used: ModelUsed::Llm,
            used_fallback: true,
            generation,
        })
    }

    /// Both models in parallel; first completable response wins, the loser
    /// is cancelled via its token and awaited to completion.
    async fn race(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<SpeculativeResult, LlmError> {
        let started = Instant::now();
        let slm_cancel = cancel.child_token();
        let llm_cancel = cancel.child_token();

        let slm = self.slm.clone();
        let slm_request = request.clone();
        let slm_token = slm_cancel.clone();
        let mut slm_task = tokio::spawn(async move {
            let (sink_tx, _sink_rx) = mpsc::channel(64);
            slm.generate_stream(&slm_request, sink_tx, slm_token).await
        });

        let llm = self.llm.clone();
        let llm_request = request.clone();
        let llm_token = llm_cancel.clone();
        let mut llm_task = tokio::spawn(async move {
            let (sink_tx, _sink_rx) = mpsc::channel(64);
            llm.generate_stream(&llm_request, sink_tx, llm_token).await
        });

        let (winner, used_fallback) = tokio::select! {
            slm_result = &mut slm_task => {
                match slm_result.map_err(|e| LlmError::Generation(e.to_string()))? {
                    Ok(generation)
                        if self.estimator.score(&generation.text, None)
                            >= self.quality_threshold =>
                    {
                        // SLM wins: cancel the LLM and await its exit.
                        llm_cancel.cancel();
                        let _ = llm_task.await;
                        self.note_slm(started.elapsed());
                        self.note_win();
                        (SpeculativeResult {
                            text: generation.text.clone(),
                            model_used: ModelUsed::Slm,
                            used_fallback: false,
                            generation,
                        }, false)
                    }
                    _ => {
                        // SLM failed or answered poorly: wait out the LLM.
                        let generation = llm_task
                            .await
                            .map_err(|e| LlmError::Generation(e.to_string()))??;
                        self.note_llm(started.elapsed());
                        (SpeculativeResult {
                            text: generation.text.clone(),
                            model_used: ModelUsed::Llm,
                            used_fallback: true,
                            generation,
                        }, true)
                    }
                }
            }
            llm_result = &mut llm_task => {
                // LLM finished first: it wins outright; cancel the SLM and
                // await its completion.
                slm_cancel.cancel();
                let _ = slm_task.await;
                let generation = llm_result
                    .map_err(|e| LlmError::Generation(e.to_string()))??;
                self.note_llm(started.elapsed());
                (SpeculativeResult {
                    text: generation.text.clone(),
                    model_used: ModelUsed::Llm,
                    used_fallback: false,
                    generation,
                }, false)
            }
        };

        if used_fallback {
            self.note_fallback();
        }
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        send_text(&tx, &winner.text).await;
        Ok(winner)
    }

    /// Stream the SLM in checkpointed batches; on quality degradation the
    /// LLM continues from the prefix the caller has already received.
    async fn hybrid(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<SpeculativeResult, LlmError> {
        let started = Instant::now();
        let (slm_tx, mut slm_rx) = mpsc::channel::<String>(64);
        let slm = self.slm.clone();
        let slm_request = request.clone();
        let slm_cancel = cancel.child_token();
        let slm_token = slm_cancel.clone();
        let slm_task = tokio::spawn(async move {
            slm.generate_stream(&slm_request, slm_tx, slm_token).await
        });

        let mut forwarded = String::new();
        let mut pending: Vec<String> = Vec::new();
        let mut degraded = false;

        while let Some(token) = slm_rx.recv().await {
            if cancel.is_cancelled() {
                slm_cancel.cancel();
                let _ = slm_task.await;
                return Err(LlmError::Cancelled);
            }
            pending.push(token);
            if pending.len() >= HYBRID_CHECKPOINT_TOKENS {
                let candidate = format!("{}{}", forwarded, pending.concat());
                if self.estimator.score(&candidate, None) < self.quality_threshold {
                    degraded = true;
                    break;
                }
                for token in pending.drain(..) {
                    forwarded.push_str(&token);
                    if tx.send(token).await.is_err() {
                        slm_cancel.cancel();
                        let _ = slm_task.await;
                        return Err(LlmError::Cancelled);
                    }
                }
            }
        }

        if !degraded {
            // Stream ended; flush the tail if it still looks good.
            let candidate = format!("{}{}", forwarded, pending.concat());
            if pending.is_empty()
                || self.estimator.score(&candidate, None) >= self.quality_threshold
            {
                for token in pending.drain(..) {
                    forwarded.push_str(&token);
                    let _ = tx.send(token).await;
                }
                let generation = slm_task
                    .await
                    .map_err(|e| LlmError::Generation(e.to_string()))??;
                self.note_slm(started.elapsed());
                self.note_win();
                return Ok(SpeculativeResult {
                    text: forwarded,
                    model_used: ModelUsed::Slm,
                    used_fallback: false,
                    generation,
                });
            }
            degraded = true;
        }

        debug_assert!(degraded);
        // Cancel the SLM cleanly; its unforwarded remainder is discarded.
        slm_cancel.cancel();
        let _ = slm_task.await;
        self.note_slm(started.elapsed());
        self.note_fallback();
        tracing::debug!(
            forwarded_chars = forwarded.len(),
            "hybrid switch: llm continues from forwarded prefix"
        );

        let mut continuation = request.clone();
        if !forwarded.is_empty() {
            continuation
                .messages
                .push(crate::backend::Message::assistant(forwarded.clone()));
        }
        let llm_started = Instant::now();
        let generation = self
            .llm
            .generate_stream(&continuation, tx, cancel.clone())
            .await?;
        self.note_llm(llm_started.elapsed());
        if generation.finish_reason == FinishReason::Cancelled {
            return Err(LlmError::Cancelled);
        }

        Ok(SpeculativeResult {
            text: format!("{}{}", forwarded, generation.text),
            model_used: ModelUsed::Hybrid,
            used_fallback: true,
            generation,
        })
    }

    /// SLM drafts, LLM judges and may overwrite. Exactly one of the two
    /// answers reaches the caller. Not a latency optimization.
    async fn draft_verify(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<SpeculativeResult, LlmError> {
        let started = Instant::now();
        let draft = self.slm.generate(request).await?;
        self.note_slm(started.elapsed());

        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let mut judge_request = request.clone();
        judge_request.messages.push(crate::backend::Message::user(format!(
            "A draft reply follows between <draft> tags. If it answers the \
             customer correctly and helpfully, reply with exactly ACCEPT. \
             Otherwise reply with the corrected answer only.\n<draft>{}</draft>",
            draft.text
        )));

        let llm_started = Instant::now();
        let verdict = self.llm.generate(&judge_request).await?;
        self.note_llm(llm_started.elapsed());

        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let accepted = verdict.text.trim().eq_ignore_ascii_case("accept");
        let (text, model_used, generation) = if accepted {
            (draft.text.clone(), ModelUsed::Slm, draft)
        } else {
            self.note_fallback();
            (verdict.text.clone(), ModelUsed::Llm, verdict)
        };
        send_text(&tx, &text).await;
        Ok(SpeculativeResult {
            text,
            model_used,
            used_fallback: !accepted,
            generation,
        })
    }

    pub fn stats(&self) -> SpeculativeStats {
        self.stats.lock().clone()
    }

    fn note_slm(&self, elapsed: Duration) {
        let mut stats = self.stats.lock();
        stats.slm_calls += 1;
        let delta = elapsed.as_millis() as f32 - stats.avg_slm_ms;
        stats.avg_slm_ms += delta / stats.slm_calls as f32;
    }

    fn note_llm(&self, elapsed: Duration) {
        let mut stats = self.stats.lock();
        stats.llm_calls += 1;
        let delta = elapsed.as_millis() as f32 - stats.avg_llm_ms;
        stats.avg_llm_ms += delta / stats.llm_calls as f32;
    }

    fn note_win(&self) {
        self.stats.lock().slm_wins += 1;
    }

    fn note_fallback(&self) {
        self.stats.lock().fallbacks += 1;
        metrics::counter!("llm_fallbacks_total").increment(1);
    }
}

async fn send_text(tx: &mpsc::Sender<String>, text: &str) {
    let _ = tx.send(text.to_string()).await;
}
