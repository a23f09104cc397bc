//! The turn-handling agent.
//!
//! Implements the pipeline's `TurnResponder`: each completed user turn is
//! classified, slot-filled, routed through the stage machine, optionally
//! grounded by retrieval and a tool call, and answered through the
//! speculative executor. Tool timeouts surface a configured apology in the
//! session language; raw error text is never spoken.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dhwani_config::{DomainConfig, Settings};
use dhwani_core::{ConversationTurn, Language, Transcript};
use dhwani_llm::{ContextHandle, GenerateRequest, PromptBuilder, PromptInputs, SpeculativeExecutor};
use dhwani_pipeline::TurnResponder;
use dhwani_rag::HybridRetriever;
use dhwani_tools::{ToolCall, ToolCatalog, ToolError, ToolRegistry};

use crate::intent::IntentClassifier;
use crate::memory::HierarchicalMemory;
use crate::slots::{SlotExtractor, SlotStore};
use crate::stage::{Stage, StageMachine};

pub struct VoiceAgent {
    session_id: String,
    settings: Arc<Settings>,
    domain: Arc<DomainConfig>,
    stage: StageMachine,
    classifier: IntentClassifier,
    extractor: SlotExtractor,
    slots: Mutex<SlotStore>,
    memory: Arc<HierarchicalMemory>,
    executor: Arc<SpeculativeExecutor>,
    registry: Arc<ToolRegistry>,
    catalog: ToolCatalog,
    retriever: Option<Arc<HybridRetriever>>,
    /// One active KV-cache handle per session; an in-flight generation
    /// holds it exclusively.
    context_handle: Mutex<Option<ContextHandle>>,
    turn_index: AtomicUsize,
}

impl VoiceAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        settings: Arc<Settings>,
        domain: Arc<DomainConfig>,
        memory: Arc<HierarchicalMemory>,
        executor: Arc<SpeculativeExecutor>,
        registry: Arc<ToolRegistry>,
        catalog: ToolCatalog,
        retriever: Option<Arc<HybridRetriever>>,
    ) -> Result<Arc<Self>, dhwani_core::Error> {
        Ok(Arc::new(Self {
            session_id: session_id.into(),
            stage: StageMachine::new(domain.clone()),
            classifier: IntentClassifier::new(&domain)?,
            extractor: SlotExtractor::new(&domain)?,
            slots: Mutex::new(SlotStore::new()),
            settings,
            domain,
            memory,
            executor,
            registry,
            catalog,
            retriever,
            context_handle: Mutex::new(None),
            turn_index: AtomicUsize::new(0),
        }))
    }

    pub fn current_stage(&self) -> Stage {
        self.stage.current()
    }

    pub fn slot_value(&self, name: &str) -> Option<String> {
        self.slots.lock().get(name).map(|s| s.value.clone())
    }

    /// Response language: the session's configured language unless the
    /// customer's turn arrived in another supported language.
    fn response_language(&self, transcript: &Transcript) -> Language {
        if transcript.text.is_empty() {
            self.settings.language.primary
        } else {
            transcript.language
        }
    }

    /// Pick the tool this turn calls, if the intent warrants one and the
    /// current stage allows it.
    fn select_tool(&self, intent: &str, slots: &SlotStore) -> Option<ToolCall> {
        let allowed = self.stage.allowed_tools();
        let permit = |name: &str| allowed.iter().any(|t| t == name);

        match intent {
            "savings_query" => {
                let outstanding = slots.get_f64("outstanding_amount")?;
                let rate = slots.get_f64("current_rate")?;
                let months = slots
                    .get_f64("tenure_months")
                    .map(|m| m as u64)
                    .unwrap_or(12);
                permit("calculate_savings").then(|| {
                    ToolCall::new(
                        "calculate_savings",
                        json!({
                            "outstanding_amount": outstanding,
                            "current_annual_rate": rate,
                            "months": months,
                        }),
                    )
                })
            }
            "eligibility_check" => {
                let weight = slots.get_f64("gold_weight_grams")?;
                let tier = slots
                    .get("gold_purity")
                    .map(|s| s.value.clone())
                    .unwrap_or_else(|| "22K".to_string());
                permit("check_eligibility").then(|| {
                    ToolCall::new(
                        "check_eligibility",
                        json!({"collateral_weight_g": weight, "collateral_tier": tier}),
                    )
                })
            }
            "branch_inquiry" => {
                let city = slots.get("city")?.value.clone();
                let mut args = json!({"city": city});
                if let Some(pincode) = slots.get("pincode") {
                    args["pincode"] = json!(pincode.value);
                }
                permit("locate_branch").then(|| ToolCall::new("locate_branch", args))
            }
            "appointment_request" => {
                let date = slots.get("appointment_date")?.value.clone();
                let mut args = json!({"date": date});
                if let Some(phone) = slots.get("phone_number") {
                    args["phone"] = json!(phone.value);
                }
                permit("schedule_appointment")
                    .then(|| ToolCall::new("schedule_appointment", args))
            }
            "lead_share" => {
                let phone = slots.get("phone_number")?.value.clone();
                let mut args = json!({"phone": phone});
                if let Some(name) = slots.get("customer_name") {
                    args["name"] = json!(name.value);
                }
                if let Some(city) = slots.get("city") {
                    args["city"] = json!(city.value);
                }
                permit("capture_lead").then(|| ToolCall::new("capture_lead", args))
            }
            "rate_inquiry" => permit("get_gold_rate")
                .then(|| ToolCall::new("get_gold_rate", json!({}))),
            _ => None,
        }
    }

    /// Run the selected tool. Timeouts map to the apology path; validation
    /// errors come back as tool content so the model can talk around them.
    async fn run_tool(&self, call: ToolCall) -> Result<Option<String>, dhwani_core::Error> {
        match self.registry.invoke(&call).await {
            Ok(result) => {
                let rendered = result
                    .content
                    .iter()
                    .map(|block| match block {
                        dhwani_tools::ContentBlock::Text { text } => text.clone(),
                        dhwani_tools::ContentBlock::Json { json } => json.to_string(),
                        dhwani_tools::ContentBlock::Audio { .. } => "[audio]".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(Some(format!("[{}] {}", call.tool_name, rendered)))
            }
            Err(ToolError::Timeout { tool, timeout_ms }) => {
                tracing::warn!(tool = %tool, timeout_ms, "tool timed out");
                Err(dhwani_core::Error::timeout(format!("tool {}", tool), timeout_ms))
            }
            Err(ToolError::Validation(message)) => {
                // Let the model repair or work without the tool.
                Ok(Some(format!(
                    "[{}] tool error: {}",
                    call.tool_name, message
                )))
            }
            Err(e) => {
                tracing::warn!(tool = %call.tool_name, "tool failed: {}", e);
                Ok(None)
            }
        }
    }

    fn build_prompt(
        &self,
        language: Language,
        user_text: &str,
        guidance_extra: &str,
        tool_output: Option<&str>,
        snippets: Vec<String>,
    ) -> Vec<dhwani_llm::Message> {
        let stage = self.stage.current();
        let mut guidance = self.stage.guidance();
        if !guidance_extra.is_empty() {
            guidance.push('\n');
            guidance.push_str(guidance_extra);
        }

        let allowed = self.stage.allowed_tools();
        let tool_catalog = self
            .catalog
            .tools
            .iter()
            .filter(|t| allowed.iter().any(|a| a == &t.name))
            .map(|t| format!("- {}: {}", t.name, t.description.trim()))
            .collect::<Vec<_>>()
            .join("\n");

        let mut working = self.memory.working_snapshot();
        if let Some(output) = tool_output {
            working.push(ConversationTurn::new(
                dhwani_core::TurnRole::Tool,
                output.to_string(),
            ));
        }

        let mut persona = self.domain.persona.for_language(language.tag()).to_string();
        persona.push_str(&format!("\nRespond in {}.", language.tag()));

        let inputs = PromptInputs {
            persona_preamble: persona,
            stage_guidance: guidance,
            tool_catalog,
            working_turns: working,
            episodic_summary: self.memory.latest_summary(),
            semantic_facts: self.slots.lock().as_facts(),
            snippets,
            user_turn: user_text.to_string(),
        };

        let budget = stage
            .context_budget_tokens()
            .min(self.settings.llm.context_budget_tokens);
        PromptBuilder::new(budget).build(&inputs)
    }

    async fn send_apology(&self, language: Language, tx: &mpsc::Sender<String>) {
        let apology = self.domain.fallback.apology_for(language.tag());
        let _ = tx.send(apology.to_string()).await;
    }
}

#[async_trait]
impl TurnResponder for VoiceAgent {
    async fn respond(
        &self,
        transcript: &Transcript,
        tokens: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), dhwani_core::Error> {
        let language = self.response_language(transcript);

        // A guard-rejected final has nothing to answer; ask again.
        if transcript.low_confidence || transcript.text.trim().is_empty() {
            self.send_apology(language, &tokens).await;
            return Ok(());
        }

        let turn = self.turn_index.fetch_add(1, Ordering::SeqCst);
        if turn >= self.settings.session.max_turns {
            tracing::info!(session = %self.session_id, turn, "max turns reached, winding down");
            let farewell = self.domain.fallback.apology_for(language.tag());
            let _ = tokens.send(farewell.to_string()).await;
            return Ok(());
        }
        self.memory
            .push_turn(ConversationTurn::user(transcript.text.clone()));

        // Slot filling and intent classification share one extraction pass.
        let extracted = self.extractor.extract(&transcript.text, turn);
        let slot_names: Vec<String> = extracted.keys().cloned().collect();
        {
            let mut slots = self.slots.lock();
            slots.merge(extracted);
        }
        for fact in self.slots.lock().as_facts() {
            if let Some((key, value)) = fact.split_once(": ") {
                self.memory.remember_fact(key, value);
            }
        }

        let intent = self.classifier.classify(&transcript.text, &slot_names);
        self.stage.note_intent(&intent.name);
        tracing::debug!(
            session = %self.session_id,
            intent = %intent.name,
            confidence = intent.confidence,
            "classified user turn"
        );

        // Stage policy: follow the suggested edge when its requirements
        // hold; otherwise stay and elicit what is missing.
        let mut guidance_extra = String::new();
        {
            let slots = self.slots.lock();
            if let Some(target) = self.stage.suggest_target(&intent.name, &slots) {
                match self.stage.transition_to(target, &slots) {
                    Ok(stage) => {
                        tracing::debug!(session = %self.session_id, stage = stage.name(), "stage advanced");
                    }
                    Err(crate::stage::StageError::MissingSlot { slot, .. }) => {
                        guidance_extra =
                            format!("Ask the customer for their {}.", slot.replace('_', " "));
                    }
                    Err(e) => {
                        tracing::debug!(session = %self.session_id, "transition skipped: {}", e);
                    }
                }
            }
        }

        // Grounding: reuse the prefetched retrieval when it matches.
        let snippets = match &self.retriever {
            Some(retriever) => retriever
                .search_final(&self.session_id, &transcript.text)
                .await
                .map(|hits| hits.into_iter().map(|h| h.text).collect())
                .unwrap_or_else(|e| {
                    tracing::warn!("retrieval failed, answering ungrounded: {}", e);
                    Vec::new()
                }),
            None => Vec::new(),
        };

        // Tool invocation per stage policy.
        let tool_call = {
            let slots = self.slots.lock();
            self.select_tool(&intent.name, &slots)
        };
        let tool_output = match tool_call {
            Some(call) => match self.run_tool(call).await {
                Ok(output) => output,
                Err(e) if matches!(e, dhwani_core::Error::Timeout { .. }) => {
                    // Bounded failure: apologize in-language and move on.
                    self.send_apology(language, &tokens).await;
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let messages = self.build_prompt(
            language,
            &transcript.text,
            &guidance_extra,
            tool_output.as_deref(),
            snippets,
        );

        let request = GenerateRequest {
            messages,
            max_tokens: self.settings.llm.max_tokens,
            temperature: self.settings.llm.temperature,
            context: self.context_handle.lock().clone(),
        };

        match self.executor.execute(&request, tokens.clone(), cancel).await {
            Ok(result) => {
                if let Some(context) = result.generation.context {
                    *self.context_handle.lock() = Some(context);
                }
                Ok(())
            }
            Err(dhwani_llm::LlmError::Cancelled) => Err(dhwani_core::Error::Cancelled),
            Err(e) => {
                tracing::warn!(session = %self.session_id, "generation failed: {}", e);
                self.send_apology(language, &tokens).await;
                Ok(())
            }
        }
    }

    fn on_partial(&self, partial: &Transcript) {
        if let Some(retriever) = &self.retriever {
            let retriever = retriever.clone();
            let session_id = self.session_id.clone();
            let text = partial.text.clone();
            tokio::spawn(async move {
                if let Err(e) = retriever.prefetch(&session_id, &text).await {
                    tracing::debug!("prefetch failed: {}", e);
                }
            });
        }
    }

    fn on_assistant_spoken(&self, text: &str, truncated: bool) {
        let mut turn = ConversationTurn::assistant(text);
        if truncated {
            turn.truncate_to_spoken(text);
        }
        self.memory.push_turn(turn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConfig;
    use dhwani_config::{LlmSettings, LlmStrategy};
    use dhwani_llm::{FinishReason, Generation, LlmBackend, LlmError, Role};
    use dhwani_tools::{build_domain_tools, StubCalendarSink, StubLeadSink};

    /// Echoes the last tool message's content, or a canned reply.
    struct ToolEchoBackend;

    #[async_trait]
    impl LlmBackend for ToolEchoBackend {
        async fn generate(&self, request: &GenerateRequest) -> Result<Generation, LlmError> {
            let text = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Tool)
                .map(|m| format!("Dekhiye, {}", m.content))
                .unwrap_or_else(|| "Ji, main aapki madad kar sakti hoon.".to_string());
            Ok(Generation {
                text,
                tokens: 8,
                time_to_first_token_ms: 5,
                total_time_ms: 10,
                finish_reason: FinishReason::Stop,
                context: Some(vec![42]),
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
            "tool-echo"
        }
    }

    fn agent_with(
        settings: Settings,
        lead_sink: Arc<dyn dhwani_tools::integrations::LeadSink>,
    ) -> Arc<VoiceAgent> {
        let settings = Arc::new(settings);
        let domain = Arc::new(DomainConfig::builtin());
        let mut registry = ToolRegistry::new(&settings.tools);
        let catalog = ToolCatalog::builtin();
        build_domain_tools(
            &mut registry,
            &catalog,
            domain.clone(),
            lead_sink,
            Arc::new(StubCalendarSink),
            &settings.tools,
        )
        .unwrap();

        let backend = Arc::new(ToolEchoBackend);
        let llm_settings = LlmSettings {
            strategy: LlmStrategy::SlmFirst,
            ..settings.llm.clone()
        };
        let executor = Arc::new(SpeculativeExecutor::new(
            backend.clone(),
            backend,
            &llm_settings,
        ));

        VoiceAgent::new(
            "test-session",
            settings,
            domain,
            HierarchicalMemory::new(MemoryConfig::default(), None),
            executor,
            Arc::new(registry),
            catalog,
            None,
        )
        .unwrap()
    }

    fn agent() -> Arc<VoiceAgent> {
        agent_with(Settings::default(), Arc::new(StubLeadSink))
    }

    fn final_t(text: &str) -> Transcript {
        Transcript::partial(text, 0.9, 0, 1_000_000).into_final()
    }

    async fn collect(agent: &Arc<VoiceAgent>, text: &str) -> String {
        let (tx, mut rx) = mpsc::channel(64);
        agent
            .respond(&final_t(text), tx, CancellationToken::new())
            .await
            .unwrap();
        let mut out = String::new();
        while let Ok(token) = rx.try_recv() {
            out.push_str(&token);
        }
        out
    }

    #[tokio::test]
    async fn greeting_advances_to_discovery() {
        let agent = agent();
        assert_eq!(agent.current_stage(), Stage::Greeting);
        let reply = collect(&agent, "नमस्ते, गोल्ड लोन के बारे में बताइए").await;
        assert!(!reply.is_empty());
        assert_eq!(agent.current_stage(), Stage::Discovery);
    }

    #[tokio::test]
    async fn savings_turn_fills_slots_and_quotes_figure() {
        let agent = agent();
        // Walk to qualification so calculate_savings is an allowed tool.
        collect(&agent, "नमस्ते").await;
        let reply = collect(&agent, "मेरा 5 लाख का लोन है, 22% पर").await;

        assert_eq!(agent.slot_value("outstanding_amount").unwrap(), "500000");
        assert_eq!(agent.slot_value("current_rate").unwrap(), "22");
        // The echo backend surfaces the tool result, which carries the
        // monthly savings figure.
        assert!(reply.contains("monthly_saving_inr"), "reply: {}", reply);
        assert_eq!(agent.current_stage(), Stage::Qualification);
    }

    #[tokio::test]
    async fn low_confidence_final_triggers_apology() {
        let agent = agent();
        let mut transcript = final_t("");
        transcript.low_confidence = true;
        let (tx, mut rx) = mpsc::channel(8);
        agent
            .respond(&transcript, tx, CancellationToken::new())
            .await
            .unwrap();
        let apology = rx.recv().await.unwrap();
        // The configured Hindi apology, never raw error text.
        assert!(apology.contains("माफ़") || apology.contains("Sorry"));
    }

    #[tokio::test]
    async fn tool_timeout_substitutes_apology_and_session_continues() {
        struct StalledLeadSink;

        #[async_trait]
        impl dhwani_tools::integrations::LeadSink for StalledLeadSink {
            async fn capture(
                &self,
                _lead: &dhwani_tools::Lead,
            ) -> Result<String, dhwani_tools::IntegrationError> {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok("never".to_string())
            }
        }

        let mut settings = Settings::default();
        settings
            .tools
            .timeout_overrides_ms
            .insert("capture_lead".to_string(), 50);
        let agent = agent_with(settings, Arc::new(StalledLeadSink));

        // Walk the stage graph to closing, where capture_lead is allowed.
        collect(&agent, "नमस्ते").await;
        collect(&agent, "मेरा 5 लाख का लोन है, 22% पर").await;
        collect(&agent, "balance transfer karke kitni bachat hogi").await;
        assert_eq!(agent.current_stage(), Stage::Presentation);

        let reply = collect(&agent, "mera number 9876543210 hai, call karna").await;
        assert!(reply.contains("माफ़") || reply.contains("Sorry"), "reply: {}", reply);

        // The session keeps going after the timeout.
        let next = collect(&agent, "ठीक है, धन्यवाद").await;
        assert!(!next.is_empty());
    }

    #[tokio::test]
    async fn spoken_history_records_truncation() {
        let agent = agent();
        agent.on_assistant_spoken("aapka gold", true);
        let working = agent.memory.working_snapshot();
        let last = working.last().unwrap();
        assert!(last.truncated);
        assert_eq!(last.content, "aapka gold");
    }

    #[tokio::test]
    async fn kv_context_carries_across_turns() {
        let agent = agent();
        collect(&agent, "नमस्ते").await;
        assert_eq!(*agent.context_handle.lock(), Some(vec![42]));
    }
}
