//! Hierarchical conversation memory.
//!
//! Three disjoint layers per session: *working* (last N turns verbatim),
//! *episodic* (summaries of older segments), *semantic* (extracted facts).
//! When the working window overflows, the oldest turns are drained and
//! summarized by a background task; the turn-handling path never waits on
//! summarization. If the model summary fails or stalls, a deterministic
//! condenser takes over — it is the fallback, not the primary path.
//! Summaries never cut a grapheme cluster in half.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use dhwani_core::language::truncate_graphemes;
use dhwani_core::{ConversationTurn, TurnRole};

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Working-window size in turns
    pub working_turns: usize,
    /// How many of the oldest turns one summarization batch drains
    pub summarize_batch: usize,
    /// Deadline for a model summary before the condenser takes over
    pub summary_timeout: Duration,
    /// Grapheme cap for stored summaries
    pub max_summary_graphemes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            working_turns: 8,
            summarize_batch: 4,
            summary_timeout: Duration::from_secs(3),
            max_summary_graphemes: 400,
        }
    }
}

/// Model-backed summarizer boundary; the agent wires the SLM here.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, turns: &[ConversationTurn]) -> Result<String, dhwani_core::Error>;
}

/// Summarizer over the small language model; cheap enough to run per
/// watermark without touching the foreground latency budget.
pub struct LlmSummarizer {
    backend: Arc<dyn dhwani_llm::LlmBackend>,
}

impl LlmSummarizer {
    pub fn new(backend: Arc<dyn dhwani_llm::LlmBackend>) -> Arc<Self> {
        Arc::new(Self { backend })
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, turns: &[ConversationTurn]) -> Result<String, dhwani_core::Error> {
        let rendered = turns
            .iter()
            .map(|turn| {
                let speaker = match turn.role {
                    TurnRole::User => "Customer",
                    TurnRole::Assistant => "Agent",
                    TurnRole::Tool => "Tool",
                    TurnRole::System => "System",
                };
                format!("{}: {}", speaker, turn.content)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let request = dhwani_llm::GenerateRequest {
            messages: vec![
                dhwani_llm::Message::system(
                    "Summarize this call segment in at most two short sentences. \
                     Keep names, amounts, and rates exactly as stated.",
                ),
                dhwani_llm::Message::user(rendered),
            ],
            max_tokens: 96,
            temperature: 0.3,
            context: None,
        };
        let generation = self.backend.generate(&request).await?;
        Ok(generation.text)
    }
}

pub struct HierarchicalMemory {
    config: MemoryConfig,
    working: Mutex<VecDeque<ConversationTurn>>,
    episodic: Mutex<Vec<String>>,
    semantic: Mutex<HashMap<String, String>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl HierarchicalMemory {
    pub fn new(config: MemoryConfig, summarizer: Option<Arc<dyn Summarizer>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            working: Mutex::new(VecDeque::new()),
            episodic: Mutex::new(Vec::new()),
            semantic: Mutex::new(HashMap::new()),
            summarizer,
        })
    }

    /// Append a turn; overflow triggers background summarization of the
    /// drained oldest batch.
    pub fn push_turn(self: &Arc<Self>, turn: ConversationTurn) {
        let drained: Option<Vec<ConversationTurn>> = {
            let mut working = self.working.lock();
            working.push_back(turn);
            if working.len() > self.config.working_turns {
                let batch = self
                    .config
                    .summarize_batch
                    .min(working.len() - self.config.working_turns / 2);
                Some(working.drain(..batch).collect())
            } else {
                None
            }
        };

        if let Some(batch) = drained {
            let memory = self.clone();
            tokio::spawn(async move {
                memory.summarize_batch(batch).await;
            });
        }
    }

    async fn summarize_batch(&self, batch: Vec<ConversationTurn>) {
        let summary = match &self.summarizer {
            Some(summarizer) => {
                match tokio::time::timeout(
                    self.config.summary_timeout,
                    summarizer.summarize(&batch),
                )
                .await
                {
                    Ok(Ok(text)) if !text.trim().is_empty() => text,
                    Ok(Err(e)) => {
                        tracing::debug!("model summary failed, using condenser: {}", e);
                        condense(&batch)
                    }
                    Err(_) => {
                        tracing::debug!("model summary timed out, using condenser");
                        condense(&batch)
                    }
                    _ => condense(&batch),
                }
            }
            None => condense(&batch),
        };

        let bounded = truncate_graphemes(&summary, self.config.max_summary_graphemes).to_string();
        self.episodic.lock().push(bounded);
        metrics::counter!("memory_summaries_total").increment(1);
    }

    pub fn remember_fact(&self, key: impl Into<String>, value: impl Into<String>) {
        self.semantic.lock().insert(key.into(), value.into());
    }

    pub fn working_snapshot(&self) -> Vec<ConversationTurn> {
        self.working.lock().iter().cloned().collect()
    }

    pub fn latest_summary(&self) -> Option<String> {
        self.episodic.lock().last().cloned()
    }

    pub fn facts(&self) -> Vec<String> {
        let semantic = self.semantic.lock();
        let mut facts: Vec<String> = semantic
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        facts.sort();
        facts
    }

    pub fn working_len(&self) -> usize {
        self.working.lock().len()
    }

    pub fn episodic_len(&self) -> usize {
        self.episodic.lock().len()
    }
}

/// Deterministic fallback condenser: one clause per turn, grapheme-safe.
fn condense(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                TurnRole::User => "Customer",
                TurnRole::Assistant => "Agent",
                TurnRole::Tool => "Tool",
                TurnRole::System => "System",
            };
            let clause = turn
                .content
                .split(['.', '।', '?', '!'])
                .next()
                .unwrap_or("")
                .trim();
            format!("{}: {}", speaker, truncate_graphemes(clause, 60))
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhwani_core::language::grapheme_count;

    fn turn(i: usize) -> ConversationTurn {
        ConversationTurn::user(format!("turn number {} with some content", i))
    }

    #[tokio::test]
    async fn overflow_summarizes_in_background() {
        let memory = HierarchicalMemory::new(MemoryConfig::default(), None);
        for i in 0..12 {
            memory.push_turn(turn(i));
        }
        // Let the background condenser run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(memory.working_len() <= 9);
        assert!(memory.episodic_len() >= 1);
        let summary = memory.latest_summary().unwrap();
        assert!(summary.contains("Customer"));
    }

    #[tokio::test]
    async fn slow_summarizer_falls_back_to_condenser() {
        struct StalledSummarizer;

        #[async_trait]
        impl Summarizer for StalledSummarizer {
            async fn summarize(
                &self,
                _turns: &[ConversationTurn],
            ) -> Result<String, dhwani_core::Error> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("never".to_string())
            }
        }

        let config = MemoryConfig {
            summary_timeout: Duration::from_millis(50),
            ..MemoryConfig::default()
        };
        let memory = HierarchicalMemory::new(config, Some(Arc::new(StalledSummarizer)));
        for i in 0..12 {
            memory.push_turn(turn(i));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(memory.episodic_len() >= 1);
        assert!(memory.latest_summary().unwrap().contains("turn number"));
    }

    #[tokio::test]
    async fn summaries_never_split_graphemes() {
        let config = MemoryConfig {
            working_turns: 2,
            summarize_batch: 2,
            max_summary_graphemes: 10,
            ..MemoryConfig::default()
        };
        let memory = HierarchicalMemory::new(config, None);
        memory.push_turn(ConversationTurn::user("श्रीमान जी नमस्ते आपका स्वागत है"));
        memory.push_turn(ConversationTurn::user("श्रीमती जी को भी नमस्ते कहिए"));
        memory.push_turn(ConversationTurn::user("और एक बात"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let summary = memory.latest_summary().unwrap();
        assert!(grapheme_count(&summary) <= 10);
        // A byte-level cut through a conjunct would break UTF-8 or strand a
        // combining mark; re-counting graphemes proves the cut was clean.
        assert!(summary.is_char_boundary(summary.len()));
    }

    #[test]
    fn facts_are_sorted_and_stable() {
        let memory = HierarchicalMemory::new(MemoryConfig::default(), None);
        memory.remember_fact("name", "Ramesh");
        memory.remember_fact("city", "Pune");
        assert_eq!(memory.facts(), vec!["city: Pune", "name: Ramesh"]);
    }
}
