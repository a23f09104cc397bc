//! Prompt assembly and context-window budgeting.
//!
//! Order: persona preamble, stage guidance, tool catalog, compressed
//! memory (working turns verbatim, latest episodic summary, semantic
//! facts), retrieval snippets, current user turn. When the assembled
//! prompt exceeds the token budget, the oldest working turns go first,
//! then retrieval snippets; the system preamble is never dropped. Token
//! counts use the grapheme-aware estimator, never bytes/4 — Devanagari
//! text would be wildly undercounted otherwise.

use dhwani_core::language::estimate_tokens;
use dhwani_core::{ConversationTurn, TurnRole};

use crate::backend::{Message, Role};

#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub persona_preamble: String,
    pub stage_guidance: String,
    /// Rendered tool catalog (names, descriptions, JSON signatures)
    pub tool_catalog: String,
    /// Working memory, oldest first
    pub working_turns: Vec<ConversationTurn>,
    pub episodic_summary: Option<String>,
    /// Semantic facts as "key: value" lines
    pub semantic_facts: Vec<String>,
    /// Retrieval snippets, best first
    pub snippets: Vec<String>,
    pub user_turn: String,
}

pub struct PromptBuilder {
    budget_tokens: usize,
}

impl PromptBuilder {
    pub fn new(budget_tokens: usize) -> Self {
        Self { budget_tokens }
    }

    pub fn build(&self, inputs: &PromptInputs) -> Vec<Message> {
        let mut working: Vec<&ConversationTurn> = inputs.working_turns.iter().collect();
        let mut snippets: Vec<&String> = inputs.snippets.iter().collect();

        loop {
            let messages = self.assemble(inputs, &working, &snippets);
            let total: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
            if total <= self.budget_tokens {
                return messages;
            }
            // Trim: oldest working turn first, then weakest snippet.
            if !working.is_empty() {
                working.remove(0);
            } else if !snippets.is_empty() {
                snippets.pop();
            } else {
                // Nothing left to trim; the preamble and user turn stay.
                return messages;
            }
        }
    }

    fn assemble(
        &self,
        inputs: &PromptInputs,
        working: &[&ConversationTurn],
        snippets: &[&String],
    ) -> Vec<Message> {
        let mut system = String::new();
        system.push_str(&inputs.persona_preamble);
        if !inputs.stage_guidance.is_empty() {
            system.push_str("\n\n# Current stage\n");
            system.push_str(&inputs.stage_guidance);
        }
        if !inputs.tool_catalog.is_empty() {
            system.push_str("\n\n# Tools\n");
            system.push_str(&inputs.tool_catalog);
        }
        if let Some(ref summary) = inputs.episodic_summary {
            system.push_str("\n\n# Earlier in this call\n");
            system.push_str(summary);
        }
        if !inputs.semantic_facts.is_empty() {
            system.push_str("\n\n# Known customer facts\n");
            for fact in &inputs.semantic_facts {
                system.push_str(fact);
                system.push('\n');
            }
        }
        if !snippets.is_empty() {
            system.push_str("\n\n# Reference material\n");
            for snippet in snippets {
                system.push_str("- ");
                system.push_str(snippet);
                system.push('\n');
            }
        }

        let mut messages = vec![Message::system(system)];
        for turn in working {
            let role = match turn.role {
                TurnRole::User => Role::User,
                TurnRole::Assistant => Role::Assistant,
                TurnRole::Tool => Role::Tool,
                TurnRole::System => Role::System,
            };
            messages.push(Message {
                role,
                content: turn.content.clone(),
            });
        }
        messages.push(Message::user(inputs.user_turn.clone()));
        messages
    }
}
