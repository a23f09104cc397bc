//! Conversation stages and the transition graph.
//!
//! The graph is fixed:
//!
//! ```text
//! Greeting → Discovery
//! Discovery ←→ ObjectionHandling
//! Discovery → Qualification
//! Qualification → Presentation
//! Presentation ←→ ObjectionHandling
//! Presentation → Closing
//! Any → Farewell
//! ```
//!
//! A transition fires only when the target stage's declared intents and
//! slots are satisfied; transitions outside the graph are rejected and
//! logged, never silently applied.

use std::sync::Arc;

use parking_lot::Mutex;

use dhwani_config::DomainConfig;

use crate::slots::SlotStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Stage {
    #[default]
    Greeting,
    Discovery,
    Qualification,
    Presentation,
    ObjectionHandling,
    Closing,
    Farewell,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Greeting => "greeting",
            Stage::Discovery => "discovery",
            Stage::Qualification => "qualification",
            Stage::Presentation => "presentation",
            Stage::ObjectionHandling => "objection_handling",
            Stage::Closing => "closing",
            Stage::Farewell => "farewell",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "greeting" => Some(Stage::Greeting),
            "discovery" => Some(Stage::Discovery),
            "qualification" => Some(Stage::Qualification),
            "presentation" => Some(Stage::Presentation),
            "objection_handling" => Some(Stage::ObjectionHandling),
            "closing" => Some(Stage::Closing),
            "farewell" => Some(Stage::Farewell),
            _ => None,
        }
    }

    /// Legal targets from this stage. Farewell is reachable from anywhere
    /// and terminal.
    pub fn allowed_transitions(&self) -> &'static [Stage] {
        match self {
            Stage::Greeting => &[Stage::Discovery, Stage::Farewell],
            Stage::Discovery => &[
                Stage::ObjectionHandling,
                Stage::Qualification,
                Stage::Farewell,
            ],
            Stage::Qualification => &[Stage::Presentation, Stage::Farewell],
            Stage::Presentation => &[
                Stage::ObjectionHandling,
                Stage::Closing,
                Stage::Farewell,
            ],
            Stage::ObjectionHandling => &[
                Stage::Discovery,
                Stage::Presentation,
                Stage::Farewell,
            ],
            Stage::Closing => &[Stage::Farewell],
            Stage::Farewell => &[],
        }
    }

    /// Context budget for prompt assembly; presentation-heavy stages get
    /// room for retrieval snippets.
    pub fn context_budget_tokens(&self) -> usize {
        match self {
            Stage::Greeting | Stage::Farewell => 1024,
            Stage::Discovery | Stage::Qualification => 2048,
            Stage::Presentation | Stage::ObjectionHandling => 3584,
            Stage::Closing => 2560,
        }
    }
}

/// Per-session stage tracker.
pub struct StageMachine {
    domain: Arc<DomainConfig>,
    current: Mutex<Stage>,
    intents_seen: Mutex<Vec<String>>,
}

impl StageMachine {
    pub fn new(domain: Arc<DomainConfig>) -> Self {
        Self {
            domain,
            current: Mutex::new(Stage::Greeting),
            intents_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Stage {
        *self.current.lock()
    }

    pub fn note_intent(&self, intent: &str) {
        let mut seen = self.intents_seen.lock();
        if !seen.iter().any(|i| i == intent) {
            seen.push(intent.to_string());
        }
    }

    /// Guidance prompt for the current stage, from configuration.
    pub fn guidance(&self) -> String {
        self.domain
            .stage(self.current().name())
            .map(|s| s.guidance_prompt.trim().to_string())
            .unwrap_or_default()
    }

    /// Tools the current stage allows the agent to invoke.
    pub fn allowed_tools(&self) -> Vec<String> {
        self.domain
            .stage(self.current().name())
            .map(|s| s.allowed_tools.clone())
            .unwrap_or_default()
    }

    /// Slots the target stage still needs, for eliciting questions.
    pub fn missing_slots(&self, target: Stage, slots: &SlotStore) -> Vec<String> {
        self.domain
            .stage(target.name())
            .map(|def| {
                def.required_slots
                    .iter()
                    .filter(|slot| slots.get(slot).is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Attempt a transition. Illegal edges and unmet requirements both
    /// leave the stage unchanged.
    pub fn transition_to(&self, target: Stage, slots: &SlotStore) -> Result<Stage, StageError> {
        let current = self.current();
        if current == target {
            return Ok(current);
        }
        if !current.allowed_transitions().contains(&target) {
            tracing::warn!(
                from = current.name(),
                to = target.name(),
                "illegal stage transition rejected"
            );
            metrics::counter!("stage_transitions_rejected_total").increment(1);
            return Err(StageError::IllegalTransition {
                from: current,
                to: target,
            });
        }

        if let Some(def) = self.domain.stage(target.name()) {
            let seen = self.intents_seen.lock();
            for required in &def.required_intents {
                if !seen.iter().any(|i| i == required) {
                    return Err(StageError::MissingIntent {
                        stage: target,
                        intent: required.clone(),
                    });
                }
            }
            drop(seen);
            for required in &def.required_slots {
                if slots.get(required).is_none() {
                    return Err(StageError::MissingSlot {
                        stage: target,
                        slot: required.clone(),
                    });
                }
            }
        }

        *self.current.lock() = target;
        tracing::debug!(from = current.name(), to = target.name(), "stage transition");
        Ok(target)
    }

    /// Policy: which stage does this user intent pull toward?
    pub fn suggest_target(&self, intent: &str, slots: &SlotStore) -> Option<Stage> {
        let current = self.current();
        match intent {
            "farewell" => Some(Stage::Farewell),
            "objection" => match current {
                Stage::Discovery | Stage::Presentation => Some(Stage::ObjectionHandling),
                _ => None,
            },
            "greeting" => match current {
                Stage::Greeting => Some(Stage::Discovery),
                _ => None,
            },
            "savings_query" | "eligibility_check" => match current {
                Stage::Greeting => Some(Stage::Discovery),
                Stage::Discovery => Some(Stage::Qualification),
                Stage::Qualification
                    if slots.get("outstanding_amount").is_some()
                        || slots.get("gold_weight_grams").is_some() =>
                {
                    Some(Stage::Presentation)
                }
                Stage::ObjectionHandling => Some(Stage::Presentation),
                _ => None,
            },
            "lead_share" | "appointment_request" => match current {
                Stage::Presentation => Some(Stage::Closing),
                _ => None,
            },
            _ => match current {
                Stage::Greeting => Some(Stage::Discovery),
                _ => None,
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("transition {} -> {} is not in the stage graph", from.name(), to.name())]
    IllegalTransition { from: Stage, to: Stage },
    #[error("stage {} requires intent {intent}", stage.name())]
    MissingIntent { stage: Stage, intent: String },
    #[error("stage {} requires slot {slot}", stage.name())]
    MissingSlot { stage: Stage, slot: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> StageMachine {
        StageMachine::new(Arc::new(DomainConfig::builtin()))
    }

    #[test]
    fn entry_state_is_greeting() {
        assert_eq!(machine().current(), Stage::Greeting);
    }

    #[test]
    fn greeting_flows_to_discovery() {
        let machine = machine();
        machine.note_intent("greeting");
        let slots = SlotStore::new();
        assert_eq!(
            machine.transition_to(Stage::Discovery, &slots).unwrap(),
            Stage::Discovery
        );
    }

    #[test]
    fn illegal_edge_is_rejected() {
        let machine = machine();
        let slots = SlotStore::new();
        let err = machine.transition_to(Stage::Closing, &slots).unwrap_err();
        assert!(matches!(err, StageError::IllegalTransition { .. }));
        assert_eq!(machine.current(), Stage::Greeting);
    }

    #[test]
    fn farewell_reachable_from_anywhere() {
        let machine = machine();
        let slots = SlotStore::new();
        machine.note_intent("greeting");
        machine.transition_to(Stage::Discovery, &slots).unwrap();
        machine.transition_to(Stage::Farewell, &slots).unwrap();
        assert_eq!(machine.current(), Stage::Farewell);
        // Terminal: nothing leaves farewell.
        assert!(machine.transition_to(Stage::Discovery, &slots).is_err());
    }

    #[test]
    fn qualification_requires_outstanding_amount() {
        let machine = machine();
        let slots = SlotStore::new();
        machine.note_intent("greeting");
        machine.transition_to(Stage::Discovery, &slots).unwrap();

        // stages.yaml requires outstanding_amount for qualification.
        let err = machine.transition_to(Stage::Qualification, &slots).unwrap_err();
        assert!(matches!(err, StageError::MissingSlot { .. }));

        let mut filled = SlotStore::new();
        filled.update("outstanding_amount", SlotValueFixture::amount(500000.0));
        machine.transition_to(Stage::Qualification, &filled).unwrap();
        assert_eq!(machine.current(), Stage::Qualification);
    }

    #[test]
    fn objection_handling_round_trips_with_presentation() {
        let machine = machine();
        let mut slots = SlotStore::new();
        slots.update("outstanding_amount", SlotValueFixture::amount(500000.0));
        slots.update("current_rate", SlotValueFixture::amount(22.0));
        machine.note_intent("greeting");
        machine.transition_to(Stage::Discovery, &slots).unwrap();
        machine.transition_to(Stage::Qualification, &slots).unwrap();
        machine.transition_to(Stage::Presentation, &slots).unwrap();
        machine.transition_to(Stage::ObjectionHandling, &slots).unwrap();
        machine.transition_to(Stage::Presentation, &slots).unwrap();
        assert_eq!(machine.current(), Stage::Presentation);
    }

    struct SlotValueFixture;

    impl SlotValueFixture {
        fn amount(value: f64) -> crate::slots::SlotValue {
            crate::slots::SlotValue {
                value: value.to_string(),
                confidence: 0.9,
                source_turn: 0,
            }
        }
    }
}
