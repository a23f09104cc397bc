//! Sales-domain data, loaded from `config/domain/*.yaml`.
//!
//! Nothing in here is business logic; the structs mirror the YAML files and
//! downstream crates consume them read-only. The built-in snapshot embeds
//! the shipped data files so tests run without a filesystem layout.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use dhwani_core::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRecord {
    pub id: String,
    pub name: String,
    pub city: String,
    pub pincode: String,
    pub lat: f64,
    pub lon: f64,
    pub phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitorRate {
    pub name: String,
    /// Typical annual interest rate offered, percent
    pub annual_rate_percent: f64,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDef {
    pub name: String,
    /// Regex patterns, compiled once by the intent classifier
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Hindi/Hinglish synonyms contributing to the keyword score
    #[serde(default)]
    pub hindi_synonyms: Vec<String>,
    #[serde(default)]
    pub required_slots: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Text,
    Integer,
    Decimal,
    Enum,
    Date,
    Phone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotDef {
    pub canonical_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub kind: SlotKind,
    #[serde(default)]
    pub enum_values: Vec<String>,
    /// Extraction regexes; group 1 captures the raw value. Compiled once
    /// by the slot extractor.
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    #[serde(default)]
    pub required_intents: Vec<String>,
    #[serde(default)]
    pub required_slots: Vec<String>,
    pub guidance_prompt: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurityTier {
    /// Display name, e.g. "24K"
    pub name: String,
    /// Fraction of the reference price this purity fetches
    pub fineness: f64,
    /// Loan-to-value cap for this tier
    pub ltv: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Reference price per gram for 24K, INR
    pub gold_price_per_gram: f64,
    pub purity_tiers: Vec<PurityTier>,
    /// Our annual interest rate, percent
    pub house_annual_rate: f64,
    pub min_loan_amount: f64,
    pub processing_fee_percent: f64,
}

impl PricingConfig {
    pub fn tier(&self, name: &str) -> Option<&PurityTier> {
        self.purity_tiers
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }
}

/// Apology/fallback utterances per language tag.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FallbackUtterances {
    #[serde(default)]
    pub apology: HashMap<String, String>,
}

/// Persona preamble per language tag.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersonaPrompts {
    #[serde(flatten)]
    pub by_language: HashMap<String, String>,
}

impl PersonaPrompts {
    pub fn for_language(&self, language_tag: &str) -> &str {
        self.by_language
            .get(language_tag)
            .or_else(|| self.by_language.get("en"))
            .map(String::as_str)
            .unwrap_or("You are a helpful gold loan advisor on a phone call.")
    }
}

impl FallbackUtterances {
    pub fn apology_for(&self, language_tag: &str) -> &str {
        self.apology
            .get(language_tag)
            .or_else(|| self.apology.get("en"))
            .map(String::as_str)
            .unwrap_or("Sorry, I am having trouble right now. Could you repeat that?")
    }
}

/// Aggregate domain snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub branches: Vec<BranchRecord>,
    pub competitors: Vec<CompetitorRate>,
    pub intents: Vec<IntentDef>,
    pub slots: Vec<SlotDef>,
    pub stages: Vec<StageDef>,
    pub pricing: PricingConfig,
    #[serde(default)]
    pub fallback: FallbackUtterances,
    #[serde(default)]
    pub persona: PersonaPrompts,
}

#[derive(Debug, Deserialize)]
struct BranchesFile {
    branches: Vec<BranchRecord>,
}

#[derive(Debug, Deserialize)]
struct CompetitorsFile {
    competitors: Vec<CompetitorRate>,
}

#[derive(Debug, Deserialize)]
struct IntentsFile {
    intents: Vec<IntentDef>,
}

#[derive(Debug, Deserialize)]
struct SlotsFile {
    slots: Vec<SlotDef>,
}

#[derive(Debug, Deserialize)]
struct StagesFile {
    stages: Vec<StageDef>,
    #[serde(default)]
    fallback: FallbackUtterances,
    #[serde(default)]
    persona: PersonaPrompts,
}

impl DomainConfig {
    /// Load from a directory of YAML files.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let branches: BranchesFile = read_yaml(&dir.join("branches.yaml"))?;
        let competitors: CompetitorsFile = read_yaml(&dir.join("competitors.yaml"))?;
        let intents: IntentsFile = read_yaml(&dir.join("intents.yaml"))?;
        let slots: SlotsFile = read_yaml(&dir.join("slots.yaml"))?;
        let stages: StagesFile = read_yaml(&dir.join("stages.yaml"))?;
        let pricing: PricingConfig = read_yaml(&dir.join("pricing.yaml"))?;

        let config = Self {
            branches: branches.branches,
            competitors: competitors.competitors,
            intents: intents.intents,
            slots: slots.slots,
            stages: stages.stages,
            pricing,
            fallback: stages.fallback,
            persona: stages.persona,
        };
        config.validate()?;
        Ok(config)
    }

    /// Snapshot of the shipped data files, embedded at compile time.
    pub fn builtin() -> Self {
        let branches: BranchesFile =
            serde_yaml::from_str(include_str!("../../../config/domain/branches.yaml"))
                .expect("embedded branches.yaml");
        let competitors: CompetitorsFile =
            serde_yaml::from_str(include_str!("../../../config/domain/competitors.yaml"))
                .expect("embedded competitors.yaml");
        let intents: IntentsFile =
            serde_yaml::from_str(include_str!("../../../config/domain/intents.yaml"))
                .expect("embedded intents.yaml");
        let slots: SlotsFile =
            serde_yaml::from_str(include_str!("../../../config/domain/slots.yaml"))
                .expect("embedded slots.yaml");
        let stages: StagesFile =
            serde_yaml::from_str(include_str!("../../../config/domain/stages.yaml"))
                .expect("embedded stages.yaml");
        let pricing: PricingConfig =
            serde_yaml::from_str(include_str!("../../../config/domain/pricing.yaml"))
                .expect("embedded pricing.yaml");

        Self {
            branches: branches.branches,
            competitors: competitors.competitors,
            intents: intents.intents,
            slots: slots.slots,
            stages: stages.stages,
            pricing,
            fallback: stages.fallback,
            persona: stages.persona,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.branches.is_empty() {
            return Err(Error::config("branch catalog is empty"));
        }
        if self.pricing.purity_tiers.is_empty() {
            return Err(Error::config("pricing.purity_tiers is empty"));
        }
        for tier in &self.pricing.purity_tiers {
            if !(0.0..=1.0).contains(&tier.ltv) {
                return Err(Error::config(format!(
                    "ltv for tier {} out of range",
                    tier.name
                )));
            }
        }
        let has = |name: &str| self.stages.iter().any(|s| s.name == name);
        if !has("greeting") || !has("farewell") {
            return Err(Error::config("stage graph must declare greeting and farewell"));
        }
        for stage in &self.stages {
            for tool in &stage.allowed_tools {
                if tool.is_empty() {
                    return Err(Error::config(format!(
                        "stage {} declares an empty tool name",
                        stage.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn slot(&self, canonical_name: &str) -> Option<&SlotDef> {
        self.slots.iter().find(|s| s.canonical_name == canonical_name)
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::config_with(format!("cannot read {}", path.display()), e))?;
    serde_yaml::from_str(&text)
        .map_err(|e| Error::config_with(format!("cannot parse {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_snapshot_is_valid() {
        let config = DomainConfig::builtin();
        assert!(config.validate().is_ok());
        assert!(config.branches.len() >= 20);
        let cities: std::collections::HashSet<_> =
            config.branches.iter().map(|b| b.city.as_str()).collect();
        assert!(cities.len() >= 8);
    }

    #[test]
    fn ltv_tiers_match_policy() {
        let pricing = DomainConfig::builtin().pricing;
        assert_eq!(pricing.tier("24K").unwrap().ltv, 0.85);
        assert_eq!(pricing.tier("22K").unwrap().ltv, 0.80);
        assert_eq!(pricing.tier("18K").unwrap().ltv, 0.75);
    }

    #[test]
    fn stage_graph_has_terminals() {
        let config = DomainConfig::builtin();
        assert!(config.stage("greeting").is_some());
        assert!(config.stage("farewell").is_some());
        assert!(config.stage("made_up").is_none());
    }

    #[test]
    fn apology_falls_back_to_english() {
        let fallback = DomainConfig::builtin().fallback;
        assert!(!fallback.apology_for("hi").is_empty());
        assert!(!fallback.apology_for("xx").is_empty());
    }
}
