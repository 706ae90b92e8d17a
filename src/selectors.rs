//! Heuristic selector tables for the answer page.
//!
//! The target page has no stable DOM contract, so every pattern we rely on is
//! data: ranked lists that can be replaced from a JSON file without touching
//! the polling code. Earlier entries are more specific and win ties.

use anyhow::{Context, Result};
use scraper::Selector;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::research::ModelHint;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSet {
    /// Answer containers, most specific first.
    pub answer_tiers: Vec<String>,
    /// Any match means the answer is still being produced.
    pub loading_indicators: Vec<String>,
    /// Query input candidates, textarea-like first.
    pub input_candidates: Vec<String>,
    /// Controls that open the model picker.
    pub model_switchers: Vec<String>,
    /// Elements that hold the individual model entries once the picker is open.
    pub model_option_scopes: Vec<String>,
    pub models: Vec<ModelOption>,
    /// Where deep research progress is reported.
    pub completion_scopes: Vec<String>,
    pub completion_markers: Vec<String>,
}

/// How a [`ModelHint`] is presented in the page's model picker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelOption {
    pub hint: ModelHint,
    /// Label reported back in results.
    pub label: String,
    /// Text the picker entry contains.
    pub option_text: String,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self {
            answer_tiers: strings(&[
                "[class*=\"prose\"]",
                "[data-testid*=\"answer\"]",
                "[class*=\"markdown\"]",
                "[class*=\"answer\"]",
                "[class*=\"response\"]",
                "[class*=\"result\"]",
                "article",
            ]),
            loading_indicators: strings(&[
                "[class*=\"loading\"]",
                "[class*=\"typing\"]",
                "[class*=\"animate-pulse\"]",
                "[class*=\"spinner\"]",
                "[aria-busy=\"true\"]",
            ]),
            input_candidates: strings(&[
                "textarea",
                "[contenteditable=\"true\"][role=\"textbox\"]",
                "input[type=\"text\"]",
            ]),
            model_switchers: strings(&[
                "[data-testid*=\"model-selector\"]",
                "button[aria-label*=\"Model\"]",
                "button[aria-label*=\"model\"]",
                "button[class*=\"model\"]",
            ]),
            model_option_scopes: strings(&[
                "[data-testid*=\"model-option\"]",
                "[role=\"menuitem\"]",
                "[role=\"option\"]",
                "[role=\"menu\"] button",
            ]),
            models: vec![
                ModelOption {
                    hint: ModelHint::Default,
                    label: "Best".into(),
                    option_text: "Best".into(),
                },
                ModelOption {
                    hint: ModelHint::VariantA,
                    label: "Sonar".into(),
                    option_text: "Sonar".into(),
                },
                ModelOption {
                    hint: ModelHint::VariantB,
                    label: "GPT".into(),
                    option_text: "GPT".into(),
                },
                ModelOption {
                    hint: ModelHint::VariantC,
                    label: "Claude".into(),
                    option_text: "Claude".into(),
                },
                ModelOption {
                    hint: ModelHint::VariantD,
                    label: "Gemini".into(),
                    option_text: "Gemini".into(),
                },
            ],
            completion_scopes: strings(&[
                "[role=\"status\"]",
                "[class*=\"status\"]",
                "[class*=\"progress\"]",
                "[class*=\"step\"]",
            ]),
            completion_markers: strings(&["Complete", "Done", "Finished"]),
        }
    }
}

impl SelectorSet {
    /// Load a selector table from JSON. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading selector file {}", path.display()))?;
        let set: SelectorSet = serde_json::from_str(&raw)
            .with_context(|| format!("parsing selector file {}", path.display()))?;
        set.validate()?;
        Ok(set)
    }

    /// Reject tables containing CSS the matcher cannot parse.
    pub fn validate(&self) -> Result<()> {
        let invalid: Vec<&str> = self
            .all_patterns()
            .filter(|pattern| Selector::parse(pattern).is_err())
            .collect();

        if !invalid.is_empty() {
            anyhow::bail!("invalid selectors: {}", invalid.join(" | "));
        }
        if self.answer_tiers.is_empty() || self.input_candidates.is_empty() {
            anyhow::bail!("answer_tiers and input_candidates must not be empty");
        }
        Ok(())
    }

    fn all_patterns(&self) -> impl Iterator<Item = &str> {
        self.answer_tiers
            .iter()
            .chain(&self.loading_indicators)
            .chain(&self.input_candidates)
            .chain(&self.model_switchers)
            .chain(&self.model_option_scopes)
            .chain(&self.completion_scopes)
            .map(String::as_str)
    }

    pub fn model(&self, hint: ModelHint) -> Option<&ModelOption> {
        self.models.iter().find(|m| m.hint == hint)
    }

    /// Label of the model the page uses when nothing is selected.
    pub fn default_label(&self) -> &str {
        self.model(ModelHint::Default)
            .map(|m| m.label.as_str())
            .unwrap_or("default")
    }
}
