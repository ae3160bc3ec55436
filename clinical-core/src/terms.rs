use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::knowledge::KnowledgeBase;

/// A matched abbreviation with its expansion from the terminology table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermExpansion {
    pub abbreviation: String,
    pub full_name: String,
    pub matched_text: String,
}

/// Scan `text` for known abbreviations and report each match with its
/// expansion. Matching is word-bounded and case-insensitive; only the first
/// occurrence per abbreviation is reported. Results follow terminology-table
/// order, not position in the source text. Pure over the text and the table
/// snapshot; unknown abbreviations are simply omitted.
pub fn expand_terms(text: &str, knowledge: &KnowledgeBase) -> Vec<TermExpansion> {
    let mut expansions = Vec::new();
    for entry in &knowledge.abbreviations {
        let pattern = format!(r"\b{}\b", regex::escape(&entry.abbreviation));
        let re = match RegexBuilder::new(&pattern).case_insensitive(true).build() {
            Ok(re) => re,
            Err(e) => {
                debug!("Skipping unmatchable abbreviation {}: {}", entry.abbreviation, e);
                continue;
            }
        };
        if let Some(m) = re.find(text) {
            expansions.push(TermExpansion {
                abbreviation: entry.abbreviation.clone(),
                full_name: entry.expansion.clone(),
                matched_text: m.as_str().to_string(),
            });
        }
    }
    expansions
}
