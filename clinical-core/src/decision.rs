use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::extract::ClinicalData;
use crate::knowledge::{AppealCriteria, KnowledgeBase};
use crate::model::DecisionModel;

/// Tri-state verdict for an appeal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Approve,
    Reject,
    Review,
}

/// Which path produced the decision, so auditing downstream can tell
/// model-derived verdicts from rule-derived ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionSource {
    #[serde(rename = "external-model")]
    ExternalModel,
    #[serde(rename = "fallback-rules")]
    FallbackRules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub confidence: f64,
    pub rationale: Vec<String>,
    pub key_factors: Vec<String>,
    pub recommendations: Vec<String>,
    pub source: DecisionSource,
}

/// Produce a decision for the given clinical record. The external model is
/// tried exactly once; any call or parse failure falls back to the
/// deterministic rule cascade. Failures are logged, never surfaced.
pub async fn decide(
    data: &ClinicalData,
    text: &str,
    knowledge: &KnowledgeBase,
    model: &dyn DecisionModel,
) -> Decision {
    match external_decision(data, text, model).await {
        Ok(decision) => {
            info!("Decision produced by external model: {:?}", decision.outcome);
            decision
        }
        Err(e) => {
            warn!("External decision model unusable, applying rule fallback: {}", e);
            fallback_decision(data, &knowledge.appeal_criteria)
        }
    }
}

// ---------------------------------------------------------------------------
// External model path
// ---------------------------------------------------------------------------

const MAX_EXCERPT_CHARS: usize = 2000;

const DECISION_PROMPT_TEMPLATE: &str = r#"
You are reviewing an appeal for kidney-disease treatment coverage.

Extracted clinical values:
- GFR: {gfr}
- Creatinine: {creatinine}
- BUN: {bun}
- Proteinuria: {proteinuria}
- Blood pressure: {blood_pressure}
- Diabetes: {diabetes}
- Documented complications: {complications}

Document excerpt:
{excerpt}

CRITICAL: Respond with ONLY this JSON (no explanation, no additional text):
{
  "decision": "APPROVE | REJECT | REVIEW",
  "confidence": 0.0,
  "rationale": ["reason the decision was reached"],
  "key_factors": ["clinical values that drove the decision"],
  "recommendations": ["next steps for the reviewer"]
}
"#;

fn fmt_value(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{} {}", v, unit),
        None => "unknown".to_string(),
    }
}

fn truncate_excerpt(text: &str) -> &str {
    match text.char_indices().nth(MAX_EXCERPT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Format the structured prompt embedding the clinical fields and a
/// truncated excerpt of the source text.
pub fn build_decision_prompt(data: &ClinicalData, text: &str) -> String {
    let complications = if data.complications.is_empty() {
        "none documented".to_string()
    } else {
        data.complications
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    DECISION_PROMPT_TEMPLATE
        .replace("{gfr}", &fmt_value(data.gfr, "mL/min/1.73m²"))
        .replace("{creatinine}", &fmt_value(data.creatinine, "mg/dL"))
        .replace("{bun}", &fmt_value(data.bun, "mg/dL"))
        .replace("{proteinuria}", &fmt_value(data.proteinuria, "g/day"))
        .replace(
            "{blood_pressure}",
            &data
                .blood_pressure
                .map(|bp| format!("{} mmHg", bp))
                .unwrap_or_else(|| "unknown".to_string()),
        )
        .replace("{diabetes}", if data.diabetes { "yes" } else { "not documented" })
        .replace("{complications}", &complications)
        .replace("{excerpt}", truncate_excerpt(text))
}

#[derive(Debug, Deserialize)]
struct ModelDecisionPayload {
    decision: String,
    confidence: f64,
    #[serde(default, deserialize_with = "string_or_seq")]
    rationale: Vec<String>,
    #[serde(default, deserialize_with = "string_or_seq")]
    key_factors: Vec<String>,
    #[serde(default, deserialize_with = "string_or_seq")]
    recommendations: Vec<String>,
}

/// Models sometimes return a bare string where an array is expected; accept
/// both.
fn string_or_seq<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrSeq {
        One(String),
        Many(Vec<String>),
    }

    Ok(match StringOrSeq::deserialize(deserializer)? {
        StringOrSeq::One(s) => vec![s],
        StringOrSeq::Many(v) => v,
    })
}

async fn external_decision(
    data: &ClinicalData,
    text: &str,
    model: &dyn DecisionModel,
) -> Result<Decision> {
    let prompt = build_decision_prompt(data, text);
    let raw = model.generate(&prompt).await?;
    let payload = parse_model_decision(&raw)?;
    let outcome = parse_outcome(&payload.decision)?;

    Ok(Decision {
        outcome,
        confidence: payload.confidence.clamp(0.0, 1.0),
        rationale: payload.rationale,
        key_factors: payload.key_factors,
        recommendations: payload.recommendations,
        source: DecisionSource::ExternalModel,
    })
}

fn parse_outcome(raw: &str) -> Result<Outcome> {
    match raw.trim().to_uppercase().as_str() {
        "APPROVE" => Ok(Outcome::Approve),
        "REJECT" => Ok(Outcome::Reject),
        "REVIEW" => Ok(Outcome::Review),
        other => Err(CoreError::ModelResponse(format!(
            "unrecognized decision value: {}",
            other
        ))),
    }
}

/// Tolerant parse of the model reply: strip markdown fences and take the
/// first balanced `{...}` span; failing that, try a fenced ```json block.
fn parse_model_decision(raw: &str) -> Result<ModelDecisionPayload> {
    let stripped = strip_code_fences(raw);
    if let Some(span) = first_balanced_object(&stripped) {
        if let Ok(payload) = serde_json::from_str::<ModelDecisionPayload>(span) {
            return Ok(payload);
        }
    }

    if let Some(block) = fenced_json_block(raw) {
        if let Some(span) = first_balanced_object(block) {
            if let Ok(payload) = serde_json::from_str::<ModelDecisionPayload>(span) {
                return Ok(payload);
            }
        }
    }

    Err(CoreError::ModelResponse(
        "no parsable decision object in model reply".to_string(),
    ))
}

fn strip_code_fences(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn fenced_json_block(raw: &str) -> Option<&str> {
    let start = raw.find("```json")? + "```json".len();
    let rest = &raw[start..];
    let end = rest.find("```")?;
    Some(&rest[..end])
}

/// First balanced top-level `{...}` span, string-literal aware.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Fallback rule cascade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RuleState {
    outcome: Outcome,
    confidence: f64,
    rationale: Vec<String>,
    key_factors: Vec<String>,
}

type Rule = fn(RuleState, &ClinicalData, &AppealCriteria) -> RuleState;

static FALLBACK_RULES: &[(&str, Rule)] = &[
    ("gfr", gfr_rule),
    ("proteinuria", proteinuria_rule),
    ("complications", complications_rule),
];

/// Deterministic rule cascade used whenever the external model path fails.
/// Rules run in fixed order as a fold over the decision state; later rules
/// may override earlier outcomes per their own stated conditions.
pub fn fallback_decision(data: &ClinicalData, criteria: &AppealCriteria) -> Decision {
    let initial = RuleState {
        outcome: Outcome::Review,
        confidence: 0.5,
        rationale: Vec::new(),
        key_factors: Vec::new(),
    };

    let state = FALLBACK_RULES.iter().fold(initial, |state, (name, rule)| {
        debug!("Applying fallback rule: {}", name);
        rule(state, data, criteria)
    });

    let mut rationale = state.rationale;
    if rationale.is_empty() {
        rationale.push(
            "No decisive clinical values were extracted; manual review is required".to_string(),
        );
    }

    Decision {
        outcome: state.outcome,
        confidence: state.confidence,
        rationale,
        key_factors: state.key_factors,
        recommendations: fallback_recommendations(state.outcome),
        source: DecisionSource::FallbackRules,
    }
}

fn gfr_rule(mut state: RuleState, data: &ClinicalData, criteria: &AppealCriteria) -> RuleState {
    let Some(gfr) = data.gfr else {
        return state;
    };
    state.key_factors.push(format!("GFR {} mL/min/1.73m²", gfr));

    if gfr < criteria.approve_below_gfr {
        state.outcome = Outcome::Approve;
        state.confidence = 0.9;
        state.rationale.push(format!(
            "GFR of {} indicates end-stage kidney function (below {})",
            gfr, criteria.approve_below_gfr
        ));
    } else if gfr >= criteria.reject_at_or_above_gfr {
        state.outcome = Outcome::Reject;
        state.confidence = 0.8;
        state.rationale.push(format!(
            "GFR of {} indicates preserved kidney function (at or above {})",
            gfr, criteria.reject_at_or_above_gfr
        ));
    } else {
        state.outcome = Outcome::Review;
        state.confidence = 0.6;
        state.rationale.push(format!(
            "GFR of {} is in the intermediate range; clinical judgement required",
            gfr
        ));
    }
    state
}

fn proteinuria_rule(
    mut state: RuleState,
    data: &ClinicalData,
    criteria: &AppealCriteria,
) -> RuleState {
    let Some(proteinuria) = data.proteinuria else {
        return state;
    };
    state.key_factors.push(format!("proteinuria {} g/day", proteinuria));

    if proteinuria > criteria.nephrotic_proteinuria {
        state.outcome = Outcome::Approve;
        state.confidence = state.confidence.max(0.85);
        state.rationale.push(format!(
            "Proteinuria of {} g/day is in the nephrotic range",
            proteinuria
        ));
    } else if proteinuria < criteria.low_proteinuria && state.outcome == Outcome::Approve {
        // Low proteinuria only ever downgrades an APPROVE, never a REJECT or
        // REVIEW outcome.
        state.outcome = Outcome::Review;
        state.confidence = 0.7;
        state.rationale.push(format!(
            "Proteinuria of {} g/day is low; approval downgraded to review",
            proteinuria
        ));
    }
    state
}

fn complications_rule(
    mut state: RuleState,
    data: &ClinicalData,
    _criteria: &AppealCriteria,
) -> RuleState {
    if data.complications.is_empty() {
        return state;
    }
    let names: Vec<&str> = data.complications.iter().map(|c| c.name.as_str()).collect();
    state.key_factors.push(format!("complications: {}", names.join(", ")));
    state.outcome = Outcome::Approve;
    state.confidence = state.confidence.max(0.8);
    state.rationale.push(format!(
        "Documented complications ({}) support approval",
        names.join(", ")
    ));
    state
}

fn fallback_recommendations(outcome: Outcome) -> Vec<String> {
    match outcome {
        Outcome::Approve => vec![
            "Proceed with appeal approval".to_string(),
            "Confirm extracted lab values against source records".to_string(),
        ],
        Outcome::Reject => vec![
            "Communicate rejection rationale to the appellant".to_string(),
            "Offer re-submission with updated lab work".to_string(),
        ],
        Outcome::Review => vec![
            "Route to a clinical reviewer for manual assessment".to_string(),
            "Request additional documentation if lab values are missing".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::Complication;
    use async_trait::async_trait;

    fn criteria() -> AppealCriteria {
        AppealCriteria::default()
    }

    fn data_with(gfr: Option<f64>, proteinuria: Option<f64>) -> ClinicalData {
        ClinicalData {
            gfr,
            proteinuria,
            ..ClinicalData::default()
        }
    }

    // -- fallback cascade ---------------------------------------------------

    #[test]
    fn test_low_gfr_approves_at_high_confidence() {
        let decision = fallback_decision(&data_with(Some(12.0), None), &criteria());
        assert_eq!(decision.outcome, Outcome::Approve);
        assert_eq!(decision.confidence, 0.9);
        assert_eq!(decision.source, DecisionSource::FallbackRules);
        assert!(decision.rationale[0].contains("end-stage"));
    }

    #[test]
    fn test_preserved_gfr_rejects() {
        let decision = fallback_decision(&data_with(Some(70.0), None), &criteria());
        assert_eq!(decision.outcome, Outcome::Reject);
        assert_eq!(decision.confidence, 0.8);
    }

    #[test]
    fn test_intermediate_gfr_reviews() {
        let decision = fallback_decision(&data_with(Some(30.0), None), &criteria());
        assert_eq!(decision.outcome, Outcome::Review);
        assert_eq!(decision.confidence, 0.6);
    }

    #[test]
    fn test_nephrotic_proteinuria_overrides_gfr_rejection() {
        let decision = fallback_decision(&data_with(Some(70.0), Some(4.0)), &criteria());
        assert_eq!(decision.outcome, Outcome::Approve);
        assert_eq!(decision.confidence, 0.85);
    }

    #[test]
    fn test_nephrotic_proteinuria_keeps_higher_confidence() {
        // GFR rule already set 0.9; the proteinuria rule must not lower it
        let decision = fallback_decision(&data_with(Some(12.0), Some(4.0)), &criteria());
        assert_eq!(decision.outcome, Outcome::Approve);
        assert_eq!(decision.confidence, 0.9);
    }

    #[test]
    fn test_low_proteinuria_downgrades_approve_only() {
        let downgraded = fallback_decision(&data_with(Some(12.0), Some(0.5)), &criteria());
        assert_eq!(downgraded.outcome, Outcome::Review);
        assert_eq!(downgraded.confidence, 0.7);

        // A REJECT is never downgraded by low proteinuria
        let untouched = fallback_decision(&data_with(Some(70.0), Some(0.5)), &criteria());
        assert_eq!(untouched.outcome, Outcome::Reject);
        assert_eq!(untouched.confidence, 0.8);
    }

    #[test]
    fn test_complications_alone_force_approval() {
        let data = ClinicalData {
            complications: vec![Complication {
                name: "anemia".to_string(),
                description: "Reduced red cell mass".to_string(),
            }],
            ..ClinicalData::default()
        };
        let decision = fallback_decision(&data, &criteria());
        assert_eq!(decision.outcome, Outcome::Approve);
        assert!(decision.confidence >= 0.8);
    }

    #[test]
    fn test_no_clinical_values_defaults_to_review() {
        let decision = fallback_decision(&ClinicalData::default(), &criteria());
        assert_eq!(decision.outcome, Outcome::Review);
        assert_eq!(decision.confidence, 0.5);
        assert!(decision.rationale[0].contains("manual review"));
    }

    // -- model reply parsing ------------------------------------------------

    #[test]
    fn test_parse_plain_json_reply() {
        let payload = parse_model_decision(
            r#"{"decision": "APPROVE", "confidence": 0.92, "rationale": ["end stage"], "key_factors": [], "recommendations": []}"#,
        )
        .unwrap();
        assert_eq!(payload.decision, "APPROVE");
        assert_eq!(payload.confidence, 0.92);
    }

    #[test]
    fn test_parse_reply_with_surrounding_prose_and_fences() {
        let raw = "Here is my assessment:\n```json\n{\"decision\": \"REVIEW\", \"confidence\": 0.6}\n```\nLet me know if you need more.";
        let payload = parse_model_decision(raw).unwrap();
        assert_eq!(payload.decision, "REVIEW");
        assert!(payload.rationale.is_empty());
    }

    #[test]
    fn test_parse_accepts_string_where_array_expected() {
        let payload = parse_model_decision(
            r#"{"decision": "REJECT", "confidence": 0.8, "rationale": "kidney function preserved"}"#,
        )
        .unwrap();
        assert_eq!(payload.rationale, vec!["kidney function preserved"]);
    }

    #[test]
    fn test_parse_handles_braces_inside_strings() {
        let raw = r#"{"decision": "APPROVE", "confidence": 0.9, "rationale": ["values like {gfr} were low"]}"#;
        let payload = parse_model_decision(raw).unwrap();
        assert_eq!(payload.decision, "APPROVE");
    }

    #[test]
    fn test_parse_rejects_plain_prose() {
        let err = parse_model_decision("The claim looks approvable to me.").unwrap_err();
        assert!(matches!(err, CoreError::ModelResponse(_)));
    }

    // -- decide() end to end --------------------------------------------------

    struct FixedModel(&'static str);

    #[async_trait]
    impl DecisionModel for FixedModel {
        async fn generate(&self, _prompt: &str) -> crate::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl DecisionModel for FailingModel {
        async fn generate(&self, _prompt: &str) -> crate::Result<String> {
            Err(CoreError::ModelCall("connection refused".to_string()))
        }
    }

    fn kb() -> KnowledgeBase {
        KnowledgeBase {
            abbreviations: vec![],
            complications: vec![],
            stages: vec![],
            guidelines: vec![],
            appeal_criteria: AppealCriteria::default(),
        }
    }

    #[tokio::test]
    async fn test_decide_uses_external_model_when_parsable() {
        let model = FixedModel(
            r#"{"decision": "REJECT", "confidence": 1.4, "rationale": ["preserved function"]}"#,
        );
        let decision = decide(&data_with(Some(12.0), None), "note", &kb(), &model).await;
        assert_eq!(decision.outcome, Outcome::Reject);
        assert_eq!(decision.source, DecisionSource::ExternalModel);
        // Out-of-range confidence is clamped
        assert_eq!(decision.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_decide_falls_back_on_model_failure() {
        let decision = decide(&data_with(Some(12.0), None), "note", &kb(), &FailingModel).await;
        assert_eq!(decision.outcome, Outcome::Approve);
        assert_eq!(decision.source, DecisionSource::FallbackRules);
    }

    #[tokio::test]
    async fn test_decide_falls_back_on_unparsable_reply() {
        let model = FixedModel("I am fairly confident this should be approved.");
        let decision = decide(&data_with(Some(70.0), None), "note", &kb(), &model).await;
        assert_eq!(decision.outcome, Outcome::Reject);
        assert_eq!(decision.source, DecisionSource::FallbackRules);
    }

    #[tokio::test]
    async fn test_decide_falls_back_on_unknown_outcome_value() {
        let model = FixedModel(r#"{"decision": "ESCALATE", "confidence": 0.9}"#);
        let decision = decide(&data_with(Some(30.0), None), "note", &kb(), &model).await;
        assert_eq!(decision.outcome, Outcome::Review);
        assert_eq!(decision.source, DecisionSource::FallbackRules);
    }

    // -- prompt building ------------------------------------------------------

    #[test]
    fn test_prompt_embeds_fields_and_marks_unknowns() {
        let data = data_with(Some(12.0), None);
        let prompt = build_decision_prompt(&data, "dialysis candidate");
        assert!(prompt.contains("GFR: 12 mL/min/1.73m²"));
        assert!(prompt.contains("Proteinuria: unknown"));
        assert!(prompt.contains("dialysis candidate"));
    }

    #[test]
    fn test_prompt_truncates_long_excerpts() {
        let long_text = "x".repeat(5000);
        let prompt = build_decision_prompt(&ClinicalData::default(), &long_text);
        assert!(!prompt.contains(&"x".repeat(2001)));
        assert!(prompt.contains(&"x".repeat(2000)));
    }
}
