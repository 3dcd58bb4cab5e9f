//! Structured profile extraction and validated merging.
//!
//! The LLM appends a machine-readable field block after its spoken reply
//! (see [`crate::llm::TokenDemux`]). This module owns the applicant
//! profile and the rules deciding which payload fields are accepted:
//! monetary fields must parse as positive numbers, credit scores must be
//! in range, and numeric fields are only trusted when the user's own
//! utterance contained at least one digit.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Valid credit score range (standard FICO bounds).
pub const CREDIT_SCORE_MIN: i64 = 300;
pub const CREDIT_SCORE_MAX: i64 = 850;

/// A single profile field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Free-text field (name, employment type, loan purpose, ...).
    Text(String),
    /// Numeric field (income, amounts, credit score).
    Number(f64),
}

impl FieldValue {
    /// Numeric value if this field holds one.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

/// The structured applicant profile built up over a session.
///
/// Field writes are last-writer-wins: a later extraction replaces the
/// prior value outright, never merges with it. The gate flags are
/// monotonic within a session (false to true only).
#[derive(Debug, Clone, Default, Serialize)]
pub struct StructuredProfile {
    fields: BTreeMap<String, FieldValue>,
    /// Set when the client signals document verification completed.
    pub documents_verified: bool,
    /// Set once eligibility scoring has run; it never re-runs.
    pub eligibility_checked: bool,
    /// Set when the verification-required event has been emitted, so it
    /// is emitted at most once per session.
    pub verification_requested: bool,
}

impl StructuredProfile {
    /// Look up a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Numeric value of a field, if present and numeric.
    #[must_use]
    pub fn get_number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_number)
    }

    /// Overwrite a field (last-writer-wins).
    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Whether every required field is present.
    #[must_use]
    pub fn is_complete(&self, required: &[String]) -> bool {
        required.iter().all(|f| self.fields.contains_key(f))
    }

    /// Required fields not yet collected, in the order given.
    #[must_use]
    pub fn missing_fields(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|f| !self.fields.contains_key(*f))
            .cloned()
            .collect()
    }

    /// JSON snapshot of the collected fields (no gate flags), used for
    /// prompt state injection and `structured_update` events.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&self.fields).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Merge an LLM-provided payload block into the profile.
///
/// `raw_payload` is the text after the payload delimiter; it should be a
/// JSON object but models routinely wrap it in prose or fences, so a
/// balanced-object recovery pass runs before giving up. A payload that
/// still fails to parse yields no updates and is never fatal to the turn.
///
/// `user_text` is the user utterance that produced this turn; numeric
/// fields are only accepted when it contains at least one digit, which
/// stops the model from inventing numbers the user never said.
///
/// Returns the names of the fields that were actually updated.
pub fn merge_payload(
    profile: &mut StructuredProfile,
    raw_payload: &str,
    user_text: &str,
) -> Vec<String> {
    let raw = raw_payload.trim();
    if raw.is_empty() {
        return Vec::new();
    }

    let object = match parse_payload(raw) {
        Some(o) => o,
        None => {
            warn!("unparseable field payload dropped ({} bytes)", raw.len());
            return Vec::new();
        }
    };

    let user_has_digit = user_text.chars().any(|c| c.is_ascii_digit());
    let mut updated = Vec::new();

    for (key, value) in &object {
        let accepted = match key.as_str() {
            "monthly_income" | "loan_amount" => {
                user_has_digit && merge_money(profile, key, value, false)
            }
            // Zero is a valid answer here: no existing obligation.
            "existing_emi" => user_has_digit && merge_money(profile, key, value, true),
            "credit_score" => user_has_digit && merge_credit_score(profile, value),
            _ => merge_text(profile, key, value),
        };
        if accepted {
            updated.push(key.clone());
        } else {
            debug!("payload field rejected: {key}");
        }
    }

    updated
}

fn parse_payload(raw: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(raw) {
        return Some(map);
    }
    // Best-effort recovery: find the first balanced object-like substring.
    let candidate = extract_json_object(raw)?;
    match serde_json::from_str(candidate) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn merge_money(
    profile: &mut StructuredProfile,
    key: &str,
    value: &serde_json::Value,
    allow_zero: bool,
) -> bool {
    let Some(amount) = parse_money(value) else {
        return false;
    };
    if amount < 0.0 || (amount == 0.0 && !allow_zero) {
        return false;
    }
    profile.set(key, FieldValue::Number(amount));
    true
}

fn merge_credit_score(profile: &mut StructuredProfile, value: &serde_json::Value) -> bool {
    let score = match value {
        serde_json::Value::Number(n) => n.as_f64().map(|f| f as i64),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    let Some(score) = score else {
        return false;
    };
    if !(CREDIT_SCORE_MIN..=CREDIT_SCORE_MAX).contains(&score) {
        return false;
    }
    profile.set("credit_score", FieldValue::Number(score as f64));
    true
}

fn merge_text(profile: &mut StructuredProfile, key: &str, value: &serde_json::Value) -> bool {
    let serde_json::Value::String(s) = value else {
        return false;
    };
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return false;
    }
    profile.set(key, FieldValue::Text(trimmed.to_owned()));
    true
}

/// Parse a monetary value, tolerating currency symbols and thousands
/// separators the model may echo from speech ("$5,000", "₹12 000").
fn parse_money(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Extract the first balanced JSON object from text.
///
/// Handles nested braces, string literals, and escaped quotes. Used to
/// recover payloads wrapped in prose or markdown fences.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    // ── merge_payload ───────────────────────────────────────────────

    #[test]
    fn merge_accepts_valid_fields() {
        let mut profile = StructuredProfile::default();
        let updated = merge_payload(
            &mut profile,
            r#"{"name": "Alice", "monthly_income": 5000, "credit_score": 750}"#,
            "my income is 5000 and my score is 750, I'm Alice",
        );
        assert_eq!(updated.len(), 3);
        assert_eq!(profile.get_number("monthly_income"), Some(5000.0));
        assert_eq!(profile.get_number("credit_score"), Some(750.0));
        assert_eq!(
            profile.get("name"),
            Some(&FieldValue::Text("Alice".to_owned()))
        );
    }

    #[test]
    fn last_writer_wins() {
        let mut profile = StructuredProfile::default();
        merge_payload(&mut profile, r#"{"monthly_income": 3000}"#, "I make 3000");
        merge_payload(
            &mut profile,
            r#"{"monthly_income": 4500}"#,
            "sorry, it is 4500",
        );
        assert_eq!(profile.get_number("monthly_income"), Some(4500.0));
    }

    #[test]
    fn credit_score_out_of_range_rejected_prior_retained() {
        let mut profile = StructuredProfile::default();
        merge_payload(&mut profile, r#"{"credit_score": 720}"#, "score is 720");
        let updated = merge_payload(&mut profile, r#"{"credit_score": "950"}"#, "950 maybe");
        assert!(updated.is_empty());
        assert_eq!(profile.get_number("credit_score"), Some(720.0));
    }

    #[test]
    fn credit_score_below_range_rejected() {
        let mut profile = StructuredProfile::default();
        let updated = merge_payload(&mut profile, r#"{"credit_score": 250}"#, "it is 250");
        assert!(updated.is_empty());
        assert!(profile.get("credit_score").is_none());
    }

    #[test]
    fn numeric_fields_need_digit_in_user_text() {
        let mut profile = StructuredProfile::default();
        let updated = merge_payload(
            &mut profile,
            r#"{"monthly_income": 5000, "name": "Bob"}"#,
            "my name is Bob",
        );
        // The invented income is dropped, the name is kept.
        assert_eq!(updated, vec!["name".to_owned()]);
        assert!(profile.get("monthly_income").is_none());
    }

    #[test]
    fn monetary_strings_are_cleaned() {
        let mut profile = StructuredProfile::default();
        merge_payload(
            &mut profile,
            r#"{"loan_amount": "$10,000"}"#,
            "ten thousand, 10000",
        );
        assert_eq!(profile.get_number("loan_amount"), Some(10_000.0));
    }

    #[test]
    fn negative_and_zero_money_rejected() {
        let mut profile = StructuredProfile::default();
        let updated = merge_payload(
            &mut profile,
            r#"{"monthly_income": 0, "loan_amount": -500}"#,
            "0 and -500",
        );
        assert!(updated.is_empty());
    }

    #[test]
    fn existing_emi_zero_is_valid() {
        let mut profile = StructuredProfile::default();
        let updated = merge_payload(&mut profile, r#"{"existing_emi": 0}"#, "I pay 0 right now");
        assert_eq!(updated, vec!["existing_emi".to_owned()]);
        assert_eq!(profile.get_number("existing_emi"), Some(0.0));
    }

    #[test]
    fn malformed_payload_yields_no_updates() {
        let mut profile = StructuredProfile::default();
        profile.set("name", FieldValue::Text("Carol".to_owned()));
        let updated = merge_payload(&mut profile, "not json at all {{{", "hello");
        assert!(updated.is_empty());
        assert_eq!(
            profile.get("name"),
            Some(&FieldValue::Text("Carol".to_owned()))
        );
    }

    #[test]
    fn payload_recovered_from_surrounding_prose() {
        let mut profile = StructuredProfile::default();
        let updated = merge_payload(
            &mut profile,
            "Here is the data:\n```json\n{\"name\": \"Dee\"}\n```",
            "I'm Dee",
        );
        assert_eq!(updated, vec!["name".to_owned()]);
    }

    #[test]
    fn free_text_trimmed_verbatim() {
        let mut profile = StructuredProfile::default();
        merge_payload(
            &mut profile,
            r#"{"employment_type": "  self-employed "}"#,
            "self employed",
        );
        assert_eq!(
            profile.get("employment_type"),
            Some(&FieldValue::Text("self-employed".to_owned()))
        );
    }

    // ── completeness ────────────────────────────────────────────────

    #[test]
    fn missing_fields_in_required_order() {
        let required = vec![
            "name".to_owned(),
            "monthly_income".to_owned(),
            "credit_score".to_owned(),
        ];
        let mut profile = StructuredProfile::default();
        profile.set("monthly_income", FieldValue::Number(4000.0));
        assert!(!profile.is_complete(&required));
        assert_eq!(
            profile.missing_fields(&required),
            vec!["name".to_owned(), "credit_score".to_owned()]
        );
    }

    // ── extract_json_object ─────────────────────────────────────────

    #[test]
    fn extract_json_nested_and_strings() {
        let text = r#"noise {"a":{"b":"} quoted"},"c":1} trailing"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"a":{"b":"} quoted"},"c":1}"#)
        );
    }

    #[test]
    fn extract_json_unbalanced_is_none() {
        assert_eq!(extract_json_object("{unclosed"), None);
        assert_eq!(extract_json_object("no braces"), None);
    }
}
