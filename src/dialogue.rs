//! Dialogue controller: the per-turn decision core.
//!
//! On every accepted final transcript the controller decides whether to
//! request document verification, run eligibility scoring, or stream a
//! reply through the LLM pipeline. The verification and eligibility
//! gates are idempotent: each fires at most once per session.

use crate::config::DialogueConfig;
use crate::error::Result;
use crate::extract::StructuredProfile;
use crate::pipeline::messages::ChatTurn;
use crate::scoring::{EligibilityOutcome, EligibilityScorer, EligibilityStatus, FeatureRecord};
use crate::session::Session;
use crate::store::ApplicationStore;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Base persona and output-convention prompt. The required-field list,
/// payload delimiter, and profile snapshot are appended per turn.
const AGENT_PROMPT: &str = "You are LoanVoice, a friendly and efficient voice assistant \
for loan eligibility assessment.\n\n\
Your job:\n\
1. Greet the user warmly.\n\
2. Collect the required fields listed below, conversationally, one or two at a time.\n\
3. Respond in SHORT, natural sentences (max 15 words per sentence).\n\
4. Be conversational and empathetic. When you extract information, acknowledge it.\n\
5. Once all fields are collected, say you will check their eligibility.\n";

/// What the supervisor should do for this turn.
#[derive(Debug)]
pub enum TurnDecision {
    /// All fields collected, documents not yet verified: tell the client
    /// to verify documents. Emitted at most once per session.
    RequestVerification {
        /// Durable application record id for the verification flow.
        application_id: Uuid,
    },
    /// Documents verified and fields sane: scoring ran. Emit the result
    /// and speak `message`.
    ReportEligibility {
        /// The scoring outcome.
        outcome: EligibilityOutcome,
        /// Sentence(s) to speak to the applicant.
        message: String,
    },
    /// Stream a reply through the LLM response pipeline.
    Dispatch {
        /// Fully built system prompt (persona + fields + state snapshot).
        system_prompt: String,
        /// Conversation history snapshot for the request.
        history: Vec<ChatTurn>,
    },
}

/// Result of the document-verification-complete control message.
#[derive(Debug)]
pub struct VerificationOutcome {
    /// Sentence(s) to speak to the applicant.
    pub message: String,
    /// Present when verification unlocked the eligibility check.
    pub result: Option<EligibilityOutcome>,
}

/// The slot-filling decision core for one deployment.
///
/// Holds no per-session state; everything mutable lives in [`Session`].
pub struct DialogueController {
    config: DialogueConfig,
    payload_delimiter: String,
    scorer: Arc<dyn EligibilityScorer>,
    store: Arc<dyn ApplicationStore>,
}

impl DialogueController {
    /// Create a controller.
    #[must_use]
    pub fn new(
        config: DialogueConfig,
        payload_delimiter: String,
        scorer: Arc<dyn EligibilityScorer>,
        store: Arc<dyn ApplicationStore>,
    ) -> Self {
        Self {
            config,
            payload_delimiter,
            scorer,
            store,
        }
    }

    /// Decide how to react to an accepted final transcript.
    ///
    /// Appends the user turn to the history as a side effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or scorer collaborator fails.
    pub async fn on_final_transcript(
        &self,
        session: &mut Session,
        text: &str,
    ) -> Result<TurnDecision> {
        session.append_user(text);

        if let Some(application_id) = self.maybe_request_verification(session).await? {
            return Ok(TurnDecision::RequestVerification { application_id });
        }

        if session.profile.is_complete(&self.config.required_fields)
            && !session.profile.eligibility_checked
            && session.profile.documents_verified
            && let Some(decision) = self.try_score(session)?
        {
            return Ok(decision);
        }

        Ok(TurnDecision::Dispatch {
            system_prompt: self.build_system_prompt(&session.profile),
            history: session.history.clone(),
        })
    }

    /// Handle the client's "document verification completed" signal.
    ///
    /// Sets the monotonic `documents_verified` flag and immediately
    /// re-evaluates the eligibility gate.
    ///
    /// # Errors
    ///
    /// Returns an error if the scorer collaborator fails.
    pub fn on_documents_verified(&self, session: &mut Session) -> Result<VerificationOutcome> {
        session.profile.documents_verified = true;

        if session.profile.eligibility_checked {
            let message = "Your documents are verified and your eligibility has already been \
                           checked."
                .to_owned();
            session.append_assistant(&message);
            return Ok(VerificationOutcome {
                message,
                result: None,
            });
        }

        let missing = session.profile.missing_fields(&self.config.required_fields);
        if !missing.is_empty() {
            let message = format!(
                "I've verified your document. However, I still need your {} to check your \
                 eligibility. Please tell me those details.",
                join_naturally(&missing)
            );
            session.append_assistant(&message);
            return Ok(VerificationOutcome {
                message,
                result: None,
            });
        }

        match self.try_score(session)? {
            Some(TurnDecision::ReportEligibility { outcome, message }) => {
                Ok(VerificationOutcome {
                    message,
                    result: Some(outcome),
                })
            }
            _ => {
                let message = "I've verified your document, but some of your details look \
                               off. Could you confirm your income, credit score, and loan \
                               amount?"
                    .to_owned();
                session.append_assistant(&message);
                Ok(VerificationOutcome {
                    message,
                    result: None,
                })
            }
        }
    }

    /// Fire the verification-required gate if it is open: all required
    /// fields collected, documents not verified, signal not yet sent.
    ///
    /// Idempotent via the `verification_requested` flag. Also called by
    /// the response pipeline right after a field merge completes the
    /// profile, so the applicant is prompted without another utterance.
    ///
    /// # Errors
    ///
    /// Returns an error if the store collaborator fails.
    pub async fn maybe_request_verification(&self, session: &mut Session) -> Result<Option<Uuid>> {
        if !session.profile.is_complete(&self.config.required_fields)
            || session.profile.eligibility_checked
            || session.profile.documents_verified
            || session.profile.verification_requested
        {
            return Ok(None);
        }
        let application_id = self.ensure_application(session).await?;
        session.profile.verification_requested = true;
        info!("all fields collected, requesting document verification ({application_id})");
        Ok(Some(application_id))
    }

    /// Run eligibility scoring if the numeric fields clear the sanity
    /// floors. Returns `None` when they do not (partially-parsed garbage
    /// must never reach the scorer).
    fn try_score(&self, session: &mut Session) -> Result<Option<TurnDecision>> {
        let Some(features) = self.feature_record(&session.profile) else {
            warn!("profile claims completeness but fails numeric sanity floors");
            return Ok(None);
        };

        let outcome = self.scorer.score(&features)?;
        session.profile.eligibility_checked = true;
        info!(
            "eligibility scored: {:.2} ({:?})",
            outcome.score, outcome.status
        );

        let message = compose_result_message(&features, &outcome);
        session.append_assistant(&message);
        Ok(Some(TurnDecision::ReportEligibility { outcome, message }))
    }

    /// Build the flat feature record, enforcing the sanity floors.
    fn feature_record(&self, profile: &StructuredProfile) -> Option<FeatureRecord> {
        let monthly_income = profile.get_number("monthly_income")?;
        let credit_score = profile.get_number("credit_score")? as u32;
        let loan_amount = profile.get_number("loan_amount")?;
        let existing_emi = profile.get_number("existing_emi").unwrap_or(0.0);

        if monthly_income < self.config.min_income
            || credit_score < self.config.min_credit_score
            || loan_amount < self.config.min_loan_amount
        {
            return None;
        }

        Some(FeatureRecord {
            monthly_income,
            credit_score,
            loan_amount,
            employment_tenure_months: 0,
            existing_emi,
        })
    }

    async fn ensure_application(&self, session: &mut Session) -> Result<Uuid> {
        if let Some(id) = session.application_id {
            return Ok(id);
        }
        let id = self.store.create(&session.profile).await?;
        session.application_id = Some(id);
        Ok(id)
    }

    /// Full system prompt: persona, required fields, output convention,
    /// and the current profile snapshot injected as known state.
    fn build_system_prompt(&self, profile: &StructuredProfile) -> String {
        let fields = self.config.required_fields.join(", ");
        let snapshot = serde_json::to_string_pretty(&profile.snapshot())
            .unwrap_or_else(|_| "{}".to_owned());
        format!(
            "{AGENT_PROMPT}\n\
             Required fields: {fields}\n\n\
             CRITICAL INSTRUCTION:\n\
             At the very end of your response, append the extracted data as a JSON object, \
             separated by '{delim}'. Use the field names above as keys. If a field is unknown, \
             omit it. Always output the JSON block, even if empty.\n\n\
             CURRENT KNOWN INFO:\n{snapshot}\n\n\
             (If a field is present in KNOWN INFO, do NOT ask for it again. If the user \
             explicitly corrects a field, update it in the JSON output.)",
            delim = self.payload_delimiter,
        )
    }
}

/// "a, b and c" for spoken field lists.
fn join_naturally(items: &[String]) -> String {
    let spoken: Vec<String> = items.iter().map(|f| f.replace('_', " ")).collect();
    match spoken.len() {
        0 => String::new(),
        1 => spoken[0].clone(),
        _ => format!(
            "{} and {}",
            spoken[..spoken.len() - 1].join(", "),
            spoken[spoken.len() - 1]
        ),
    }
}

fn compose_result_message(features: &FeatureRecord, outcome: &EligibilityOutcome) -> String {
    match outcome.status {
        EligibilityStatus::Eligible => format!(
            "Great news! With a credit score of {} and a monthly income of ${:.0}, you are \
             eligible for the ${:.0} loan. A manager will review your application shortly.",
            features.credit_score, features.monthly_income, features.loan_amount
        ),
        EligibilityStatus::Borderline => format!(
            "Thanks for your patience. Your application for ${:.0} needs a manual review. {}",
            features.loan_amount,
            outcome.recommendations.first().cloned().unwrap_or_default()
        ),
        EligibilityStatus::NotEligible => format!(
            "I'm sorry, but based on your current profile we cannot approve the ${:.0} loan. {}",
            features.loan_amount,
            outcome.recommendations.first().cloned().unwrap_or_default()
        ),
    }
}
