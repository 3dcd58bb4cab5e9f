//! Eligibility scoring collaborator.
//!
//! Scoring is a single synchronous call over a flat feature record. The
//! built-in rule-based scorer mirrors the lending heuristics the rest of
//! the system was tuned against (credit tier, income floor, debt load);
//! a remote model can be swapped in behind the same trait.

use crate::error::Result;
use serde::Serialize;

/// Flat numeric feature record for one applicant.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    /// Monthly income in currency units.
    pub monthly_income: f64,
    /// Credit score in [300, 850].
    pub credit_score: u32,
    /// Requested loan amount.
    pub loan_amount: f64,
    /// Employment tenure in months (0 if unknown).
    pub employment_tenure_months: u32,
    /// Existing monthly obligation (EMI) amount.
    pub existing_emi: f64,
}

/// Categorical eligibility status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityStatus {
    /// Likely to be approved.
    Eligible,
    /// Needs manual review.
    Borderline,
    /// Unlikely to be approved at the requested amount.
    NotEligible,
}

/// Result of one scoring call.
#[derive(Debug, Clone, Serialize)]
pub struct EligibilityOutcome {
    /// Score in [0, 1].
    pub score: f64,
    /// Categorical status derived from the score.
    pub status: EligibilityStatus,
    /// Free-text recommendations for the applicant.
    pub recommendations: Vec<String>,
}

/// An eligibility scoring backend.
pub trait EligibilityScorer: Send + Sync {
    /// Score one applicant.
    ///
    /// # Errors
    ///
    /// Returns an error if the scoring backend fails.
    fn score(&self, features: &FeatureRecord) -> Result<EligibilityOutcome>;
}

/// Rule-based scorer: weighted credit tier, debt-to-income ratio, and
/// loan-to-income ratio, squashed into [0, 1].
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedScorer;

/// Assumed repayment term used to estimate the new monthly installment.
const ASSUMED_TERM_MONTHS: f64 = 36.0;

impl EligibilityScorer for RuleBasedScorer {
    fn score(&self, features: &FeatureRecord) -> Result<EligibilityOutcome> {
        let income = features.monthly_income.max(1.0);

        // Credit component: linear from 300 (0.0) to 850 (1.0).
        let credit = f64::from(features.credit_score.clamp(300, 850));
        let credit_component = (credit - 300.0) / 550.0;

        // Debt component: existing EMI plus the estimated new installment,
        // relative to income. A combined ratio at or past 60% scores zero.
        let new_emi = features.loan_amount / ASSUMED_TERM_MONTHS;
        let dti = (features.existing_emi + new_emi) / income;
        let debt_component = (1.0 - dti / 0.6).clamp(0.0, 1.0);

        // Stability component: tenure saturates at 5 years.
        let stability_component =
            (f64::from(features.employment_tenure_months) / 60.0).clamp(0.0, 1.0);

        let mut score =
            0.5 * credit_component + 0.35 * debt_component + 0.15 * stability_component;

        // Hard floor from the approval rule the model was trained with:
        // sub-650 credit or sub-1000 income never clears eligible.
        if features.credit_score < 650 || features.monthly_income < 1000.0 {
            score = score.min(0.6);
        }
        let score = score.clamp(0.0, 1.0);

        let status = if score >= 0.65 {
            EligibilityStatus::Eligible
        } else if score >= 0.45 {
            EligibilityStatus::Borderline
        } else {
            EligibilityStatus::NotEligible
        };

        let mut recommendations = Vec::new();
        if features.credit_score < 650 {
            recommendations
                .push("Improve your credit score above 650 to qualify for better terms.".to_owned());
        }
        if dti > 0.4 {
            recommendations.push(
                "Your combined monthly obligations are high relative to income; consider a smaller loan amount.".to_owned(),
            );
        }
        if features.monthly_income < 1000.0 {
            recommendations
                .push("A documented monthly income of at least $1,000 is required.".to_owned());
        }
        if recommendations.is_empty() {
            recommendations.push("Your profile looks strong for this loan amount.".to_owned());
        }

        Ok(EligibilityOutcome {
            score,
            status,
            recommendations,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn strong_applicant() -> FeatureRecord {
        FeatureRecord {
            monthly_income: 6000.0,
            credit_score: 780,
            loan_amount: 10_000.0,
            employment_tenure_months: 48,
            existing_emi: 200.0,
        }
    }

    #[test]
    fn strong_profile_is_eligible() {
        let outcome = RuleBasedScorer.score(&strong_applicant()).unwrap();
        assert!(outcome.score > 0.65, "score was {}", outcome.score);
        assert_eq!(outcome.status, EligibilityStatus::Eligible);
        assert_eq!(outcome.recommendations.len(), 1);
    }

    #[test]
    fn low_credit_never_clears_eligible() {
        let mut features = strong_applicant();
        features.credit_score = 620;
        let outcome = RuleBasedScorer.score(&features).unwrap();
        assert_ne!(outcome.status, EligibilityStatus::Eligible);
        assert!(outcome
            .recommendations
            .iter()
            .any(|r| r.contains("credit score")));
    }

    #[test]
    fn heavy_debt_load_drags_score_down() {
        let mut features = strong_applicant();
        features.existing_emi = 3500.0;
        features.loan_amount = 60_000.0;
        let outcome = RuleBasedScorer.score(&features).unwrap();
        assert_eq!(outcome.status, EligibilityStatus::NotEligible);
    }

    #[test]
    fn score_is_always_in_unit_interval() {
        let extremes = [
            FeatureRecord {
                monthly_income: 1.0,
                credit_score: 300,
                loan_amount: 1_000_000.0,
                employment_tenure_months: 0,
                existing_emi: 99_999.0,
            },
            FeatureRecord {
                monthly_income: 1_000_000.0,
                credit_score: 850,
                loan_amount: 1.0,
                employment_tenure_months: 600,
                existing_emi: 0.0,
            },
        ];
        for features in &extremes {
            let outcome = RuleBasedScorer.score(features).unwrap();
            assert!((0.0..=1.0).contains(&outcome.score));
        }
    }
}
