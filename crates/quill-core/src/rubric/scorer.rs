//! Rubric scorer.
//!
//! Pure and network-free: the same case and rubric always produce the same
//! classification.

use tracing::debug;

use super::{signals, Derivation, FactorRule, Rubric};
use crate::case::CaseRecord;
use crate::types::{Classification, ContributingFactor, Level};

/// Scores case records against one rubric.
#[derive(Debug, Clone)]
pub struct RubricScorer {
    rubric: Rubric,
}

/// Where a factor's input value came from.
#[derive(Debug, Clone, Copy, PartialEq)]
enum InputSource {
    Case,
    Default,
    Derived,
}

impl RubricScorer {
    pub fn new(rubric: Rubric) -> Self {
        Self { rubric }
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }

    /// Score a case.
    pub fn score(&self, case: &CaseRecord) -> Classification {
        let mut factors = Vec::new();
        let mut total = 0.0;

        for rule in &self.rubric.factors {
            let Some((value, source)) = resolve_input(rule, case) else {
                continue;
            };
            if !rule.trigger.matches(value) {
                continue;
            }

            let weight = rule.points.raw(value).max(0.0).min(rule.cap);
            total += weight;

            let severity = match &rule.escalate {
                Some(escalation) if escalation.when.matches(value) => {
                    escalation.severity.max(rule.severity)
                }
                _ => rule.severity,
            };

            let mut detail = rule.detail.replace("{value}", &format_value(value));
            match source {
                InputSource::Derived => detail.push_str(" (derived from narrative)"),
                InputSource::Default => detail.push_str(" (assumed)"),
                InputSource::Case => {}
            }

            factors.push(ContributingFactor {
                factor: rule.factor.clone(),
                severity,
                weight,
                detail,
                recommendation: rule.recommendation.clone(),
            });
        }

        // Stable: equal severities keep rubric order.
        factors.sort_by(|a, b| b.severity.cmp(&a.severity));

        let score = round2(total.clamp(0.0, 100.0));
        let level = Level::from_score(score);

        debug!(score, level = %level, factors = factors.len(), "Case scored");

        Classification {
            score,
            level,
            contributing_factors: factors,
        }
    }
}

fn resolve_input(rule: &FactorRule, case: &CaseRecord) -> Option<(f64, InputSource)> {
    if let Some(value) = case.signal(&rule.input) {
        return Some((value, InputSource::Case));
    }

    if let Some(Derivation::KeywordSentiment { narrative_field }) = &rule.derive {
        if let Some(text) = case.text(narrative_field) {
            if !text.trim().is_empty() {
                return Some((signals::keyword_sentiment(text), InputSource::Derived));
            }
        }
    }

    rule.default.map(|value| (value, InputSource::Default))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::DomainProfile;

    fn retention() -> RubricScorer {
        let profile = DomainProfile::builtin("retention").unwrap();
        RubricScorer::new(profile.rubric.clone())
    }

    #[test]
    fn test_scenario_a_is_critical() {
        let case = CaseRecord::new("ACME-1")
            .with("usage_change_pct", -60)
            .with("days_since_last_activity", 20)
            .with("sentiment", -0.7);

        let classification = retention().score(&case);

        assert!(classification.score >= 75.0, "score {}", classification.score);
        assert_eq!(classification.level, Level::Critical);
        assert!((classification.score - 76.25).abs() < 1e-9);
    }

    #[test]
    fn test_healthy_nps_keeps_scenario_a_signals_high() {
        let case = CaseRecord::new("ACME-1")
            .with("usage_change_pct", -60)
            .with("days_since_last_activity", 20)
            .with("sentiment", -0.7)
            .with("nps", 50);

        let classification = retention().score(&case);
        assert!((classification.score - 66.25).abs() < 1e-9);
        assert_eq!(classification.level, Level::High);
    }

    #[test]
    fn test_detractor_nps_escalates_to_critical() {
        let case = CaseRecord::new("ACME-6").with("nps", -20);

        let classification = retention().score(&case);
        let nps = classification
            .contributing_factors
            .iter()
            .find(|f| f.factor == "Low NPS")
            .unwrap();
        assert_eq!(nps.severity, Level::Critical);
        assert!((nps.weight - 14.0).abs() < 1e-9);
    }

    #[test]
    fn test_factors_sorted_by_severity() {
        let case = CaseRecord::new("ACME-2")
            .with("usage_change_pct", -60)
            .with("days_since_last_activity", 20)
            .with("sentiment", -0.4)
            .with("nps", 10);

        let classification = retention().score(&case);
        let severities: Vec<Level> = classification
            .contributing_factors
            .iter()
            .map(|f| f.severity)
            .collect();

        let mut sorted = severities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(severities, sorted);
        assert_eq!(severities[0], Level::Critical);
    }

    #[test]
    fn test_caps_applied_before_sum() {
        let case = CaseRecord::new("ACME-3")
            .with("usage_change_pct", -100)
            .with("days_since_last_activity", 400)
            .with("sentiment", -1.0)
            .with("nps", -100)
            .with("feature_adoption_pct", 0)
            .with("payment_delays", 12)
            .with("days_until_renewal", 0)
            .with("has_champion", false);

        let classification = retention().score(&case);
        assert_eq!(classification.score, 100.0);

        let usage = classification
            .contributing_factors
            .iter()
            .find(|f| f.factor == "Usage Decline")
            .unwrap();
        assert_eq!(usage.weight, 25.0);
    }

    #[test]
    fn test_healthy_account_is_low() {
        let case = CaseRecord::new("ACME-4")
            .with("usage_change_pct", 12)
            .with("days_since_last_activity", 1)
            .with("sentiment", 0.8)
            .with("nps", 70);

        let classification = retention().score(&case);
        assert_eq!(classification.level, Level::Low);
        assert!(classification.contributing_factors.is_empty());
    }

    #[test]
    fn test_sentiment_derived_from_narrative() {
        let case = CaseRecord::new("ACME-5")
            .with("nps", 60)
            .with(
                "narrative",
                "Customer is frustrated, disappointed and threatening to cancel.",
            );

        let classification = retention().score(&case);
        let sentiment = classification
            .contributing_factors
            .iter()
            .find(|f| f.factor == "Negative Sentiment")
            .unwrap();

        // -0.1 - 0.15 * 3 = -0.55 -> |(-0.55) - 1| * 12.5
        assert!((sentiment.weight - 19.375).abs() < 1e-9);
        assert!(sentiment.detail.contains("derived from narrative"));
    }

    #[test]
    fn test_deterministic() {
        let case = CaseRecord::new("ACME-6")
            .with("usage_change_pct", -45)
            .with("payment_delays", 1);
        let scorer = retention();
        assert_eq!(scorer.score(&case), scorer.score(&case));
    }
}
