//! Reconciliation engine - classifies authoritative vs. reported value pairs
//!
//! Thresholds are policy inputs, never embedded in the classifier. Defaults
//! mirror the billing policy the engine ships with, but every field can be
//! overridden per run (e.g. from policy-lookup snippets).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Comparison, EscalationId, ValueKind};

/// Outcome class of one comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    /// Difference is zero (monetary: within the match tolerance)
    Matched,
    /// Nonzero but within the soft threshold, and the data source attached
    /// warnings explaining the gap
    Warned,
    /// Everything else, including anything beyond the hard thresholds
    Discrepant,
}

/// Resolution lifecycle of a discrepancy
///
/// Strictly `Open -> Escalated -> Resolved`; once the tolerance is exceeded
/// the escalated step cannot be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStatus {
    Open,
    Escalated,
    Resolved,
}

/// Tolerance thresholds for classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TolerancePolicy {
    /// Relative monetary difference still counted as matched (default 1%)
    pub monetary_match_relative: f64,
    /// Relative monetary difference tolerated as warned when the source
    /// carries warnings (default 10%)
    pub monetary_soft_relative: f64,
    /// Relative monetary difference beyond which the comparison is always
    /// discrepant (default 10%)
    pub monetary_hard_relative: f64,
    /// Day-count difference tolerated as warned when the source carries
    /// warnings (default 5 days)
    pub day_soft_threshold: f64,
    /// Day-count difference beyond which the comparison is always
    /// discrepant (default 5 days)
    pub day_hard_threshold: f64,
}

impl Default for TolerancePolicy {
    fn default() -> Self {
        Self {
            monetary_match_relative: 0.01,
            monetary_soft_relative: 0.10,
            monetary_hard_relative: 0.10,
            day_soft_threshold: 5.0,
            day_hard_threshold: 5.0,
        }
    }
}

impl TolerancePolicy {
    /// Apply a named threshold override, e.g. extracted from a policy
    /// snippet. Returns false for unknown keys.
    pub fn apply_override(&mut self, key: &str, value: f64) -> bool {
        match key {
            "monetary-match-relative" => self.monetary_match_relative = value,
            "monetary-soft-relative" => self.monetary_soft_relative = value,
            "monetary-hard-relative" => self.monetary_hard_relative = value,
            "day-soft-threshold" => self.day_soft_threshold = value,
            "day-hard-threshold" => self.day_hard_threshold = value,
            _ => return false,
        }
        true
    }
}

/// A classified mismatch between an authoritative source and a reported value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// Subject key, e.g. worker+project+period
    pub subject: String,
    pub kind: ValueKind,
    pub authoritative: f64,
    pub reported: f64,
    pub absolute_diff: f64,
    pub relative_diff: f64,
    pub classification: Classification,
    pub resolution: ResolutionStatus,
    /// The agreed value, once resolved
    pub resolution_value: Option<f64>,
    /// Escalation this discrepancy was routed to, if any
    pub escalation: Option<EscalationId>,
}

impl Discrepancy {
    /// Mark as escalated. Legal only from `Open`.
    pub fn escalate(&mut self, escalation: EscalationId) {
        if self.resolution == ResolutionStatus::Open {
            self.resolution = ResolutionStatus::Escalated;
            self.escalation = Some(escalation);
        }
    }

    /// Apply a resolution value.
    ///
    /// A non-matched discrepancy must pass through `Escalated` first; it
    /// cannot jump straight from `Open` to `Resolved`.
    pub fn resolve(&mut self, value: f64) -> bool {
        match (self.classification, self.resolution) {
            (Classification::Matched, _) | (_, ResolutionStatus::Escalated) => {
                self.resolution = ResolutionStatus::Resolved;
                self.resolution_value = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Whether this discrepancy still blocks finalization
    pub fn blocks_finalize(&self) -> bool {
        self.classification != Classification::Matched
            && self.resolution != ResolutionStatus::Resolved
    }
}

/// Ranked policy snippet from the external retrieval collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnippet {
    pub text: String,
    pub score: f64,
}

/// External policy-lookup contract (RAG collaborator)
///
/// Consumed only to parameterize tolerance thresholds and escalation
/// criteria; never drives orchestration control flow.
#[async_trait]
pub trait PolicyLookup: Send + Sync {
    async fn lookup(&self, query: &str) -> Vec<PolicySnippet>;
}

/// Classifies value pairs under a tolerance policy
#[derive(Debug, Clone, Default)]
pub struct ReconcileEngine {
    policy: TolerancePolicy,
}

impl ReconcileEngine {
    pub fn new(policy: TolerancePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TolerancePolicy {
        &self.policy
    }

    /// Classify one comparison into a discrepancy record
    pub fn classify(&self, cmp: &Comparison) -> Discrepancy {
        let absolute = (cmp.authoritative - cmp.reported).abs();
        let relative = if cmp.authoritative.abs() > f64::EPSILON {
            absolute / cmp.authoritative.abs()
        } else if absolute > f64::EPSILON {
            f64::INFINITY
        } else {
            0.0
        };

        let classification = match cmp.kind {
            ValueKind::DayCount => self.classify_days(absolute, !cmp.warnings.is_empty()),
            ValueKind::Monetary => self.classify_monetary(relative, !cmp.warnings.is_empty()),
        };

        debug!(
            subject = %cmp.subject,
            kind = ?cmp.kind,
            absolute,
            relative,
            classification = ?classification,
            "classified comparison"
        );

        Discrepancy {
            subject: cmp.subject.clone(),
            kind: cmp.kind,
            authoritative: cmp.authoritative,
            reported: cmp.reported,
            absolute_diff: absolute,
            relative_diff: relative,
            classification,
            resolution: ResolutionStatus::Open,
            resolution_value: None,
            escalation: None,
        }
    }

    fn classify_days(&self, absolute: f64, has_warnings: bool) -> Classification {
        if absolute == 0.0 {
            Classification::Matched
        } else if absolute > self.policy.day_hard_threshold {
            Classification::Discrepant
        } else if has_warnings && absolute <= self.policy.day_soft_threshold {
            Classification::Warned
        } else {
            Classification::Discrepant
        }
    }

    fn classify_monetary(&self, relative: f64, has_warnings: bool) -> Classification {
        if relative <= self.policy.monetary_match_relative {
            Classification::Matched
        } else if relative > self.policy.monetary_hard_relative {
            Classification::Discrepant
        } else if has_warnings && relative <= self.policy.monetary_soft_relative {
            Classification::Warned
        } else {
            Classification::Discrepant
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ReconcileEngine {
        ReconcileEngine::new(TolerancePolicy::default())
    }

    fn days(authoritative: f64, reported: f64, warnings: &[&str]) -> Comparison {
        Comparison {
            subject: "LEGUAY Elodie/Modernisation/2025-09".into(),
            kind: ValueKind::DayCount,
            authoritative,
            reported,
            warnings: warnings.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn monetary(authoritative: f64, reported: f64) -> Comparison {
        Comparison {
            subject: "GEIG Didier/Modernisation/2025-09".into(),
            kind: ValueKind::Monetary,
            authoritative,
            reported,
            warnings: Vec::new(),
        }
    }

    // === Classification scenarios ===

    #[test]
    fn test_equal_day_counts_match() {
        // 12 declared vs 12 in the CRA
        let d = engine().classify(&days(12.0, 12.0, &[]));
        assert_eq!(d.classification, Classification::Matched);
        assert_eq!(d.absolute_diff, 0.0);
        assert!(!d.blocks_finalize());
    }

    #[test]
    fn test_small_day_gap_with_source_warnings_is_warned() {
        // 15 vs 12, hard threshold 5: inside tolerance, source flagged an
        // unvalidated timesheet
        let d = engine().classify(&days(15.0, 12.0, &["timesheet not validated"]));
        assert_eq!(d.classification, Classification::Warned);
        assert!(d.blocks_finalize());
    }

    #[test]
    fn test_small_day_gap_without_warnings_is_discrepant() {
        let d = engine().classify(&days(15.0, 12.0, &[]));
        assert_eq!(d.classification, Classification::Discrepant);
        assert!(d.blocks_finalize());
    }

    #[test]
    fn test_day_gap_beyond_hard_threshold_always_discrepant() {
        // Warnings cannot soften a gap past the hard threshold
        let d = engine().classify(&days(22.0, 12.0, &["some warning"]));
        assert_eq!(d.classification, Classification::Discrepant);
    }

    #[test]
    fn test_monetary_within_one_percent_matches() {
        let d = engine().classify(&monetary(10_000.0, 10_050.0));
        assert_eq!(d.classification, Classification::Matched);
    }

    #[test]
    fn test_monetary_twelve_percent_discrepant() {
        // 22,292 authoritative vs 25,000 reported: ~12% relative difference
        let d = engine().classify(&monetary(22_292.0, 25_000.0));
        assert!(d.relative_diff > 0.10);
        assert_eq!(d.classification, Classification::Discrepant);
    }

    #[test]
    fn test_zero_authoritative_nonzero_reported_discrepant() {
        let d = engine().classify(&monetary(0.0, 500.0));
        assert_eq!(d.classification, Classification::Discrepant);
    }

    // === Monotonicity ===

    #[test]
    fn test_classification_monotonic_in_difference() {
        let rank = |c: Classification| match c {
            Classification::Matched => 0,
            Classification::Warned => 1,
            Classification::Discrepant => 2,
        };

        let eng = engine();
        let mut last = 0;
        for reported in [12.0, 13.0, 15.0, 18.0, 25.0, 40.0] {
            let d = eng.classify(&days(12.0, reported, &["w"]));
            let r = rank(d.classification);
            assert!(r >= last, "classification regressed at reported={reported}");
            last = r;
        }
    }

    // === Resolution lifecycle ===

    #[test]
    fn test_resolution_cannot_skip_escalated() {
        let mut d = engine().classify(&days(20.0, 12.0, &[]));
        assert_eq!(d.resolution, ResolutionStatus::Open);

        // Open -> Resolved is rejected for a non-matched discrepancy
        assert!(!d.resolve(12.0));
        assert_eq!(d.resolution, ResolutionStatus::Open);

        d.escalate(EscalationId::new());
        assert_eq!(d.resolution, ResolutionStatus::Escalated);

        assert!(d.resolve(12.0));
        assert_eq!(d.resolution, ResolutionStatus::Resolved);
        assert_eq!(d.resolution_value, Some(12.0));
        assert!(!d.blocks_finalize());
    }

    // === Policy overrides ===

    #[test]
    fn test_policy_override_from_lookup() {
        let mut policy = TolerancePolicy::default();
        assert!(policy.apply_override("day-hard-threshold", 2.0));
        assert!(!policy.apply_override("unknown-key", 1.0));

        let eng = ReconcileEngine::new(policy);
        let d = eng.classify(&days(15.0, 12.0, &["w"]));
        // Gap of 3 now exceeds the tightened hard threshold
        assert_eq!(d.classification, Classification::Discrepant);
    }
}
