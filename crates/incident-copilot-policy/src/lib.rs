#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use incident_copilot_domain::{Classification, PolicyBand, PolicyDecision, Severity};
use serde::{Deserialize, Serialize};

/// Confidence cutoffs for the automation bands. The defaults mirror the
/// production policy, but both floors are configuration, not law.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyThresholds {
    /// Confidence below this floor always forces REVIEW.
    #[serde(default = "default_review_floor")]
    pub review_confidence_floor: f64,
    /// Confidence at or above this floor qualifies for AUTO (unless a
    /// REVIEW rule already fired).
    #[serde(default = "default_auto_floor")]
    pub auto_confidence_floor: f64,
}

fn default_review_floor() -> f64 {
    0.70
}

fn default_auto_floor() -> f64 {
    0.90
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            review_confidence_floor: default_review_floor(),
            auto_confidence_floor: default_auto_floor(),
        }
    }
}

impl PolicyThresholds {
    /// Validate threshold ordering and range.
    ///
    /// # Errors
    /// Returns an error when a floor is outside [0, 1] or the review floor
    /// exceeds the auto floor.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("review_confidence_floor", self.review_confidence_floor),
            ("auto_confidence_floor", self.auto_confidence_floor),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{name} MUST be within [0, 1], got {value}"));
            }
        }
        if self.review_confidence_floor > self.auto_confidence_floor {
            return Err(anyhow!(
                "review_confidence_floor ({}) MUST NOT exceed auto_confidence_floor ({})",
                self.review_confidence_floor,
                self.auto_confidence_floor
            ));
        }
        Ok(())
    }
}

/// Load thresholds from a YAML file.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_thresholds_from_path(path: &Path) -> Result<PolicyThresholds> {
    let content = fs::read_to_string(path)?;
    parse_thresholds_yaml(&content)
}

/// Parse and validate thresholds from YAML text.
///
/// # Errors
/// Returns an error when parsing or validation fails.
pub fn parse_thresholds_yaml(yaml: &str) -> Result<PolicyThresholds> {
    let thresholds: PolicyThresholds = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid policy thresholds YAML: {err}"))?;
    thresholds.validate()?;
    Ok(thresholds)
}

/// Map a classification onto an automation band.
///
/// Pure and deterministic: no clock, randomness, or external call. REVIEW
/// rules are evaluated first and short-circuit, so a critical alert stays
/// in REVIEW no matter how confident the classifier was. The returned
/// decision is built from the band, keeping the derived booleans
/// consistent by construction, and `policy_reason` names the rule that
/// fired.
#[must_use]
pub fn decide(classification: &Classification, thresholds: &PolicyThresholds) -> PolicyDecision {
    let severity = classification.severity;
    let confidence = classification.confidence;

    let (band, reason) = if severity == Severity::Critical {
        (PolicyBand::Review, "review.critical_severity")
    } else if confidence.is_nan() || confidence < thresholds.review_confidence_floor {
        // An unusable score is never grounds for automation.
        (PolicyBand::Review, "review.low_confidence")
    } else if severity == Severity::Low {
        (PolicyBand::Auto, "auto.low_severity")
    } else if confidence >= thresholds.auto_confidence_floor {
        (PolicyBand::Auto, "auto.high_confidence")
    } else {
        (PolicyBand::Propose, "propose.moderate_confidence")
    };

    let requires_approval = band != PolicyBand::Auto;
    let notification_required =
        requires_approval || matches!(severity, Severity::High | Severity::Critical);
    // Anything applied without a human in the loop needs a rollback path.
    let rollback_required = band == PolicyBand::Auto;

    PolicyDecision::from_band(band, notification_required, rollback_required, reason)
}
