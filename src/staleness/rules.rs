//! Severity escalation policy for stale sources.
//!
//! Each rule that fires proposes a severity and the most severe proposal
//! wins. This reproduces an "each rule overrides the previous one if more
//! severe" cascade while keeping the policy inspectable as data.

use crate::health_store::Severity;

/// Facts about one source that the rules look at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleInput {
    /// `None` when the source never succeeded. May be negative when the
    /// source is still within tolerance.
    pub hours_overdue: Option<f64>,
    pub alert_after_hours: f64,
    pub is_critical: bool,
    pub consecutive_failures: u32,
}

pub struct SeverityRule {
    pub name: &'static str,
    pub applies: fn(&RuleInput) -> bool,
    pub severity: Severity,
}

fn overdue_beyond(input: &RuleInput, threshold: f64) -> bool {
    input.hours_overdue.is_some_and(|h| h > threshold)
}

pub const SEVERITY_RULES: &[SeverityRule] = &[
    SeverityRule {
        name: "never_succeeded",
        applies: |i| i.hours_overdue.is_none(),
        severity: Severity::Critical,
    },
    SeverityRule {
        name: "overdue_twice_alert_threshold",
        applies: |i| overdue_beyond(i, 2.0 * i.alert_after_hours),
        severity: Severity::Critical,
    },
    SeverityRule {
        name: "critical_source_past_alert_threshold",
        applies: |i| i.is_critical && overdue_beyond(i, i.alert_after_hours),
        severity: Severity::Critical,
    },
    SeverityRule {
        name: "past_alert_threshold",
        applies: |i| overdue_beyond(i, i.alert_after_hours),
        severity: Severity::Alert,
    },
    SeverityRule {
        name: "past_tolerance",
        applies: |i| overdue_beyond(i, 0.0),
        severity: Severity::Warning,
    },
    SeverityRule {
        name: "five_consecutive_failures",
        applies: |i| i.consecutive_failures >= 5,
        severity: Severity::Critical,
    },
    SeverityRule {
        name: "three_consecutive_failures",
        applies: |i| i.consecutive_failures >= 3,
        severity: Severity::Alert,
    },
];

/// Most severe severity proposed by `rules`, `None` when the source is
/// healthy.
pub fn resolve_with(rules: &[SeverityRule], input: &RuleInput) -> Option<Severity> {
    rules
        .iter()
        .filter(|rule| (rule.applies)(input))
        .map(|rule| rule.severity)
        .max()
}

pub fn resolve_severity(input: &RuleInput) -> Option<Severity> {
    resolve_with(SEVERITY_RULES, input)
}

/// Names of the rules that fire for `input`, for log messages.
pub fn fired_rules(input: &RuleInput) -> Vec<&'static str> {
    SEVERITY_RULES
        .iter()
        .filter(|rule| (rule.applies)(input))
        .map(|rule| rule.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(hours_overdue: Option<f64>, is_critical: bool, failures: u32) -> RuleInput {
        RuleInput {
            hours_overdue,
            alert_after_hours: 24.0,
            is_critical,
            consecutive_failures: failures,
        }
    }

    #[test]
    fn test_never_succeeded_is_critical() {
        assert_eq!(resolve_severity(&input(None, false, 0)), Some(Severity::Critical));
    }

    #[test]
    fn test_overdue_ladder() {
        assert_eq!(resolve_severity(&input(Some(-2.0), false, 0)), None);
        assert_eq!(resolve_severity(&input(Some(0.0), false, 0)), None);
        assert_eq!(resolve_severity(&input(Some(4.0), false, 0)), Some(Severity::Warning));
        assert_eq!(resolve_severity(&input(Some(24.0), false, 0)), Some(Severity::Warning));
        assert_eq!(resolve_severity(&input(Some(24.1), false, 0)), Some(Severity::Alert));
        assert_eq!(resolve_severity(&input(Some(24.1), true, 0)), Some(Severity::Critical));
        assert_eq!(resolve_severity(&input(Some(48.1), false, 0)), Some(Severity::Critical));
    }

    #[test]
    fn test_failure_streaks() {
        assert_eq!(resolve_severity(&input(Some(-1.0), false, 2)), None);
        assert_eq!(resolve_severity(&input(Some(-1.0), false, 3)), Some(Severity::Alert));
        assert_eq!(resolve_severity(&input(Some(-1.0), false, 5)), Some(Severity::Critical));
        // Never downgrades.
        assert_eq!(resolve_severity(&input(Some(50.0), false, 3)), Some(Severity::Critical));
        // Upgrades a warning.
        assert_eq!(resolve_severity(&input(Some(1.0), false, 3)), Some(Severity::Alert));
    }

    #[test]
    fn test_custom_rule_table() {
        let rules = [SeverityRule {
            name: "any_failure",
            applies: |i| i.consecutive_failures > 0,
            severity: Severity::Warning,
        }];
        assert_eq!(resolve_with(&rules, &input(None, false, 1)), Some(Severity::Warning));
        assert_eq!(resolve_with(&rules, &input(None, false, 0)), None);
    }

    #[test]
    fn test_fired_rules_names() {
        assert_eq!(
            fired_rules(&input(Some(30.0), true, 0)),
            vec!["critical_source_past_alert_threshold", "past_alert_threshold", "past_tolerance"]
        );
    }
}
