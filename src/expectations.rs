//! Per-source freshness expectations.
//!
//! Loaded from a TOML file of `[[sources]]` entries. Loading fails on the
//! first invalid entry: running with a partially loaded set would hide
//! sources from monitoring.

use crate::health_store::{escape_like, SourceFilter};
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

lazy_static! {
    static ref SOURCE_ID: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("source id regex is valid");
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpectationError {
    #[error("expectations file declares no sources")]
    Empty,
    #[error("invalid source_id {0:?}")]
    InvalidSourceId(String),
    #[error("source_id {0:?} is declared more than once")]
    DuplicateSource(String),
    #[error("{source_id}: {field} must be a finite number >= 0, got {value}")]
    InvalidHours {
        source_id: String,
        field: &'static str,
        value: f64,
    },
    #[error("{source_id}: invalid run id pattern {pattern:?}: {reason}")]
    InvalidPattern {
        source_id: String,
        pattern: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
}

/// A glob over run `source_id`s. `*` matches any run of characters; nothing
/// else is special.
#[derive(Debug, Clone)]
pub struct RunIdPattern {
    glob: String,
    regex: Regex,
    like: String,
}

impl RunIdPattern {
    pub fn compile(source_id: &str, glob: &str) -> Result<Self, ExpectationError> {
        let invalid = |reason| ExpectationError::InvalidPattern {
            source_id: source_id.to_string(),
            pattern: glob.to_string(),
            reason,
        };
        if glob.trim().is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if glob.chars().any(char::is_whitespace) {
            return Err(invalid("pattern contains whitespace"));
        }
        if glob.chars().all(|c| c == '*') {
            return Err(invalid("pattern would match every source"));
        }

        let pieces: Vec<&str> = glob.split('*').collect();
        let regex_src = format!(
            "^{}$",
            pieces
                .iter()
                .map(|p| regex::escape(p))
                .collect::<Vec<_>>()
                .join(".*")
        );
        let regex = Regex::new(&regex_src).map_err(|_| invalid("pattern does not compile"))?;
        let like = pieces
            .iter()
            .map(|p| escape_like(p))
            .collect::<Vec<_>>()
            .join("%");

        Ok(Self {
            glob: glob.to_string(),
            regex,
            like,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    pub fn matches(&self, run_source_id: &str) -> bool {
        self.regex.is_match(run_source_id)
    }

    /// Equivalent SQL `LIKE` pattern, escaped with `\`.
    pub fn like_pattern(&self) -> &str {
        &self.like
    }
}

#[derive(Debug, Clone)]
pub struct SourceExpectation {
    pub source_id: String,
    pub frequency: Frequency,
    /// Grace period after which the source counts as overdue.
    pub tolerance_hours: f64,
    /// Overdue hours that escalate severity.
    pub alert_after_hours: f64,
    /// Doubles the weight in freshness scoring and escalates sooner.
    pub is_critical: bool,
    patterns: Vec<RunIdPattern>,
}

impl SourceExpectation {
    /// Builds an expectation with the default run id patterns
    /// `[source_id, "source_id_*"]`.
    pub fn new(
        source_id: &str,
        frequency: Frequency,
        tolerance_hours: f64,
        alert_after_hours: f64,
        is_critical: bool,
    ) -> Result<Self, ExpectationError> {
        Self::with_patterns(
            source_id,
            frequency,
            tolerance_hours,
            alert_after_hours,
            is_critical,
            None,
        )
    }

    pub fn with_patterns(
        source_id: &str,
        frequency: Frequency,
        tolerance_hours: f64,
        alert_after_hours: f64,
        is_critical: bool,
        run_id_patterns: Option<&[String]>,
    ) -> Result<Self, ExpectationError> {
        if !SOURCE_ID.is_match(source_id) {
            return Err(ExpectationError::InvalidSourceId(source_id.to_string()));
        }
        for (field, value) in [
            ("tolerance_hours", tolerance_hours),
            ("alert_after_hours", alert_after_hours),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ExpectationError::InvalidHours {
                    source_id: source_id.to_string(),
                    field,
                    value,
                });
            }
        }

        let globs = match run_id_patterns {
            Some(globs) if !globs.is_empty() => globs.to_vec(),
            Some(_) => {
                return Err(ExpectationError::InvalidPattern {
                    source_id: source_id.to_string(),
                    pattern: String::new(),
                    reason: "run_id_patterns must not be empty",
                })
            }
            None => vec![source_id.to_string(), format!("{}_*", source_id)],
        };
        let patterns = globs
            .iter()
            .map(|glob| RunIdPattern::compile(source_id, glob))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source_id: source_id.to_string(),
            frequency,
            tolerance_hours,
            alert_after_hours,
            is_critical,
            patterns,
        })
    }

    pub fn patterns(&self) -> &[RunIdPattern] {
        &self.patterns
    }

    /// Whether runs recorded under `run_source_id` belong to this source.
    pub fn matches_run_id(&self, run_source_id: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(run_source_id))
    }

    /// Store filter selecting this source's runs.
    pub fn source_filter(&self) -> SourceFilter {
        SourceFilter::from_like_patterns(
            self.patterns
                .iter()
                .map(|p| p.like_pattern().to_string())
                .collect(),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExpectationsFile {
    #[serde(default)]
    sources: Vec<ExpectationEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExpectationEntry {
    source_id: String,
    frequency: Frequency,
    tolerance_hours: f64,
    alert_after_hours: f64,
    #[serde(default)]
    is_critical: bool,
    run_id_patterns: Option<Vec<String>>,
}

/// The validated set of expectations, in file order.
#[derive(Debug, Clone, Default)]
pub struct ExpectationSet {
    sources: Vec<SourceExpectation>,
}

impl ExpectationSet {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read expectations file: {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid expectations file: {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ExpectationsFile =
            toml::from_str(content).context("Failed to parse expectations TOML")?;
        if file.sources.is_empty() {
            return Err(ExpectationError::Empty.into());
        }
        let sources = file
            .sources
            .into_iter()
            .map(|entry| {
                SourceExpectation::with_patterns(
                    &entry.source_id,
                    entry.frequency,
                    entry.tolerance_hours,
                    entry.alert_after_hours,
                    entry.is_critical,
                    entry.run_id_patterns.as_deref(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(sources)?)
    }

    /// Builds a set from already validated expectations, rejecting duplicate
    /// ids. An empty set is allowed here; only files must be non-empty.
    pub fn new(sources: Vec<SourceExpectation>) -> Result<Self, ExpectationError> {
        let mut seen = HashSet::new();
        for source in &sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(ExpectationError::DuplicateSource(source.source_id.clone()));
            }
        }
        Ok(Self { sources })
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceExpectation> {
        self.sources.iter()
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceExpectation> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    /// Expectations whose run id patterns match `run_source_id`.
    pub fn matching<'a>(
        &'a self,
        run_source_id: &'a str,
    ) -> impl Iterator<Item = &'a SourceExpectation> + 'a {
        self.sources
            .iter()
            .filter(move |s| s.matches_run_id(run_source_id))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        [[sources]]
        source_id = "fr_delta"
        frequency = "daily"
        tolerance_hours = 6
        alert_after_hours = 24
        is_critical = true

        [[sources]]
        source_id = "gao_reports"
        frequency = "weekly"
        tolerance_hours = 170.0
        alert_after_hours = 48.0
        run_id_patterns = ["gao_*", "oversight_gao"]
    "#;

    fn error_of(content: &str) -> ExpectationError {
        let err = ExpectationSet::from_toml_str(content).unwrap_err();
        err.downcast_ref::<ExpectationError>()
            .cloned()
            .unwrap_or_else(|| panic!("unexpected error: {:#}", err))
    }

    #[test]
    fn test_load_valid_file() {
        let set = ExpectationSet::from_toml_str(VALID).unwrap();
        assert_eq!(set.len(), 2);

        let fr = set.get("fr_delta").unwrap();
        assert_eq!(fr.frequency, Frequency::Daily);
        assert!(fr.is_critical);
        assert_eq!(fr.tolerance_hours, 6.0);

        let gao = set.get("gao_reports").unwrap();
        assert!(!gao.is_critical);
        assert_eq!(gao.patterns().len(), 2);
    }

    #[test]
    fn test_default_patterns_match_sub_sources_only() {
        let set = ExpectationSet::from_toml_str(VALID).unwrap();
        let fr = set.get("fr_delta").unwrap();

        assert!(fr.matches_run_id("fr_delta"));
        assert!(fr.matches_run_id("fr_delta_title38"));
        assert!(!fr.matches_run_id("old_fr_delta"));
        assert!(!fr.matches_run_id("fr_deltas"));

        let matched: Vec<_> = set
            .matching("oversight_gao")
            .map(|s| s.source_id.as_str())
            .collect();
        assert_eq!(matched, vec!["gao_reports"]);
    }

    #[test]
    fn test_patterns_compile_to_escaped_like() {
        let pattern = RunIdPattern::compile("fr_delta", "fr_delta_*").unwrap();
        assert_eq!(pattern.like_pattern(), "fr\\_delta\\_%");

        let exact = RunIdPattern::compile("a.b", "a.b").unwrap();
        assert!(exact.matches("a.b"));
        assert!(!exact.matches("aXb"));
    }

    #[test]
    fn test_empty_file_is_rejected() {
        assert_eq!(error_of(""), ExpectationError::Empty);
        assert_eq!(error_of("sources = []"), ExpectationError::Empty);
    }

    #[test]
    fn test_duplicate_source_is_rejected() {
        let content = r#"
            [[sources]]
            source_id = "a"
            frequency = "daily"
            tolerance_hours = 1
            alert_after_hours = 1

            [[sources]]
            source_id = "a"
            frequency = "weekly"
            tolerance_hours = 1
            alert_after_hours = 1
        "#;
        assert_eq!(
            error_of(content),
            ExpectationError::DuplicateSource("a".to_string())
        );
    }

    #[test]
    fn test_negative_hours_are_rejected() {
        let content = r#"
            [[sources]]
            source_id = "a"
            frequency = "daily"
            tolerance_hours = -1
            alert_after_hours = 1
        "#;
        assert!(matches!(
            error_of(content),
            ExpectationError::InvalidHours {
                field: "tolerance_hours",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_patterns_are_rejected() {
        for patterns in [r#"[]"#, r#"["*"]"#, r#"["a b"]"#] {
            let content = format!(
                r#"
                [[sources]]
                source_id = "a"
                frequency = "daily"
                tolerance_hours = 1
                alert_after_hours = 1
                run_id_patterns = {}
                "#,
                patterns
            );
            assert!(matches!(
                error_of(&content),
                ExpectationError::InvalidPattern { .. }
            ));
        }
    }

    #[test]
    fn test_unknown_fields_and_bad_frequency_fail_parsing() {
        let unknown = r#"
            [[sources]]
            source_id = "a"
            frequency = "daily"
            tolerance_hours = 1
            alert_after_hours = 1
            tolerence_hours = 3
        "#;
        assert!(ExpectationSet::from_toml_str(unknown).is_err());

        let bad_frequency = r#"
            [[sources]]
            source_id = "a"
            frequency = "hourly"
            tolerance_hours = 1
            alert_after_hours = 1
        "#;
        assert!(ExpectationSet::from_toml_str(bad_frequency).is_err());
    }

    #[test]
    fn test_invalid_source_id() {
        assert_eq!(
            SourceExpectation::new("fr*", Frequency::Daily, 1.0, 1.0, false).unwrap_err(),
            ExpectationError::InvalidSourceId("fr*".to_string())
        );
    }

    #[test]
    fn test_example_expectations_load() {
        let set =
            ExpectationSet::from_toml_str(include_str!("../config/expectations.example.toml"))
                .unwrap();
        assert_eq!(set.len(), 3);
        let congress: Vec<_> = set.matching("congress_api_votes").collect();
        assert_eq!(congress.len(), 1);
        assert_eq!(congress[0].source_id, "congress_bills");
        assert!(set.get("fr_delta").unwrap().is_critical);
    }
}
