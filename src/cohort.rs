use crate::errors::{AppError, AppResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

pub const PARTITION_PREFIX: &str = "cohort_";
const MAX_LABEL_CHARS: usize = 32;

static LABEL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid cohort label regex"));
static STRICT_LABEL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^C[0-9]+$").expect("valid strict cohort regex"));
static NATURAL_PARTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\D*)(\d*)(.*)$").expect("valid natural order regex"));

/// A validated cohort label. Case is preserved; partition naming goes through [`CohortLabel::key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CohortLabel(String);

impl CohortLabel {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("Cohort label cannot be empty".to_string()));
        }
        if trimmed.chars().count() > MAX_LABEL_CHARS {
            return Err(AppError::Validation(format!(
                "Cohort label '{}' exceeds {} characters",
                trimmed, MAX_LABEL_CHARS
            )));
        }
        if !LABEL_PATTERN.is_match(trimmed) {
            return Err(AppError::Validation(format!(
                "Invalid cohort label '{}': only letters, digits and '_' are allowed",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The `C<number>` format required when an operator creates a cohort by hand.
    pub fn parse_strict(raw: &str) -> AppResult<Self> {
        let label = Self::parse(raw)?;
        if !STRICT_LABEL_PATTERN.is_match(label.as_str()) {
            return Err(AppError::Validation(
                "Invalid cohort name. Must be in format C1, C2, C3, etc.".to_string(),
            ));
        }
        Ok(label)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn key(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    pub fn table_name(&self) -> String {
        format!("{}{}", PARTITION_PREFIX, self.key())
    }
}

impl fmt::Display for CohortLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partition key for a raw record cohort, or `None` when the label is blank or malformed.
pub fn partition_key(raw: &str) -> Option<String> {
    CohortLabel::parse(raw).ok().map(|label| label.key())
}

/// Whether a physical partition name (`cohort_<key>`) carries a key a valid label could produce.
pub fn is_valid_partition_name(table: &str) -> bool {
    match table.strip_prefix(PARTITION_PREFIX) {
        Some(key) => {
            !key.is_empty()
                && key.chars().count() <= MAX_LABEL_CHARS
                && LABEL_PATTERN.is_match(key)
                && key == key.to_ascii_lowercase()
        }
        None => false,
    }
}

/// Orders `C2` before `C10`; falls back to plain string order for the remainder.
pub fn natural_cmp(left: &str, right: &str) -> Ordering {
    let split = |value: &str| -> (String, Option<u64>, String) {
        match NATURAL_PARTS.captures(value) {
            Some(caps) => (
                caps[1].to_ascii_lowercase(),
                caps[2].parse::<u64>().ok(),
                caps[3].to_string(),
            ),
            None => (value.to_ascii_lowercase(), None, String::new()),
        }
    };
    let (left_prefix, left_number, left_rest) = split(left);
    let (right_prefix, right_number, right_rest) = split(right);
    left_prefix
        .cmp(&right_prefix)
        .then_with(|| left_number.cmp(&right_number))
        .then_with(|| left_rest.cmp(&right_rest))
        .then_with(|| left.cmp(right))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_trimmed_and_case_preserved() {
        let label = CohortLabel::parse("  c1 ").expect("label");
        assert_eq!(label.as_str(), "c1");
        assert_eq!(label.key(), "c1");
        assert_eq!(label.table_name(), "cohort_c1");
        assert_eq!(
            CohortLabel::parse("C1").expect("label").table_name(),
            label.table_name()
        );
    }

    #[test]
    fn blank_and_malformed_labels_are_rejected() {
        assert!(matches!(CohortLabel::parse(""), Err(AppError::Validation(_))));
        assert!(matches!(CohortLabel::parse("   "), Err(AppError::Validation(_))));
        assert!(CohortLabel::parse("C1; DROP TABLE students").is_err());
        assert!(CohortLabel::parse(&"C".repeat(40)).is_err());
        assert!(partition_key("").is_none());
    }

    #[test]
    fn strict_format_requires_c_number() {
        assert!(CohortLabel::parse_strict("C12").is_ok());
        assert!(CohortLabel::parse_strict("c12").is_err());
        assert!(CohortLabel::parse_strict("Spring").is_err());
    }

    #[test]
    fn partition_names_are_validated() {
        assert!(is_valid_partition_name("cohort_c1"));
        assert!(!is_valid_partition_name("cohort_"));
        assert!(!is_valid_partition_name("cohort_C1"));
        assert!(!is_valid_partition_name("cohort_c 1"));
        assert!(!is_valid_partition_name("students"));
    }

    #[test]
    fn natural_order_sorts_numeric_suffixes() {
        let mut labels = vec!["C10", "C2", "C1", "C11"];
        labels.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(labels, vec!["C1", "C2", "C10", "C11"]);
    }
}
