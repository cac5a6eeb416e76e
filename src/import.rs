use crate::cohort::CohortLabel;
use crate::errors::{AppError, AppResult};
use crate::models::{value_as_text, NewRecord, StudentRecord};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

/// One spreadsheet row: header text to cell value.
pub type ImportRow = BTreeMap<String, Value>;

const NUMERIC_SUFFIXES: [&str; 6] = ["Fee", "Payment", "Due", "Amount", "Total", "Paid"];

#[derive(Debug, Clone)]
pub enum RowOutcome {
    Insert(NewRecord),
    Skip(String),
}

/// Tracks `(name, cohort)` pairs already present, including rows inserted earlier in the batch.
#[derive(Debug, Default)]
pub struct DuplicateIndex {
    seen: HashSet<(String, String)>,
}

impl DuplicateIndex {
    pub fn from_records(records: &[StudentRecord]) -> Self {
        let mut index = Self::default();
        for record in records {
            index.remember(&record.full_name, &record.cohort);
        }
        index
    }

    pub fn remember(&mut self, full_name: &str, cohort: &str) {
        self.seen.insert(Self::key(full_name, cohort));
    }

    pub fn contains(&self, full_name: &str, cohort: &str) -> bool {
        self.seen.contains(&Self::key(full_name, cohort))
    }

    fn key(full_name: &str, cohort: &str) -> (String, String) {
        (full_name.trim().to_string(), cohort.trim().to_ascii_lowercase())
    }
}

pub fn read_rows(path: &Path) -> AppResult<Vec<ImportRow>> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|error| {
        AppError::Validation(format!(
            "Import file {} must be a JSON array of row objects: {}",
            path.display(),
            error
        ))
    })
}

pub fn classify(row: &ImportRow, cohort: &CohortLabel, duplicates: &DuplicateIndex) -> RowOutcome {
    let record = normalize_row(row, cohort);
    if record.full_name.is_empty() {
        return RowOutcome::Skip("no name".to_string());
    }
    if duplicates.contains(&record.full_name, cohort.as_str()) {
        return RowOutcome::Skip(format!("duplicate of '{}' in {}", record.full_name, cohort));
    }
    RowOutcome::Insert(record)
}

/// Maps header aliases onto record fields; every other non-empty cell lands in `attributes`.
pub fn normalize_row(row: &ImportRow, cohort: &CohortLabel) -> NewRecord {
    let mut record = NewRecord {
        cohort: Some(cohort.as_str().to_string()),
        ..NewRecord::default()
    };

    for (header, value) in row {
        let Some(text) = value_as_text(value).map(|text| text.trim().to_string()) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }
        match compact(header).as_str() {
            "fullname" | "name" | "studentname" => record.full_name = text,
            "college" | "institution" | "collegename" => record.institution = text,
            "program" | "programme" => record.program = text,
            "district" => record.district = text,
            "contactnumber" | "contact" | "phone" => record.contact_number = text,
            "currentyear" | "year" => record.current_year = text,
            // The batch cohort wins; identity is assigned by the registry.
            "cohort" | "id" | "studentid" | "studentcode" => {}
            _ => {
                let key = camel_case(header);
                if key.is_empty() {
                    continue;
                }
                let value = numeric_cell(&key, value, &text);
                record.attributes.insert(key, value);
            }
        }
    }
    record
}

fn compact(header: &str) -> String {
    header
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

/// `"Total College Fee"`, `"Total_College_Fee"` and `"total_college_fee"` all become `totalCollegeFee`.
fn camel_case(header: &str) -> String {
    let words: Vec<String> = header
        .split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '\'')
        .map(|word| word.replace('\'', ""))
        .filter(|word| !word.is_empty())
        .collect();

    let mut key = String::new();
    for (index, word) in words.iter().enumerate() {
        let lower = word.to_ascii_lowercase();
        if index == 0 {
            key.push_str(&lower);
            continue;
        }
        let mut chars = lower.chars();
        if let Some(first) = chars.next() {
            key.push(first.to_ascii_uppercase());
            key.extend(chars);
        }
    }
    key
}

fn numeric_cell(key: &str, original: &Value, text: &str) -> Value {
    if original.is_number() || !NUMERIC_SUFFIXES.iter().any(|suffix| key.ends_with(suffix)) {
        return original.clone();
    }
    match text.replace(',', "").parse::<f64>() {
        Ok(number) => serde_json::Number::from_f64(number).map_or_else(|| original.clone(), Value::Number),
        Err(_) => original.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> ImportRow {
        pairs.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
    }

    fn c2() -> CohortLabel {
        CohortLabel::parse("C2").expect("label")
    }

    #[test]
    fn header_aliases_map_to_fields() {
        let record = normalize_row(
            &row(&[
                ("Full Name", json!("  Asha Rai ")),
                ("College", json!("Prithvi Narayan Campus")),
                ("Current_Year", json!(2)),
                ("Contact Number", json!("9800000001")),
                ("Cohort", json!("C9")),
            ]),
            &c2(),
        );
        assert_eq!(record.full_name, "Asha Rai");
        assert_eq!(record.institution, "Prithvi Narayan Campus");
        assert_eq!(record.current_year, "2");
        assert_eq!(record.contact_number, "9800000001");
        assert_eq!(record.cohort.as_deref(), Some("C2"));
        assert!(record.attributes.is_empty());
    }

    #[test]
    fn other_headers_become_camel_case_attributes() {
        let record = normalize_row(
            &row(&[
                ("full_name", json!("Bikash")),
                ("Total College Fee", json!("1,200.50")),
                ("Father's Name", json!("Hari")),
                ("Scholarship Status", json!("")),
            ]),
            &c2(),
        );
        assert_eq!(record.attributes.get("totalCollegeFee"), Some(&json!(1200.5)));
        assert_eq!(record.attributes.get("fathersName"), Some(&json!("Hari")));
        assert!(!record.attributes.contains_key("scholarshipStatus"));
    }

    #[test]
    fn nameless_and_duplicate_rows_are_skipped() {
        let mut duplicates = DuplicateIndex::default();
        duplicates.remember("Asha Rai", "c2");

        assert!(matches!(
            classify(&row(&[("District", json!("Kaski"))]), &c2(), &duplicates),
            RowOutcome::Skip(_)
        ));
        assert!(matches!(
            classify(&row(&[("Full_Name", json!("Asha Rai"))]), &c2(), &duplicates),
            RowOutcome::Skip(_)
        ));
        assert!(matches!(
            classify(&row(&[("Full_Name", json!("Gita Lama"))]), &c2(), &duplicates),
            RowOutcome::Insert(_)
        ));
    }
}
