use crate::cohort::partition_key;
use crate::models::{FinancialSummary, RegistryStats, StudentRecord};
use serde_json::Value;
use std::collections::BTreeMap;

const FEE_KEY: &str = "totalCollegeFee";
const SCHOLARSHIP_KEY: &str = "totalScholarshipAmount";
const PAID_KEY: &str = "totalAmountPaid";
const DUE_KEY: &str = "totalDue";

pub fn compute(records: &[StudentRecord]) -> RegistryStats {
    let mut stats = RegistryStats {
        total_students: records.len(),
        ..RegistryStats::default()
    };
    // Partition key -> (first label seen, count), so `C1` and `c1` land in one bucket.
    let mut cohorts: BTreeMap<String, (String, usize)> = BTreeMap::new();

    for record in records {
        bump(&mut stats.by_district, &record.district);
        bump(&mut stats.by_institution, &record.institution);
        bump(&mut stats.by_program, &record.program);
        bump(&mut stats.by_year, &record.current_year);
        let label = record.cohort.trim();
        if !label.is_empty() {
            let key = partition_key(label).unwrap_or_else(|| label.to_string());
            cohorts.entry(key).or_insert_with(|| (label.to_string(), 0)).1 += 1;
        }

        let summary = &mut stats.financial_summary;
        summary.total_fees += amount(record.attributes.get(FEE_KEY));
        summary.total_scholarship += amount(record.attributes.get(SCHOLARSHIP_KEY));
        summary.total_paid += amount(record.attributes.get(PAID_KEY));
        summary.total_due += amount(record.attributes.get(DUE_KEY));
    }
    stats.total_cohorts = cohorts.keys().filter(|key| partition_key(key).is_some()).count();
    stats.by_cohort = cohorts.into_values().collect();
    stats
}

fn bump(counts: &mut BTreeMap<String, usize>, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    *counts.entry(value.to_string()).or_insert(0) += 1;
}

/// Numeric attribute value; numeric strings such as `"1,500.50"` count, anything else is zero.
fn amount(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text.trim().replace(',', "").parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
}
