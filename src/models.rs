use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type RecordId = i64;

/// One student in the canonical set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub id: RecordId,
    pub student_code: String,
    pub cohort: String,
    pub full_name: String,
    #[serde(default)]
    pub institution: String,
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub district: String,
    #[serde(default)]
    pub contact_number: String,
    #[serde(default)]
    pub current_year: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    pub last_updated: DateTime<Utc>,
}

impl StudentRecord {
    /// Field lookup used by filters: named columns first, then the attribute map.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.to_string()),
            "studentCode" => Some(self.student_code.clone()),
            "cohort" => Some(self.cohort.clone()),
            "fullName" => Some(self.full_name.clone()),
            "institution" => Some(self.institution.clone()),
            "program" => Some(self.program.clone()),
            "district" => Some(self.district.clone()),
            "contactNumber" => Some(self.contact_number.clone()),
            "currentYear" => Some(self.current_year.clone()),
            other => self.attributes.get(other).and_then(value_as_text),
        }
    }

    pub fn apply_patch(&mut self, patch: RecordPatch, now: DateTime<Utc>) {
        if let Some(cohort) = patch.cohort {
            self.cohort = cohort;
        }
        if let Some(full_name) = patch.full_name {
            self.full_name = full_name;
        }
        if let Some(institution) = patch.institution {
            self.institution = institution;
        }
        if let Some(program) = patch.program {
            self.program = program;
        }
        if let Some(district) = patch.district {
            self.district = district;
        }
        if let Some(contact_number) = patch.contact_number {
            self.contact_number = contact_number;
        }
        if let Some(current_year) = patch.current_year {
            self.current_year = current_year;
        }
        if let Some(attributes) = patch.attributes {
            for (key, value) in attributes {
                if value.is_null() {
                    self.attributes.remove(&key);
                } else {
                    self.attributes.insert(key, value);
                }
            }
        }
        self.last_updated = now;
    }
}

pub fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        other => Some(other.to_string()),
    }
}

/// Partial record accepted by `insert`; id, code and timestamp are assigned by the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewRecord {
    pub cohort: Option<String>,
    pub full_name: String,
    pub institution: String,
    pub program: String,
    pub district: String,
    pub contact_number: String,
    pub current_year: String,
    pub attributes: BTreeMap<String, Value>,
}

/// Mutable fields only. Unknown keys such as `id` or `studentCode` are ignored on deserialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordPatch {
    pub cohort: Option<String>,
    pub full_name: Option<String>,
    pub institution: Option<String>,
    pub program: Option<String>,
    pub district: Option<String>,
    pub contact_number: Option<String>,
    pub current_year: Option<String>,
    pub attributes: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EventType {
    #[default]
    Workshop,
    Seminar,
    Conference,
    Volunteer,
    Competition,
    Training,
    Other,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workshop => "Workshop",
            Self::Seminar => "Seminar",
            Self::Conference => "Conference",
            Self::Volunteer => "Volunteer",
            Self::Competition => "Competition",
            Self::Training => "Training",
            Self::Other => "Other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Workshop" => Some(Self::Workshop),
            "Seminar" => Some(Self::Seminar),
            "Conference" => Some(Self::Conference),
            "Volunteer" => Some(Self::Volunteer),
            "Competition" => Some(Self::Competition),
            "Training" => Some(Self::Training),
            "Other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ParticipationRole {
    #[default]
    Participant,
    Organizer,
    Volunteer,
    Speaker,
    Facilitator,
}

impl ParticipationRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Participant => "Participant",
            Self::Organizer => "Organizer",
            Self::Volunteer => "Volunteer",
            Self::Speaker => "Speaker",
            Self::Facilitator => "Facilitator",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Participant" => Some(Self::Participant),
            "Organizer" => Some(Self::Organizer),
            "Volunteer" => Some(Self::Volunteer),
            "Speaker" => Some(Self::Speaker),
            "Facilitator" => Some(Self::Facilitator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participation {
    pub participation_id: i64,
    pub student_id: RecordId,
    pub event_name: String,
    pub event_date: Option<NaiveDate>,
    pub event_type: EventType,
    pub role: ParticipationRole,
    pub hours: f64,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewParticipation {
    pub student_id: RecordId,
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub event_date: Option<NaiveDate>,
    #[serde(default)]
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub role: Option<ParticipationRole>,
    #[serde(default)]
    pub hours: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParticipationPatch {
    pub event_name: Option<String>,
    pub event_date: Option<NaiveDate>,
    pub event_type: Option<EventType>,
    pub role: Option<ParticipationRole>,
    pub hours: Option<f64>,
    pub notes: Option<String>,
}

impl Participation {
    pub fn apply_patch(&mut self, patch: ParticipationPatch, now: DateTime<Utc>) {
        if let Some(event_name) = patch.event_name {
            self.event_name = event_name;
        }
        if let Some(event_date) = patch.event_date {
            self.event_date = Some(event_date);
        }
        if let Some(event_type) = patch.event_type {
            self.event_type = event_type;
        }
        if let Some(role) = patch.role {
            self.role = role;
        }
        if let Some(hours) = patch.hours {
            self.hours = hours;
        }
        if let Some(notes) = patch.notes {
            self.notes = if notes.is_empty() { None } else { Some(notes) };
        }
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionState {
    Unknown,
    Provisioned,
    Populated,
}

impl PartitionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Provisioned => "provisioned",
            Self::Populated => "populated",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "provisioned" => Self::Provisioned,
            "populated" => Self::Populated,
            _ => Self::Unknown,
        }
    }
}

/// Persisted entry of the partition registry, keyed by the normalized cohort key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDescriptor {
    pub key: String,
    pub label: String,
    pub table: String,
    pub state: PartitionState,
    pub created_at: DateTime<Utc>,
    pub populated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
    pub search: Option<String>,
    pub filters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialSummary {
    pub total_fees: f64,
    pub total_scholarship: f64,
    pub total_paid: f64,
    pub total_due: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_students: usize,
    pub total_cohorts: usize,
    pub by_district: BTreeMap<String, usize>,
    pub by_institution: BTreeMap<String, usize>,
    pub by_program: BTreeMap<String, usize>,
    pub by_year: BTreeMap<String, usize>,
    pub by_cohort: BTreeMap<String, usize>,
    pub financial_summary: FinancialSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionCount {
    pub cohort: String,
    pub partition_rows: usize,
    pub canonical_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMismatch {
    pub cohort: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStatus {
    pub persisted: i64,
    pub max_id: i64,
    pub drift: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub canonical_total: usize,
    pub partitions: Vec<PartitionCount>,
    pub mismatches: Vec<PartitionMismatch>,
    pub sequence: SequenceStatus,
}

impl VerificationReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && !self.sequence.drift
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionBackfill {
    pub cohort: String,
    pub rows_inserted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub records_touched: usize,
    pub dropped_partitions: Vec<String>,
    pub provisioned_partitions: Vec<PartitionBackfill>,
    pub verification: VerificationReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub cohort: String,
    pub total: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub inserted_ids: Vec<RecordId>,
    pub errors: Vec<String>,
    pub verification: VerificationReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRepair {
    pub previous: i64,
    pub current: i64,
    pub next_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub total_students: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BooleanResponse {
    pub success: bool,
}

/// Result envelope handed to the presentation layer. `success == false` always carries `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StudentRecord {
        StudentRecord {
            id: 7,
            student_code: "UGO_C1_7".to_string(),
            cohort: "C1".to_string(),
            full_name: "Asha Rai".to_string(),
            institution: "Tribhuvan".to_string(),
            program: "BSc".to_string(),
            district: "Kaski".to_string(),
            contact_number: String::new(),
            current_year: "2".to_string(),
            attributes: BTreeMap::from([("scholarshipType".to_string(), serde_json::json!("Full"))]),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn patch_ignores_identity_keys() {
        let patch: RecordPatch = serde_json::from_value(serde_json::json!({
            "id": 99,
            "studentCode": "UGO_C9_99",
            "district": "Lalitpur"
        }))
        .expect("patch");
        let mut record = sample();
        record.apply_patch(patch, Utc::now());
        assert_eq!(record.id, 7);
        assert_eq!(record.student_code, "UGO_C1_7");
        assert_eq!(record.district, "Lalitpur");
    }

    #[test]
    fn null_attribute_in_patch_removes_key() {
        let mut record = sample();
        record.apply_patch(
            RecordPatch {
                attributes: Some(BTreeMap::from([
                    ("scholarshipType".to_string(), Value::Null),
                    ("totalDue".to_string(), serde_json::json!(1200)),
                ])),
                ..RecordPatch::default()
            },
            Utc::now(),
        );
        assert!(!record.attributes.contains_key("scholarshipType"));
        assert_eq!(record.field("totalDue").as_deref(), Some("1200"));
    }

    #[test]
    fn failure_envelope_always_has_error() {
        let envelope: Envelope<()> = Envelope::failure(crate::errors::AppError::NotFound("Student 4".to_string()));
        assert!(!envelope.success);
        assert_eq!(envelope.error.as_deref(), Some("NOT_FOUND: Student 4"));
    }
}
