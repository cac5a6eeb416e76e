use crate::errors::{AppError, AppResult};
use crate::models::{RecordId, SequenceRepair, SequenceStatus, StudentRecord};

/// `max(id) + 1` over a snapshot, `1` for an empty one. Pure: the same snapshot always yields the same id.
pub fn next_id(records: &[StudentRecord]) -> RecordId {
    next_id_after(records.iter().map(|record| record.id).max())
}

pub fn next_id_after(max_id: Option<RecordId>) -> RecordId {
    max_id.unwrap_or(0).max(0) + 1
}

pub fn student_code(org_prefix: &str, cohort: &str, id: RecordId) -> String {
    format!("{}_{}_{}", org_prefix, cohort, id)
}

/// Persisted "last assigned id" counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSequence {
    last_assigned: RecordId,
}

impl IdSequence {
    pub fn new(last_assigned: RecordId) -> Self {
        Self {
            last_assigned: last_assigned.max(0),
        }
    }

    pub fn last_assigned(&self) -> RecordId {
        self.last_assigned
    }

    pub fn next_id(&self) -> RecordId {
        self.last_assigned + 1
    }

    pub fn status(&self, max_id: RecordId) -> SequenceStatus {
        SequenceStatus {
            persisted: self.last_assigned,
            max_id,
            drift: self.last_assigned < max_id,
        }
    }

    pub fn check(&self, max_id: RecordId) -> AppResult<()> {
        if self.last_assigned < max_id {
            return Err(AppError::SequenceDrift {
                persisted: self.last_assigned,
                max_id,
            });
        }
        Ok(())
    }

    /// Hands out the next id. Fails with `SequenceDrift` instead of producing a duplicate key.
    pub fn allocate(&mut self, max_id: RecordId) -> AppResult<RecordId> {
        self.check(max_id)?;
        self.last_assigned += 1;
        Ok(self.last_assigned)
    }

    /// Resets the counter so that the next allocation yields `current_max + 1`.
    pub fn repair(&mut self, current_max: RecordId) -> SequenceRepair {
        let previous = self.last_assigned;
        self.last_assigned = current_max.max(0);
        SequenceRepair {
            previous,
            current: self.last_assigned,
            next_id: self.next_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(id: RecordId) -> StudentRecord {
        StudentRecord {
            id,
            student_code: student_code("UGO", "C1", id),
            cohort: "C1".to_string(),
            full_name: format!("Student {}", id),
            institution: String::new(),
            program: String::new(),
            district: String::new(),
            contact_number: String::new(),
            current_year: String::new(),
            attributes: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn next_id_on_empty_set_is_one() {
        assert_eq!(next_id(&[]), 1);
        assert_eq!(student_code("UGO", "C1", 1), "UGO_C1_1");
    }

    #[test]
    fn next_id_exceeds_every_id_and_is_stable() {
        let records = vec![record(3), record(11), record(7)];
        let first = next_id(&records);
        assert!(records.iter().all(|existing| first > existing.id));
        assert_eq!(first, 12);
        assert_eq!(next_id(&records), first);
    }

    #[test]
    fn drifted_sequence_refuses_to_allocate_until_repaired() {
        let mut sequence = IdSequence::new(270);
        assert!(sequence.status(273).drift);
        assert!(matches!(
            sequence.allocate(273),
            Err(AppError::SequenceDrift {
                persisted: 270,
                max_id: 273
            })
        ));

        let repair = sequence.repair(273);
        assert_eq!(repair.previous, 270);
        assert_eq!(repair.next_id, 274);
        assert_eq!(sequence.next_id(), 274);
        assert_eq!(sequence.allocate(273).expect("allocate"), 274);
    }

    #[test]
    fn peeking_does_not_advance() {
        let sequence = IdSequence::new(5);
        assert_eq!(sequence.next_id(), 6);
        assert_eq!(sequence.next_id(), 6);
    }
}
