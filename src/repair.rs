use crate::allocator::IdSequence;
use crate::cohort::{is_valid_partition_name, natural_cmp, partition_key, CohortLabel, PARTITION_PREFIX};
use crate::errors::AppResult;
use crate::models::{
    PartitionBackfill, PartitionCount, PartitionMismatch, PartitionState, RepairReport, StudentRecord,
    VerificationReport,
};
use crate::partition::PartitionManager;
use crate::store::Backend;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

/// Ordered, idempotent consistency pass. Assumes exclusive access to the store for its whole run.
pub struct ConsistencyRepair<'a, S: Backend + ?Sized> {
    store: &'a S,
    default_cohort: CohortLabel,
}

impl<'a, S: Backend + ?Sized> ConsistencyRepair<'a, S> {
    pub fn new(store: &'a S, default_cohort: CohortLabel) -> Self {
        Self { store, default_cohort }
    }

    pub fn run(&self) -> AppResult<RepairReport> {
        let records_touched = self.normalize_cohorts()?;
        tracing::info!(step = "normalize", records_touched, "repair step finished");

        let dropped_partitions = self.drop_invalid_partitions()?;
        tracing::info!(step = "drop-invalid", dropped = dropped_partitions.len(), "repair step finished");

        let provisioned_partitions = self.provision_partitions()?;
        tracing::info!(step = "provision", provisioned = provisioned_partitions.len(), "repair step finished");

        let verification = verify(self.store)?;
        if verification.is_consistent() {
            tracing::info!(step = "verify", total = verification.canonical_total, "registry consistent");
        } else {
            tracing::warn!(
                step = "verify",
                mismatches = verification.mismatches.len(),
                drift = verification.sequence.drift,
                "registry inconsistent after repair"
            );
        }

        Ok(RepairReport {
            records_touched,
            dropped_partitions,
            provisioned_partitions,
            verification,
        })
    }

    /// Blank cohorts take the configured default.
    fn normalize_cohorts(&self) -> AppResult<usize> {
        let manager = PartitionManager::new(self.store);
        let mut touched = 0usize;
        for mut record in self.store.list()? {
            if !record.cohort.trim().is_empty() {
                continue;
            }
            let previous = std::mem::replace(&mut record.cohort, self.default_cohort.as_str().to_string());
            record.last_updated = Utc::now();
            manager.update(&record, &previous)?;
            touched += 1;
        }
        Ok(touched)
    }

    fn drop_invalid_partitions(&self) -> AppResult<Vec<String>> {
        let manager = PartitionManager::new(self.store);
        let mut dropped = Vec::new();
        for table in self.store.partition_tables()? {
            if is_valid_partition_name(&table) {
                continue;
            }
            if manager.drop_table(&table)? {
                dropped.push(table);
            }
        }
        Ok(dropped)
    }

    fn provision_partitions(&self) -> AppResult<Vec<PartitionBackfill>> {
        let manager = PartitionManager::new(self.store);
        let canonical = self.store.list()?;

        let mut labels: BTreeMap<String, CohortLabel> = BTreeMap::new();
        for record in &canonical {
            if let Ok(label) = CohortLabel::parse(&record.cohort) {
                labels.entry(label.key()).or_insert(label);
            }
        }
        let mut labels: Vec<CohortLabel> = labels.into_values().collect();
        labels.sort_by(|a, b| natural_cmp(a.as_str(), b.as_str()));

        let mut provisioned = Vec::new();
        for label in labels {
            if manager.state(&label)? == PartitionState::Populated {
                tracing::debug!(cohort = %label, "partition already populated");
                continue;
            }
            let rows_inserted = manager.backfill_from(&label, &canonical)?;
            provisioned.push(PartitionBackfill {
                cohort: label.as_str().to_string(),
                rows_inserted,
            });
        }
        Ok(provisioned)
    }
}

/// Compares every partition against the canonical set. Reports; never fixes.
pub fn verify<S: Backend + ?Sized>(store: &S) -> AppResult<VerificationReport> {
    let canonical = store.list()?;
    let tables = store.partition_tables()?;
    let mut mismatches = Vec::new();

    let mut groups: BTreeMap<String, (String, Vec<&StudentRecord>)> = BTreeMap::new();
    let mut blank = 0usize;
    let mut malformed = Vec::new();
    for record in &canonical {
        match partition_key(&record.cohort) {
            Some(key) => groups
                .entry(key)
                .or_insert_with(|| (record.cohort.trim().to_string(), Vec::new()))
                .1
                .push(record),
            None if record.cohort.trim().is_empty() => blank += 1,
            None => malformed.push(record.id),
        }
    }
    if blank > 0 {
        mismatches.push(PartitionMismatch {
            cohort: String::new(),
            detail: format!("{} records have no cohort", blank),
        });
    }
    if !malformed.is_empty() {
        mismatches.push(PartitionMismatch {
            cohort: String::new(),
            detail: format!("records {:?} carry malformed cohort labels", malformed),
        });
    }

    let mut keys: BTreeSet<String> = groups.keys().cloned().collect();
    for table in &tables {
        if is_valid_partition_name(table) {
            if let Some(key) = table.strip_prefix(PARTITION_PREFIX) {
                keys.insert(key.to_string());
            }
        } else {
            mismatches.push(PartitionMismatch {
                cohort: table.clone(),
                detail: "partition name is not a valid cohort key".to_string(),
            });
        }
    }

    let mut partitions = Vec::new();
    for key in keys {
        let table = format!("{}{}", PARTITION_PREFIX, key);
        let (label, members) = match groups.get(&key) {
            Some((label, members)) => (label.clone(), members.as_slice()),
            None => (key.clone(), &[][..]),
        };

        if !tables.contains(&table) {
            mismatches.push(PartitionMismatch {
                cohort: label.clone(),
                detail: format!("partition {} is missing", table),
            });
            partitions.push(PartitionCount {
                cohort: label,
                partition_rows: 0,
                canonical_rows: members.len(),
            });
            continue;
        }

        let rows = store.partition_rows(&table)?;
        let by_id: BTreeMap<i64, &StudentRecord> = members.iter().map(|record| (record.id, *record)).collect();
        let row_ids: BTreeSet<i64> = rows.iter().map(|row| row.id).collect();

        if rows.len() != members.len() {
            mismatches.push(PartitionMismatch {
                cohort: label.clone(),
                detail: format!("partition holds {} rows, canonical set holds {}", rows.len(), members.len()),
            });
        }
        let missing: Vec<i64> = by_id.keys().filter(|id| !row_ids.contains(*id)).copied().collect();
        if !missing.is_empty() {
            mismatches.push(PartitionMismatch {
                cohort: label.clone(),
                detail: format!("ids {:?} missing from partition", missing),
            });
        }
        let foreign: Vec<i64> = row_ids.iter().filter(|id| !by_id.contains_key(*id)).copied().collect();
        if !foreign.is_empty() {
            mismatches.push(PartitionMismatch {
                cohort: label.clone(),
                detail: format!("ids {:?} do not belong to this cohort", foreign),
            });
        }
        let stale = rows
            .iter()
            .filter(|row| by_id.get(&row.id).is_some_and(|canonical| *canonical != *row))
            .count();
        if stale > 0 {
            mismatches.push(PartitionMismatch {
                cohort: label.clone(),
                detail: format!("{} rows differ from their canonical record", stale),
            });
        }

        partitions.push(PartitionCount {
            cohort: label,
            partition_rows: rows.len(),
            canonical_rows: members.len(),
        });
    }
    partitions.sort_by(|a, b| natural_cmp(&a.cohort, &b.cohort));

    let max_id = canonical.iter().map(|record| record.id).max().unwrap_or(0);
    let sequence = IdSequence::new(store.load_sequence()?).status(max_id);

    Ok(VerificationReport {
        canonical_total: canonical.len(),
        partitions,
        mismatches,
        sequence,
    })
}
