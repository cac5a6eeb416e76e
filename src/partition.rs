use crate::cohort::{partition_key, CohortLabel, PARTITION_PREFIX};
use crate::errors::AppResult;
use crate::models::{PartitionDescriptor, PartitionState, StudentRecord};
use crate::store::{Backend, WriteMode};
use chrono::Utc;

/// Drives the per-cohort `Unknown -> Provisioned -> Populated` lifecycle on top of a backend.
pub struct PartitionManager<'a, S: Backend + ?Sized> {
    store: &'a S,
}

impl<'a, S: Backend + ?Sized> PartitionManager<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn descriptor(&self, label: &CohortLabel) -> AppResult<Option<PartitionDescriptor>> {
        let key = label.key();
        Ok(self
            .store
            .list_descriptors()?
            .into_iter()
            .find(|descriptor| descriptor.key == key))
    }

    pub fn state(&self, label: &CohortLabel) -> AppResult<PartitionState> {
        if !self.store.partition_exists(&label.table_name())? {
            return Ok(PartitionState::Unknown);
        }
        Ok(match self.descriptor(label)? {
            Some(descriptor) => descriptor.state,
            None => PartitionState::Provisioned,
        })
    }

    /// Creates the partition when missing. Returns whether anything was created or registered.
    pub fn ensure_partition(&self, label: &CohortLabel) -> AppResult<bool> {
        let table = label.table_name();
        let existed = self.store.partition_exists(&table)?;
        let descriptor = self.descriptor(label)?;

        if existed && descriptor.is_some() {
            return Ok(false);
        }
        if !existed {
            self.store.create_partition(&table)?;
            tracing::info!(cohort = %label, table = %table, "partition created");
        }
        // A descriptor that outlived its table no longer describes any rows.
        self.store.save_descriptor(&PartitionDescriptor {
            key: label.key(),
            label: label.as_str().to_string(),
            table,
            state: PartitionState::Provisioned,
            created_at: descriptor.map_or_else(Utc::now, |existing| existing.created_at),
            populated_at: None,
        })?;
        Ok(true)
    }

    /// Copies every canonical record of the cohort into its partition, keyed on id.
    pub fn backfill(&self, label: &CohortLabel) -> AppResult<usize> {
        let canonical = self.store.list()?;
        self.backfill_from(label, &canonical)
    }

    pub fn backfill_from(&self, label: &CohortLabel, canonical: &[StudentRecord]) -> AppResult<usize> {
        self.ensure_partition(label)?;
        let key = label.key();
        let members: Vec<StudentRecord> = canonical
            .iter()
            .filter(|record| partition_key(&record.cohort).as_deref() == Some(key.as_str()))
            .cloned()
            .collect();

        let table = label.table_name();
        let inserted = self.store.backfill_partition(&table, &members)?;

        if let Some(descriptor) = self.descriptor(label)? {
            if descriptor.state != PartitionState::Populated {
                self.store.save_descriptor(&PartitionDescriptor {
                    state: PartitionState::Populated,
                    populated_at: Some(Utc::now()),
                    ..descriptor
                })?;
            }
        }
        tracing::info!(cohort = %label, table = %table, rows = inserted, members = members.len(), "partition backfilled");
        Ok(inserted)
    }

    /// Stores a new record and mirrors it into its cohort partition as one write.
    pub fn insert(&self, record: &StudentRecord) -> AppResult<()> {
        let mirror = self.prepare(record)?;
        self.store.write_mirrored(record, WriteMode::Insert, mirror.as_deref(), None)
    }

    /// Stores a changed record, refreshes its partition row and evicts it from the previous
    /// cohort's partition, all as one write.
    pub fn update(&self, record: &StudentRecord, previous_cohort: &str) -> AppResult<()> {
        let mirror = self.prepare(record)?;
        let evict = self.eviction_target(record, previous_cohort)?;
        self.store
            .write_mirrored(record, WriteMode::Update, mirror.as_deref(), evict.as_deref())?;
        if let Some(old_table) = evict {
            tracing::info!(id = record.id, from = %old_table, "record moved out of partition");
        }
        Ok(())
    }

    /// Provisions and populates the destination partition ahead of the record write.
    fn prepare(&self, record: &StudentRecord) -> AppResult<Option<String>> {
        let Ok(label) = CohortLabel::parse(&record.cohort) else {
            tracing::debug!(id = record.id, cohort = %record.cohort, "record has no partitionable cohort");
            return Ok(None);
        };
        if self.state(&label)? != PartitionState::Populated {
            self.backfill(&label)?;
        }
        Ok(Some(label.table_name()))
    }

    fn eviction_target(&self, record: &StudentRecord, previous_cohort: &str) -> AppResult<Option<String>> {
        let Some(previous_key) = partition_key(previous_cohort) else {
            return Ok(None);
        };
        if partition_key(&record.cohort).as_deref() == Some(previous_key.as_str()) {
            return Ok(None);
        }
        let old_table = format!("{}{}", PARTITION_PREFIX, previous_key);
        Ok(self.store.partition_exists(&old_table)?.then_some(old_table))
    }

    /// Removes a partition and its descriptor. No-op when absent.
    pub fn drop_partition(&self, label: &CohortLabel) -> AppResult<bool> {
        let dropped = self.drop_table(&label.table_name())?;
        self.store.remove_descriptor(&label.key())?;
        Ok(dropped)
    }

    /// Drops a physical partition by name, including names no valid label could produce.
    pub fn drop_table(&self, table: &str) -> AppResult<bool> {
        let dropped = self.store.drop_partition(table)?;
        for descriptor in self.store.list_descriptors()? {
            if descriptor.table == table {
                self.store.remove_descriptor(&descriptor.key)?;
            }
        }
        if dropped {
            tracing::info!(table = %table, "partition dropped");
        }
        Ok(dropped)
    }

}

#[cfg(test)]
mod tests {
    use super::PartitionManager;
    use crate::cohort::CohortLabel;
    use crate::models::PartitionState;
    use crate::store::contract::record;
    use crate::store::sqlite::SqliteStore;
    use crate::store::workbook::WorkbookStore;
    use crate::store::{Backend, PartitionStore, RecordStore};
    use std::time::Duration;

    fn label(raw: &str) -> CohortLabel {
        CohortLabel::parse(raw).expect("label")
    }

    fn lifecycle(store: &dyn Backend) {
        let manager = PartitionManager::new(store);
        let c1 = label("C1");
        assert_eq!(manager.state(&c1).expect("state"), PartitionState::Unknown);

        assert!(manager.ensure_partition(&c1).expect("ensure"));
        assert!(!manager.ensure_partition(&c1).expect("ensure twice"));
        assert_eq!(manager.state(&c1).expect("state"), PartitionState::Provisioned);

        for id in 1..=3 {
            store.insert(&record(id, if id == 3 { "c1" } else { "C1" }, "Student")).expect("insert");
        }
        store.insert(&record(4, "C2", "Other")).expect("insert");

        assert_eq!(manager.backfill(&c1).expect("backfill"), 3);
        assert_eq!(manager.backfill(&c1).expect("backfill again"), 0);
        assert_eq!(manager.state(&c1).expect("state"), PartitionState::Populated);
        assert_eq!(store.partition_rows("cohort_c1").expect("rows").len(), 3);
    }

    fn cohort_change(store: &dyn Backend) {
        let manager = PartitionManager::new(store);
        let mut moving = record(1, "C1", "Asha");
        manager.insert(&moving).expect("insert");
        assert_eq!(store.partition_rows("cohort_c1").expect("c1 rows").len(), 1);

        moving.cohort = "C2".to_string();
        manager.update(&moving, "C1").expect("move");

        let in_c1 = store.partition_rows("cohort_c1").expect("c1 rows");
        let in_c2 = store.partition_rows("cohort_c2").expect("c2 rows");
        assert!(in_c1.iter().all(|row| row.id != 1));
        assert_eq!(in_c2.iter().filter(|row| row.id == 1).count(), 1);
        assert_eq!(in_c2[0].cohort, "C2");
    }

    fn reads_never_create(store: &dyn Backend) {
        let manager = PartitionManager::new(store);
        manager.state(&label("C7")).expect("state");
        manager.descriptor(&label("C7")).expect("descriptor");
        assert!(store.partition_tables().expect("tables").is_empty());
        assert!(!manager.drop_partition(&label("C7")).expect("drop absent"));
    }

    #[test]
    fn sqlite_partition_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("p.db"), Duration::from_secs(5)).expect("store");
        lifecycle(&store);
    }

    #[test]
    fn workbook_partition_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = WorkbookStore::open(&dir.path().join("p.json")).expect("store");
        lifecycle(&store);
    }

    #[test]
    fn cohort_change_leaves_record_in_one_partition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sqlite = SqliteStore::open(&dir.path().join("move.db"), Duration::from_secs(5)).expect("store");
        cohort_change(&sqlite);
        let workbook = WorkbookStore::open(&dir.path().join("move.json")).expect("store");
        cohort_change(&workbook);
    }

    #[test]
    fn reads_do_not_provision_partitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = WorkbookStore::open(&dir.path().join("reads.json")).expect("store");
        reads_never_create(&store);
    }
}
