pub mod sqlite;
pub mod workbook;

use crate::cache::SourceSignature;
use crate::config::{BackendConfig, RegistryConfig};
use crate::errors::AppResult;
use crate::models::{
    NewParticipation, Participation, PartitionDescriptor, RecordId, StudentRecord,
};
use chrono::{DateTime, Utc};

/// Canonical record set plus participations. Every mutation is persisted before it returns.
pub trait RecordStore: Send {
    fn backend_name(&self) -> &'static str;
    fn signature(&self) -> AppResult<SourceSignature>;

    fn list(&self) -> AppResult<Vec<StudentRecord>>;
    fn get(&self, id: RecordId) -> AppResult<StudentRecord>;
    fn max_id(&self) -> AppResult<Option<RecordId>>;
    /// Inserts the record and raises the persisted sequence to at least `record.id`.
    fn insert(&self, record: &StudentRecord) -> AppResult<()>;
    fn update(&self, record: &StudentRecord) -> AppResult<()>;
    /// Removes the record together with its partition rows and participations.
    fn delete(&self, id: RecordId) -> AppResult<()>;

    fn load_sequence(&self) -> AppResult<RecordId>;
    fn store_sequence(&self, last_assigned: RecordId) -> AppResult<()>;

    fn list_participations(&self, student_id: Option<RecordId>) -> AppResult<Vec<Participation>>;
    fn get_participation(&self, participation_id: i64) -> AppResult<Participation>;
    fn insert_participation(&self, payload: &NewParticipation, now: DateTime<Utc>) -> AppResult<Participation>;
    fn update_participation(&self, participation: &Participation) -> AppResult<()>;
    fn delete_participation(&self, participation_id: i64) -> AppResult<()>;
}

/// Physical partition primitives. Names are `cohort_<key>`; callers validate before creating.
pub trait PartitionStore: Send {
    fn partition_tables(&self) -> AppResult<Vec<String>>;
    fn partition_exists(&self, table: &str) -> AppResult<bool>;
    fn create_partition(&self, table: &str) -> AppResult<()>;
    fn drop_partition(&self, table: &str) -> AppResult<bool>;
    fn upsert_partition_row(&self, table: &str, record: &StudentRecord) -> AppResult<()>;
    /// Insert-if-absent keyed on `id`; returns the number of rows actually added.
    fn backfill_partition(&self, table: &str, records: &[StudentRecord]) -> AppResult<usize>;
    fn remove_partition_row(&self, table: &str, id: RecordId) -> AppResult<bool>;
    fn partition_rows(&self, table: &str) -> AppResult<Vec<StudentRecord>>;

    /// Writes the canonical row, upserts it into `mirror` and removes it from `evict` as one
    /// unit. When any step fails nothing is persisted, the canonical row included.
    fn write_mirrored(
        &self,
        record: &StudentRecord,
        mode: WriteMode,
        mirror: Option<&str>,
        evict: Option<&str>,
    ) -> AppResult<()>;

    fn list_descriptors(&self) -> AppResult<Vec<PartitionDescriptor>>;
    fn save_descriptor(&self, descriptor: &PartitionDescriptor) -> AppResult<()>;
    fn remove_descriptor(&self, key: &str) -> AppResult<()>;
}

/// How `write_mirrored` treats the canonical row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// New row; raises the persisted sequence like `RecordStore::insert`.
    Insert,
    /// Existing row; `NotFound` when absent.
    Update,
}

pub trait Backend: RecordStore + PartitionStore {}

impl<T: RecordStore + PartitionStore> Backend for T {}

pub fn open_backend(config: &RegistryConfig) -> AppResult<Box<dyn Backend>> {
    match &config.backend {
        BackendConfig::Sqlite { path } => Ok(Box::new(sqlite::SqliteStore::open(
            path,
            std::time::Duration::from_millis(config.busy_timeout_ms),
        )?)),
        BackendConfig::Workbook { path } => Ok(Box::new(workbook::WorkbookStore::open(path)?)),
    }
}
