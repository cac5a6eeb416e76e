use crate::cache::SourceSignature;
use crate::cohort::is_valid_partition_name;
use crate::errors::{AppError, AppResult};
use crate::models::{NewParticipation, Participation, PartitionDescriptor, RecordId, StudentRecord};
use crate::store::{PartitionStore, RecordStore, WriteMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// On-disk layout: one named sheet per concern, partitions keyed by sheet name.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Workbook {
    #[serde(rename = "Master_Database", default)]
    master: Vec<StudentRecord>,
    #[serde(rename = "Participations", default)]
    participations: Vec<Participation>,
    #[serde(rename = "Partitions", default)]
    partitions: BTreeMap<String, Vec<StudentRecord>>,
    #[serde(rename = "Partition_Registry", default)]
    registry: Vec<PartitionDescriptor>,
    #[serde(rename = "Meta", default)]
    meta: WorkbookMeta,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WorkbookMeta {
    id_sequence: Option<i64>,
    participation_sequence: i64,
}

impl Workbook {
    fn max_id(&self) -> Option<RecordId> {
        self.master.iter().map(|record| record.id).max()
    }

    fn position(&self, id: RecordId) -> AppResult<usize> {
        self.master
            .iter()
            .position(|record| record.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Student {} not found", id)))
    }

    fn insert_master(&mut self, record: &StudentRecord) -> AppResult<()> {
        if self.master.iter().any(|existing| existing.id == record.id) {
            return Err(AppError::Internal(format!("Student id {} already exists", record.id)));
        }
        self.master.push(record.clone());
        let sequence = self.meta.id_sequence.unwrap_or(0);
        self.meta.id_sequence = Some(sequence.max(record.id));
        Ok(())
    }

    fn update_master(&mut self, record: &StudentRecord) -> AppResult<()> {
        let index = self.position(record.id)?;
        self.master[index] = record.clone();
        Ok(())
    }

    fn upsert_row(&mut self, table: &str, record: &StudentRecord) -> AppResult<()> {
        let rows = self.sheet_mut(table)?;
        match rows.iter_mut().find(|row| row.id == record.id) {
            Some(row) => *row = record.clone(),
            None => rows.push(record.clone()),
        }
        Ok(())
    }

    fn sheet_mut(&mut self, table: &str) -> AppResult<&mut Vec<StudentRecord>> {
        self.partitions
            .get_mut(table)
            .ok_or_else(|| AppError::NotFound(format!("Partition sheet '{}' does not exist", table)))
    }
}

/// Flat-file backend. Every mutation rewrites the whole workbook through a temp file and rename,
/// so a cascading delete either lands completely or not at all.
#[derive(Debug)]
pub struct WorkbookStore {
    path: PathBuf,
}

impl WorkbookStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            path: path.to_path_buf(),
        };
        if store.path.exists() {
            let mut workbook = store.load()?;
            if workbook.meta.id_sequence.is_none() {
                workbook.meta.id_sequence = Some(workbook.max_id().unwrap_or(0));
                store.save(&workbook)?;
            }
        }
        tracing::debug!(path = %path.display(), "workbook store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> AppResult<Workbook> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Workbook::default()),
            Err(error) => return Err(error.into()),
        };
        serde_json::from_slice(&bytes).map_err(|error| {
            AppError::StorageUnavailable(format!("Workbook {} is unreadable: {}", self.path.display(), error))
        })
    }

    fn save(&self, workbook: &Workbook) -> AppResult<()> {
        let bytes = serde_json::to_vec_pretty(workbook)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, bytes)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut Workbook) -> AppResult<T>) -> AppResult<T> {
        let mut workbook = self.load()?;
        let value = apply(&mut workbook)?;
        self.save(&workbook)?;
        Ok(value)
    }
}

impl RecordStore for WorkbookStore {
    fn backend_name(&self) -> &'static str {
        "workbook"
    }

    fn signature(&self) -> AppResult<SourceSignature> {
        SourceSignature::of_path(&self.path)
    }

    fn list(&self) -> AppResult<Vec<StudentRecord>> {
        let mut records = self.load()?.master;
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    fn get(&self, id: RecordId) -> AppResult<StudentRecord> {
        let workbook = self.load()?;
        let index = workbook.position(id)?;
        Ok(workbook.master[index].clone())
    }

    fn max_id(&self) -> AppResult<Option<RecordId>> {
        Ok(self.load()?.max_id())
    }

    fn insert(&self, record: &StudentRecord) -> AppResult<()> {
        self.mutate(|workbook| workbook.insert_master(record))
    }

    fn update(&self, record: &StudentRecord) -> AppResult<()> {
        self.mutate(|workbook| workbook.update_master(record))
    }

    fn delete(&self, id: RecordId) -> AppResult<()> {
        self.mutate(|workbook| {
            let index = workbook.position(id)?;
            for rows in workbook.partitions.values_mut() {
                rows.retain(|row| row.id != id);
            }
            workbook.participations.retain(|participation| participation.student_id != id);
            workbook.master.remove(index);
            Ok(())
        })
    }

    fn load_sequence(&self) -> AppResult<RecordId> {
        Ok(self.load()?.meta.id_sequence.unwrap_or(0))
    }

    fn store_sequence(&self, last_assigned: RecordId) -> AppResult<()> {
        self.mutate(|workbook| {
            workbook.meta.id_sequence = Some(last_assigned);
            Ok(())
        })
    }

    fn list_participations(&self, student_id: Option<RecordId>) -> AppResult<Vec<Participation>> {
        let mut participations: Vec<Participation> = self
            .load()?
            .participations
            .into_iter()
            .filter(|participation| student_id.map_or(true, |id| participation.student_id == id))
            .collect();
        participations.sort_by(|a, b| {
            b.event_date
                .cmp(&a.event_date)
                .then_with(|| b.participation_id.cmp(&a.participation_id))
        });
        Ok(participations)
    }

    fn get_participation(&self, participation_id: i64) -> AppResult<Participation> {
        self.load()?
            .participations
            .into_iter()
            .find(|participation| participation.participation_id == participation_id)
            .ok_or_else(|| AppError::NotFound(format!("Participation {} not found", participation_id)))
    }

    fn insert_participation(&self, payload: &NewParticipation, now: DateTime<Utc>) -> AppResult<Participation> {
        self.mutate(|workbook| {
            workbook.position(payload.student_id)?;
            let next = workbook
                .participations
                .iter()
                .map(|participation| participation.participation_id)
                .max()
                .unwrap_or(0)
                .max(workbook.meta.participation_sequence)
                + 1;
            workbook.meta.participation_sequence = next;

            let participation = Participation {
                participation_id: next,
                student_id: payload.student_id,
                event_name: payload.event_name.clone(),
                event_date: payload.event_date,
                event_type: payload.event_type.unwrap_or_default(),
                role: payload.role.unwrap_or_default(),
                hours: payload.hours.unwrap_or(0.0),
                notes: payload.notes.clone().filter(|notes| !notes.is_empty()),
                created_at: now,
                updated_at: now,
            };
            workbook.participations.push(participation.clone());
            Ok(participation)
        })
    }

    fn update_participation(&self, participation: &Participation) -> AppResult<()> {
        self.mutate(|workbook| {
            let slot = workbook
                .participations
                .iter_mut()
                .find(|existing| existing.participation_id == participation.participation_id)
                .ok_or_else(|| {
                    AppError::NotFound(format!("Participation {} not found", participation.participation_id))
                })?;
            *slot = participation.clone();
            Ok(())
        })
    }

    fn delete_participation(&self, participation_id: i64) -> AppResult<()> {
        self.mutate(|workbook| {
            let before = workbook.participations.len();
            workbook
                .participations
                .retain(|participation| participation.participation_id != participation_id);
            if workbook.participations.len() == before {
                return Err(AppError::NotFound(format!("Participation {} not found", participation_id)));
            }
            Ok(())
        })
    }
}

impl PartitionStore for WorkbookStore {
    fn partition_tables(&self) -> AppResult<Vec<String>> {
        Ok(self.load()?.partitions.into_keys().collect())
    }

    fn partition_exists(&self, table: &str) -> AppResult<bool> {
        Ok(self.load()?.partitions.contains_key(table))
    }

    fn create_partition(&self, table: &str) -> AppResult<()> {
        if !is_valid_partition_name(table) {
            return Err(AppError::Validation(format!("Invalid partition name '{}'", table)));
        }
        let mut workbook = self.load()?;
        if workbook.partitions.contains_key(table) {
            return Ok(());
        }
        workbook.partitions.insert(table.to_string(), Vec::new());
        self.save(&workbook)
    }

    fn drop_partition(&self, table: &str) -> AppResult<bool> {
        let mut workbook = self.load()?;
        if workbook.partitions.remove(table).is_none() {
            return Ok(false);
        }
        self.save(&workbook)?;
        Ok(true)
    }

    fn upsert_partition_row(&self, table: &str, record: &StudentRecord) -> AppResult<()> {
        self.mutate(|workbook| workbook.upsert_row(table, record))
    }

    fn backfill_partition(&self, table: &str, records: &[StudentRecord]) -> AppResult<usize> {
        let mut workbook = self.load()?;
        let rows = workbook.sheet_mut(table)?;
        let mut inserted = 0usize;
        for record in records {
            if rows.iter().any(|row| row.id == record.id) {
                continue;
            }
            rows.push(record.clone());
            inserted += 1;
        }
        if inserted > 0 {
            self.save(&workbook)?;
        }
        Ok(inserted)
    }

    fn remove_partition_row(&self, table: &str, id: RecordId) -> AppResult<bool> {
        let mut workbook = self.load()?;
        let Some(rows) = workbook.partitions.get_mut(table) else {
            return Ok(false);
        };
        let before = rows.len();
        rows.retain(|row| row.id != id);
        if rows.len() == before {
            return Ok(false);
        }
        self.save(&workbook)?;
        Ok(true)
    }

    fn partition_rows(&self, table: &str) -> AppResult<Vec<StudentRecord>> {
        let mut rows = self.load()?.partitions.remove(table).unwrap_or_default();
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    fn write_mirrored(
        &self,
        record: &StudentRecord,
        mode: WriteMode,
        mirror: Option<&str>,
        evict: Option<&str>,
    ) -> AppResult<()> {
        self.mutate(|workbook| {
            match mode {
                WriteMode::Insert => workbook.insert_master(record)?,
                WriteMode::Update => workbook.update_master(record)?,
            }
            if let Some(table) = mirror {
                workbook.upsert_row(table, record)?;
            }
            if let Some(rows) = evict.and_then(|table| workbook.partitions.get_mut(table)) {
                rows.retain(|row| row.id != record.id);
            }
            Ok(())
        })
    }

    fn list_descriptors(&self) -> AppResult<Vec<PartitionDescriptor>> {
        let mut descriptors = self.load()?.registry;
        descriptors.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(descriptors)
    }

    fn save_descriptor(&self, descriptor: &PartitionDescriptor) -> AppResult<()> {
        self.mutate(|workbook| {
            match workbook.registry.iter_mut().find(|existing| existing.key == descriptor.key) {
                Some(existing) => {
                    let created_at = existing.created_at;
                    *existing = PartitionDescriptor {
                        created_at,
                        ..descriptor.clone()
                    };
                }
                None => workbook.registry.push(descriptor.clone()),
            }
            Ok(())
        })
    }

    fn remove_descriptor(&self, key: &str) -> AppResult<()> {
        self.mutate(|workbook| {
            workbook.registry.retain(|descriptor| descriptor.key != key);
            Ok(())
        })
    }
}
