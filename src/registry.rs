use crate::allocator::{self, IdSequence};
use crate::cache::SnapshotCache;
use crate::cohort::{natural_cmp, CohortLabel};
use crate::config::RegistryConfig;
use crate::errors::{AppError, AppResult};
use crate::import::{self, DuplicateIndex, ImportRow, RowOutcome};
use crate::models::{
    BooleanResponse, ImportReport, ListQuery, NewParticipation, NewRecord, PageResponse, Participation,
    ParticipationPatch, PartitionDescriptor, PartitionState, RecordId, RecordPatch, RefreshResponse,
    RegistryStats, RepairReport, SequenceRepair, SequenceStatus, StudentRecord, VerificationReport,
};
use crate::partition::PartitionManager;
use crate::repair::{self, ConsistencyRepair};
use crate::search;
use crate::stats;
use crate::store::{self, Backend};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Single-writer orchestration over one backend. A record write and its partition mirror land
/// together or not at all, and the snapshot cache is invalidated before returning.
pub struct Registry {
    config: RegistryConfig,
    default_cohort: CohortLabel,
    store: Box<dyn Backend>,
    cache: SnapshotCache,
}

impl Registry {
    pub fn open(config: RegistryConfig) -> AppResult<Self> {
        config.validate()?;
        let store = store::open_backend(&config)?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: RegistryConfig, store: Box<dyn Backend>) -> AppResult<Self> {
        let default_cohort = config.default_cohort_label()?;
        tracing::info!(
            backend = store.backend_name(),
            path = %config.backend.path().display(),
            default_cohort = %default_cohort,
            "registry opened"
        );
        Ok(Self {
            config,
            default_cohort,
            store,
            cache: SnapshotCache::new(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn Backend {
        self.store.as_ref()
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    fn snapshot(&mut self, force_refresh: bool) -> AppResult<Arc<Vec<StudentRecord>>> {
        let signature = self.store.signature()?;
        let store = &self.store;
        self.cache.get(force_refresh, signature, || store.list())
    }

    fn partitions(&self) -> PartitionManager<'_, dyn Backend> {
        PartitionManager::new(self.store.as_ref())
    }

    pub fn list_records(&mut self, query: &ListQuery) -> AppResult<PageResponse<StudentRecord>> {
        let snapshot = self.snapshot(false)?;
        Ok(search::apply(&snapshot, query))
    }

    pub fn get_record(&self, id: RecordId) -> AppResult<StudentRecord> {
        self.store.get(id)
    }

    /// Id the next insert would receive if nothing changes in between.
    pub fn next_id(&mut self) -> AppResult<RecordId> {
        let snapshot = self.snapshot(false)?;
        let persisted = IdSequence::new(self.store.load_sequence()?).next_id();
        Ok(allocator::next_id(&snapshot).max(persisted))
    }

    pub fn insert_record(&mut self, payload: NewRecord) -> AppResult<StudentRecord> {
        let full_name = payload.full_name.trim().to_string();
        if full_name.is_empty() {
            return Err(AppError::Validation("Full name is required".to_string()));
        }
        let cohort = self.resolve_cohort(payload.cohort.as_deref())?;

        let id = self.allocate_id()?;
        let record = StudentRecord {
            id,
            student_code: allocator::student_code(&self.config.org_prefix, cohort.as_str(), id),
            cohort: cohort.as_str().to_string(),
            full_name,
            institution: payload.institution.trim().to_string(),
            program: payload.program.trim().to_string(),
            district: payload.district.trim().to_string(),
            contact_number: payload.contact_number.trim().to_string(),
            current_year: payload.current_year.trim().to_string(),
            attributes: payload.attributes,
            last_updated: Utc::now(),
        };

        let written = self.partitions().insert(&record);
        self.cache.invalidate();
        written?;
        tracing::info!(id, code = %record.student_code, cohort = %cohort, "record inserted");
        Ok(record)
    }

    pub fn update_record(&mut self, id: RecordId, mut patch: RecordPatch) -> AppResult<StudentRecord> {
        if let Some(cohort) = patch.cohort.take() {
            patch.cohort = Some(CohortLabel::parse(&cohort)?.as_str().to_string());
        }
        if let Some(full_name) = patch.full_name.take() {
            let full_name = full_name.trim().to_string();
            if full_name.is_empty() {
                return Err(AppError::Validation("Full name cannot be empty".to_string()));
            }
            patch.full_name = Some(full_name);
        }

        let mut record = self.store.get(id)?;
        let previous_cohort = record.cohort.clone();
        record.apply_patch(patch, Utc::now());

        let written = self.partitions().update(&record, &previous_cohort);
        self.cache.invalidate();
        written?;
        if previous_cohort != record.cohort {
            tracing::info!(id, from = %previous_cohort, to = %record.cohort, "record changed cohort");
        }
        Ok(record)
    }

    pub fn delete_record(&mut self, id: RecordId) -> AppResult<BooleanResponse> {
        self.store.delete(id)?;
        self.cache.invalidate();
        tracing::info!(id, "record deleted");
        Ok(BooleanResponse { success: true })
    }

    pub fn list_participations(&self, student_id: RecordId) -> AppResult<Vec<Participation>> {
        self.store.get(student_id)?;
        self.store.list_participations(Some(student_id))
    }

    pub fn list_all_participations(&self) -> AppResult<Vec<Participation>> {
        self.store.list_participations(None)
    }

    pub fn add_participation(&mut self, mut payload: NewParticipation) -> AppResult<Participation> {
        payload.event_name = payload.event_name.trim().to_string();
        if payload.event_name.is_empty() {
            return Err(AppError::Validation("Event name is required".to_string()));
        }
        validate_hours(payload.hours)?;
        let participation = self.store.insert_participation(&payload, Utc::now())?;
        tracing::info!(
            participation_id = participation.participation_id,
            student_id = participation.student_id,
            "participation added"
        );
        Ok(participation)
    }

    pub fn update_participation(&mut self, participation_id: i64, patch: ParticipationPatch) -> AppResult<Participation> {
        validate_hours(patch.hours)?;
        if patch.event_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(AppError::Validation("Event name cannot be empty".to_string()));
        }
        let mut participation = self.store.get_participation(participation_id)?;
        participation.apply_patch(patch, Utc::now());
        self.store.update_participation(&participation)?;
        Ok(participation)
    }

    pub fn delete_participation(&mut self, participation_id: i64) -> AppResult<BooleanResponse> {
        self.store.delete_participation(participation_id)?;
        Ok(BooleanResponse { success: true })
    }

    /// Known cohorts in natural order: registered partitions plus labels carried by records.
    pub fn get_cohorts(&mut self) -> AppResult<Vec<String>> {
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        for descriptor in self.store.list_descriptors()? {
            labels.entry(descriptor.key).or_insert(descriptor.label);
        }
        for record in self.snapshot(false)?.iter() {
            if let Ok(label) = CohortLabel::parse(&record.cohort) {
                labels.entry(label.key()).or_insert_with(|| label.as_str().to_string());
            }
        }

        let mut cohorts: Vec<String> = labels.into_values().collect();
        if cohorts.is_empty() {
            cohorts.push(self.default_cohort.as_str().to_string());
        }
        cohorts.sort_by(|a, b| natural_cmp(a, b));
        Ok(cohorts)
    }

    pub fn add_cohort(&mut self, raw: &str) -> AppResult<PartitionDescriptor> {
        let label = CohortLabel::parse_strict(raw)?;
        let partitions = self.partitions();
        if partitions.state(&label)? != PartitionState::Unknown {
            return Err(AppError::Validation(format!("Cohort {} already exists", label)));
        }
        partitions.ensure_partition(&label)?;
        let canonical = self.store.list()?;
        partitions.backfill_from(&label, &canonical)?;
        partitions
            .descriptor(&label)?
            .ok_or_else(|| AppError::PartitionInconsistency(format!("Cohort {} was not registered", label)))
    }

    pub fn get_stats(&mut self) -> AppResult<RegistryStats> {
        let snapshot = self.snapshot(false)?;
        Ok(stats::compute(&snapshot))
    }

    pub fn refresh(&mut self) -> AppResult<RefreshResponse> {
        let snapshot = self.snapshot(true)?;
        tracing::info!(records = snapshot.len(), "snapshot refreshed");
        Ok(RefreshResponse {
            total_students: snapshot.len(),
        })
    }

    /// Inserts rows one by one; a failing row never undoes rows already inserted.
    pub fn import_records(&mut self, rows: &[ImportRow], cohort: &str) -> AppResult<ImportReport> {
        let label = CohortLabel::parse(cohort)?;
        self.partitions().ensure_partition(&label)?;
        let mut duplicates = DuplicateIndex::from_records(&self.store.list()?);

        let mut inserted_ids = Vec::new();
        let mut errors = Vec::new();
        let mut skipped = 0usize;

        for (index, row) in rows.iter().enumerate() {
            let row_number = index + 1;
            match import::classify(row, &label, &duplicates) {
                RowOutcome::Skip(reason) => {
                    tracing::debug!(row = row_number, reason = %reason, "import row skipped");
                    skipped += 1;
                }
                RowOutcome::Insert(payload) => match self.insert_record(payload) {
                    Ok(record) => {
                        duplicates.remember(&record.full_name, &record.cohort);
                        inserted_ids.push(record.id);
                    }
                    Err(error) => {
                        tracing::warn!(row = row_number, error = %error, "import row failed");
                        errors.push(format!("Row {}: {}", row_number, error));
                    }
                },
            }
        }

        let report = ImportReport {
            cohort: label.as_str().to_string(),
            total: rows.len(),
            inserted: inserted_ids.len(),
            skipped,
            failed: errors.len(),
            inserted_ids,
            errors,
            verification: repair::verify(self.store.as_ref())?,
        };
        tracing::info!(
            cohort = %label,
            total = report.total,
            inserted = report.inserted,
            skipped = report.skipped,
            failed = report.failed,
            "import finished"
        );
        Ok(report)
    }

    pub fn run_repair(&mut self) -> AppResult<RepairReport> {
        let report = ConsistencyRepair::new(self.store.as_ref(), self.default_cohort.clone()).run();
        self.cache.invalidate();
        report
    }

    pub fn verify(&self) -> AppResult<VerificationReport> {
        repair::verify(self.store.as_ref())
    }

    pub fn sequence_status(&self) -> AppResult<SequenceStatus> {
        let max_id = self.store.max_id()?.unwrap_or(0);
        Ok(IdSequence::new(self.store.load_sequence()?).status(max_id))
    }

    pub fn repair_sequence(&mut self) -> AppResult<SequenceRepair> {
        let max_id = self.store.max_id()?.unwrap_or(0);
        let mut sequence = IdSequence::new(self.store.load_sequence()?);
        let repair = sequence.repair(max_id);
        self.store.store_sequence(repair.current)?;
        tracing::info!(previous = repair.previous, current = repair.current, next_id = repair.next_id, "sequence repaired");
        Ok(repair)
    }

    fn resolve_cohort(&self, raw: Option<&str>) -> AppResult<CohortLabel> {
        match raw.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => CohortLabel::parse(value),
            None => Ok(self.default_cohort.clone()),
        }
    }

    /// Drift is the one fault repaired in place: the sequence is moved past the true maximum first.
    fn allocate_id(&mut self) -> AppResult<RecordId> {
        let max_id = self.store.max_id()?.unwrap_or(0);
        let mut sequence = IdSequence::new(self.store.load_sequence()?);
        match sequence.allocate(max_id) {
            Err(AppError::SequenceDrift { persisted, max_id }) => {
                tracing::warn!(persisted, max_id, "id sequence drifted behind stored records; repairing");
                let repair = sequence.repair(max_id);
                self.store.store_sequence(repair.current)?;
                sequence.allocate(max_id)
            }
            other => other,
        }
    }
}

fn validate_hours(hours: Option<f64>) -> AppResult<()> {
    match hours {
        Some(hours) if !hours.is_finite() || hours < 0.0 => Err(AppError::Validation(format!(
            "Hours must be a non-negative number, got {}",
            hours
        ))),
        _ => Ok(()),
    }
}
