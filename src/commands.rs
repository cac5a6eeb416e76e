use crate::config::RegistryConfig;
use crate::errors::{AppError, AppResult};
use crate::import::ImportRow;
use crate::models::{
    BooleanResponse, Envelope, ImportReport, ListQuery, NewParticipation, NewRecord, PageResponse, Participation,
    ParticipationPatch, PartitionDescriptor, RecordId, RecordPatch, RefreshResponse, RegistryStats, RepairReport,
    SequenceRepair, SequenceStatus, StudentRecord, VerificationReport,
};
use crate::registry::Registry;
use std::sync::{Arc, Mutex};

/// Shared handle for the presentation layer. Each call runs on the blocking pool under the registry lock.
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Arc<Mutex<Registry>>,
}

impl RegistryHandle {
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Arc::new(Mutex::new(registry)),
        }
    }

    pub fn open(config: RegistryConfig) -> AppResult<Self> {
        Ok(Self::new(Registry::open(config)?))
    }

    async fn call<T, F>(&self, command: &'static str, op: F) -> Envelope<T>
    where
        F: FnOnce(&mut Registry) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let joined = tokio::task::spawn_blocking(move || {
            let mut registry = inner
                .lock()
                .map_err(|_| AppError::Internal("registry mutex poisoned".to_string()))?;
            op(&mut registry)
        })
        .await;

        match joined.map_err(AppError::from).and_then(|result| result) {
            Ok(data) => Envelope::ok(data),
            Err(error) => {
                tracing::warn!(command, code = error.code(), error = %error, "command failed");
                Envelope::failure(to_client_error(error))
            }
        }
    }
}

pub async fn list_records(handle: &RegistryHandle, query: ListQuery) -> Envelope<PageResponse<StudentRecord>> {
    handle.call("list_records", move |registry| registry.list_records(&query)).await
}

pub async fn get_record(handle: &RegistryHandle, id: RecordId) -> Envelope<StudentRecord> {
    handle.call("get_record", move |registry| registry.get_record(id)).await
}

pub async fn insert_record(handle: &RegistryHandle, payload: NewRecord) -> Envelope<StudentRecord> {
    handle.call("insert_record", move |registry| registry.insert_record(payload)).await
}

pub async fn update_record(handle: &RegistryHandle, id: RecordId, patch: RecordPatch) -> Envelope<StudentRecord> {
    handle
        .call("update_record", move |registry| registry.update_record(id, patch))
        .await
}

pub async fn delete_record(handle: &RegistryHandle, id: RecordId) -> Envelope<BooleanResponse> {
    handle.call("delete_record", move |registry| registry.delete_record(id)).await
}

pub async fn list_participations(handle: &RegistryHandle, student_id: RecordId) -> Envelope<Vec<Participation>> {
    handle
        .call("list_participations", move |registry| registry.list_participations(student_id))
        .await
}

pub async fn list_all_participations(handle: &RegistryHandle) -> Envelope<Vec<Participation>> {
    handle
        .call("list_all_participations", |registry| registry.list_all_participations())
        .await
}

pub async fn add_participation(handle: &RegistryHandle, payload: NewParticipation) -> Envelope<Participation> {
    handle
        .call("add_participation", move |registry| registry.add_participation(payload))
        .await
}

pub async fn update_participation(
    handle: &RegistryHandle,
    participation_id: i64,
    patch: ParticipationPatch,
) -> Envelope<Participation> {
    handle
        .call("update_participation", move |registry| {
            registry.update_participation(participation_id, patch)
        })
        .await
}

pub async fn delete_participation(handle: &RegistryHandle, participation_id: i64) -> Envelope<BooleanResponse> {
    handle
        .call("delete_participation", move |registry| {
            registry.delete_participation(participation_id)
        })
        .await
}

pub async fn get_cohorts(handle: &RegistryHandle) -> Envelope<Vec<String>> {
    handle.call("get_cohorts", |registry| registry.get_cohorts()).await
}

pub async fn add_cohort(handle: &RegistryHandle, cohort: String) -> Envelope<PartitionDescriptor> {
    handle.call("add_cohort", move |registry| registry.add_cohort(&cohort)).await
}

pub async fn get_stats(handle: &RegistryHandle) -> Envelope<RegistryStats> {
    handle.call("get_stats", |registry| registry.get_stats()).await
}

pub async fn refresh(handle: &RegistryHandle) -> Envelope<RefreshResponse> {
    handle.call("refresh", |registry| registry.refresh()).await
}

pub async fn import_records(handle: &RegistryHandle, rows: Vec<ImportRow>, cohort: String) -> Envelope<ImportReport> {
    handle
        .call("import_records", move |registry| registry.import_records(&rows, &cohort))
        .await
}

pub async fn run_repair(handle: &RegistryHandle) -> Envelope<RepairReport> {
    handle.call("run_repair", |registry| registry.run_repair()).await
}

pub async fn verify(handle: &RegistryHandle) -> Envelope<VerificationReport> {
    handle.call("verify", |registry| registry.verify()).await
}

pub async fn sequence_status(handle: &RegistryHandle) -> Envelope<SequenceStatus> {
    handle.call("sequence_status", |registry| registry.sequence_status()).await
}

pub async fn repair_sequence(handle: &RegistryHandle) -> Envelope<SequenceRepair> {
    handle.call("repair_sequence", |registry| registry.repair_sequence()).await
}

pub async fn next_id(handle: &RegistryHandle) -> Envelope<RecordId> {
    handle.call("next_id", |registry| registry.next_id()).await
}

fn to_client_error(error: impl std::fmt::Display) -> String {
    error.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn handle(dir: &tempfile::TempDir) -> RegistryHandle {
        RegistryHandle::open(RegistryConfig {
            backend: BackendConfig::Sqlite {
                path: dir.path().join("facade.db"),
            },
            ..RegistryConfig::default()
        })
        .expect("handle")
    }

    #[tokio::test]
    async fn successful_calls_carry_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = handle(&dir);
        let inserted = insert_record(
            &handle,
            NewRecord {
                full_name: "Asha Rai".to_string(),
                ..NewRecord::default()
            },
        )
        .await;
        assert!(inserted.success);
        let id = inserted.data.expect("record").id;

        let fetched = get_record(&handle, id).await;
        assert_eq!(fetched.data.map(|record| record.full_name).as_deref(), Some("Asha Rai"));
        assert!(fetched.error.is_none());
    }

    #[tokio::test]
    async fn failures_become_envelopes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = handle(&dir);

        let missing = delete_record(&handle, 42).await;
        assert!(!missing.success);
        assert!(missing.data.is_none());
        assert!(missing.error.as_deref().is_some_and(|error| error.starts_with("NOT_FOUND")));

        let invalid = add_cohort(&handle, "spring".to_string()).await;
        assert_eq!(
            invalid.error.as_deref(),
            Some("VALIDATION: Invalid cohort name. Must be in format C1, C2, C3, etc.")
        );
    }

    #[tokio::test]
    async fn sequential_calls_observe_each_other() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = handle(&dir);
        for name in ["Asha", "Bikash", "Chandra"] {
            let envelope = insert_record(
                &handle,
                NewRecord {
                    full_name: name.to_string(),
                    cohort: Some("C2".to_string()),
                    ..NewRecord::default()
                },
            )
            .await;
            assert!(envelope.success);
        }
        let page = list_records(&handle, ListQuery::default()).await.data.expect("page");
        assert_eq!(page.pagination.total, 3);
        assert_eq!(get_cohorts(&handle).await.data, Some(vec!["C2".to_string()]));
        assert_eq!(next_id(&handle).await.data, Some(4));
        assert!(verify(&handle).await.data.expect("report").is_consistent());
    }
}
