use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use cohort_registry::config::{BackendConfig, RegistryConfig};
use cohort_registry::errors::AppError;
use cohort_registry::import;
use cohort_registry::models::{ListQuery, NewParticipation, NewRecord, RecordPatch, StudentRecord};
use cohort_registry::store::{PartitionStore, RecordStore};
use cohort_registry::Registry;

fn sqlite_config(dir: &Path) -> RegistryConfig {
    RegistryConfig {
        backend: BackendConfig::Sqlite {
            path: dir.join("registry.db"),
        },
        ..RegistryConfig::default()
    }
}

fn workbook_config(dir: &Path) -> RegistryConfig {
    RegistryConfig {
        backend: BackendConfig::Workbook {
            path: dir.join("registry.json"),
        },
        ..RegistryConfig::default()
    }
}

fn for_each_backend(scenario: impl Fn(&mut Registry)) {
    let dir = tempfile::tempdir().expect("tempdir");
    for config in [sqlite_config(dir.path()), workbook_config(dir.path())] {
        let mut registry = Registry::open(config).expect("registry");
        scenario(&mut registry);
    }
}

fn new_student(name: &str, cohort: &str) -> NewRecord {
    NewRecord {
        cohort: Some(cohort.to_string()),
        full_name: name.to_string(),
        institution: "Pokhara University".to_string(),
        program: "BBA".to_string(),
        district: "Kaski".to_string(),
        ..NewRecord::default()
    }
}

fn raw_record(id: i64, cohort: &str) -> StudentRecord {
    StudentRecord {
        id,
        student_code: format!("UGO_{}_{}", cohort, id),
        cohort: cohort.to_string(),
        full_name: format!("Legacy Student {}", id),
        institution: String::new(),
        program: String::new(),
        district: String::new(),
        contact_number: String::new(),
        current_year: String::new(),
        attributes: BTreeMap::new(),
        last_updated: Utc::now(),
    }
}

fn partition_ids(registry: &Registry, table: &str) -> Vec<i64> {
    registry
        .store()
        .partition_rows(table)
        .expect("partition rows")
        .iter()
        .map(|row| row.id)
        .collect()
}

#[test]
fn pagination_over_twenty_five_records() {
    for_each_backend(|registry| {
        for index in 1..=25 {
            registry
                .insert_record(new_student(&format!("Student {:02}", index), "C1"))
                .expect("insert");
        }
        let page = |registry: &mut Registry, number: usize| {
            registry
                .list_records(&ListQuery {
                    page: Some(number),
                    limit: Some(10),
                    ..ListQuery::default()
                })
                .expect("list")
        };

        let second = page(registry, 2);
        assert_eq!(second.data.iter().map(|r| r.id).collect::<Vec<_>>(), (11..=20).collect::<Vec<_>>());
        let third = page(registry, 3);
        assert_eq!(third.data.iter().map(|r| r.id).collect::<Vec<_>>(), (21..=25).collect::<Vec<_>>());
        assert_eq!(third.pagination.total_pages, 3);
        assert!(page(registry, 4).data.is_empty());
    });
}

#[test]
fn mixed_cohort_labels_converge_after_repair() {
    for_each_backend(|registry| {
        for (id, cohort) in [(1, "C1"), (2, "C1"), (3, "C1"), (4, ""), (5, "c1")] {
            registry.store().insert(&raw_record(id, cohort)).expect("out-of-band insert");
        }

        let report = registry.run_repair().expect("repair");
        assert_eq!(report.records_touched, 1);
        assert_eq!(registry.get_record(4).expect("record 4").cohort, "C1");
        assert_eq!(partition_ids(registry, "cohort_c1"), vec![1, 2, 3, 4, 5]);
        assert!(report.verification.is_consistent(), "{:?}", report.verification);

        let again = registry.run_repair().expect("second repair");
        assert_eq!(again.records_touched, 0);
        assert_eq!(again, registry.run_repair().expect("third repair"));
    });
}

#[test]
fn cohort_move_leaves_exactly_one_partition() {
    for_each_backend(|registry| {
        let staying = registry.insert_record(new_student("Asha Rai", "C1")).expect("insert");
        let moving = registry.insert_record(new_student("Bikash Thapa", "C1")).expect("insert");

        registry
            .update_record(
                moving.id,
                RecordPatch {
                    cohort: Some("C2".to_string()),
                    ..RecordPatch::default()
                },
            )
            .expect("move");

        assert_eq!(partition_ids(registry, "cohort_c1"), vec![staying.id]);
        assert_eq!(partition_ids(registry, "cohort_c2"), vec![moving.id]);
        assert!(registry.verify().expect("verify").is_consistent());
    });
}

#[test]
fn delete_removes_partition_rows_and_participations() {
    for_each_backend(|registry| {
        let record = registry.insert_record(new_student("Chandra Gurung", "C3")).expect("insert");
        for event in ["Orientation", "Career Fair"] {
            registry
                .add_participation(NewParticipation {
                    student_id: record.id,
                    event_name: event.to_string(),
                    hours: Some(3.0),
                    ..NewParticipation::default()
                })
                .expect("participation");
        }
        assert_eq!(registry.list_participations(record.id).expect("list").len(), 2);

        registry.delete_record(record.id).expect("delete");
        assert!(matches!(registry.get_record(record.id), Err(AppError::NotFound(_))));
        assert!(partition_ids(registry, "cohort_c3").is_empty());
        assert!(registry.list_all_participations().expect("all").is_empty());
    });
}

#[test]
fn sequence_repair_resumes_after_highest_id() {
    for_each_backend(|registry| {
        for id in 271..=273 {
            registry.store().insert(&raw_record(id, "C1")).expect("out-of-band insert");
        }
        registry.store().store_sequence(270).expect("rewind sequence");
        assert!(registry.verify().expect("verify").sequence.drift);

        let repair = registry.repair_sequence().expect("repair sequence");
        assert_eq!(repair.previous, 270);
        assert_eq!(repair.next_id, 274);

        let inserted = registry.insert_record(new_student("Dipa Shrestha", "C1")).expect("insert");
        assert_eq!(inserted.id, 274);
        assert_eq!(inserted.student_code, "UGO_C1_274");
    });
}

#[test]
fn import_fixture_skips_nameless_and_duplicate_rows() {
    let rows = import::read_rows(Path::new("tests/fixtures/import-batch.json")).expect("fixture");
    for_each_backend(|registry| {
        let report = registry.import_records(&rows, "C5").expect("import");
        assert_eq!(report.total, 5);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed, 0);
        assert!(report.verification.is_consistent());
        assert_eq!(partition_ids(registry, "cohort_c5"), report.inserted_ids);

        let stats = registry.get_stats().expect("stats");
        assert_eq!(stats.by_cohort.get("C5"), Some(&3));
        assert_eq!(stats.financial_summary.total_fees, 85_000.0);
        assert_eq!(stats.financial_summary.total_due, 12_500.5);

        let again = registry.import_records(&rows, "C5").expect("re-import");
        assert_eq!(again.inserted, 0);
        assert_eq!(again.skipped, 5);
    });
}

#[test]
fn failing_import_row_keeps_earlier_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = sqlite_config(dir.path());
    let db_path = config.backend.path().to_path_buf();
    let mut registry = Registry::open(config).expect("registry");

    let conn = rusqlite::Connection::open(&db_path).expect("side connection");
    conn.busy_timeout(Duration::from_secs(5)).expect("busy timeout");
    conn.execute_batch(
        "CREATE TRIGGER reject_broken_rows BEFORE INSERT ON students
         WHEN NEW.full_name = 'Broken Row'
         BEGIN SELECT RAISE(ABORT, 'rejected by trigger'); END;",
    )
    .expect("trigger");
    drop(conn);

    let rows: Vec<import::ImportRow> = serde_json::from_value(serde_json::json!([
        { "Full Name": "First Row" },
        { "Full Name": "Broken Row" },
        { "Full Name": "Third Row" }
    ]))
    .expect("rows");

    let report = registry.import_records(&rows, "C6").expect("import");
    assert_eq!(report.inserted, 2);
    assert_eq!(report.failed, 1);
    assert!(report.errors[0].starts_with("Row 2:"));
    assert_eq!(report.inserted_ids, vec![1, 2]);
    assert!(report.verification.is_consistent());
}

#[test]
fn rejected_partition_write_leaves_no_canonical_change() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = sqlite_config(dir.path());
    let db_path = config.backend.path().to_path_buf();
    let mut registry = Registry::open(config).expect("registry");
    registry.add_cohort("C1").expect("add cohort");
    let kept = registry.insert_record(new_student("Asha Rai", "C1")).expect("insert");

    let conn = rusqlite::Connection::open(&db_path).expect("side connection");
    conn.busy_timeout(Duration::from_secs(5)).expect("busy timeout");
    conn.execute_batch(
        "CREATE TRIGGER reject_partition_rows BEFORE INSERT ON cohort_c1
         WHEN NEW.full_name = 'Rejected'
         BEGIN SELECT RAISE(ABORT, 'partition write rejected'); END;",
    )
    .expect("trigger");
    drop(conn);

    assert!(registry.insert_record(new_student("Rejected", "C1")).is_err());
    assert_eq!(registry.store().list().expect("list").len(), 1);
    assert_eq!(registry.store().load_sequence().expect("sequence"), kept.id);

    let renamed = registry.update_record(
        kept.id,
        RecordPatch {
            full_name: Some("Rejected".to_string()),
            ..RecordPatch::default()
        },
    );
    assert!(renamed.is_err());
    assert_eq!(registry.get_record(kept.id).expect("record").full_name, "Asha Rai");
    assert_eq!(partition_ids(&registry, "cohort_c1"), vec![kept.id]);
    assert!(registry.verify().expect("verify").is_consistent());

    let rows: Vec<import::ImportRow> =
        serde_json::from_value(serde_json::json!([{ "Full Name": "Rejected" }])).expect("rows");
    let report = registry.import_records(&rows, "C1").expect("import");
    assert_eq!(report.failed, 1);
    assert!(report.inserted_ids.is_empty());
    assert_eq!(registry.store().list().expect("list").len(), 1);

    let retried = registry.insert_record(new_student("Bikash Thapa", "C1")).expect("insert");
    assert_eq!(retried.id, kept.id + 1);
}

#[test]
fn snapshot_cache_reloads_only_after_changes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = Registry::open(workbook_config(dir.path())).expect("registry");
    registry.insert_record(new_student("Asha", "C1")).expect("insert");

    registry.list_records(&ListQuery::default()).expect("list");
    registry.get_stats().expect("stats");
    registry.get_cohorts().expect("cohorts");
    assert_eq!(registry.cache().load_count(), 1);

    registry.insert_record(new_student("Bikash", "C1")).expect("insert");
    assert_eq!(registry.list_records(&ListQuery::default()).expect("list").pagination.total, 2);
    assert_eq!(registry.cache().load_count(), 2);

    assert_eq!(registry.refresh().expect("refresh").total_students, 2);
    assert_eq!(registry.cache().load_count(), 3);
}

#[test]
fn unreadable_workbook_surfaces_as_storage_unavailable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = workbook_config(dir.path());
    std::fs::write(config.backend.path(), b"<html>not a workbook</html>").expect("corrupt");
    match Registry::open(config) {
        Err(error) => {
            assert!(matches!(error, AppError::StorageUnavailable(_)));
            assert_eq!(error.code(), "STORAGE_UNAVAILABLE");
        }
        Ok(_) => panic!("corrupt workbook should not open"),
    }
}
