use crate::cache::SourceSignature;
use crate::cohort::is_valid_partition_name;
use crate::errors::{AppError, AppResult};
use crate::models::{
    EventType, NewParticipation, Participation, ParticipationRole, PartitionDescriptor, PartitionState, RecordId,
    StudentRecord,
};
use crate::store::{PartitionStore, RecordStore, WriteMode};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SEQUENCE_KEY: &str = "student_id_sequence";
const RECORD_COLUMNS: &str = "id, student_code, cohort, full_name, institution, program, district, \
                              contact_number, current_year, attributes_json, last_updated";
const PARTICIPATION_COLUMNS: &str = "participation_id, student_id, event_name, event_date, event_type, role, \
                                     hours, notes, created_at, updated_at";

/// Relational backend: canonical `students` table plus physical `cohort_<key>` tables.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        store.ensure_schema_extensions()?;
        store.ensure_sequence()?;
        tracing::debug!(path = %path.display(), "sqlite store opened");
        Ok(store)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn ensure_schema_extensions(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // Older databases predate free-form attributes.
        if !column_exists(&conn, "students", "attributes_json")? {
            conn.execute(
                "ALTER TABLE students ADD COLUMN attributes_json TEXT NOT NULL DEFAULT '{}'",
                [],
            )?;
        }
        Ok(())
    }

    fn ensure_sequence(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO registry_meta (key, value_json, updated_at)
             SELECT ?1, CAST(COALESCE(MAX(id), 0) AS TEXT), ?2 FROM students",
            params![SEQUENCE_KEY, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn signature(&self) -> AppResult<SourceSignature> {
        SourceSignature::of_path(&self.db_path)
    }

    fn list(&self) -> AppResult<Vec<StudentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM students ORDER BY id ASC", RECORD_COLUMNS))?;
        let rows = stmt.query_map([], record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn get(&self, id: RecordId) -> AppResult<StudentRecord> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM students WHERE id = ?1", RECORD_COLUMNS),
            [id],
            record_from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("Student {} not found", id)))
    }

    fn max_id(&self) -> AppResult<Option<RecordId>> {
        let conn = self.lock()?;
        let max: Option<i64> = conn.query_row("SELECT MAX(id) FROM students", [], |row| row.get(0))?;
        Ok(max)
    }

    fn insert(&self, record: &StudentRecord) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_student(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn update(&self, record: &StudentRecord) -> AppResult<()> {
        let conn = self.lock()?;
        update_student(&conn, record)
    }

    fn delete(&self, id: RecordId) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tables = list_partition_tables(&conn)?;
        let tx = conn.transaction()?;
        // Partition tables carry an ON DELETE CASCADE key; tables created outside the registry may not.
        for table in tables.iter().filter(|table| is_valid_partition_name(table)) {
            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", quote_ident(table)), [id])?;
        }
        tx.execute("DELETE FROM participations WHERE student_id = ?1", [id])?;
        let changed = tx.execute("DELETE FROM students WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("Student {} not found", id)));
        }
        tx.commit()?;
        Ok(())
    }

    fn load_sequence(&self) -> AppResult<RecordId> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value_json FROM registry_meta WHERE key = ?1",
                [SEQUENCE_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(serde_json::from_str::<i64>(&raw)?),
            None => Ok(0),
        }
    }

    fn store_sequence(&self, last_assigned: RecordId) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO registry_meta (key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![SEQUENCE_KEY, last_assigned.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn list_participations(&self, student_id: Option<RecordId>) -> AppResult<Vec<Participation>> {
        let conn = self.lock()?;
        let mut participations = Vec::new();
        match student_id {
            Some(student_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM participations WHERE student_id = ?1
                     ORDER BY event_date DESC, participation_id DESC",
                    PARTICIPATION_COLUMNS
                ))?;
                let rows = stmt.query_map([student_id], participation_from_row)?;
                for row in rows {
                    participations.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM participations ORDER BY event_date DESC, participation_id DESC",
                    PARTICIPATION_COLUMNS
                ))?;
                let rows = stmt.query_map([], participation_from_row)?;
                for row in rows {
                    participations.push(row?);
                }
            }
        }
        Ok(participations)
    }

    fn get_participation(&self, participation_id: i64) -> AppResult<Participation> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM participations WHERE participation_id = ?1",
                PARTICIPATION_COLUMNS
            ),
            [participation_id],
            participation_from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("Participation {} not found", participation_id)))
    }

    fn insert_participation(&self, payload: &NewParticipation, now: DateTime<Utc>) -> AppResult<Participation> {
        let conn = self.lock()?;
        let owner: Option<i64> = conn
            .query_row("SELECT id FROM students WHERE id = ?1", [payload.student_id], |row| row.get(0))
            .optional()?;
        if owner.is_none() {
            return Err(AppError::NotFound(format!("Student {} not found", payload.student_id)));
        }

        let participation = Participation {
            participation_id: 0,
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
        conn.execute(
            "INSERT INTO participations (
               student_id, event_name, event_date, event_type, role, hours, notes, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                participation.student_id,
                participation.event_name,
                participation.event_date.map(format_date),
                participation.event_type.as_str(),
                participation.role.as_str(),
                participation.hours,
                participation.notes,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        Ok(Participation {
            participation_id: conn.last_insert_rowid(),
            ..participation
        })
    }

    fn update_participation(&self, participation: &Participation) -> AppResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE participations SET
               event_name = ?2, event_date = ?3, event_type = ?4, role = ?5, hours = ?6, notes = ?7, updated_at = ?8
             WHERE participation_id = ?1",
            params![
                participation.participation_id,
                participation.event_name,
                participation.event_date.map(format_date),
                participation.event_type.as_str(),
                participation.role.as_str(),
                participation.hours,
                participation.notes,
                participation.updated_at.to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!(
                "Participation {} not found",
                participation.participation_id
            )));
        }
        Ok(())
    }

    fn delete_participation(&self, participation_id: i64) -> AppResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM participations WHERE participation_id = ?1",
            [participation_id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("Participation {} not found", participation_id)));
        }
        Ok(())
    }
}

impl PartitionStore for SqliteStore {
    fn partition_tables(&self) -> AppResult<Vec<String>> {
        let conn = self.lock()?;
        list_partition_tables(&conn)
    }

    fn partition_exists(&self, table: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        table_exists(&conn, table)
    }

    fn create_partition(&self, table: &str) -> AppResult<()> {
        if !is_valid_partition_name(table) {
            return Err(AppError::Validation(format!("Invalid partition name '{}'", table)));
        }
        let ident = quote_ident(table);
        let conn = self.lock()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {ident} (
               id INTEGER PRIMARY KEY REFERENCES students(id) ON DELETE CASCADE,
               student_code TEXT NOT NULL,
               cohort TEXT NOT NULL,
               full_name TEXT NOT NULL DEFAULT '',
               institution TEXT NOT NULL DEFAULT '',
               program TEXT NOT NULL DEFAULT '',
               district TEXT NOT NULL DEFAULT '',
               contact_number TEXT NOT NULL DEFAULT '',
               current_year TEXT NOT NULL DEFAULT '',
               attributes_json TEXT NOT NULL DEFAULT '{{}}',
               last_updated TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS {name_index} ON {ident}(full_name);
             CREATE INDEX IF NOT EXISTS {institution_index} ON {ident}(institution);",
            ident = ident,
            name_index = quote_ident(&format!("idx_{}_full_name", table)),
            institution_index = quote_ident(&format!("idx_{}_institution", table)),
        ))?;
        Ok(())
    }

    fn drop_partition(&self, table: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        if !table_exists(&conn, table)? {
            return Ok(false);
        }
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(table)))?;
        Ok(true)
    }

    fn upsert_partition_row(&self, table: &str, record: &StudentRecord) -> AppResult<()> {
        let conn = self.lock()?;
        upsert_partition_row(&conn, table, record)
    }

    fn backfill_partition(&self, table: &str, records: &[StudentRecord]) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO NOTHING",
                quote_ident(table),
                RECORD_COLUMNS
            ))?;
            for record in records {
                let attributes_json = serde_json::to_string(&record.attributes)?;
                inserted += stmt.execute(params![
                    record.id,
                    record.student_code,
                    record.cohort,
                    record.full_name,
                    record.institution,
                    record.program,
                    record.district,
                    record.contact_number,
                    record.current_year,
                    attributes_json,
                    record.last_updated.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn remove_partition_row(&self, table: &str, id: RecordId) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(&format!("DELETE FROM {} WHERE id = ?1", quote_ident(table)), [id])?;
        Ok(changed > 0)
    }

    fn partition_rows(&self, table: &str) -> AppResult<Vec<StudentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY id ASC",
            RECORD_COLUMNS,
            quote_ident(table)
        ))?;
        let rows = stmt.query_map([], record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn write_mirrored(
        &self,
        record: &StudentRecord,
        mode: WriteMode,
        mirror: Option<&str>,
        evict: Option<&str>,
    ) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        match mode {
            WriteMode::Insert => insert_student(&tx, record)?,
            WriteMode::Update => update_student(&tx, record)?,
        }
        if let Some(table) = mirror {
            upsert_partition_row(&tx, table, record)?;
        }
        if let Some(table) = evict {
            if table_exists(&tx, table)? {
                tx.execute(&format!("DELETE FROM {} WHERE id = ?1", quote_ident(table)), [record.id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn list_descriptors(&self) -> AppResult<Vec<PartitionDescriptor>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, label, table_name, state, created_at, populated_at
             FROM partition_registry ORDER BY key ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let state: String = row.get(3)?;
            let created_at: String = row.get(4)?;
            let populated_at: Option<String> = row.get(5)?;
            Ok(PartitionDescriptor {
                key: row.get(0)?,
                label: row.get(1)?,
                table: row.get(2)?,
                state: PartitionState::parse(&state),
                created_at: parse_time(&created_at)?,
                populated_at: populated_at.as_deref().map(parse_time).transpose()?,
            })
        })?;
        let mut descriptors = Vec::new();
        for row in rows {
            descriptors.push(row?);
        }
        Ok(descriptors)
    }

    fn save_descriptor(&self, descriptor: &PartitionDescriptor) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO partition_registry (key, label, table_name, state, created_at, populated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET
               label = excluded.label,
               table_name = excluded.table_name,
               state = excluded.state,
               populated_at = excluded.populated_at",
            params![
                descriptor.key,
                descriptor.label,
                descriptor.table,
                descriptor.state.as_str(),
                descriptor.created_at.to_rfc3339(),
                descriptor.populated_at.map(|at| at.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn remove_descriptor(&self, key: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM partition_registry WHERE key = ?1", [key])?;
        Ok(())
    }
}

/// Inserts into `students` and raises the persisted sequence; the caller owns the transaction.
fn insert_student(conn: &Connection, record: &StudentRecord) -> AppResult<()> {
    let attributes_json = serde_json::to_string(&record.attributes)?;
    conn.execute(
        &format!(
            "INSERT INTO students ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            RECORD_COLUMNS
        ),
        params![
            record.id,
            record.student_code,
            record.cohort,
            record.full_name,
            record.institution,
            record.program,
            record.district,
            record.contact_number,
            record.current_year,
            attributes_json,
            record.last_updated.to_rfc3339(),
        ],
    )?;
    conn.execute(
        "INSERT INTO registry_meta (key, value_json, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
           value_json = CASE
             WHEN CAST(registry_meta.value_json AS INTEGER) < CAST(excluded.value_json AS INTEGER)
             THEN excluded.value_json
             ELSE registry_meta.value_json
           END,
           updated_at = excluded.updated_at",
        params![SEQUENCE_KEY, record.id.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn update_student(conn: &Connection, record: &StudentRecord) -> AppResult<()> {
    let attributes_json = serde_json::to_string(&record.attributes)?;
    let changed = conn.execute(
        "UPDATE students SET
           student_code = ?2, cohort = ?3, full_name = ?4, institution = ?5, program = ?6,
           district = ?7, contact_number = ?8, current_year = ?9, attributes_json = ?10, last_updated = ?11
         WHERE id = ?1",
        params![
            record.id,
            record.student_code,
            record.cohort,
            record.full_name,
            record.institution,
            record.program,
            record.district,
            record.contact_number,
            record.current_year,
            attributes_json,
            record.last_updated.to_rfc3339(),
        ],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound(format!("Student {} not found", record.id)));
    }
    Ok(())
}

fn upsert_partition_row(conn: &Connection, table: &str, record: &StudentRecord) -> AppResult<()> {
    let attributes_json = serde_json::to_string(&record.attributes)?;
    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
               student_code = excluded.student_code,
               cohort = excluded.cohort,
               full_name = excluded.full_name,
               institution = excluded.institution,
               program = excluded.program,
               district = excluded.district,
               contact_number = excluded.contact_number,
               current_year = excluded.current_year,
               attributes_json = excluded.attributes_json,
               last_updated = excluded.last_updated",
            quote_ident(table),
            RECORD_COLUMNS
        ),
        params![
            record.id,
            record.student_code,
            record.cohort,
            record.full_name,
            record.institution,
            record.program,
            record.district,
            record.contact_number,
            record.current_year,
            attributes_json,
            record.last_updated.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn list_partition_tables(conn: &Connection) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name LIKE 'cohort\\_%' ESCAPE '\\'
         ORDER BY name ASC",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut tables = Vec::new();
    for row in rows {
        tables.push(row?);
    }
    Ok(tables)
}

fn table_exists(conn: &Connection, table: &str) -> AppResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", quote_ident(table));
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StudentRecord> {
    let attributes_json: String = row.get(9)?;
    let last_updated: String = row.get(10)?;
    Ok(StudentRecord {
        id: row.get(0)?,
        student_code: row.get(1)?,
        cohort: row.get(2)?,
        full_name: row.get(3)?,
        institution: row.get(4)?,
        program: row.get(5)?,
        district: row.get(6)?,
        contact_number: row.get(7)?,
        current_year: row.get(8)?,
        attributes: serde_json::from_str(&attributes_json).map_err(|error| conversion_error(9, error))?,
        last_updated: parse_time(&last_updated)?,
    })
}

fn participation_from_row(row: &Row<'_>) -> rusqlite::Result<Participation> {
    let event_date: Option<String> = row.get(3)?;
    let event_type: String = row.get(4)?;
    let role: String = row.get(5)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok(Participation {
        participation_id: row.get(0)?,
        student_id: row.get(1)?,
        event_name: row.get(2)?,
        event_date: event_date.as_deref().map(parse_date).transpose()?,
        event_type: EventType::parse(&event_type).unwrap_or_default(),
        role: ParticipationRole::parse(&role).unwrap_or_default(),
        hours: row.get(6)?,
        notes: row.get(7)?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|error| conversion_error(3, error))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(0, error))
}

fn conversion_error(column: usize, error: impl ToString) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
    )
}
