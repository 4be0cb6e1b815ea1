use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fsic_registry_core::{
    normalize_key, HistoryAction, HistoryEvent, InspectionRecord, RecordId,
};
use rusqlite::{params, Connection, DatabaseName};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS current_records (
  id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  record_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS archive_records (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  month TEXT NOT NULL,
  id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  record_json TEXT NOT NULL,
  UNIQUE(month, id)
);

CREATE TABLE IF NOT EXISTS history_events (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entity_key TEXT NOT NULL,
  source TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('PREVIOUS','RENEWED')),
  changed_at TEXT NOT NULL,
  record_id TEXT NOT NULL,
  event_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_current_records_created_at ON current_records(created_at);
CREATE INDEX IF NOT EXISTS idx_archive_records_month ON archive_records(month);
CREATE INDEX IF NOT EXISTS idx_history_events_entity_key ON history_events(entity_key);
CREATE INDEX IF NOT EXISTS idx_history_events_record_id ON history_events(record_id);
";

// v2 introduces stable entity keys on the record tables; legacy databases
// only carried them inside the history log.
const MIGRATION_002_SQL: &str = r"
ALTER TABLE current_records ADD COLUMN entity_key TEXT;
ALTER TABLE archive_records ADD COLUMN entity_key TEXT;
CREATE INDEX IF NOT EXISTS idx_current_records_entity_key ON current_records(entity_key);
CREATE INDEX IF NOT EXISTS idx_archive_records_entity_key ON archive_records(entity_key);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

/// One archived record together with its `YYYY-MM` bucket.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedRecord {
    pub month: String,
    pub record: InspectionRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_current: usize,
    pub skipped_existing_current: usize,
    pub imported_archive: usize,
    pub skipped_existing_archive: usize,
    pub imported_history: usize,
    pub skipped_existing_history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

const CURRENT_NDJSON: &str = "current_records.ndjson";
const ARCHIVE_NDJSON: &str = "archive_records.ndjson";
const HISTORY_NDJSON: &str = "history_events.ndjson";

impl SqliteStore {
    /// Open the registry database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        let has_current_records = table_exists(&self.conn, "current_records")?;

        if !has_current_records {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "current_records", "entity_key")? {
            // Database already in v2 shape but missing migration records.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        // Legacy v1 tables exist; mark version 1 and allow the standard v2
        // upgrade with entity-key backfill.
        record_schema_version(&self.conn, 1)?;
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "current_records", "entity_key")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to add entity_key columns")?;

        backfill_entity_keys(&tx, "current_records")?;
        backfill_entity_keys(&tx, "archive_records")?;

        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now],
        )
        .context("failed to record migration version 2")?;

        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Insert one record into the current store.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails (including a
    /// duplicate record id).
    pub fn insert_current(&mut self, record: &InspectionRecord) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO current_records(id, created_at, entity_key, record_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.to_string(),
                rfc3339(record.created_at)?,
                entity_key_column(record),
                serde_json::to_string(record).context("failed to serialize record")?,
            ],
        )
        .context("failed to insert current record")?;
        tx.commit().context("failed to commit current record insert")?;
        Ok(())
    }

    /// Load the current store in creation order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_current(&self) -> Result<Vec<InspectionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_json FROM current_records ORDER BY created_at ASC, id ASC",
        )?;
        collect_record_rows(&mut stmt)
    }

    /// Remove one record from the current store by id.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_current(&mut self, id: &RecordId) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM current_records WHERE id = ?1", params![id.to_string()])
            .context("failed to delete current record")?;
        Ok(removed > 0)
    }

    /// Move every current record into the given month bucket.
    ///
    /// The move is one transaction: the archive copy and the current-store
    /// delete either both happen or neither does. Returns the number of
    /// records moved (zero when the current store was already empty).
    ///
    /// # Errors
    /// Returns an error when any statement in the transaction fails.
    pub fn close_month(&mut self, month: &str) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start close-month transaction")?;
        let moved = tx
            .execute(
                "INSERT INTO archive_records(month, id, created_at, entity_key, record_json)
                 SELECT ?1, id, created_at, entity_key, record_json
                 FROM current_records
                 ORDER BY created_at ASC, id ASC",
                params![month],
            )
            .context("failed to copy current records into archive")?;
        tx.execute("DELETE FROM current_records", [])
            .context("failed to clear current store")?;
        tx.commit().context("failed to commit close-month transaction")?;
        Ok(moved)
    }

    /// Distinct archive month keys, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn archive_months(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT month FROM archive_records ORDER BY month ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut months = Vec::new();
        for row in rows {
            months.push(row?);
        }
        Ok(months)
    }

    /// Load one archive month bucket in archival order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_archive(&self, month: &str) -> Result<Vec<InspectionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_json FROM archive_records WHERE month = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![month], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(record_from_json(&row?)?);
        }
        Ok(records)
    }

    /// Remove one archived record by month and id.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_archived(&mut self, month: &str, id: &RecordId) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM archive_records WHERE month = ?1 AND id = ?2",
                params![month, id.to_string()],
            )
            .context("failed to delete archived record")?;
        Ok(removed > 0)
    }

    /// Append history events in submission order as one transaction.
    ///
    /// Every event is validated first; nothing is persisted when any event
    /// is invalid. No reordering, no deduplication.
    ///
    /// # Errors
    /// Returns an error when validation or any insert in the transaction
    /// fails.
    pub fn append_history(&mut self, events: &[HistoryEvent]) -> Result<()> {
        for event in events {
            event.validate().map_err(|err| anyhow!("history event rejected: {err}"))?;
        }

        let tx = self.conn.transaction().context("failed to start history transaction")?;
        for event in events {
            tx.execute(
                "INSERT INTO history_events(entity_key, source, action, changed_at, record_id, event_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    normalize_key(Some(&event.entity_key)),
                    event.source,
                    event.action.as_str(),
                    rfc3339(event.changed_at)?,
                    event.data.id.to_string(),
                    serde_json::to_string(event).context("failed to serialize history event")?,
                ],
            )
            .context("failed to insert history event")?;
        }
        tx.commit().context("failed to commit history transaction")?;
        Ok(())
    }

    /// Load history events in log-append order, optionally filtered by
    /// normalized entity key and action.
    ///
    /// Time ordering is the reconciler's job, not the log's.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_history(
        &self,
        entity_key: Option<&str>,
        action: Option<HistoryAction>,
    ) -> Result<Vec<HistoryEvent>> {
        let key = entity_key.map(|raw| normalize_key(Some(raw)));
        let mut stmt = self.conn.prepare(
            "SELECT event_json FROM history_events
             WHERE (?1 IS NULL OR entity_key = ?1)
               AND (?2 IS NULL OR action = ?2)
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(
            params![key, action.map(HistoryAction::as_str)],
            |row| row.get::<_, String>(0),
        )?;

        let mut events = Vec::new();
        for row in rows {
            let raw = row?;
            let event = serde_json::from_str::<HistoryEvent>(&raw)
                .context("failed to deserialize history event row")?;
            events.push(event);
        }
        Ok(events)
    }

    /// Remove all `RENEWED` events whose snapshot id matches.
    ///
    /// `PREVIOUS` events and renewals of other records are retained; this is
    /// the only delete path against the history log.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_renewed_by_record_id(&mut self, id: &RecordId) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM history_events WHERE action = 'RENEWED' AND record_id = ?1",
                params![id.to_string()],
            )
            .context("failed to delete renewed history events")?;
        Ok(removed)
    }

    /// Export the three collections as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or
    /// serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let current = self.list_current()?;
        let archive = self.list_archive_all()?;
        let history = self.list_history(None, None)?;

        let current_digest = write_ndjson_file(&out_dir.join(CURRENT_NDJSON), &current)?;
        let archive_digest = write_ndjson_file(&out_dir.join(ARCHIVE_NDJSON), &archive)?;
        let history_digest = write_ndjson_file(&out_dir.join(HISTORY_NDJSON), &history)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: CURRENT_NDJSON.to_string(),
                    sha256: current_digest.0,
                    records: current_digest.1,
                },
                ExportFileDigest {
                    path: ARCHIVE_NDJSON.to_string(),
                    sha256: archive_digest.0,
                    records: archive_digest.1,
                },
                ExportFileDigest {
                    path: HISTORY_NDJSON.to_string(),
                    sha256: history_digest.0,
                    records: history_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest verification, duplicate
    /// handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut summary = ImportSummary {
            imported_current: 0,
            skipped_existing_current: 0,
            imported_archive: 0,
            skipped_existing_archive: 0,
            imported_history: 0,
            skipped_existing_history: 0,
        };

        for record in read_ndjson_file::<InspectionRecord>(&in_dir.join(CURRENT_NDJSON))? {
            if self.current_exists(&record.id)? {
                if skip_existing {
                    summary.skipped_existing_current += 1;
                    continue;
                }
                return Err(anyhow!("current record already exists for id {}", record.id));
            }
            self.insert_current(&record)?;
            summary.imported_current += 1;
        }

        for entry in read_ndjson_file::<ArchivedRecord>(&in_dir.join(ARCHIVE_NDJSON))? {
            if self.archived_exists(&entry.month, &entry.record.id)? {
                if skip_existing {
                    summary.skipped_existing_archive += 1;
                    continue;
                }
                return Err(anyhow!(
                    "archived record already exists for {} / {}",
                    entry.month,
                    entry.record.id
                ));
            }
            self.insert_archived(&entry)?;
            summary.imported_archive += 1;
        }

        for event in read_ndjson_file::<HistoryEvent>(&in_dir.join(HISTORY_NDJSON))? {
            if self.history_exists(&event)? {
                if skip_existing {
                    summary.skipped_existing_history += 1;
                    continue;
                }
                return Err(anyhow!(
                    "history event already exists for record {} at {}",
                    event.data.id,
                    rfc3339(event.changed_at)?
                ));
            }
            self.append_history(std::slice::from_ref(&event))?;
            summary.imported_history += 1;
        }

        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup
    /// fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to
    /// latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or
    /// migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn list_archive_all(&self) -> Result<Vec<ArchivedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT month, record_json FROM archive_records ORDER BY month ASC, seq ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut entries = Vec::new();
        for row in rows {
            let (month, raw) = row?;
            entries.push(ArchivedRecord { month, record: record_from_json(&raw)? });
        }
        Ok(entries)
    }

    fn insert_archived(&mut self, entry: &ArchivedRecord) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO archive_records(month, id, created_at, entity_key, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.month,
                entry.record.id.to_string(),
                rfc3339(entry.record.created_at)?,
                entity_key_column(&entry.record),
                serde_json::to_string(&entry.record).context("failed to serialize record")?,
            ],
        )
        .context("failed to insert archived record")?;
        tx.commit().context("failed to commit archived record insert")?;
        Ok(())
    }

    fn current_exists(&self, id: &RecordId) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM current_records WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    fn archived_exists(&self, month: &str, id: &RecordId) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM archive_records WHERE month = ?1 AND id = ?2)",
            params![month, id.to_string()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    fn history_exists(&self, event: &HistoryEvent) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM history_events
                WHERE record_id = ?1 AND action = ?2 AND changed_at = ?3
             )",
            params![event.data.id.to_string(), event.action.as_str(), rfc3339(event.changed_at)?],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)?;
    Ok(())
}

fn backfill_entity_keys(tx: &rusqlite::Transaction<'_>, table: &str) -> Result<()> {
    let query = format!("SELECT rowid, record_json FROM {table}");
    let mut stmt = tx.prepare(&query)?;
    let rows =
        stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

    let mut resolved: Vec<(i64, String, String)> = Vec::new();
    for row in rows {
        let (rowid, raw) = row?;
        let record = record_from_json(&raw)?.resolve_entity_key();
        let key = record.normalized_entity_key();
        let json = serde_json::to_string(&record).context("failed to serialize record")?;
        resolved.push((rowid, key, json));
    }

    let update = format!("UPDATE {table} SET entity_key = ?1, record_json = ?2 WHERE rowid = ?3");
    for (rowid, key, json) in resolved {
        tx.execute(&update, params![key, json, rowid])
            .with_context(|| format!("failed to backfill entity_key in {table}"))?;
    }

    Ok(())
}

fn entity_key_column(record: &InspectionRecord) -> Option<String> {
    let key = record.normalized_entity_key();
    if key.is_empty() { None } else { Some(key) }
}

fn record_from_json(raw: &str) -> Result<InspectionRecord> {
    serde_json::from_str(raw).context("failed to deserialize inspection record row")
}

fn collect_record_rows(stmt: &mut rusqlite::Statement<'_>) -> Result<Vec<InspectionRecord>> {
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut records = Vec::new();
    for row in rows {
        records.push(record_from_json(&row?)?);
    }
    Ok(records)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "current_records")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "current_records", "entity_key")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [CURRENT_NDJSON, ARCHIVE_NDJSON, HISTORY_NDJSON] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use fsic_registry_core::{
        build_renewed_record, SOURCE_RENEWED, SOURCE_UNKNOWN,
    };
    use time::Duration;
    use ulid::Ulid;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn mem_store() -> SqliteStore {
        let mut store = match SqliteStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("in-memory store should open: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("in-memory store should migrate: {err}");
        }
        store
    }

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()));
        if let Err(err) = fs::create_dir_all(&dir) {
            panic!("failed to create temp dir {}: {err}", dir.display());
        }
        dir
    }

    fn mk_record(fsic_app_no: &str, owner_name: &str) -> InspectionRecord {
        let mut record = InspectionRecord::new(fixture_time());
        record.fsic_app_no = fsic_app_no.to_string();
        record.owner_name = owner_name.to_string();
        record.resolve_entity_key()
    }

    fn mk_renew_pair(old: &InspectionRecord, owner_name: &str) -> Vec<HistoryEvent> {
        let key = old.normalized_entity_key();
        let now = fixture_time() + Duration::days(1);
        let mut updated = old.clone();
        updated.owner_name = owner_name.to_string();
        let renewed = build_renewed_record(&updated, &key, now);

        vec![
            HistoryEvent {
                entity_key: key.clone(),
                source: SOURCE_UNKNOWN.to_string(),
                changed_at: now,
                action: HistoryAction::Previous,
                data: old.clone(),
            },
            HistoryEvent {
                entity_key: key,
                source: SOURCE_RENEWED.to_string(),
                changed_at: now,
                action: HistoryAction::Renewed,
                data: renewed,
            },
        ]
    }

    #[test]
    fn migrate_bootstraps_fresh_database_to_latest() {
        let store = mem_store();
        let status = match store.schema_status() {
            Ok(status) => status,
            Err(err) => panic!("schema status should load: {err}"),
        };
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
    }

    #[test]
    fn migrate_backfills_entity_keys_on_legacy_v1_database() {
        let mut store = match SqliteStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("in-memory store should open: {err}"),
        };
        if let Err(err) = store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL) {
            panic!("schema_migrations should apply: {err}");
        }
        if let Err(err) = apply_migration_1(&store.conn) {
            panic!("v1 schema should apply: {err}");
        }

        // Legacy rows never carried entity keys.
        let legacy = {
            let mut record = InspectionRecord::new(fixture_time());
            record.fsic_app_no = "F-100".to_string();
            record
        };
        let raw = match serde_json::to_string(&legacy) {
            Ok(raw) => raw,
            Err(err) => panic!("legacy record should serialize: {err}"),
        };
        if let Err(err) = store.conn.execute(
            "INSERT INTO current_records(id, created_at, record_json) VALUES (?1, ?2, ?3)",
            params![legacy.id.to_string(), "2024-01-01T00:00:00Z", raw],
        ) {
            panic!("legacy row should insert: {err}");
        }

        if let Err(err) = store.migrate() {
            panic!("migration to v2 should succeed: {err}");
        }

        let key: Option<String> = match store.conn.query_row(
            "SELECT entity_key FROM current_records WHERE id = ?1",
            params![legacy.id.to_string()],
            |row| row.get(0),
        ) {
            Ok(key) => key,
            Err(err) => panic!("backfilled row should load: {err}"),
        };
        assert_eq!(key.as_deref(), Some("fsic:F-100"));

        let records = match store.list_current() {
            Ok(records) => records,
            Err(err) => panic!("current records should list: {err}"),
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_key.as_deref(), Some("fsic:F-100"));
    }

    #[test]
    fn append_history_preserves_submission_order() {
        let mut store = mem_store();
        let old = mk_record("F-1", "A");
        let events = mk_renew_pair(&old, "B");
        if let Err(err) = store.append_history(&events) {
            panic!("history should append: {err}");
        }

        let log = match store.list_history(Some("fsic:F-1"), None) {
            Ok(log) => log,
            Err(err) => panic!("history should list: {err}"),
        };
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].action, HistoryAction::Previous);
        assert_eq!(log[1].action, HistoryAction::Renewed);
        assert_eq!(log[0].changed_at, log[1].changed_at);
        assert_eq!(log[1].data.owner_name, "B");
    }

    #[test]
    fn append_history_rejects_invalid_batch_without_persisting() {
        let mut store = mem_store();
        let old = mk_record("F-1", "A");
        let mut events = mk_renew_pair(&old, "B");
        events[1].entity_key = "  ".to_string();

        assert!(store.append_history(&events).is_err());
        let log = match store.list_history(None, None) {
            Ok(log) => log,
            Err(err) => panic!("history should list: {err}"),
        };
        assert!(log.is_empty());
    }

    #[test]
    fn list_history_filters_by_normalized_key_and_action() {
        let mut store = mem_store();
        let first = mk_record("F-1", "A");
        let second = mk_record("F-2", "C");
        if let Err(err) = store.append_history(&mk_renew_pair(&first, "B")) {
            panic!("history should append: {err}");
        }
        if let Err(err) = store.append_history(&mk_renew_pair(&second, "D")) {
            panic!("history should append: {err}");
        }

        let renewed = match store.list_history(Some("  fsic:F-1  "), Some(HistoryAction::Renewed)) {
            Ok(log) => log,
            Err(err) => panic!("history should list: {err}"),
        };
        assert_eq!(renewed.len(), 1);
        assert_eq!(renewed[0].data.owner_name, "B");

        let everything = match store.list_history(None, None) {
            Ok(log) => log,
            Err(err) => panic!("history should list: {err}"),
        };
        assert_eq!(everything.len(), 4);
    }

    #[test]
    fn delete_renewed_is_scoped_to_matching_snapshot_ids() {
        let mut store = mem_store();
        let first = mk_record("F-1", "A");
        let second = mk_record("F-2", "C");
        if let Err(err) = store.append_history(&mk_renew_pair(&first, "B")) {
            panic!("history should append: {err}");
        }
        if let Err(err) = store.append_history(&mk_renew_pair(&second, "D")) {
            panic!("history should append: {err}");
        }

        let renewed = match store.list_history(Some("fsic:F-1"), Some(HistoryAction::Renewed)) {
            Ok(log) => log,
            Err(err) => panic!("history should list: {err}"),
        };
        let target_id = renewed[0].data.id;

        let removed = match store.delete_renewed_by_record_id(&target_id) {
            Ok(removed) => removed,
            Err(err) => panic!("delete should succeed: {err}"),
        };
        assert_eq!(removed, 1);

        let remaining = match store.list_history(None, None) {
            Ok(log) => log,
            Err(err) => panic!("history should list: {err}"),
        };
        // Both PREVIOUS events and the other entity's RENEWED event survive.
        assert_eq!(remaining.len(), 3);
        assert!(remaining
            .iter()
            .filter(|event| event.action == HistoryAction::Previous)
            .count()
            == 2);
        assert!(remaining
            .iter()
            .all(|event| event.action != HistoryAction::Renewed || event.data.id != target_id));
    }

    #[test]
    fn close_month_moves_records_in_one_transaction() {
        let mut store = mem_store();
        for index in 0..3 {
            let record = mk_record(&format!("F-{index}"), "owner");
            if let Err(err) = store.insert_current(&record) {
                panic!("record should insert: {err}");
            }
        }

        let moved = match store.close_month("2024-02") {
            Ok(moved) => moved,
            Err(err) => panic!("close-month should succeed: {err}"),
        };
        assert_eq!(moved, 3);

        let current = match store.list_current() {
            Ok(current) => current,
            Err(err) => panic!("current records should list: {err}"),
        };
        assert!(current.is_empty());

        let archived = match store.list_archive("2024-02") {
            Ok(archived) => archived,
            Err(err) => panic!("archive should list: {err}"),
        };
        assert_eq!(archived.len(), 3);

        let moved_again = match store.close_month("2024-02") {
            Ok(moved) => moved,
            Err(err) => panic!("close-month should succeed: {err}"),
        };
        assert_eq!(moved_again, 0);
    }

    #[test]
    fn delete_current_and_archived_report_row_presence() {
        let mut store = mem_store();
        let record = mk_record("F-1", "A");
        if let Err(err) = store.insert_current(&record) {
            panic!("record should insert: {err}");
        }

        assert_eq!(store.delete_current(&record.id).ok(), Some(true));
        assert_eq!(store.delete_current(&record.id).ok(), Some(false));
        assert_eq!(store.delete_archived("2024-02", &record.id).ok(), Some(false));
    }

    #[test]
    fn export_and_import_round_trip_with_manifest_verification() {
        let mut store = mem_store();
        let current = mk_record("F-1", "A");
        if let Err(err) = store.insert_current(&current) {
            panic!("record should insert: {err}");
        }
        let archived = mk_record("F-2", "B");
        if let Err(err) = store.insert_current(&archived) {
            panic!("record should insert: {err}");
        }
        if let Err(err) = store.close_month("2024-01") {
            panic!("close-month should succeed: {err}");
        }
        let fresh = mk_record("F-3", "C");
        if let Err(err) = store.insert_current(&fresh) {
            panic!("record should insert: {err}");
        }
        if let Err(err) = store.append_history(&mk_renew_pair(&archived, "B2")) {
            panic!("history should append: {err}");
        }

        let out_dir = unique_temp_dir("fsic-registry-export");
        let manifest = match store.export_snapshot(&out_dir) {
            Ok(manifest) => manifest,
            Err(err) => panic!("export should succeed: {err}"),
        };
        assert_eq!(manifest.files.len(), 3);

        let mut target = mem_store();
        let summary = match target.import_snapshot(&out_dir, true) {
            Ok(summary) => summary,
            Err(err) => panic!("import should succeed: {err}"),
        };
        assert_eq!(summary.imported_current, 1);
        assert_eq!(summary.imported_archive, 2);
        assert_eq!(summary.imported_history, 2);

        // Re-import skips everything.
        let second = match target.import_snapshot(&out_dir, true) {
            Ok(summary) => summary,
            Err(err) => panic!("re-import should succeed: {err}"),
        };
        assert_eq!(second.imported_current, 0);
        assert_eq!(second.skipped_existing_history, 2);

        let _ = fs::remove_dir_all(&out_dir);
    }

    #[test]
    fn import_rejects_tampered_snapshot_files() {
        let mut store = mem_store();
        let record = mk_record("F-1", "A");
        if let Err(err) = store.insert_current(&record) {
            panic!("record should insert: {err}");
        }

        let out_dir = unique_temp_dir("fsic-registry-tamper");
        if let Err(err) = store.export_snapshot(&out_dir) {
            panic!("export should succeed: {err}");
        }

        let tampered_path = out_dir.join(CURRENT_NDJSON);
        let mut body = match fs::read_to_string(&tampered_path) {
            Ok(body) => body,
            Err(err) => panic!("export file should read: {err}"),
        };
        body.push_str("{\"ownerName\":\"smuggled\"}\n");
        if let Err(err) = fs::write(&tampered_path, body) {
            panic!("tampered file should write: {err}");
        }

        let mut target = mem_store();
        assert!(target.import_snapshot(&out_dir, true).is_err());

        let _ = fs::remove_dir_all(&out_dir);
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let dir = unique_temp_dir("fsic-registry-backup");
        let db_path = dir.join("registry.sqlite3");
        let backup_path = dir.join("backup.sqlite3");

        {
            let mut store = match SqliteStore::open(&db_path) {
                Ok(store) => store,
                Err(err) => panic!("store should open: {err}"),
            };
            if let Err(err) = store.migrate() {
                panic!("store should migrate: {err}");
            }
            let record = mk_record("F-1", "A");
            if let Err(err) = store.insert_current(&record) {
                panic!("record should insert: {err}");
            }
            if let Err(err) = store.backup_database(&backup_path) {
                panic!("backup should succeed: {err}");
            }
        }

        let restored_path = dir.join("restored.sqlite3");
        let mut restored = match SqliteStore::open(&restored_path) {
            Ok(store) => store,
            Err(err) => panic!("store should open: {err}"),
        };
        if let Err(err) = restored.restore_database(&backup_path) {
            panic!("restore should succeed: {err}");
        }

        let records = match restored.list_current() {
            Ok(records) => records,
            Err(err) => panic!("restored records should list: {err}"),
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_key.as_deref(), Some("fsic:F-1"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn integrity_check_reports_healthy_database() {
        let store = mem_store();
        let report = match store.integrity_check() {
            Ok(report) => report,
            Err(err) => panic!("integrity check should run: {err}"),
        };
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
    }

    #[test]
    fn history_action_check_constraint_rejects_unknown_actions() {
        let store = mem_store();
        let result = store.conn.execute(
            "INSERT INTO history_events(entity_key, source, action, changed_at, record_id, event_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params!["fsic:F-1", "Unknown", "ROLLED_BACK", "2024-01-01T00:00:00Z", "x", "{}"],
        );
        assert!(result.is_err());
    }
}
