use std::path::PathBuf;

use anyhow::{anyhow, Result};
use fsic_registry_core::{
    build_renewed_record, latest_renewed, list_renewed, month_key, normalize_key,
    substitute_renewals, HistoryAction, HistoryEvent, InspectionRecord, RecordId, SOURCE_RENEWED,
    SOURCE_UNKNOWN,
};
use fsic_registry_store_sqlite::{
    ArchivedRecord, ExportManifest, ImportSummary, IntegrityReport, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Renewal submission: the record being superseded plus the operator-edited
/// replacement, with an optional explicit entity key override.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenewRequest {
    pub old_record: InspectionRecord,
    pub updated_record: InspectionRecord,
    #[serde(default)]
    pub entity_key: Option<String>,
    /// Label for the `PREVIOUS` snapshot's origin; defaults to `"Unknown"`.
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenewResult {
    pub entity_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
    pub previous: InspectionRecord,
    pub renewed: InspectionRecord,
}

/// Close-month outcome. An empty current store is a soft failure, not an
/// error: `success` is false and `message` explains why.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloseMonthResult {
    pub success: bool,
    pub month: String,
    pub moved: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct RegistryApi {
    db_path: PathBuf,
}

impl RegistryApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Add one record to the current store, resolving its entity key first.
    ///
    /// # Errors
    /// Returns an error when persistence fails (including a duplicate id).
    pub fn add_record(&self, record: InspectionRecord) -> Result<InspectionRecord> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let record = record.resolve_entity_key();
        store.insert_current(&record)?;
        Ok(record)
    }

    /// List the current store in creation order.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_current(&self) -> Result<Vec<InspectionRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_current()
    }

    /// Remove one current record by id.
    ///
    /// # Errors
    /// Returns an error when the record does not exist or the delete fails.
    pub fn delete_current(&self, id: &RecordId) -> Result<DeleteResult> {
        let mut store = self.open_store()?;
        store.migrate()?;
        if store.delete_current(id)? {
            Ok(DeleteResult { removed: 1 })
        } else {
            Err(anyhow!("current record not found: {id}"))
        }
    }

    /// Record one renewal as an atomic `PREVIOUS` + `RENEWED` event pair.
    ///
    /// The effective entity key is the explicit override when present, else
    /// the old record's resolved key. Both events share one `changed_at`
    /// instant and are appended in one transaction; partial pairs cannot
    /// reach the log.
    ///
    /// # Errors
    /// Returns an error when event validation or log persistence fails.
    pub fn renew(&self, input: RenewRequest) -> Result<RenewResult> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let old = input.old_record.resolve_entity_key();
        let entity_key = {
            let explicit = normalize_key(input.entity_key.as_deref());
            if explicit.is_empty() { old.normalized_entity_key() } else { explicit }
        };

        let changed_at = OffsetDateTime::now_utc();
        let renewed = build_renewed_record(&input.updated_record, &entity_key, changed_at);
        let previous_source = input
            .source
            .map(|source| source.trim().to_string())
            .filter(|source| !source.is_empty())
            .unwrap_or_else(|| SOURCE_UNKNOWN.to_string());

        let events = [
            HistoryEvent {
                entity_key: entity_key.clone(),
                source: previous_source,
                changed_at,
                action: HistoryAction::Previous,
                data: old.clone(),
            },
            HistoryEvent {
                entity_key: entity_key.clone(),
                source: SOURCE_RENEWED.to_string(),
                changed_at,
                action: HistoryAction::Renewed,
                data: renewed.clone(),
            },
        ];
        store.append_history(&events)?;

        Ok(RenewResult { entity_key, changed_at, previous: old, renewed })
    }

    /// Move the current store into an archive month bucket.
    ///
    /// Defaults to the current UTC month when no month is given. An empty
    /// current store returns a soft failure instead of an error.
    ///
    /// # Errors
    /// Returns an error when the archival transaction fails.
    pub fn close_month(&self, month: Option<String>) -> Result<CloseMonthResult> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let month = month.unwrap_or_else(|| month_key(OffsetDateTime::now_utc()));
        if store.list_current()?.is_empty() {
            return Ok(CloseMonthResult {
                success: false,
                month,
                moved: 0,
                message: Some("No records".to_string()),
            });
        }

        let moved = store.close_month(&month)?;
        Ok(CloseMonthResult { success: true, month, moved, message: None })
    }

    /// The authoritative latest renewal for one entity, or `None`.
    ///
    /// # Errors
    /// Returns an error when the history log cannot be read.
    pub fn latest_renewed(&self, entity_key: &str) -> Result<Option<InspectionRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let events = store.list_history(Some(entity_key), Some(HistoryAction::Renewed))?;
        Ok(latest_renewed(&events, entity_key))
    }

    /// Every `RENEWED` snapshot in log order, across all entities.
    ///
    /// # Errors
    /// Returns an error when the history log cannot be read.
    pub fn list_all_renewed(&self) -> Result<Vec<InspectionRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let events = store.list_history(None, Some(HistoryAction::Renewed))?;
        Ok(list_renewed(&events))
    }

    /// Raw history events, optionally filtered by entity key and action.
    ///
    /// # Errors
    /// Returns an error when the history log cannot be read.
    pub fn list_history(
        &self,
        entity_key: Option<&str>,
        action: Option<HistoryAction>,
    ) -> Result<Vec<HistoryEvent>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_history(entity_key, action)
    }

    /// Remove all `RENEWED` events carrying the given snapshot id.
    ///
    /// `PREVIOUS` events are never deleted through this path.
    ///
    /// # Errors
    /// Returns an error when no matching event exists or the delete fails.
    pub fn delete_renewed(&self, id: &RecordId) -> Result<DeleteResult> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let removed = store.delete_renewed_by_record_id(id)?;
        if removed == 0 {
            return Err(anyhow!("no renewed history event found for record: {id}"));
        }
        Ok(DeleteResult { removed })
    }

    /// Distinct archive months, oldest first.
    ///
    /// # Errors
    /// Returns an error when the archive cannot be read.
    pub fn archive_months(&self) -> Result<Vec<String>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.archive_months()
    }

    /// One archive month bucket in archival order.
    ///
    /// # Errors
    /// Returns an error when the archive cannot be read.
    pub fn list_archive(&self, month: &str) -> Result<Vec<InspectionRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_archive(month)
    }

    /// Remove one archived record by month and id.
    ///
    /// # Errors
    /// Returns an error when the record does not exist or the delete fails.
    pub fn delete_archived(&self, month: &str, id: &RecordId) -> Result<DeleteResult> {
        let mut store = self.open_store()?;
        store.migrate()?;
        if store.delete_archived(month, id)? {
            Ok(DeleteResult { removed: 1 })
        } else {
            Err(anyhow!("archived record not found: {month}/{id}"))
        }
    }

    /// Export one archive month with each record replaced by its latest
    /// renewal where one exists.
    ///
    /// # Errors
    /// Returns an error when the archive or history log cannot be read.
    pub fn export_month(&self, month: &str) -> Result<Vec<InspectionRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let archived = store.list_archive(month)?;
        let events = store.list_history(None, Some(HistoryAction::Renewed))?;
        Ok(substitute_renewals(&archived, &events))
    }

    /// Export the whole database as an NDJSON snapshot directory.
    ///
    /// # Errors
    /// Returns an error when export serialization or file writes fail.
    pub fn export_snapshot(&self, out_dir: PathBuf) -> Result<ExportManifest> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.export_snapshot(&out_dir)
    }

    /// Import a previously exported snapshot directory.
    ///
    /// # Errors
    /// Returns an error when manifest verification or writes fail.
    pub fn import_snapshot(&self, in_dir: PathBuf, skip_existing: bool) -> Result<ImportSummary> {
        let mut store = self.open_store()?;
        store.import_snapshot(&in_dir, skip_existing)
    }

    /// Create a `SQLite` backup file of the registry database.
    ///
    /// # Errors
    /// Returns an error when the backup cannot be created.
    pub fn backup_database(&self, out_file: PathBuf) -> Result<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.backup_database(&out_file)
    }

    /// Restore the registry database from a `SQLite` backup file.
    ///
    /// # Errors
    /// Returns an error when restore or the follow-up migration fails.
    pub fn restore_database(&self, in_file: PathBuf) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(&in_file)
    }

    /// Run database health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Full archive contents grouped with their month buckets.
    ///
    /// # Errors
    /// Returns an error when the archive cannot be read.
    pub fn list_archive_all(&self) -> Result<Vec<ArchivedRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let mut entries = Vec::new();
        for month in store.archive_months()? {
            for record in store.list_archive(&month)? {
                entries.push(ArchivedRecord { month: month.clone(), record });
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("fsicregistry-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn mk_record(fsic_app_no: &str, owner_name: &str) -> InspectionRecord {
        let mut record = InspectionRecord::new(OffsetDateTime::now_utc());
        record.fsic_app_no = fsic_app_no.to_string();
        record.owner_name = owner_name.to_string();
        record
    }

    // Test IDs: TAPI-001
    #[test]
    fn api_add_renew_and_latest_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RegistryApi::new(db_path.clone());

        let old = api.add_record(mk_record("F-123", "A"))?;
        assert_eq!(old.entity_key.as_deref(), Some("fsic:F-123"));

        let mut updated = old.clone();
        updated.owner_name = "B".to_string();
        let result = api.renew(RenewRequest {
            old_record: old.clone(),
            updated_record: updated,
            entity_key: None,
            source: None,
        })?;
        assert_eq!(result.entity_key, "fsic:F-123");
        assert_eq!(result.previous.id, old.id);
        assert_ne!(result.renewed.id, old.id);
        assert_eq!(result.renewed.renewed_at, Some(result.changed_at));

        let latest = api.latest_renewed("fsic:F-123")?;
        assert_eq!(latest.map(|record| record.owner_name), Some("B".to_string()));

        let log = api.list_history(Some("fsic:F-123"), None)?;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].action, HistoryAction::Previous);
        assert_eq!(log[1].action, HistoryAction::Renewed);
        assert_eq!(log[0].changed_at, log[1].changed_at);
        assert_eq!(log[0].source, SOURCE_UNKNOWN);
        assert_eq!(log[1].source, SOURCE_RENEWED);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn api_renew_honors_explicit_entity_key_and_source_overrides() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RegistryApi::new(db_path.clone());

        let old = api.add_record(mk_record("F-1", "A"))?;
        let mut updated = old.clone();
        updated.owner_name = "B".to_string();

        let result = api.renew(RenewRequest {
            old_record: old,
            updated_record: updated,
            entity_key: Some("  fsic:OVERRIDE  ".to_string()),
            source: Some("Spreadsheet import".to_string()),
        })?;
        assert_eq!(result.entity_key, "fsic:OVERRIDE");
        assert_eq!(result.renewed.entity_key.as_deref(), Some("fsic:OVERRIDE"));

        assert!(api.latest_renewed("fsic:OVERRIDE")?.is_some());
        assert!(api.latest_renewed("fsic:F-1")?.is_none());

        let log = api.list_history(Some("fsic:OVERRIDE"), None)?;
        assert_eq!(log[0].source, "Spreadsheet import");
        assert_eq!(log[1].source, SOURCE_RENEWED);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn api_close_month_soft_fails_on_empty_store() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RegistryApi::new(db_path.clone());

        let empty = api.close_month(Some("2024-03".to_string()))?;
        assert!(!empty.success);
        assert_eq!(empty.message.as_deref(), Some("No records"));
        assert_eq!(empty.moved, 0);
        assert!(api.archive_months()?.is_empty());

        api.add_record(mk_record("F-1", "A"))?;
        api.add_record(mk_record("F-2", "B"))?;
        let closed = api.close_month(Some("2024-03".to_string()))?;
        assert!(closed.success);
        assert_eq!(closed.moved, 2);
        assert!(api.list_current()?.is_empty());
        assert_eq!(api.archive_months()?, vec!["2024-03".to_string()]);
        assert_eq!(api.list_archive("2024-03")?.len(), 2);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn api_export_month_substitutes_latest_renewals() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RegistryApi::new(db_path.clone());

        let renewed_entity = api.add_record(mk_record("F-1", "A"))?;
        api.add_record(mk_record("F-2", "C"))?;
        api.close_month(Some("2024-01".to_string()))?;

        let mut updated = renewed_entity.clone();
        updated.owner_name = "A2".to_string();
        api.renew(RenewRequest {
            old_record: renewed_entity,
            updated_record: updated,
            entity_key: None,
            source: None,
        })?;

        let exported = api.export_month("2024-01")?;
        assert_eq!(exported.len(), 2);
        let by_key = |key: &str| {
            exported
                .iter()
                .find(|record| record.entity_key.as_deref() == Some(key))
                .map(|record| record.owner_name.clone())
        };
        assert_eq!(by_key("fsic:F-1"), Some("A2".to_string()));
        assert_eq!(by_key("fsic:F-2"), Some("C".to_string()));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn api_delete_renewed_requires_a_matching_event() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RegistryApi::new(db_path.clone());

        let old = api.add_record(mk_record("F-1", "A"))?;
        let mut updated = old.clone();
        updated.owner_name = "B".to_string();
        let result = api.renew(RenewRequest {
            old_record: old,
            updated_record: updated,
            entity_key: None,
            source: None,
        })?;

        assert!(api.delete_renewed(&RecordId::new()).is_err());
        let removed = api.delete_renewed(&result.renewed.id)?;
        assert_eq!(removed.removed, 1);
        assert!(api.latest_renewed("fsic:F-1")?.is_none());

        // PREVIOUS stays in the log after the renewal is withdrawn.
        let log = api.list_history(Some("fsic:F-1"), None)?;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, HistoryAction::Previous);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn api_delete_current_and_archived_report_missing_rows() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RegistryApi::new(db_path.clone());

        let record = api.add_record(mk_record("F-1", "A"))?;
        assert!(api.delete_current(&RecordId::new()).is_err());
        assert_eq!(api.delete_current(&record.id)?.removed, 1);

        let archived = api.add_record(mk_record("F-2", "B"))?;
        api.close_month(Some("2024-04".to_string()))?;
        assert!(api.delete_archived("2024-05", &archived.id).is_err());
        assert_eq!(api.delete_archived("2024-04", &archived.id)?.removed, 1);
        assert!(api.list_archive("2024-04")?.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
