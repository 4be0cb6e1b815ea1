use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Prefix for entity keys derived from an FSIC application number.
pub const FSIC_KEY_PREFIX: &str = "fsic:";
/// Prefix for entity keys derived from the record id itself.
pub const RECORD_KEY_PREFIX: &str = "rec:";

/// Source label for `PREVIOUS` snapshots when the caller supplies none.
pub const SOURCE_UNKNOWN: &str = "Unknown";
/// Source label stamped on every `RENEWED` snapshot.
pub const SOURCE_RENEWED: &str = "Renewed";

/// Opaque, string-comparable record identifier.
///
/// ULIDs are time-prefixed, so string ordering follows creation order and
/// ids are only ever compared as strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    Previous,
    Renewed,
}

impl HistoryAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Previous => "PREVIOUS",
            Self::Renewed => "RENEWED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PREVIOUS" => Some(Self::Previous),
            "RENEWED" => Some(Self::Renewed),
            _ => None,
        }
    }
}

/// One flat fire-safety inspection record.
///
/// All inspection fields default to empty strings so that partial client
/// payloads deserialize cleanly; unknown fields are dropped by serde, which
/// is the sanitization boundary for renewal submissions. The wire shape is
/// camelCase to match the certificate/template field mapping downstream.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InspectionRecord {
    #[serde(default)]
    pub id: RecordId,
    #[serde(default = "OffsetDateTime::now_utc", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub renewed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub entity_key: Option<String>,
    #[serde(default)]
    pub owner_name: String,
    #[serde(default)]
    pub establishment_name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub fsic_app_no: String,
    #[serde(default)]
    pub fsic_no: String,
    #[serde(default)]
    pub fsic_validity: String,
    #[serde(default)]
    pub inspection_order_no: String,
    #[serde(default)]
    pub inspection_order_date: String,
    #[serde(default)]
    pub nfsi_no: String,
    #[serde(default)]
    pub nfsi_date: String,
    #[serde(default)]
    pub or_no: String,
    #[serde(default)]
    pub or_amount: String,
    #[serde(default)]
    pub or_date: String,
    #[serde(default)]
    pub defects: String,
    #[serde(default)]
    pub inspectors: String,
    #[serde(default)]
    pub building_desc: String,
    #[serde(default)]
    pub storeys: String,
    #[serde(default)]
    pub floor_area: String,
    #[serde(default)]
    pub occupancy_type: String,
    #[serde(default)]
    pub remarks: String,
    #[serde(default)]
    pub team_leader: String,
}

impl InspectionRecord {
    /// Empty record with a fresh id and the given creation instant.
    #[must_use]
    pub fn new(created_at: OffsetDateTime) -> Self {
        Self {
            id: RecordId::new(),
            created_at,
            renewed_at: None,
            entity_key: None,
            owner_name: String::new(),
            establishment_name: String::new(),
            address: String::new(),
            fsic_app_no: String::new(),
            fsic_no: String::new(),
            fsic_validity: String::new(),
            inspection_order_no: String::new(),
            inspection_order_date: String::new(),
            nfsi_no: String::new(),
            nfsi_date: String::new(),
            or_no: String::new(),
            or_amount: String::new(),
            or_date: String::new(),
            defects: String::new(),
            inspectors: String::new(),
            building_desc: String::new(),
            storeys: String::new(),
            floor_area: String::new(),
            occupancy_type: String::new(),
            remarks: String::new(),
            team_leader: String::new(),
        }
    }

    /// Derive a stable entity key for this record.
    ///
    /// An existing non-empty key is kept verbatim and never recomputed.
    /// Otherwise a trimmed non-empty `fsic_app_no` yields `fsic:<value>`,
    /// with `rec:<id>` as the final fallback. Idempotent.
    #[must_use]
    pub fn resolve_entity_key(mut self) -> Self {
        if !normalize_key(self.entity_key.as_deref()).is_empty() {
            return self;
        }

        let app_no = self.fsic_app_no.trim();
        self.entity_key = Some(if app_no.is_empty() {
            format!("{RECORD_KEY_PREFIX}{}", self.id)
        } else {
            format!("{FSIC_KEY_PREFIX}{app_no}")
        });
        self
    }

    /// The trimmed entity key, or an empty string when none is set.
    #[must_use]
    pub fn normalized_entity_key(&self) -> String {
        normalize_key(self.entity_key.as_deref())
    }
}

/// One append-only renewal history event keyed by entity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub entity_key: String,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
    pub action: HistoryAction,
    pub data: InspectionRecord,
}

impl HistoryEvent {
    /// Check the invariants every appended history event must satisfy.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] when the entity key or source
    /// is empty, or when a `RENEWED` snapshot carries a different key than
    /// the event itself.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let key = normalize_key(Some(&self.entity_key));
        if key.is_empty() {
            return Err(RegistryError::Validation(
                "entityKey MUST be non-empty for every history event".to_string(),
            ));
        }

        if self.source.trim().is_empty() {
            return Err(RegistryError::Validation(
                "source MUST be provided for every history event".to_string(),
            ));
        }

        if self.action == HistoryAction::Renewed && self.data.normalized_entity_key() != key {
            return Err(RegistryError::Validation(
                "RENEWED snapshot entityKey MUST equal the event entityKey".to_string(),
            ));
        }

        Ok(())
    }
}

/// Trim a client-supplied key; `None` becomes the empty string.
///
/// Key comparison everywhere in the registry is exact, case-sensitive
/// string equality after this normalization and nothing else.
#[must_use]
pub fn normalize_key(raw: Option<&str>) -> String {
    raw.map(str::trim).unwrap_or_default().to_string()
}

/// Construct the new record appended as a `RENEWED` snapshot.
///
/// Only the allow-listed inspection fields are copied from `updated`; its
/// id, timestamps, and entity key are discarded. The new record gets a
/// fresh id, `created_at` and `renewed_at` both set to `now`, and the
/// effective entity key of the renewal.
#[must_use]
pub fn build_renewed_record(
    updated: &InspectionRecord,
    entity_key: &str,
    now: OffsetDateTime,
) -> InspectionRecord {
    let record = InspectionRecord {
        id: RecordId::new(),
        created_at: now,
        renewed_at: Some(now),
        entity_key: Some(entity_key.trim().to_string()),
        owner_name: updated.owner_name.clone(),
        establishment_name: updated.establishment_name.clone(),
        address: updated.address.clone(),
        fsic_app_no: updated.fsic_app_no.clone(),
        fsic_no: updated.fsic_no.clone(),
        fsic_validity: updated.fsic_validity.clone(),
        inspection_order_no: updated.inspection_order_no.clone(),
        inspection_order_date: updated.inspection_order_date.clone(),
        nfsi_no: updated.nfsi_no.clone(),
        nfsi_date: updated.nfsi_date.clone(),
        or_no: updated.or_no.clone(),
        or_amount: updated.or_amount.clone(),
        or_date: updated.or_date.clone(),
        defects: updated.defects.clone(),
        inspectors: updated.inspectors.clone(),
        building_desc: updated.building_desc.clone(),
        storeys: updated.storeys.clone(),
        floor_area: updated.floor_area.clone(),
        occupancy_type: updated.occupancy_type.clone(),
        remarks: updated.remarks.clone(),
        team_leader: updated.team_leader.clone(),
    };
    record.resolve_entity_key()
}

/// Fold the history log into the single authoritative record for one entity.
///
/// Returns `None` for an empty key or when the entity has no `RENEWED`
/// events; absence is a normal outcome, not an error. Ties on `changed_at`
/// are broken by log-append order (stable sort, last entry wins).
#[must_use]
pub fn latest_renewed(events: &[HistoryEvent], entity_key: &str) -> Option<InspectionRecord> {
    let key = normalize_key(Some(entity_key));
    if key.is_empty() {
        return None;
    }

    let mut matching: Vec<&HistoryEvent> = events
        .iter()
        .filter(|event| {
            event.action == HistoryAction::Renewed
                && normalize_key(Some(&event.entity_key)) == key
        })
        .collect();
    if matching.is_empty() {
        return None;
    }

    matching.sort_by(|lhs, rhs| lhs.changed_at.cmp(&rhs.changed_at));
    matching.last().map(|event| event.data.clone().resolve_entity_key())
}

/// Project every `RENEWED` snapshot in log order.
///
/// This is the broad data-manager view: all renewals, not just the latest
/// one per entity.
#[must_use]
pub fn list_renewed(events: &[HistoryEvent]) -> Vec<InspectionRecord> {
    events
        .iter()
        .filter(|event| event.action == HistoryAction::Renewed)
        .map(|event| event.data.clone().resolve_entity_key())
        .collect()
}

/// Replace each archived record with its latest renewal where one exists.
///
/// Records whose entity has never been renewed pass through unchanged
/// (key-resolved). Used by the month-export flow.
#[must_use]
pub fn substitute_renewals(
    archived: &[InspectionRecord],
    events: &[HistoryEvent],
) -> Vec<InspectionRecord> {
    archived
        .iter()
        .map(|record| {
            let resolved = record.clone().resolve_entity_key();
            let key = resolved.normalized_entity_key();
            latest_renewed(events, &key).unwrap_or(resolved)
        })
        .collect()
}

/// Archive bucket key for the given instant, `YYYY-MM` with a zero-padded
/// month.
#[must_use]
pub fn month_key(now: OffsetDateTime) -> String {
    format!("{:04}-{:02}", now.year(), u8::from(now.month()))
}
