//! Domain Model
//!
//! Entities served by the source-of-truth and the durable catalog rows the
//! cache layer keeps beside the KV store.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Metadata collection name used for the relationship step.
pub const RELATIONSHIP_COLLECTION: &str = "relationship";

// =============================================================================
// Entity Types
// =============================================================================

/// Kind of entity the cache knows how to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Division,
    Section,
    Employee,
    Attendance,
}

impl EntityType {
    /// Organizational hierarchy types, in preload order.
    pub const HIERARCHY: [EntityType; 3] =
        [EntityType::Division, EntityType::Section, EntityType::Employee];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Division => "division",
            EntityType::Section => "section",
            EntityType::Employee => "employee",
            EntityType::Attendance => "attendance",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "division" | "divisions" => Ok(EntityType::Division),
            "section" | "sections" => Ok(EntityType::Section),
            "employee" | "employees" => Ok(EntityType::Employee),
            "attendance" => Ok(EntityType::Attendance),
            other => Err(Error::Config(format!("Unknown entity type: {}", other))),
        }
    }
}

/// An entity that can be written to the cache under its natural id.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Entity type tag
    const TYPE: EntityType;

    /// Natural identifier
    fn entity_id(&self) -> &str;
}

/// Link from a child record to one of its parents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParentLink {
    pub parent_type: EntityType,
    pub parent_id: String,
}

impl ParentLink {
    pub fn new(parent_type: EntityType, parent_id: impl Into<String>) -> Self {
        Self {
            parent_type,
            parent_id: parent_id.into(),
        }
    }
}

/// An entity that participates in the index registry and relationship graph.
pub trait Indexed: Entity {
    /// Secondary attributes to index, as `(index_key, index_value)`.
    fn index_values(&self) -> Vec<(&'static str, String)>;

    /// Parents this record hangs under.
    fn parent_links(&self) -> Vec<ParentLink>;
}

fn default_active() -> bool {
    true
}

/// Organizational division.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Division {
    pub id: String,
    pub code: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl Entity for Division {
    const TYPE: EntityType = EntityType::Division;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Indexed for Division {
    fn index_values(&self) -> Vec<(&'static str, String)> {
        vec![("code", self.code.clone()), ("name", self.name.clone())]
    }

    fn parent_links(&self) -> Vec<ParentLink> {
        Vec::new()
    }
}

/// Section within a division.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub code: String,
    pub name: String,
    pub division_id: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl Entity for Section {
    const TYPE: EntityType = EntityType::Section;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Indexed for Section {
    fn index_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("code", self.code.clone()),
            ("name", self.name.clone()),
            ("division_id", self.division_id.clone()),
        ]
    }

    fn parent_links(&self) -> Vec<ParentLink> {
        vec![ParentLink::new(EntityType::Division, &self.division_id)]
    }
}

/// Employee, attached to a division and optionally a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub id: String,
    pub employee_number: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub designation: Option<String>,
    #[serde(default)]
    pub division_id: Option<String>,
    #[serde(default)]
    pub section_id: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl Entity for Employee {
    const TYPE: EntityType = EntityType::Employee;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Indexed for Employee {
    fn index_values(&self) -> Vec<(&'static str, String)> {
        let mut values = vec![
            ("employee_number", self.employee_number.clone()),
            ("name", self.name.clone()),
        ];
        if let Some(email) = &self.email {
            values.push(("email", email.clone()));
        }
        if let Some(division_id) = &self.division_id {
            values.push(("division_id", division_id.clone()));
        }
        if let Some(section_id) = &self.section_id {
            values.push(("section_id", section_id.clone()));
        }
        values
    }

    fn parent_links(&self) -> Vec<ParentLink> {
        let mut links = Vec::with_capacity(2);
        if let Some(division_id) = &self.division_id {
            links.push(ParentLink::new(EntityType::Division, division_id));
        }
        if let Some(section_id) = &self.section_id {
            links.push(ParentLink::new(EntityType::Section, section_id));
        }
        links
    }
}

/// Daily attendance fact. Only ever streamed, never preloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub employee_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub check_in: Option<String>,
    #[serde(default)]
    pub check_out: Option<String>,
    pub status: String,
}

impl Entity for AttendanceRecord {
    const TYPE: EntityType = EntityType::Attendance;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Report Parameters
// =============================================================================

/// Parameter bag for a computed report.
///
/// Only the canonical fields take part in cache key derivation; a field that
/// is absent behaves exactly like an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportParams {
    #[serde(default)]
    pub from_date: Option<String>,
    #[serde(default)]
    pub to_date: Option<String>,
    #[serde(default)]
    pub division_id: Option<String>,
    #[serde(default)]
    pub section_id: Option<String>,
    #[serde(default)]
    pub sub_section_id: Option<String>,
    #[serde(default)]
    pub employee_id: Option<String>,
    #[serde(default)]
    pub grouping: Option<String>,
}

impl ReportParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn date_range(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from_date = Some(from.into());
        self.to_date = Some(to.into());
        self
    }

    pub fn division(mut self, id: impl Into<String>) -> Self {
        self.division_id = Some(id.into());
        self
    }

    pub fn section(mut self, id: impl Into<String>) -> Self {
        self.section_id = Some(id.into());
        self
    }

    pub fn sub_section(mut self, id: impl Into<String>) -> Self {
        self.sub_section_id = Some(id.into());
        self
    }

    pub fn employee(mut self, id: impl Into<String>) -> Self {
        self.employee_id = Some(id.into());
        self
    }

    pub fn grouping(mut self, grouping: impl Into<String>) -> Self {
        self.grouping = Some(grouping.into());
        self
    }

    /// Build from an arbitrary JSON object. Key order is irrelevant, unknown
    /// keys are ignored, scalars are rendered as text and `null` is absent.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let Some(map) = value.as_object() else {
            return Self::default();
        };

        let field = |name: &str| -> Option<String> {
            match map.get(name)? {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }
        };

        Self {
            from_date: field("from_date"),
            to_date: field("to_date"),
            division_id: field("division_id"),
            section_id: field("section_id"),
            sub_section_id: field("sub_section_id"),
            employee_id: field("employee_id"),
            grouping: field("grouping"),
        }
    }

    /// Canonical fields in key order, missing ones as `""`.
    pub fn canonical_fields(&self) -> [&str; 7] {
        fn f(v: &Option<String>) -> &str {
            v.as_deref().unwrap_or("")
        }
        [
            f(&self.from_date),
            f(&self.to_date),
            f(&self.division_id),
            f(&self.section_id),
            f(&self.sub_section_id),
            f(&self.employee_id),
            f(&self.grouping),
        ]
    }
}

// =============================================================================
// Catalog Rows
// =============================================================================

/// Secondary index row, unique on `(entity_type, entity_id, index_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub index_key: String,
    pub index_value: String,
    pub cache_key: String,
    pub updated_at: DateTime<Utc>,
}

impl IndexEntry {
    /// Natural key used for upserts.
    pub fn natural_key(&self) -> (EntityType, String, String) {
        (self.entity_type, self.entity_id.clone(), self.index_key.clone())
    }
}

/// Parent to child edge in the organizational hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub parent_type: EntityType,
    pub parent_id: String,
    pub child_type: EntityType,
    pub child_id: String,
    pub relationship_type: String,
}

impl RelationshipEdge {
    pub fn new(
        parent_type: EntityType,
        parent_id: impl Into<String>,
        child_type: EntityType,
        child_id: impl Into<String>,
    ) -> Self {
        Self {
            parent_type,
            parent_id: parent_id.into(),
            child_type,
            child_id: child_id.into(),
            relationship_type: format!("{}_{}", parent_type, child_type),
        }
    }
}

/// Sync bookkeeping for one top-level collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub cache_key: String,
    pub entity_type: String,
    pub record_count: u64,
    pub size_bytes: u64,
    pub last_sync_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
    pub is_valid: bool,
}

impl CacheMetadata {
    /// Valid and not past its expiry.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.is_valid && self.expires_at > now
    }
}

/// Status of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Completed,
    Failed,
}

/// Append-only record of a preload/sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: u64,
    pub sync_type: String,
    pub records_synced: u64,
    pub indexes_built: u64,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub triggered_by: String,
}

impl SyncLog {
    /// New in-progress log. The catalog assigns the id.
    pub fn start(sync_type: impl Into<String>, triggered_by: impl Into<String>) -> Self {
        Self {
            id: 0,
            sync_type: sync_type.into(),
            records_synced: 0,
            indexes_built: 0,
            status: SyncStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            triggered_by: triggered_by.into(),
        }
    }

    pub fn complete(&mut self) {
        self.status = SyncStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = SyncStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(error.into());
    }
}

/// Snapshot written by the nightly optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub memory_used_bytes: u64,
    pub keys_by_namespace: BTreeMap<String, u64>,
    pub hit_ratio: f64,
    pub tracked_keys: usize,
    pub hot_keys: usize,
    pub cold_keys: usize,
    pub evicted_keys: u64,
    pub duration_ms: u64,
}

/// Convert a std duration to a chrono duration, saturating on overflow.
pub fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

// =============================================================================
// Tests
// =============================================================================
