//! In-Memory Source Store
//!
//! `SourceStore` over an in-memory snapshot of the relational source. The
//! binary loads the snapshot from a JSON fixture; tests build it directly and
//! use the failure switches to exercise degraded paths.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::domain::model::{
    AttendanceRecord, Division, Employee, Entity, EntityType, ReportParams, Section,
};
use crate::domain::ports::SourceStore;
use crate::error::{Error, Result};

/// Full contents of the source-of-truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSnapshot {
    #[serde(default)]
    pub divisions: Vec<Division>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub employees: Vec<Employee>,
    #[serde(default)]
    pub attendance: Vec<AttendanceRecord>,
    /// Canned report results by report type
    #[serde(default)]
    pub reports: BTreeMap<String, Value>,
}

/// In-memory source store
#[derive(Default)]
pub struct MemorySourceStore {
    data: RwLock<SourceSnapshot>,
    /// Every call fails while set
    unavailable: AtomicBool,
    /// Bulk listing of this type fails while set
    failing_list: RwLock<Option<EntityType>>,
    point_queries: AtomicU64,
    bulk_queries: AtomicU64,
}

fn insert_or_replace<T: Entity>(rows: &mut Vec<T>, row: T) {
    match rows.iter_mut().find(|r| r.entity_id() == row.entity_id()) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

fn remove_row<T: Entity>(rows: &mut Vec<T>, id: &str) -> bool {
    let before = rows.len();
    rows.retain(|r| r.entity_id() != id);
    rows.len() != before
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: SourceSnapshot) -> Self {
        Self {
            data: RwLock::new(snapshot),
            ..Default::default()
        }
    }

    /// Load a JSON snapshot file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let snapshot: SourceSnapshot = serde_json::from_str(&raw)?;
        info!(
            path = %path.display(),
            divisions = snapshot.divisions.len(),
            sections = snapshot.sections.len(),
            employees = snapshot.employees.len(),
            attendance = snapshot.attendance.len(),
            "Loaded source snapshot"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn upsert_division(&self, division: Division) {
        insert_or_replace(&mut self.data.write().divisions, division);
    }

    pub fn upsert_section(&self, section: Section) {
        insert_or_replace(&mut self.data.write().sections, section);
    }

    pub fn upsert_employee(&self, employee: Employee) {
        insert_or_replace(&mut self.data.write().employees, employee);
    }

    pub fn push_attendance(&self, record: AttendanceRecord) {
        insert_or_replace(&mut self.data.write().attendance, record);
    }

    pub fn set_report(&self, report_type: impl Into<String>, result: Value) {
        self.data.write().reports.insert(report_type.into(), result);
    }

    /// Delete a row of any type. Returns whether it existed.
    pub fn remove(&self, entity_type: EntityType, id: &str) -> bool {
        let mut data = self.data.write();
        match entity_type {
            EntityType::Division => remove_row(&mut data.divisions, id),
            EntityType::Section => remove_row(&mut data.sections, id),
            EntityType::Employee => remove_row(&mut data.employees, id),
            EntityType::Attendance => remove_row(&mut data.attendance, id),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make bulk listing of one entity type fail.
    pub fn fail_listing(&self, entity_type: Option<EntityType>) {
        *self.failing_list.write() = entity_type;
    }

    pub fn point_queries(&self) -> u64 {
        self.point_queries.load(Ordering::Relaxed)
    }

    pub fn bulk_queries(&self) -> u64 {
        self.bulk_queries.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::SourceUnavailable(
                "source store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_listing(&self, entity_type: EntityType) -> Result<()> {
        self.check()?;
        self.bulk_queries.fetch_add(1, Ordering::Relaxed);
        if *self.failing_list.read() == Some(entity_type) {
            return Err(Error::SourceUnavailable(format!(
                "listing {} failed",
                entity_type
            )));
        }
        Ok(())
    }

    /// Attendance summary for report types without a canned result.
    fn summarize_attendance(&self, report_type: &str, params: &ReportParams) -> Value {
        let data = self.data.read();
        let employees: HashMap<&str, &Employee> =
            data.employees.iter().map(|e| (e.id.as_str(), e)).collect();

        let parse = |v: &Option<String>| {
            v.as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        };
        let from = parse(&params.from_date);
        let to = parse(&params.to_date);

        let mut by_status: BTreeMap<String, u64> = BTreeMap::new();
        let mut total = 0u64;
        for record in &data.attendance {
            if from.is_some_and(|f| record.date < f) || to.is_some_and(|t| record.date > t) {
                continue;
            }
            if params
                .employee_id
                .as_deref()
                .is_some_and(|id| id != record.employee_id)
            {
                continue;
            }
            let employee = employees.get(record.employee_id.as_str());
            if let Some(division) = params.division_id.as_deref() {
                if employee.and_then(|e| e.division_id.as_deref()) != Some(division) {
                    continue;
                }
            }
            if let Some(section) = params.section_id.as_deref() {
                if employee.and_then(|e| e.section_id.as_deref()) != Some(section) {
                    continue;
                }
            }
            total += 1;
            *by_status.entry(record.status.clone()).or_insert(0) += 1;
        }

        json!({
            "report_type": report_type,
            "params": params,
            "total": total,
            "by_status": by_status,
        })
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn list_divisions(&self) -> Result<Vec<Division>> {
        self.check_listing(EntityType::Division)?;
        Ok(self
            .data
            .read()
            .divisions
            .iter()
            .filter(|d| d.is_active)
            .cloned()
            .collect())
    }

    async fn list_sections(&self) -> Result<Vec<Section>> {
        self.check_listing(EntityType::Section)?;
        Ok(self
            .data
            .read()
            .sections
            .iter()
            .filter(|s| s.is_active)
            .cloned()
            .collect())
    }

    async fn list_employees(&self) -> Result<Vec<Employee>> {
        self.check_listing(EntityType::Employee)?;
        Ok(self
            .data
            .read()
            .employees
            .iter()
            .filter(|e| e.is_active)
            .cloned()
            .collect())
    }

    async fn fetch_entity(&self, entity_type: EntityType, id: &str) -> Result<Option<Value>> {
        self.check()?;
        self.point_queries.fetch_add(1, Ordering::Relaxed);

        let data = self.data.read();
        let row = match entity_type {
            EntityType::Division => data
                .divisions
                .iter()
                .find(|r| r.id == id && r.is_active)
                .map(serde_json::to_value),
            EntityType::Section => data
                .sections
                .iter()
                .find(|r| r.id == id && r.is_active)
                .map(serde_json::to_value),
            EntityType::Employee => data
                .employees
                .iter()
                .find(|r| r.id == id && r.is_active)
                .map(serde_json::to_value),
            EntityType::Attendance => data
                .attendance
                .iter()
                .find(|r| r.id == id)
                .map(serde_json::to_value),
        };
        Ok(row.transpose()?)
    }

    async fn fetch_attendance_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AttendanceRecord>> {
        self.check()?;
        self.bulk_queries.fetch_add(1, Ordering::Relaxed);

        let mut rows = self.data.read().attendance.clone();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn compute_report(&self, report_type: &str, params: &ReportParams) -> Result<Value> {
        self.check()?;
        if let Some(canned) = self.data.read().reports.get(report_type) {
            return Ok(canned.clone());
        }
        Ok(self.summarize_attendance(report_type, params))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.unavailable.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemorySourceStore {
        let store = MemorySourceStore::new();
        store.upsert_division(Division {
            id: "D1".into(),
            code: "OPS".into(),
            name: "Operations".into(),
            is_active: true,
        });
        store.upsert_division(Division {
            id: "D2".into(),
            code: "OLD".into(),
            name: "Retired".into(),
            is_active: false,
        });
        store.upsert_employee(Employee {
            id: "E1".into(),
            employee_number: "0001".into(),
            name: "Ada".into(),
            email: None,
            designation: None,
            division_id: Some("D1".into()),
            section_id: None,
            is_active: true,
        });
        for (id, day, status) in [("A1", 1, "present"), ("A2", 2, "absent"), ("A3", 9, "present")] {
            store.push_attendance(AttendanceRecord {
                id: id.into(),
                employee_id: "E1".into(),
                date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
                check_in: None,
                check_out: None,
                status: status.into(),
            });
        }
        store
    }

    #[tokio::test]
    async fn test_lists_only_active_rows() {
        let store = store();
        let divisions = store.list_divisions().await.unwrap();
        assert_eq!(divisions.len(), 1);
        assert!(store
            .fetch_entity(EntityType::Division, "D2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_attendance_paging() {
        let store = store();
        let first = store.fetch_attendance_page(0, 2).await.unwrap();
        let rest = store.fetch_attendance_page(2, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "A3");
    }

    #[tokio::test]
    async fn test_report_summary_filters_by_range() {
        let store = store();
        let params = ReportParams::new().date_range("2025-01-01", "2025-01-07");
        let report = store.compute_report("group", &params).await.unwrap();
        assert_eq!(report["total"], 2);
        assert_eq!(report["by_status"]["absent"], 1);

        store.set_report("group", json!({"canned": true}));
        let report = store.compute_report("group", &params).await.unwrap();
        assert_eq!(report["canned"], true);
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let store = store();
        store.fail_listing(Some(EntityType::Section));
        assert!(store.list_divisions().await.is_ok());
        assert!(store.list_sections().await.is_err());

        store.set_unavailable(true);
        assert!(!store.health_check().await.unwrap());
        assert!(store.fetch_entity(EntityType::Employee, "E1").await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_file_round_trip() {
        let path = std::env::temp_dir().join(format!("rostercache-{}.json", uuid::Uuid::new_v4()));
        let snapshot = SourceSnapshot {
            divisions: vec![Division {
                id: "D1".into(),
                code: "OPS".into(),
                name: "Operations".into(),
                is_active: true,
            }],
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let store = MemorySourceStore::from_json_file(&path).unwrap();
        assert_eq!(store.list_divisions().await.unwrap().len(), 1);
        std::fs::remove_file(path).ok();
    }
}
