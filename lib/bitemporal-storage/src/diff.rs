//! Comparison model: criteria and field-level diff results.

use chrono::{DateTime, Utc};

use crate::{StorageCode, TypedValue};

/// Row-level classification of one joined pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStatus {
    /// Missing on the old side.
    Inserted,
    /// Present on both sides with at least one differing non-primary field.
    Updated,
    /// Missing on the new side.
    Deleted,
}

/// Criteria for comparing two storages (or one storage at two dates).
#[derive(Debug, Clone, PartialEq)]
pub struct CompareCriteria {
    pub old_storage: StorageCode,
    pub new_storage: StorageCode,
    pub old_date: Option<DateTime<Utc>>,
    pub new_date: Option<DateTime<Utc>>,
    /// Caller-declared fields identifying a logical entity, independent of
    /// the system hash.
    pub primary_fields: Vec<String>,
    /// Restrict output to one status; `None` returns all three.
    pub status: Option<DiffStatus>,
    /// Skip result materialization, returning only the count.
    pub count_only: bool,
    /// 1-based page number.
    pub page: u32,
    pub size: u32,
}

impl CompareCriteria {
    pub fn new(
        old_storage: StorageCode,
        new_storage: StorageCode,
        primary_fields: Vec<String>,
    ) -> Self {
        Self {
            old_storage,
            new_storage,
            old_date: None,
            new_date: None,
            primary_fields,
            status: None,
            count_only: false,
            page: 1,
            size: 10,
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.size)
    }
}

/// Old/new values of one field within a diff row. When nothing changed for
/// the field, only the new value is retained.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffFieldValue {
    pub field: String,
    pub old_value: Option<TypedValue>,
    pub new_value: Option<TypedValue>,
}

/// One classified row of a comparison result.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffRowValue {
    pub status: DiffStatus,
    pub values: Vec<DiffFieldValue>,
}

impl DiffRowValue {
    /// The diff entry for `field`, if the comparison produced one.
    pub fn value_of(&self, field: &str) -> Option<&DiffFieldValue> {
        self.values.iter().find(|v| v.field == field)
    }
}

/// One page of a comparison result with the total differing-row count.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffPage {
    pub count: u64,
    pub rows: Vec<DiffRowValue>,
}
