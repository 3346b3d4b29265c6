//! Structured search criteria, translated to SQL by the predicate builder.

use chrono::{DateTime, Utc};

use crate::{Field, Row, TypedValue};

/// Comparison kind of one per-field filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchType {
    /// Field IN value-list; a sole null value means IS NULL.
    Exact,
    /// Case-insensitive substring match; single value only.
    Like,
    IsNull,
    IsNotNull,
    /// Match against the resolved reference key rather than its display value.
    Reference,
    /// Hierarchical descendant containment against a tree field.
    More,
    /// Hierarchical ancestor containment against a tree field.
    Less,
}

/// One per-field filter: field, comparison kind, values.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSearchCriteria {
    pub field: Field,
    pub search_type: SearchType,
    pub values: Vec<Option<TypedValue>>,
}

impl FieldSearchCriteria {
    pub fn new(field: Field, search_type: SearchType, values: Vec<Option<TypedValue>>) -> Self {
        Self {
            field,
            search_type,
            values,
        }
    }

    pub fn exact(field: Field, values: Vec<Option<TypedValue>>) -> Self {
        Self::new(field, SearchType::Exact, values)
    }
}

/// Search criteria for one storage: OR-grouped, AND-combined per-field
/// filters plus free-text, hash, system-id and validity-date restrictions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataCriteria {
    /// Outer vec is OR-combined; each inner group is AND-combined.
    pub field_filters: Vec<Vec<FieldSearchCriteria>>,
    /// Free-text query against the FTS vector.
    pub common_filter: Option<String>,
    /// Restrict to rows with these content hashes.
    pub hashes: Vec<String>,
    /// Restrict to rows with these system ids.
    pub system_ids: Vec<i64>,
    /// Validity window; applied whenever an as-of date is given.
    pub begin_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub size: u32,
    /// Skip result materialization, returning only the count.
    pub count_only: bool,
}

impl DataCriteria {
    pub fn new() -> Self {
        Self {
            page: 1,
            size: 10,
            ..Self::default()
        }
    }

    /// Zero-based row offset of the requested page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.size)
    }
}

/// One page of search results with the total candidate count.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPage {
    pub count: u64,
    pub rows: Vec<Row>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_offset_is_zero_based() {
        let mut c = DataCriteria::new();
        assert_eq!(c.offset(), 0);
        c.page = 3;
        c.size = 20;
        assert_eq!(c.offset(), 40);
        c.page = 0; // treated as the first page
        assert_eq!(c.offset(), 0);
    }
}
