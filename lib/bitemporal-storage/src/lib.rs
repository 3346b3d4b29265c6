//! Bitemporal Storage - Core model for a bitemporal tabular data store.
//!
//! This crate provides the backend-agnostic foundation for a draft/version
//! storage system: each logical dataset ("storage") is a table with a fixed
//! schema of typed fields plus system columns, mutated as a draft and then
//! published into an immutable, time-sliced version.
//!
//! # Core Concepts
//!
//! - **Storage code**: a `schema.table` pair addressing one storage.
//! - **Draft**: a mutable, non-versioned working table prior to publication.
//! - **Version**: an immutable table whose rows carry a half-open validity
//!   interval `[SYS_PUBLISHTIME, SYS_CLOSETIME)`.
//! - **SYS_HASH**: a 32-char digest over all non-system field values in
//!   canonical order, used to detect unchanged rows across publications.
//!
//! # Modules
//!
//! - [`StorageCode`]: identifier parsing, validation and SQL name derivation
//! - [`Field`] / [`FieldType`] / [`TypedValue`]: the typed column model
//! - [`Row`]: an immutable row record
//! - [`SqlWithParams`]: a composable SQL fragment with bound parameters
//! - [`DataCriteria`]: structured search criteria
//! - [`StorageError`]: the error taxonomy

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::unwrap_in_result,
        clippy::panic
    )
)]

mod code;
mod criteria;
mod diff;
mod error;
mod field;
mod hash;
mod query;
mod row;
mod value;

pub use code::{DEFAULT_SCHEMA, StorageCode, escape_identifier};
pub use criteria::{DataCriteria, DataPage, FieldSearchCriteria, SearchType};
pub use diff::{CompareCriteria, DiffFieldValue, DiffPage, DiffRowValue, DiffStatus};
pub use error::{FieldError, StorageError};
pub use field::{Field, FieldType};
pub use hash::row_content_hash;
pub use query::{NullKind, SqlValue, SqlWithParams};
pub use row::{Row, RowValue};
pub use value::{ReferenceValue, TypedValue};

/// System column holding the sequence-assigned primary key.
pub const SYS_RECORDID: &str = "SYS_RECORDID";
/// System column holding the content hash of all non-system field values.
pub const SYS_HASH: &str = "SYS_HASH";
/// System column holding the full-text-search vector.
pub const SYS_FTS: &str = "FTS";
/// Version-only system column: start of the validity interval.
pub const SYS_PUBLISHTIME: &str = "SYS_PUBLISHTIME";
/// Version-only system column: exclusive end of the validity interval
/// (null means open-ended).
pub const SYS_CLOSETIME: &str = "SYS_CLOSETIME";

/// All system column names, in persisted order.
pub const SYS_COLUMNS: &[&str] = &[SYS_RECORDID, SYS_HASH, SYS_FTS, SYS_PUBLISHTIME, SYS_CLOSETIME];

/// Returns true if `name` is one of the system columns.
pub fn is_system_column(name: &str) -> bool {
    SYS_COLUMNS.contains(&name)
}
