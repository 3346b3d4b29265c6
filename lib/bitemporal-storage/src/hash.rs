//! Content hashing for rows.
//!
//! `SYS_HASH` is normally maintained by a database trigger; this module is
//! the Rust side of the same computation, used for pre-computing hashes and
//! in tests. Both sides digest the identical canonical string with md5, so
//! they agree byte-for-byte: field text values in field order, nulls as
//! empty strings, joined with `;`.
//!
//! Reference values contribute only their raw key, not the display value,
//! so re-resolving a display name does not change row identity.

use crate::{Field, Row};

/// Join separator of the canonical string. Must match the trigger DDL.
pub(crate) const HASH_SEPARATOR: &str = ";";

/// Canonical string over `row`'s values in the order given by `fields`.
pub(crate) fn canonical_string(fields: &[Field], row: &Row) -> String {
    fields
        .iter()
        .map(|f| {
            row.value_of(f.name())
                .map(|v| v.to_text())
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join(HASH_SEPARATOR)
}

/// The 32-char lowercase hex content hash of a row over `fields`.
///
/// Deterministic: two rows with identical field values (ignoring system
/// columns) hash equally; changing any single value changes the hash.
pub fn row_content_hash(fields: &[Field], row: &Row) -> String {
    format!("{:x}", md5::compute(canonical_string(fields, row)))
}
