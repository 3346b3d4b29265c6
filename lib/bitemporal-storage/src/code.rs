//! Storage codes and SQL identifier naming.
//!
//! A storage is addressed externally by a single `storageCode` string of the
//! form `schema.table`; a missing separator implies the default schema. All
//! derived SQL names (sequence, triggers, indexes) are generated here so that
//! the rest of the system never assembles identifiers ad hoc.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::StorageError;

/// Schema used when a storage code has no explicit schema part.
pub const DEFAULT_SCHEMA: &str = "data";

const CODE_SEPARATOR: char = '.';

// pattern is a compile-time constant
#[allow(clippy::unwrap_used)]
fn schema_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z\d_]{0,62}$").unwrap())
}

/// Escape an SQL identifier by double-quoting it, doubling embedded quotes.
///
/// Identifiers passed here come only from internally-generated or
/// schema-validated names, never from raw user text.
pub fn escape_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Identity of one storage: a `(schema, table)` pair.
///
/// `parse` and `to_string` are mutual inverses under the `schema.table`
/// convention (the default schema is printed explicitly).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageCode {
    schema: String,
    table: String,
}

impl StorageCode {
    /// Create a storage code, validating the schema name.
    ///
    /// An invalid schema name is a fatal configuration error and is raised
    /// here, before any DDL could execute.
    pub fn new(schema: &str, table: &str) -> Result<Self, StorageError> {
        if !schema_name_regex().is_match(schema) {
            return Err(StorageError::InvalidSchemaName(schema.to_string()));
        }
        if table.is_empty() {
            return Err(StorageError::InvalidStorageCode(format!(
                "{schema}{CODE_SEPARATOR}"
            )));
        }
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    /// Create a storage code in the default schema.
    pub fn in_default_schema(table: &str) -> Result<Self, StorageError> {
        Self::new(DEFAULT_SCHEMA, table)
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// `"schema"."table"` with both parts escaped.
    pub fn escaped_qualified_name(&self) -> String {
        format!(
            "{}.{}",
            escape_identifier(&self.schema),
            escape_identifier(&self.table)
        )
    }

    /// Name of the dedicated primary-key sequence backing this storage.
    pub fn sequence_name(&self) -> String {
        format!("{}_seq", self.table)
    }

    /// `"schema"."<table>_seq"` with both parts escaped.
    pub fn escaped_sequence_name(&self) -> String {
        format!(
            "{}.{}",
            escape_identifier(&self.schema),
            escape_identifier(&self.sequence_name())
        )
    }

    /// Name of the trigger maintaining `SYS_HASH`.
    pub fn hash_trigger_name(&self) -> &'static str {
        "hash_tg"
    }

    /// Name of the trigger maintaining the full-text-search vector.
    pub fn fts_trigger_name(&self) -> &'static str {
        "fts_vector_tg"
    }

    /// Name of the plpgsql function backing the hash trigger.
    pub fn hash_function_name(&self) -> String {
        format!("{}_hash_tf", self.table)
    }

    /// Name of the plpgsql function backing the FTS trigger.
    pub fn fts_function_name(&self) -> String {
        format!("{}_fts_tf", self.table)
    }

    /// Name of the index over `SYS_HASH`.
    pub fn hash_index_name(&self) -> String {
        format!("{}_sys_hash_ix", self.table)
    }

    /// Name of the index over the FTS vector.
    pub fn fts_index_name(&self) -> String {
        format!("{}_fts_ix", self.table)
    }

    /// Name of the per-field index for `field`.
    pub fn field_index_name(&self, field: &str) -> String {
        format!("{}_{}_ix", self.table, field.to_lowercase())
    }
}

impl FromStr for StorageCode {
    type Err = StorageError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code.split_once(CODE_SEPARATOR) {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new(DEFAULT_SCHEMA, code),
        }
    }
}

impl fmt::Display for StorageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.schema, CODE_SEPARATOR, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_are_inverses() {
        let code: StorageCode = "ref.countries".parse().unwrap();
        assert_eq!(code.schema(), "ref");
        assert_eq!(code.table(), "countries");
        assert_eq!(code.to_string(), "ref.countries");

        let reparsed: StorageCode = code.to_string().parse().unwrap();
        assert_eq!(reparsed, code);
    }

    #[test]
    fn missing_separator_implies_default_schema() {
        let code: StorageCode = "countries".parse().unwrap();
        assert_eq!(code.schema(), DEFAULT_SCHEMA);
        assert_eq!(code.table(), "countries");
    }

    #[test]
    fn schema_name_is_validated_strictly() {
        assert!("Ref.countries".parse::<StorageCode>().is_err());
        assert!("1ref.countries".parse::<StorageCode>().is_err());
        assert!("re-f.countries".parse::<StorageCode>().is_err());
        assert!("ref_2.countries".parse::<StorageCode>().is_ok());

        let too_long = format!("{}.t", "a".repeat(64));
        assert!(too_long.parse::<StorageCode>().is_err());
        let max_len = format!("{}.t", "a".repeat(63));
        assert!(max_len.parse::<StorageCode>().is_ok());
    }

    #[test]
    fn derived_names() {
        let code: StorageCode = "ref.countries".parse().unwrap();
        assert_eq!(code.escaped_qualified_name(), "\"ref\".\"countries\"");
        assert_eq!(code.escaped_sequence_name(), "\"ref\".\"countries_seq\"");
        assert_eq!(code.hash_index_name(), "countries_sys_hash_ix");
        assert_eq!(code.field_index_name("NAME"), "countries_name_ix");
    }

    #[test]
    fn escaping_doubles_embedded_quotes() {
        assert_eq!(escape_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn uuid_like_table_names_are_accepted() {
        // published version tables get generated names; only the schema part
        // is held to the identifier grammar
        let code = StorageCode::new("data", "7a1f3c9e-1b2d-4e5f-8a9b-0c1d2e3f4a5b").unwrap();
        assert_eq!(
            code.escaped_qualified_name(),
            "\"data\".\"7a1f3c9e-1b2d-4e5f-8a9b-0c1d2e3f4a5b\""
        );
    }
}
