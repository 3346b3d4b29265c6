//! The typed column model.
//!
//! Field kind is a closed enum with an associated payload per variant, so the
//! codec and predicate logic dispatch via exhaustive matching - adding a kind
//! is a compile-time-checked, single-point change.

use chrono::NaiveDate;

use crate::{StorageError, TypedValue};

/// Semantic type of a field, with the data each kind carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// Variable-length text, optionally length-limited.
    String { max_length: Option<u32> },
    Integer,
    Float,
    Date,
    Boolean,
    /// A denormalized pointer into another storage, stored as a jsonb
    /// document `{value, displayValue, hash}`.
    Reference,
    /// A hierarchical path (ltree).
    Tree,
}

impl FieldType {
    /// The backend column type for this kind.
    pub fn sql_type(&self) -> String {
        match self {
            FieldType::String { max_length: Some(n) } => format!("varchar({n})"),
            FieldType::String { max_length: None } => "varchar".to_string(),
            FieldType::Integer => "bigint".to_string(),
            FieldType::Float => "numeric".to_string(),
            FieldType::Date => "date".to_string(),
            FieldType::Boolean => "boolean".to_string(),
            FieldType::Reference => "jsonb".to_string(),
            FieldType::Tree => "ltree".to_string(),
        }
    }

    /// Whether two kinds map to the same backend column type, ignoring
    /// length constraints. Used for structural comparison on publish.
    pub fn is_same_storage_type(&self, other: &FieldType) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// A column definition: name, kind and constraints.
///
/// Immutable once part of a published version; mutable on a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    field_type: FieldType,
    required: bool,
    unique: bool,
    searchable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            unique: false,
            searchable: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_searchable(&self) -> bool {
        self.searchable
    }

    /// Field-factory contract: construct a typed value of this field's kind
    /// from its raw text representation.
    pub fn value_of(&self, raw: &str) -> Result<TypedValue, StorageError> {
        let parse_error = || {
            StorageError::IncompatibleDataType(self.name.clone())
        };
        match &self.field_type {
            FieldType::String { .. } => Ok(TypedValue::String(raw.to_string())),
            FieldType::Integer => raw
                .parse::<i64>()
                .map(TypedValue::Integer)
                .map_err(|_| parse_error()),
            FieldType::Float => raw
                .parse::<f64>()
                .map(TypedValue::Float)
                .map_err(|_| parse_error()),
            FieldType::Date => raw
                .parse::<NaiveDate>()
                .map(TypedValue::Date)
                .map_err(|_| parse_error()),
            FieldType::Boolean => match raw {
                "true" | "t" => Ok(TypedValue::Boolean(true)),
                "false" | "f" => Ok(TypedValue::Boolean(false)),
                _ => Err(parse_error()),
            },
            FieldType::Reference => serde_json::from_str(raw)
                .map(TypedValue::Reference)
                .map_err(|_| parse_error()),
            FieldType::Tree => Ok(TypedValue::Tree(raw.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_types() {
        assert_eq!(
            FieldType::String { max_length: Some(100) }.sql_type(),
            "varchar(100)"
        );
        assert_eq!(FieldType::String { max_length: None }.sql_type(), "varchar");
        assert_eq!(FieldType::Integer.sql_type(), "bigint");
        assert_eq!(FieldType::Float.sql_type(), "numeric");
        assert_eq!(FieldType::Reference.sql_type(), "jsonb");
        assert_eq!(FieldType::Tree.sql_type(), "ltree");
    }

    #[test]
    fn storage_type_ignores_length() {
        assert!(
            FieldType::String { max_length: Some(10) }
                .is_same_storage_type(&FieldType::String { max_length: None })
        );
        assert!(!FieldType::Integer.is_same_storage_type(&FieldType::Float));
    }

    #[test]
    fn value_of_parses_by_kind() {
        let f = Field::new("AMOUNT", FieldType::Integer);
        assert_eq!(f.value_of("42").unwrap(), TypedValue::Integer(42));
        assert!(matches!(
            f.value_of("forty-two"),
            Err(StorageError::IncompatibleDataType(name)) if name == "AMOUNT"
        ));

        let d = Field::new("OPENED", FieldType::Date);
        assert_eq!(
            d.value_of("2020-03-05").unwrap(),
            TypedValue::Date(NaiveDate::from_ymd_opt(2020, 3, 5).unwrap())
        );
    }
}
