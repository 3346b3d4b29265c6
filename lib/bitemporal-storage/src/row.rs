//! Immutable row records.

use crate::TypedValue;

/// One named field value within a row. `None` models SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct RowValue {
    field: String,
    value: Option<TypedValue>,
}

impl RowValue {
    pub fn new(field: impl Into<String>, value: Option<TypedValue>) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn value(&self) -> Option<&TypedValue> {
        self.value.as_ref()
    }
}

/// A row record: system id, content hash and an ordered list of field values.
///
/// Immutable after construction; the row exclusively owns its value list.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    system_id: Option<i64>,
    hash: Option<String>,
    values: Vec<RowValue>,
}

impl Row {
    pub fn new(system_id: Option<i64>, hash: Option<String>, values: Vec<RowValue>) -> Self {
        Self {
            system_id,
            hash,
            values,
        }
    }

    /// A row that has not been persisted yet (no system id, no hash).
    pub fn of_values(values: Vec<RowValue>) -> Self {
        Self::new(None, None, values)
    }

    pub fn system_id(&self) -> Option<i64> {
        self.system_id
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn values(&self) -> &[RowValue] {
        &self.values
    }

    /// The value of `field`, or `None` when the field is absent or null.
    pub fn value_of(&self, field: &str) -> Option<&TypedValue> {
        self.values
            .iter()
            .find(|v| v.field() == field)
            .and_then(|v| v.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_lookup_distinguishes_absent_from_null() {
        let row = Row::of_values(vec![
            RowValue::new("NAME", Some(TypedValue::from("x"))),
            RowValue::new("CODE", None),
        ]);
        assert_eq!(row.value_of("NAME"), Some(&TypedValue::from("x")));
        assert_eq!(row.value_of("CODE"), None);
        assert_eq!(row.value_of("MISSING"), None);
        assert!(row.values().iter().any(|v| v.field() == "CODE"));
    }
}
