//! Typed field values, including the composite reference value.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A field value that points into another storage.
///
/// Resolved server-side via a correlated subquery against the target storage
/// at `as_of_date`; stored denormalized as `{value, displayValue, hash}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceValue {
    /// Target storage code (`schema.table`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_code: Option<String>,
    /// Date at which the target storage is read when resolving the display
    /// value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_of_date: Option<NaiveDate>,
    /// Key field in the target storage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,
    /// Display field in the target storage; exclusive with
    /// `display_expression`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_field: Option<String>,
    /// Display expression over target fields; exclusive with `display_field`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_expression: Option<String>,
    /// The raw key value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// The resolved display value; may be freshly re-resolved on rewrite.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_value: Option<String>,
    /// `SYS_HASH` of the referenced row at resolution time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl ReferenceValue {
    /// A reference carrying only the raw key, with no display resolution.
    pub fn of_value(value: impl Into<String>) -> Self {
        Self {
            storage_code: None,
            as_of_date: None,
            key_field: None,
            display_field: None,
            display_expression: None,
            value: Some(value.into()),
            display_value: None,
            hash: None,
        }
    }

    /// Whether this reference can be resolved server-side (target storage,
    /// key field and display field/expression are all known).
    pub fn is_resolvable(&self) -> bool {
        self.storage_code.is_some()
            && self.key_field.is_some()
            && (self.display_field.is_some() || self.display_expression.is_some())
    }
}

/// A typed field value. Null-ness is modelled as `Option<TypedValue>` at the
/// row level, not as a variant here.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    String(String),
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
    Boolean(bool),
    Reference(ReferenceValue),
    /// A hierarchical path in dotted ltree form, e.g. `root.branch.leaf`.
    Tree(String),
}

impl TypedValue {
    /// Text representation matching the backend's `::text` cast for the
    /// corresponding column type. Drives the canonical hash input and the
    /// uniqueness check grouping.
    pub fn to_text(&self) -> String {
        match self {
            TypedValue::String(s) => s.clone(),
            TypedValue::Integer(n) => n.to_string(),
            TypedValue::Float(n) => n.to_string(),
            TypedValue::Date(d) => d.to_string(),
            TypedValue::Boolean(b) => b.to_string(),
            TypedValue::Reference(r) => r.value.clone().unwrap_or_default(),
            TypedValue::Tree(path) => path.clone(),
        }
    }
}

impl From<&str> for TypedValue {
    fn from(s: &str) -> Self {
        TypedValue::String(s.to_string())
    }
}

impl From<String> for TypedValue {
    fn from(s: String) -> Self {
        TypedValue::String(s)
    }
}

impl From<i64> for TypedValue {
    fn from(n: i64) -> Self {
        TypedValue::Integer(n)
    }
}

impl From<f64> for TypedValue {
    fn from(n: f64) -> Self {
        TypedValue::Float(n)
    }
}

impl From<bool> for TypedValue {
    fn from(b: bool) -> Self {
        TypedValue::Boolean(b)
    }
}

impl From<NaiveDate> for TypedValue {
    fn from(d: NaiveDate) -> Self {
        TypedValue::Date(d)
    }
}

impl From<ReferenceValue> for TypedValue {
    fn from(r: ReferenceValue) -> Self {
        TypedValue::Reference(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_serializes_camel_case_without_nulls() {
        let r = ReferenceValue {
            value: Some("77".to_string()),
            display_value: Some("Moscow".to_string()),
            hash: Some("abc".to_string()),
            ..ReferenceValue::of_value("77")
        };
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(
            json,
            "{\"value\":\"77\",\"displayValue\":\"Moscow\",\"hash\":\"abc\"}"
        );
    }

    #[test]
    fn resolvable_requires_target_and_display() {
        let mut r = ReferenceValue::of_value("77");
        assert!(!r.is_resolvable());
        r.storage_code = Some("ref.regions".to_string());
        r.key_field = Some("CODE".to_string());
        r.display_field = Some("NAME".to_string());
        assert!(r.is_resolvable());
    }

    #[test]
    fn text_representation() {
        assert_eq!(TypedValue::Integer(42).to_text(), "42");
        assert_eq!(TypedValue::Boolean(true).to_text(), "true");
        assert_eq!(
            TypedValue::Date(NaiveDate::from_ymd_opt(2020, 3, 5).unwrap()).to_text(),
            "2020-03-05"
        );
    }
}
