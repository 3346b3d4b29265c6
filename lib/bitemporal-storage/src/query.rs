//! Composable SQL fragments with bound parameters.
//!
//! Every user-supplied value travels through [`SqlWithParams`] as a bound
//! parameter; only internally-generated or schema-validated identifiers are
//! ever interpolated into SQL text. Fragments use `?` placeholders and are
//! renumbered to the backend's positional form by the executor.

use chrono::{DateTime, NaiveDate, Utc};

/// Type tag for binding a NULL parameter, so the backend receives a
/// correctly-typed null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullKind {
    Text,
    Int,
    Float,
    Bool,
    Date,
    Timestamp,
    Json,
}

/// A value that can be bound to a query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    Null(NullKind),
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::String(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::String(s)
    }
}

impl From<i64> for SqlValue {
    fn from(n: i64) -> Self {
        SqlValue::Int(n)
    }
}

impl From<f64> for SqlValue {
    fn from(n: f64) -> Self {
        SqlValue::Float(n)
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        SqlValue::Bool(b)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(d: NaiveDate) -> Self {
        SqlValue::Date(d)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(ts: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(ts)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

/// An SQL fragment plus the parameters bound to its `?` placeholders, as a
/// composable value type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlWithParams {
    sql: String,
    params: Vec<SqlValue>,
}

impl SqlWithParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fragment with no parameters.
    pub fn of(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    /// Append literal SQL text (identifiers and keywords only - never user
    /// values).
    pub fn push_sql(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Append a `?` placeholder bound to `value`.
    pub fn push_param(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        self.sql.push('?');
        self.params.push(value.into());
        self
    }

    /// Append a comma-separated placeholder list, one per value, e.g. for
    /// `IN (...)`.
    pub fn push_param_list<I, V>(&mut self, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_param(value);
        }
        self
    }

    /// Append another fragment, carrying its parameters over in order.
    pub fn append(&mut self, other: SqlWithParams) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
        self
    }

    /// Rewrite `?` placeholders to positional `$1..$n` form.
    pub fn to_positional(&self) -> String {
        let mut out = String::with_capacity(self.sql.len() + self.params.len() * 2);
        let mut n = 0;
        for ch in self.sql.chars() {
            if ch == '?' {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            } else {
                out.push(ch);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_compose_with_their_params() {
        let mut q = SqlWithParams::of("SELECT * FROM t WHERE a = ");
        q.push_param(1i64);

        let mut tail = SqlWithParams::of(" AND b IN (");
        tail.push_param_list(vec!["x", "y"]);
        tail.push_sql(")");

        q.append(tail);
        assert_eq!(q.sql(), "SELECT * FROM t WHERE a = ? AND b IN (?, ?)");
        assert_eq!(q.params().len(), 3);
        assert_eq!(
            q.to_positional(),
            "SELECT * FROM t WHERE a = $1 AND b IN ($2, $3)"
        );
    }

    #[test]
    fn typed_nulls_carry_their_kind() {
        let mut q = SqlWithParams::of("UPDATE t SET a = ");
        q.push_param(SqlValue::Null(NullKind::Int));
        assert_eq!(q.params(), &[SqlValue::Null(NullKind::Int)]);
    }
}
