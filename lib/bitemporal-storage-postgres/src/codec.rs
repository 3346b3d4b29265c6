//! Row codec: typed field definitions to and from SQL tuples.
//!
//! Encoding walks the field list and the flat result tuple positionally:
//! `SYS_RECORDID` first, `SYS_HASH` next when requested, then one position
//! per field, with reference fields consuming up to two extra positions for
//! the requested value parts. Decoding produces parameterized INSERT/UPDATE
//! value expressions; null values become typed SQL NULLs, references become
//! a correlated subselect (or a bare `jsonb_build_object` when only the raw
//! key is known), tree values get an explicit ltree cast.

use chrono::NaiveDate;
use sqlx::Row as _;
use sqlx::postgres::PgRow;

use bitemporal_storage::{
    Field, FieldType, NullKind, ReferenceValue, Row, RowValue, SYS_CLOSETIME, SYS_HASH,
    SYS_PUBLISHTIME, SYS_RECORDID, SqlValue, SqlWithParams, StorageCode, StorageError, TypedValue,
    escape_identifier,
};

use crate::executor::from_sqlx;

/// Which optional value parts the caller wants in the result tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueParts {
    /// Include the row's `SYS_HASH` after `SYS_RECORDID`.
    pub row_hash: bool,
    /// Include each reference field's resolved display value.
    pub reference_display: bool,
    /// Include each reference field's stored hash part.
    pub reference_hash: bool,
}

/// One position of the flat result tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    SystemId,
    RowHash,
    Value(usize),
    ReferenceDisplay(usize),
    ReferenceHash(usize),
}

/// Positional layout of a result tuple for `fields` under `parts`.
pub(crate) fn row_layout(fields: &[Field], parts: ValueParts) -> Vec<Slot> {
    let mut layout = vec![Slot::SystemId];
    if parts.row_hash {
        layout.push(Slot::RowHash);
    }
    for (idx, field) in fields.iter().enumerate() {
        layout.push(Slot::Value(idx));
        if matches!(field.field_type(), FieldType::Reference) {
            if parts.reference_display {
                layout.push(Slot::ReferenceDisplay(idx));
            }
            if parts.reference_hash {
                layout.push(Slot::ReferenceHash(idx));
            }
        }
    }
    layout
}

/// Select-list matching [`row_layout`]. Float and tree columns are cast so
/// the driver can decode them without extension types.
pub fn select_columns(fields: &[Field], parts: ValueParts) -> String {
    select_columns_prefixed(fields, parts, "")
}

/// [`select_columns`] with each column qualified by a table alias, for
/// joined queries.
pub(crate) fn select_columns_prefixed(
    fields: &[Field],
    parts: ValueParts,
    prefix: &str,
) -> String {
    let mut columns = vec![format!("{prefix}{}", escape_identifier(SYS_RECORDID))];
    if parts.row_hash {
        columns.push(format!("{prefix}{}", escape_identifier(SYS_HASH)));
    }
    for field in fields {
        let name = format!("{prefix}{}", escape_identifier(field.name()));
        match field.field_type() {
            FieldType::Reference => {
                columns.push(format!("{name} ->> 'value'"));
                if parts.reference_display {
                    columns.push(format!("{name} ->> 'displayValue'"));
                }
                if parts.reference_hash {
                    columns.push(format!("{name} ->> 'hash'"));
                }
            }
            FieldType::Float => columns.push(format!("({name})::float8")),
            FieldType::Tree => columns.push(format!("({name})::text")),
            _ => columns.push(name),
        }
    }
    columns.join(", ")
}

/// Decode one result tuple into a [`Row`].
pub fn encode_row(fields: &[Field], parts: ValueParts, row: &PgRow) -> Result<Row, StorageError> {
    encode_row_offset(fields, parts, row, 0)
}

/// [`encode_row`] starting at tuple position `offset`, for decoding one side
/// of a joined result.
pub(crate) fn encode_row_offset(
    fields: &[Field],
    parts: ValueParts,
    row: &PgRow,
    offset: usize,
) -> Result<Row, StorageError> {
    let mut system_id = None;
    let mut hash = None;
    let mut values: Vec<RowValue> = fields
        .iter()
        .map(|f| RowValue::new(f.name(), None))
        .collect();
    let mut references: Vec<Option<ReferenceValue>> = vec![None; fields.len()];

    for (position, slot) in row_layout(fields, parts).into_iter().enumerate() {
        let position = offset + position;
        match slot {
            Slot::SystemId => {
                system_id = row.try_get::<Option<i64>, _>(position).map_err(from_sqlx)?;
            }
            Slot::RowHash => {
                hash = row
                    .try_get::<Option<String>, _>(position)
                    .map_err(from_sqlx)?;
            }
            Slot::Value(idx) => {
                let value = read_value(row, position, fields[idx].field_type())?;
                if let Some(TypedValue::Reference(r)) = &value {
                    references[idx] = Some(r.clone());
                }
                values[idx] = RowValue::new(fields[idx].name(), value);
            }
            Slot::ReferenceDisplay(idx) => {
                let display: Option<String> = row.try_get(position).map_err(from_sqlx)?;
                if let Some(r) = &mut references[idx] {
                    r.display_value = display;
                    values[idx] = RowValue::new(
                        fields[idx].name(),
                        Some(TypedValue::Reference(r.clone())),
                    );
                }
            }
            Slot::ReferenceHash(idx) => {
                let ref_hash: Option<String> = row.try_get(position).map_err(from_sqlx)?;
                if let Some(r) = &mut references[idx] {
                    r.hash = ref_hash;
                    values[idx] = RowValue::new(
                        fields[idx].name(),
                        Some(TypedValue::Reference(r.clone())),
                    );
                }
            }
        }
    }

    Ok(Row::new(system_id, hash, values))
}

/// Read one typed position of a result tuple.
fn read_value(
    row: &PgRow,
    position: usize,
    field_type: &FieldType,
) -> Result<Option<TypedValue>, StorageError> {
    let value = match field_type {
        FieldType::String { .. } => row
            .try_get::<Option<String>, _>(position)
            .map_err(from_sqlx)?
            .map(TypedValue::String),
        FieldType::Integer => row
            .try_get::<Option<i64>, _>(position)
            .map_err(from_sqlx)?
            .map(TypedValue::Integer),
        FieldType::Float => row
            .try_get::<Option<f64>, _>(position)
            .map_err(from_sqlx)?
            .map(TypedValue::Float),
        FieldType::Date => row
            .try_get::<Option<NaiveDate>, _>(position)
            .map_err(from_sqlx)?
            .map(TypedValue::Date),
        FieldType::Boolean => row
            .try_get::<Option<bool>, _>(position)
            .map_err(from_sqlx)?
            .map(TypedValue::Boolean),
        FieldType::Reference => row
            .try_get::<Option<String>, _>(position)
            .map_err(from_sqlx)?
            .map(|value| TypedValue::Reference(ReferenceValue::of_value(value))),
        FieldType::Tree => row
            .try_get::<Option<String>, _>(position)
            .map_err(from_sqlx)?
            .map(TypedValue::Tree),
    };
    Ok(value)
}

/// Typed NULL kind for a field.
fn null_kind(field_type: &FieldType) -> NullKind {
    match field_type {
        FieldType::String { .. } => NullKind::Text,
        FieldType::Integer => NullKind::Int,
        FieldType::Float => NullKind::Float,
        FieldType::Date => NullKind::Date,
        FieldType::Boolean => NullKind::Bool,
        FieldType::Reference => NullKind::Json,
        FieldType::Tree => NullKind::Text,
    }
}

/// Value expression for one field of an INSERT/UPDATE.
pub fn value_expression(field: &Field, value: Option<&TypedValue>) -> SqlWithParams {
    let mut expr = SqlWithParams::new();
    match value {
        None => match field.field_type() {
            FieldType::Tree => {
                expr.push_param(SqlValue::Null(NullKind::Text));
                expr.push_sql("::ltree");
            }
            other => {
                expr.push_param(SqlValue::Null(null_kind(other)));
            }
        },
        Some(TypedValue::String(s)) => {
            expr.push_param(s.as_str());
        }
        Some(TypedValue::Integer(n)) => {
            expr.push_param(*n);
        }
        Some(TypedValue::Float(n)) => {
            expr.push_param(*n);
        }
        Some(TypedValue::Date(d)) => {
            expr.push_param(*d);
        }
        Some(TypedValue::Boolean(b)) => {
            expr.push_param(*b);
        }
        Some(TypedValue::Tree(path)) => {
            expr.push_param(path.as_str());
            expr.push_sql("::ltree");
        }
        Some(TypedValue::Reference(reference)) => {
            expr.append(reference_expression(reference));
        }
    }
    expr
}

/// Expression for a reference value: a correlated subselect when the target
/// and display are known, otherwise a literal jsonb with the raw key only.
fn reference_expression(reference: &ReferenceValue) -> SqlWithParams {
    let raw_key = reference.value.clone().unwrap_or_default();

    let resolvable = reference.is_resolvable();
    let target = reference
        .storage_code
        .as_deref()
        .and_then(|code| code.parse::<StorageCode>().ok());

    match (resolvable, target) {
        (true, Some(target)) => {
            let key = escape_identifier(
                reference.key_field.as_deref().unwrap_or_default(),
            );
            let display = match (&reference.display_field, &reference.display_expression) {
                (Some(field), _) => format!("d.{}::text", escape_identifier(field)),
                (None, Some(expression)) => expression.clone(),
                (None, None) => "null".to_string(),
            };

            let mut expr = SqlWithParams::of(format!(
                "(SELECT jsonb_build_object('value', d.{key}::text, 'displayValue', {display}, \
                 'hash', d.{hash}) FROM {table} d WHERE d.{key}::text = ",
                hash = escape_identifier(SYS_HASH),
                table = target.escaped_qualified_name(),
            ));
            expr.push_param(raw_key);
            if let Some(as_of) = reference.as_of_date {
                let ts = as_of
                    .and_hms_opt(0, 0, 0)
                    .map(|naive| naive.and_utc())
                    .unwrap_or_default();
                expr.push_sql(&format!(
                    " AND date_trunc('second', d.{publish}) <= ",
                    publish = escape_identifier(SYS_PUBLISHTIME),
                ));
                expr.push_param(ts);
                expr.push_sql(&format!(
                    " AND (date_trunc('second', d.{close}) > ",
                    close = escape_identifier(SYS_CLOSETIME),
                ));
                expr.push_param(ts);
                expr.push_sql(&format!(
                    " OR d.{close} IS NULL)",
                    close = escape_identifier(SYS_CLOSETIME),
                ));
            }
            expr.push_sql(")");
            expr
        }
        _ => {
            let mut expr = SqlWithParams::of("jsonb_build_object('value', ");
            expr.push_param(raw_key);
            expr.push_sql("::text)");
            expr
        }
    }
}

/// Column list and value expressions for inserting `row` into a draft.
pub fn insert_values(fields: &[Field], row: &Row) -> (Vec<String>, SqlWithParams) {
    let columns = fields
        .iter()
        .map(|f| escape_identifier(f.name()))
        .collect::<Vec<_>>();

    let mut values = SqlWithParams::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            values.push_sql(", ");
        }
        values.append(value_expression(field, row.value_of(field.name())));
    }
    (columns, values)
}

/// `SET` assignments for updating `row`'s fields in place.
pub fn update_assignments(fields: &[Field], row: &Row) -> SqlWithParams {
    let mut assignments = SqlWithParams::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            assignments.push_sql(", ");
        }
        assignments.push_sql(&format!("{} = ", escape_identifier(field.name())));
        assignments.append(value_expression(field, row.value_of(field.name())));
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<Field> {
        vec![
            Field::new("ID", FieldType::Integer),
            Field::new("REGION", FieldType::Reference),
            Field::new("PATH", FieldType::Tree),
        ]
    }

    #[test]
    fn layout_consumes_system_and_reference_positions() {
        let layout = row_layout(
            &fields(),
            ValueParts {
                row_hash: true,
                reference_display: true,
                reference_hash: true,
            },
        );
        assert_eq!(
            layout,
            vec![
                Slot::SystemId,
                Slot::RowHash,
                Slot::Value(0),
                Slot::Value(1),
                Slot::ReferenceDisplay(1),
                Slot::ReferenceHash(1),
                Slot::Value(2),
            ]
        );
    }

    #[test]
    fn layout_without_parts_is_one_position_per_field() {
        let layout = row_layout(&fields(), ValueParts::default());
        assert_eq!(
            layout,
            vec![Slot::SystemId, Slot::Value(0), Slot::Value(1), Slot::Value(2)]
        );
    }

    #[test]
    fn select_list_extracts_reference_parts_and_casts() {
        let sql = select_columns(
            &fields(),
            ValueParts {
                row_hash: false,
                reference_display: true,
                reference_hash: false,
            },
        );
        assert_eq!(
            sql,
            "\"SYS_RECORDID\", \"ID\", \"REGION\" ->> 'value', \
             \"REGION\" ->> 'displayValue', (\"PATH\")::text"
        );
    }

    #[test]
    fn null_values_become_typed_nulls() {
        let field = Field::new("ID", FieldType::Integer);
        let expr = value_expression(&field, None);
        assert_eq!(expr.sql(), "?");
        assert_eq!(expr.params(), &[SqlValue::Null(NullKind::Int)]);

        let tree = Field::new("PATH", FieldType::Tree);
        let expr = value_expression(&tree, None);
        assert_eq!(expr.sql(), "?::ltree");
    }

    #[test]
    fn tree_values_are_cast_to_ltree() {
        let field = Field::new("PATH", FieldType::Tree);
        let expr = value_expression(&field, Some(&TypedValue::Tree("a.b.c".to_string())));
        assert_eq!(expr.sql(), "?::ltree");
        assert_eq!(expr.params(), &[SqlValue::String("a.b.c".to_string())]);
    }

    #[test]
    fn unresolvable_reference_becomes_literal_jsonb() {
        let field = Field::new("REGION", FieldType::Reference);
        let value = TypedValue::Reference(ReferenceValue::of_value("77"));
        let expr = value_expression(&field, Some(&value));
        assert_eq!(expr.sql(), "jsonb_build_object('value', ?::text)");
        assert_eq!(expr.params(), &[SqlValue::String("77".to_string())]);
    }

    #[test]
    fn resolvable_reference_becomes_correlated_subselect() {
        let field = Field::new("REGION", FieldType::Reference);
        let reference = ReferenceValue {
            storage_code: Some("ref.regions".to_string()),
            as_of_date: NaiveDate::from_ymd_opt(2021, 6, 1),
            key_field: Some("CODE".to_string()),
            display_field: Some("NAME".to_string()),
            ..ReferenceValue::of_value("77")
        };
        let expr = value_expression(&field, Some(&TypedValue::Reference(reference)));
        assert!(expr.sql().starts_with(
            "(SELECT jsonb_build_object('value', d.\"CODE\"::text, \
             'displayValue', d.\"NAME\"::text, 'hash', d.\"SYS_HASH\") \
             FROM \"ref\".\"regions\" d WHERE d.\"CODE\"::text = ?"
        ));
        assert!(expr.sql().contains("\"SYS_PUBLISHTIME\") <= ?"));
        assert!(expr.sql().contains("\"SYS_CLOSETIME\" IS NULL)"));
        assert_eq!(expr.params().len(), 3);
    }

    #[test]
    fn insert_values_align_with_columns() {
        let fields = fields();
        let row = Row::of_values(vec![
            RowValue::new("ID", Some(TypedValue::Integer(1))),
            RowValue::new("REGION", None),
            RowValue::new("PATH", Some(TypedValue::Tree("a.b".to_string()))),
        ]);
        let (columns, values) = insert_values(&fields, &row);
        assert_eq!(columns, vec!["\"ID\"", "\"REGION\"", "\"PATH\""]);
        assert_eq!(values.sql(), "?, ?, ?::ltree");
        assert_eq!(values.params().len(), 3);
    }

    #[test]
    fn update_assignments_name_each_column() {
        let fields = vec![Field::new("NAME", FieldType::String { max_length: None })];
        let row = Row::of_values(vec![RowValue::new("NAME", Some(TypedValue::from("x")))]);
        let assignments = update_assignments(&fields, &row);
        assert_eq!(assignments.sql(), "\"NAME\" = ?");
    }
}
