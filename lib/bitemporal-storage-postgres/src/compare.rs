//! Field-level comparison of two storages.
//!
//! Joins two (optionally date-sliced) storages with a full outer join on
//! caller-declared primary fields and classifies each joined pair: missing
//! on the old side is `Inserted`, missing on the new side is `Deleted`,
//! present on both with differing content hashes is `Updated`. Identical
//! pairs are filtered out in SQL, so only differing rows travel to the
//! client. Classification and field-level value retention happen in Rust
//! over the decoded pair.

use tracing::debug;

use bitemporal_storage::{
    CompareCriteria, DiffFieldValue, DiffPage, DiffRowValue, DiffStatus, Field, FieldType, Row,
    SYS_HASH, SYS_RECORDID, SqlWithParams, StorageError, TypedValue, escape_identifier,
};

use crate::codec::{self, ValueParts};
use crate::draft::table_columns;
use crate::executor::{PgPool, SqlExecutor};
use crate::predicate;
use crate::triggers::DEFAULT_FTS_CONFIG;

/// Resolve the declared primary field names against the field list.
fn primary_fields<'a>(
    fields: &'a [Field],
    criteria: &CompareCriteria,
) -> Result<Vec<&'a Field>, StorageError> {
    if criteria.primary_fields.is_empty() {
        return Err(StorageError::Backend(
            "comparison requires at least one primary field".to_string(),
        ));
    }
    criteria
        .primary_fields
        .iter()
        .map(|name| {
            fields.iter().find(|f| f.name() == name).ok_or_else(|| {
                StorageError::FieldNotFound {
                    storage: criteria.new_storage.to_string(),
                    field: name.clone(),
                }
            })
        })
        .collect()
}

/// Text form of one side's field, suitable for join and ordering across
/// types; references contribute their raw key.
fn text_expr(alias: &str, field: &Field) -> String {
    let name = escape_identifier(field.name());
    match field.field_type() {
        FieldType::Reference => format!("{alias}.{name} ->> 'value'"),
        _ => format!("{alias}.{name}::text"),
    }
}

/// The joined source: each side date-filtered independently, matched on the
/// primary fields.
pub(crate) fn joined_source(
    criteria: &CompareCriteria,
    primary: &[&Field],
) -> SqlWithParams {
    let join = primary
        .iter()
        .map(|f| {
            format!(
                "{} IS NOT DISTINCT FROM {}",
                text_expr("o", f),
                text_expr("n", f)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    let old_slice = bitemporal_storage::DataCriteria {
        begin_date: criteria.old_date,
        end_date: criteria.old_date,
        ..bitemporal_storage::DataCriteria::new()
    };
    let new_slice = bitemporal_storage::DataCriteria {
        begin_date: criteria.new_date,
        end_date: criteria.new_date,
        ..bitemporal_storage::DataCriteria::new()
    };

    let mut source = SqlWithParams::of(format!(
        "(SELECT * FROM {}",
        criteria.old_storage.escaped_qualified_name()
    ));
    source.append(predicate::build_where(&old_slice, DEFAULT_FTS_CONFIG));
    source.push_sql(&format!(
        ") o FULL OUTER JOIN (SELECT * FROM {}",
        criteria.new_storage.escaped_qualified_name()
    ));
    source.append(predicate::build_where(&new_slice, DEFAULT_FTS_CONFIG));
    source.push_sql(&format!(") n ON {join}"));
    source
}

/// Filter selecting only the requested kind(s) of difference. Identical
/// pairs (same hash on both sides) never match.
pub(crate) fn diff_condition(status: Option<DiffStatus>) -> String {
    let id = escape_identifier(SYS_RECORDID);
    let hash = escape_identifier(SYS_HASH);
    match status {
        None => format!("(o.{id} IS NULL OR n.{id} IS NULL OR o.{hash} <> n.{hash})"),
        Some(DiffStatus::Inserted) => format!("o.{id} IS NULL"),
        Some(DiffStatus::Deleted) => format!("n.{id} IS NULL"),
        Some(DiffStatus::Updated) => format!(
            "o.{id} IS NOT NULL AND n.{id} IS NOT NULL AND o.{hash} <> n.{hash}"
        ),
    }
}

/// Stable ordering over both sides of the join: the new side's primary
/// values, falling back to the old side's for deleted rows.
pub(crate) fn order_clause(primary: &[&Field]) -> String {
    primary
        .iter()
        .map(|f| format!("coalesce({}, {})", text_expr("n", f), text_expr("o", f)))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn count_query(criteria: &CompareCriteria, primary: &[&Field]) -> SqlWithParams {
    let mut count = SqlWithParams::of("SELECT count(*) FROM ");
    count.append(joined_source(criteria, primary));
    count.push_sql(" WHERE ");
    count.push_sql(&diff_condition(criteria.status));
    count
}

pub(crate) fn select_query(
    criteria: &CompareCriteria,
    fields: &[Field],
    primary: &[&Field],
    parts: ValueParts,
) -> SqlWithParams {
    let mut select = SqlWithParams::of(format!(
        "SELECT {}, {} FROM ",
        codec::select_columns_prefixed(fields, parts, "o."),
        codec::select_columns_prefixed(fields, parts, "n."),
    ));
    select.append(joined_source(criteria, primary));
    select.push_sql(" WHERE ");
    select.push_sql(&diff_condition(criteria.status));
    select.push_sql(&format!(
        " ORDER BY {} LIMIT {} OFFSET {}",
        order_clause(primary),
        criteria.size,
        criteria.offset()
    ));
    select
}

/// Equality for change detection; references compare by raw key only, since
/// display parts are re-resolved presentation data.
fn values_equal(old: Option<&TypedValue>, new: Option<&TypedValue>) -> bool {
    match (old, new) {
        (Some(TypedValue::Reference(o)), Some(TypedValue::Reference(n))) => o.value == n.value,
        _ => old == new,
    }
}

/// Classify one joined pair and retain field values per the status: inserted
/// rows carry new values, deleted rows old values, updated rows both values
/// for changed fields and only the new value for unchanged ones.
pub(crate) fn classify(fields: &[Field], old: &Row, new: &Row) -> Option<DiffRowValue> {
    let status = match (old.system_id(), new.system_id()) {
        (None, Some(_)) => DiffStatus::Inserted,
        (Some(_), None) => DiffStatus::Deleted,
        (Some(_), Some(_)) => DiffStatus::Updated,
        (None, None) => return None,
    };

    let values = fields
        .iter()
        .map(|field| {
            let old_value = old.value_of(field.name()).cloned();
            let new_value = new.value_of(field.name()).cloned();
            match status {
                DiffStatus::Inserted => DiffFieldValue {
                    field: field.name().to_string(),
                    old_value: None,
                    new_value,
                },
                DiffStatus::Deleted => DiffFieldValue {
                    field: field.name().to_string(),
                    old_value,
                    new_value: None,
                },
                DiffStatus::Updated => {
                    if values_equal(old_value.as_ref(), new_value.as_ref()) {
                        DiffFieldValue {
                            field: field.name().to_string(),
                            old_value: None,
                            new_value,
                        }
                    } else {
                        DiffFieldValue {
                            field: field.name().to_string(),
                            old_value,
                            new_value,
                        }
                    }
                }
            }
        })
        .collect();

    Some(DiffRowValue { status, values })
}

/// Compare two storages (or one storage at two dates) and return the
/// differing rows, classified and paginated.
pub async fn compare_data(
    pool: &PgPool,
    fields: &[Field],
    criteria: &CompareCriteria,
    parts: ValueParts,
) -> Result<DiffPage, StorageError> {
    let mut pool = pool.clone();

    let old_columns = table_columns(&mut pool, &criteria.old_storage).await?;
    let new_columns = table_columns(&mut pool, &criteria.new_storage).await?;
    if old_columns != new_columns {
        return Err(StorageError::StructureMismatch {
            draft: criteria.old_storage.to_string(),
            version: criteria.new_storage.to_string(),
        });
    }

    let primary = primary_fields(fields, criteria)?;
    let count = pool.count(&count_query(criteria, &primary)).await?;
    debug!(
        old = %criteria.old_storage,
        new = %criteria.new_storage,
        count,
        "comparison counted"
    );
    if criteria.count_only {
        return Ok(DiffPage {
            count,
            rows: Vec::new(),
        });
    }

    let tuples = pool
        .fetch(&select_query(criteria, fields, &primary, parts))
        .await?;
    let side_width = codec::row_layout(fields, parts).len();
    let mut rows = Vec::with_capacity(tuples.len());
    for tuple in &tuples {
        let old = codec::encode_row_offset(fields, parts, tuple, 0)?;
        let new = codec::encode_row_offset(fields, parts, tuple, side_width)?;
        if let Some(diff) = classify(fields, &old, &new) {
            rows.push(diff);
        }
    }
    Ok(DiffPage { count, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitemporal_storage::{RowValue, StorageCode};
    use chrono::{TimeZone, Utc};

    fn fields() -> Vec<Field> {
        vec![
            Field::new("ID", FieldType::Integer),
            Field::new("NAME", FieldType::String { max_length: None }),
        ]
    }

    fn criteria() -> CompareCriteria {
        let old: StorageCode = "data.old_v".parse().unwrap();
        let new: StorageCode = "data.new_v".parse().unwrap();
        CompareCriteria::new(old, new, vec!["ID".to_string()])
    }

    fn row(id: Option<i64>, value: i64, name: &str) -> Row {
        Row::new(
            id,
            id.map(|_| "h".to_string()),
            vec![
                RowValue::new("ID", Some(TypedValue::Integer(value))),
                RowValue::new("NAME", Some(TypedValue::from(name))),
            ],
        )
    }

    fn absent() -> Row {
        Row::new(None, None, Vec::new())
    }

    #[test]
    fn joined_source_slices_each_side_independently() {
        let fields = fields();
        let primary = vec![&fields[0]];
        let mut criteria = criteria();
        criteria.old_date = Some(Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap());
        criteria.new_date = Some(Utc.with_ymd_and_hms(2021, 7, 1, 0, 0, 0).unwrap());

        let source = joined_source(&criteria, &primary);
        assert!(source.sql().starts_with("(SELECT * FROM \"data\".\"old_v\" WHERE"));
        assert!(source.sql().contains("FULL OUTER JOIN (SELECT * FROM \"data\".\"new_v\" WHERE"));
        assert!(source.sql().ends_with(
            ") n ON o.\"ID\"::text IS NOT DISTINCT FROM n.\"ID\"::text"
        ));
        // three date params per side: publish bound plus both close bounds
        assert_eq!(source.params().len(), 6);
    }

    #[test]
    fn diff_condition_matches_the_requested_status() {
        assert_eq!(
            diff_condition(None),
            "(o.\"SYS_RECORDID\" IS NULL OR n.\"SYS_RECORDID\" IS NULL \
             OR o.\"SYS_HASH\" <> n.\"SYS_HASH\")"
        );
        assert_eq!(
            diff_condition(Some(DiffStatus::Inserted)),
            "o.\"SYS_RECORDID\" IS NULL"
        );
        assert_eq!(
            diff_condition(Some(DiffStatus::Deleted)),
            "n.\"SYS_RECORDID\" IS NULL"
        );
        assert!(diff_condition(Some(DiffStatus::Updated)).contains("<>"));
    }

    #[test]
    fn select_query_orders_by_primary_and_paginates() {
        let fields = fields();
        let primary = vec![&fields[0]];
        let mut criteria = criteria();
        criteria.page = 2;
        criteria.size = 20;

        let select = select_query(&criteria, &fields, &primary, ValueParts::default());
        assert!(select.sql().starts_with(
            "SELECT o.\"SYS_RECORDID\", o.\"ID\", o.\"NAME\", \
             n.\"SYS_RECORDID\", n.\"ID\", n.\"NAME\" FROM "
        ));
        assert!(select.sql().contains(
            "ORDER BY coalesce(n.\"ID\"::text, o.\"ID\"::text) LIMIT 20 OFFSET 20"
        ));
    }

    #[test]
    fn missing_primary_field_is_reported() {
        let fields = fields();
        let mut criteria = criteria();
        criteria.primary_fields = vec!["CODE".to_string()];
        match primary_fields(&fields, &criteria).unwrap_err() {
            StorageError::FieldNotFound { field, .. } => assert_eq!(field, "CODE"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn changed_value_is_an_update_with_both_values() {
        let fields = fields();
        let diff = classify(&fields, &row(Some(1), 1, "a"), &row(Some(9), 1, "b")).unwrap();
        assert_eq!(diff.status, DiffStatus::Updated);

        let name = diff.value_of("NAME").unwrap();
        assert_eq!(name.old_value, Some(TypedValue::from("a")));
        assert_eq!(name.new_value, Some(TypedValue::from("b")));

        // the unchanged primary keeps only the new value
        let id = diff.value_of("ID").unwrap();
        assert_eq!(id.old_value, None);
        assert_eq!(id.new_value, Some(TypedValue::Integer(1)));
    }

    #[test]
    fn row_missing_on_the_new_side_is_deleted() {
        let fields = fields();
        let diff = classify(&fields, &row(Some(2), 2, "y"), &absent()).unwrap();
        assert_eq!(diff.status, DiffStatus::Deleted);
        let name = diff.value_of("NAME").unwrap();
        assert_eq!(name.old_value, Some(TypedValue::from("y")));
        assert_eq!(name.new_value, None);
    }

    #[test]
    fn row_missing_on_the_old_side_is_inserted() {
        let fields = fields();
        let diff = classify(&fields, &absent(), &row(Some(3), 3, "z")).unwrap();
        assert_eq!(diff.status, DiffStatus::Inserted);
        let name = diff.value_of("NAME").unwrap();
        assert_eq!(name.old_value, None);
        assert_eq!(name.new_value, Some(TypedValue::from("z")));
    }

    #[test]
    fn reference_change_detection_uses_the_raw_key() {
        use bitemporal_storage::ReferenceValue;
        let mut displayed = ReferenceValue::of_value("77");
        displayed.display_value = Some("Moscow".to_string());
        assert!(values_equal(
            Some(&TypedValue::Reference(ReferenceValue::of_value("77"))),
            Some(&TypedValue::Reference(displayed)),
        ));
        assert!(!values_equal(
            Some(&TypedValue::Reference(ReferenceValue::of_value("77"))),
            Some(&TypedValue::Reference(ReferenceValue::of_value("78"))),
        ));
    }
}
