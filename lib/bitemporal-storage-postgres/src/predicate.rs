//! Criteria-to-WHERE-clause translation.
//!
//! Turns a [`DataCriteria`] into one parameterized SQL fragment. Filters
//! sharing the same comparison kind and field within an AND-group are
//! coalesced into a single `IN (...)` to reduce parameter count; the output
//! order of coalesced values is not guaranteed.

use chrono::{DateTime, Utc};

use bitemporal_storage::{
    DataCriteria, FieldSearchCriteria, FieldType, SYS_CLOSETIME, SYS_FTS, SYS_HASH,
    SYS_PUBLISHTIME, SYS_RECORDID, SearchType, SqlValue, SqlWithParams, TypedValue,
    escape_identifier,
};

use crate::time::truncate_to_seconds;

/// Bindable parameter for a typed value; references bind their raw key.
fn sql_param(value: &TypedValue) -> SqlValue {
    match value {
        TypedValue::String(s) => SqlValue::String(s.clone()),
        TypedValue::Integer(n) => SqlValue::Int(*n),
        TypedValue::Float(n) => SqlValue::Float(*n),
        TypedValue::Date(d) => SqlValue::Date(*d),
        TypedValue::Boolean(b) => SqlValue::Bool(*b),
        TypedValue::Reference(r) => SqlValue::String(r.value.clone().unwrap_or_default()),
        TypedValue::Tree(path) => SqlValue::String(path.clone()),
    }
}

/// Escape LIKE wildcards so the search value matches as a literal substring.
fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Column expression a filter compares against.
fn filter_column(criteria: &FieldSearchCriteria) -> String {
    let name = escape_identifier(criteria.field.name());
    match (criteria.search_type, criteria.field.field_type()) {
        // match against the resolved reference key, not its display value
        (SearchType::Reference, _) | (_, FieldType::Reference) => {
            format!("{name} ->> 'value'")
        }
        _ => name,
    }
}

/// SQL for one (possibly coalesced) per-field filter.
fn filter_predicate(criteria: &FieldSearchCriteria) -> SqlWithParams {
    let column = filter_column(criteria);
    let mut predicate = SqlWithParams::new();

    match criteria.search_type {
        SearchType::IsNull => {
            predicate.push_sql(&format!("{column} IS NULL"));
        }
        SearchType::IsNotNull => {
            predicate.push_sql(&format!("{column} IS NOT NULL"));
        }
        SearchType::Like => {
            let value = criteria
                .values
                .first()
                .and_then(|v| v.as_ref())
                .map(|v| v.to_text())
                .unwrap_or_default();
            predicate.push_sql(&format!("{column}::text ILIKE "));
            predicate.push_param(format!("%{}%", escape_like(&value)));
        }
        SearchType::More => {
            let value = criteria
                .values
                .first()
                .and_then(|v| v.as_ref())
                .map(|v| v.to_text())
                .unwrap_or_default();
            // set containment: rows below the given node
            predicate.push_sql(&format!("{column} <@ "));
            predicate.push_param(value);
            predicate.push_sql("::ltree");
        }
        SearchType::Less => {
            let value = criteria
                .values
                .first()
                .and_then(|v| v.as_ref())
                .map(|v| v.to_text())
                .unwrap_or_default();
            // set containment: rows above the given node
            predicate.push_sql(&format!("{column} @> "));
            predicate.push_param(value);
            predicate.push_sql("::ltree");
        }
        SearchType::Exact | SearchType::Reference => {
            let non_null: Vec<SqlValue> = criteria
                .values
                .iter()
                .flatten()
                .map(sql_param)
                .collect();
            let has_null = criteria.values.iter().any(|v| v.is_none());

            if non_null.is_empty() {
                predicate.push_sql(&format!("{column} IS NULL"));
            } else {
                if has_null {
                    predicate.push_sql("(");
                }
                predicate.push_sql(&format!("{column} IN ("));
                predicate.push_param_list(non_null);
                predicate.push_sql(")");
                if has_null {
                    predicate.push_sql(&format!(" OR {column} IS NULL)"));
                }
            }
        }
    }
    predicate
}

/// Coalesce same-kind same-field filters of one AND-group into single
/// filters with merged value lists.
fn coalesce_group(group: &[FieldSearchCriteria]) -> Vec<FieldSearchCriteria> {
    let mut merged: Vec<FieldSearchCriteria> = Vec::new();
    for criteria in group {
        let coalescible = matches!(
            criteria.search_type,
            SearchType::Exact | SearchType::Reference
        );
        if coalescible
            && let Some(existing) = merged.iter_mut().find(|m| {
                m.search_type == criteria.search_type && m.field.name() == criteria.field.name()
            })
        {
            existing.values.extend(criteria.values.iter().cloned());
        } else {
            merged.push(criteria.clone());
        }
    }
    merged
}

/// The validity-window predicate, truncated to whole seconds on both sides.
fn date_range_predicate(
    begin: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Option<SqlWithParams> {
    if begin.is_none() && end.is_none() {
        return None;
    }
    let publish = escape_identifier(SYS_PUBLISHTIME);
    let close = escape_identifier(SYS_CLOSETIME);
    let mut predicate = SqlWithParams::new();

    if let Some(begin) = begin {
        let begin = truncate_to_seconds(begin);
        predicate.push_sql(&format!("date_trunc('second', {publish}) <= "));
        predicate.push_param(begin);
        predicate.push_sql(&format!(" AND (date_trunc('second', {close}) > "));
        predicate.push_param(begin);
        predicate.push_sql(&format!(" OR {close} IS NULL)"));
    }
    if let Some(end) = end {
        if !predicate.sql().is_empty() {
            predicate.push_sql(" AND ");
        }
        predicate.push_sql(&format!("(date_trunc('second', {close}) >= "));
        predicate.push_param(truncate_to_seconds(end));
        predicate.push_sql(&format!(" OR {close} IS NULL)"));
    }
    Some(predicate)
}

/// Detect a `dd.mm.yyyy`-like value and reorder it to ISO form.
fn reorder_date_to_iso(text: &str) -> Option<String> {
    let parts: Vec<&str> = text.split('.').collect();
    if let [day, month, year] = parts[..]
        && (1..=2).contains(&day.len())
        && (1..=2).contains(&month.len())
        && year.len() == 4
        && parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()))
    {
        return Some(format!("{year}-{month:0>2}-{day:0>2}"));
    }
    None
}

/// The free-text predicate against the FTS vector.
fn common_filter_predicate(text: &str, fts_config: &str) -> Option<SqlWithParams> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let fts = escape_identifier(SYS_FTS);
    let mut predicate = SqlWithParams::new();

    if let Some(iso) = reorder_date_to_iso(text) {
        // the indexed vector may contain either text representation
        predicate.push_sql(&format!("({fts} @@ to_tsquery("));
        predicate.push_param(format!("'{text}'"));
        predicate.push_sql(&format!(") OR {fts} @@ to_tsquery("));
        predicate.push_param(format!("'{iso}'"));
        predicate.push_sql("))");
    } else {
        let query = text
            .to_lowercase()
            .split_whitespace()
            .map(|token| format!("{token}:*"))
            .collect::<Vec<_>>()
            .join(" & ");
        predicate.push_sql(&format!("({fts} @@ to_tsquery('simple', "));
        predicate.push_param(query.clone());
        predicate.push_sql(&format!(") OR {fts} @@ to_tsquery('{fts_config}', "));
        predicate.push_param(query);
        predicate.push_sql("))");
    }
    Some(predicate)
}

/// Build the full WHERE clause (including the leading ` WHERE `) for
/// `criteria`; empty when no restriction applies.
pub fn build_where(criteria: &DataCriteria, fts_config: &str) -> SqlWithParams {
    let mut clauses: Vec<SqlWithParams> = Vec::new();

    if !criteria.system_ids.is_empty() {
        let mut clause = SqlWithParams::of(format!(
            "{} IN (",
            escape_identifier(SYS_RECORDID)
        ));
        clause.push_param_list(criteria.system_ids.iter().copied());
        clause.push_sql(")");
        clauses.push(clause);
    }

    if !criteria.hashes.is_empty() {
        let mut clause = SqlWithParams::of(format!("{} IN (", escape_identifier(SYS_HASH)));
        clause.push_param_list(criteria.hashes.iter().map(String::as_str));
        clause.push_sql(")");
        clauses.push(clause);
    }

    if let Some(clause) = date_range_predicate(criteria.begin_date, criteria.end_date) {
        clauses.push(clause);
    }

    let groups: Vec<SqlWithParams> = criteria
        .field_filters
        .iter()
        .filter(|group| !group.is_empty())
        .map(|group| {
            let mut combined = SqlWithParams::of("(");
            for (i, filter) in coalesce_group(group).iter().enumerate() {
                if i > 0 {
                    combined.push_sql(" AND ");
                }
                combined.append(filter_predicate(filter));
            }
            combined.push_sql(")");
            combined
        })
        .collect();
    if !groups.is_empty() {
        let mut clause = SqlWithParams::of("(");
        for (i, group) in groups.into_iter().enumerate() {
            if i > 0 {
                clause.push_sql(" OR ");
            }
            clause.append(group);
        }
        clause.push_sql(")");
        clauses.push(clause);
    }

    if let Some(text) = &criteria.common_filter
        && let Some(clause) = common_filter_predicate(text, fts_config)
    {
        clauses.push(clause);
    }

    let mut where_clause = SqlWithParams::new();
    for (i, clause) in clauses.into_iter().enumerate() {
        where_clause.push_sql(if i == 0 { " WHERE " } else { " AND " });
        where_clause.append(clause);
    }
    where_clause
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitemporal_storage::Field;
    use chrono::TimeZone;

    fn name_field() -> Field {
        Field::new("NAME", FieldType::String { max_length: None })
    }

    fn exact(values: Vec<Option<TypedValue>>) -> FieldSearchCriteria {
        FieldSearchCriteria::exact(name_field(), values)
    }

    #[test]
    fn exact_filter_emits_in_list() {
        let criteria = DataCriteria {
            field_filters: vec![vec![exact(vec![
                Some(TypedValue::from("a")),
                Some(TypedValue::from("b")),
            ])]],
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(clause.sql(), " WHERE ((\"NAME\" IN (?, ?)))");
        assert_eq!(clause.params().len(), 2);
    }

    #[test]
    fn sole_null_value_becomes_is_null() {
        let criteria = DataCriteria {
            field_filters: vec![vec![exact(vec![None])]],
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(clause.sql(), " WHERE ((\"NAME\" IS NULL))");
        assert!(clause.params().is_empty());
    }

    #[test]
    fn like_filter_is_case_insensitive_substring() {
        let criteria = DataCriteria {
            field_filters: vec![vec![FieldSearchCriteria::new(
                name_field(),
                SearchType::Like,
                vec![Some(TypedValue::from("al"))],
            )]],
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(clause.sql(), " WHERE ((\"NAME\"::text ILIKE ?))");
        assert_eq!(clause.params(), &[SqlValue::String("%al%".to_string())]);
    }

    #[test]
    fn like_wildcards_in_the_search_value_match_literally() {
        let criteria = DataCriteria {
            field_filters: vec![vec![FieldSearchCriteria::new(
                name_field(),
                SearchType::Like,
                vec![Some(TypedValue::from("100%_off\\"))],
            )]],
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(
            clause.params(),
            &[SqlValue::String("%100\\%\\_off\\\\%".to_string())]
        );
    }

    #[test]
    fn tree_filters_use_set_containment_not_prefix_match() {
        let path = Field::new("PATH", FieldType::Tree);
        let criteria = DataCriteria {
            field_filters: vec![vec![
                FieldSearchCriteria::new(
                    path.clone(),
                    SearchType::More,
                    vec![Some(TypedValue::Tree("a.b".to_string()))],
                ),
                FieldSearchCriteria::new(
                    path,
                    SearchType::Less,
                    vec![Some(TypedValue::Tree("a.b".to_string()))],
                ),
            ]],
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(
            clause.sql(),
            " WHERE ((\"PATH\" <@ ?::ltree AND \"PATH\" @> ?::ltree))"
        );
    }

    #[test]
    fn reference_filter_matches_resolved_key() {
        let region = Field::new("REGION", FieldType::Reference);
        let criteria = DataCriteria {
            field_filters: vec![vec![FieldSearchCriteria::new(
                region,
                SearchType::Reference,
                vec![Some(TypedValue::from("77"))],
            )]],
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(clause.sql(), " WHERE ((\"REGION\" ->> 'value' IN (?)))");
    }

    #[test]
    fn same_kind_same_field_filters_coalesce() {
        let criteria = DataCriteria {
            field_filters: vec![vec![
                exact(vec![Some(TypedValue::from("a"))]),
                exact(vec![Some(TypedValue::from("b"))]),
            ]],
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(clause.sql(), " WHERE ((\"NAME\" IN (?, ?)))");
    }

    #[test]
    fn groups_combine_with_or() {
        let criteria = DataCriteria {
            field_filters: vec![
                vec![exact(vec![Some(TypedValue::from("a"))])],
                vec![exact(vec![Some(TypedValue::from("b"))])],
            ],
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(
            clause.sql(),
            " WHERE ((\"NAME\" IN (?)) OR (\"NAME\" IN (?)))"
        );
    }

    #[test]
    fn date_range_predicate_truncates_to_seconds() {
        let begin = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap()
            + chrono::Duration::milliseconds(250);
        let end = Utc.with_ymd_and_hms(2021, 7, 1, 0, 0, 0).unwrap();
        let criteria = DataCriteria {
            begin_date: Some(begin),
            end_date: Some(end),
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(
            clause.sql(),
            " WHERE date_trunc('second', \"SYS_PUBLISHTIME\") <= ? \
             AND (date_trunc('second', \"SYS_CLOSETIME\") > ? OR \"SYS_CLOSETIME\" IS NULL) \
             AND (date_trunc('second', \"SYS_CLOSETIME\") >= ? OR \"SYS_CLOSETIME\" IS NULL)"
        );
        assert_eq!(
            clause.params()[0],
            SqlValue::Timestamp(Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn hash_and_id_lists_bind_each_value() {
        let criteria = DataCriteria {
            hashes: vec!["h1".to_string(), "h2".to_string()],
            system_ids: vec![5, 6],
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(
            clause.sql(),
            " WHERE \"SYS_RECORDID\" IN (?, ?) AND \"SYS_HASH\" IN (?, ?)"
        );
        assert_eq!(clause.params().len(), 4);
    }

    #[test]
    fn free_text_is_tokenized_and_prefix_matched() {
        let criteria = DataCriteria {
            common_filter: Some("Alpha Beta".to_string()),
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(
            clause.sql(),
            " WHERE (\"FTS\" @@ to_tsquery('simple', ?) \
             OR \"FTS\" @@ to_tsquery('english', ?))"
        );
        assert_eq!(
            clause.params(),
            &[
                SqlValue::String("alpha:* & beta:*".to_string()),
                SqlValue::String("alpha:* & beta:*".to_string()),
            ]
        );
    }

    #[test]
    fn date_like_free_text_is_queried_in_both_representations() {
        let criteria = DataCriteria {
            common_filter: Some("05.03.2020".to_string()),
            ..DataCriteria::new()
        };
        let clause = build_where(&criteria, "english");
        assert_eq!(
            clause.sql(),
            " WHERE (\"FTS\" @@ to_tsquery(?) OR \"FTS\" @@ to_tsquery(?))"
        );
        assert_eq!(
            clause.params(),
            &[
                SqlValue::String("'05.03.2020'".to_string()),
                SqlValue::String("'2020-03-05'".to_string()),
            ]
        );
    }

    #[test]
    fn reorder_handles_single_digit_parts() {
        assert_eq!(
            reorder_date_to_iso("5.3.2020").as_deref(),
            Some("2020-03-05")
        );
        assert_eq!(reorder_date_to_iso("alpha"), None);
        assert_eq!(reorder_date_to_iso("05.03.20"), None);
    }

    #[test]
    fn empty_criteria_produce_no_clause() {
        let clause = build_where(&DataCriteria::new(), "english");
        assert!(clause.sql().is_empty());
        assert!(clause.params().is_empty());
    }
}
