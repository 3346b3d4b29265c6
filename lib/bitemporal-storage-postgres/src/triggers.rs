//! Hash and full-text-search maintenance.
//!
//! Two triggers fire before insert/update on any non-system column: one
//! recomputes `SYS_HASH` as an md5 digest of the row's values concatenated
//! in fixed field order, the other recomputes the search vector. The digest
//! input matches [`bitemporal_storage::row_content_hash`] byte-for-byte.
//!
//! After any structural change the triggers must be dropped and recreated
//! with the updated field list before further writes, otherwise hash and
//! search values silently go stale.

use tracing::debug;

use bitemporal_storage::{
    Field, FieldType, SYS_FTS, SYS_HASH, SqlWithParams, StorageCode, StorageError,
    escape_identifier,
};

use crate::executor::SqlExecutor;

/// Text search configuration used alongside the `'simple'` default.
pub const DEFAULT_FTS_CONFIG: &str = "english";

/// Per-field digest input expression. References contribute only their raw
/// key so display re-resolution does not change row identity.
fn hash_input(prefix: &str, field: &Field) -> String {
    let name = escape_identifier(field.name());
    match field.field_type() {
        FieldType::Reference => format!("coalesce({prefix}{name} ->> 'value', '')"),
        _ => format!("coalesce({prefix}{name}::text, '')"),
    }
}

/// `md5(concat_ws(';', ...))` over all fields in order.
fn hash_expression(prefix: &str, fields: &[Field]) -> String {
    let inputs = fields
        .iter()
        .map(|f| hash_input(prefix, f))
        .collect::<Vec<_>>()
        .join(", ");
    format!("md5(concat_ws(';', {inputs}))")
}

/// `to_tsvector` over the same fields, default plus language configuration.
fn fts_expression(prefix: &str, fields: &[Field], config: &str) -> String {
    let inputs = fields
        .iter()
        .map(|f| hash_input(prefix, f))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "to_tsvector('simple', concat_ws(' ', {inputs})) || \
         to_tsvector('{config}', concat_ws(' ', {inputs}))"
    )
}

fn column_list(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| escape_identifier(f.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// DDL creating the hash trigger function and trigger.
pub(crate) fn create_hash_trigger_ddl(code: &StorageCode, fields: &[Field]) -> Vec<SqlWithParams> {
    let function = format!(
        "{}.{}",
        escape_identifier(code.schema()),
        escape_identifier(&code.hash_function_name())
    );
    vec![
        SqlWithParams::of(format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $$ \
             BEGIN NEW.{hash} := {expression}; RETURN NEW; END; \
             $$ LANGUAGE plpgsql",
            hash = escape_identifier(SYS_HASH),
            expression = hash_expression("NEW.", fields),
        )),
        SqlWithParams::of(format!(
            "CREATE TRIGGER {trigger} BEFORE INSERT OR UPDATE OF {columns} ON {table} \
             FOR EACH ROW EXECUTE PROCEDURE {function}()",
            trigger = code.hash_trigger_name(),
            columns = column_list(fields),
            table = code.escaped_qualified_name(),
        )),
    ]
}

/// DDL creating the FTS trigger function and trigger.
pub(crate) fn create_fts_trigger_ddl(
    code: &StorageCode,
    fields: &[Field],
    config: &str,
) -> Vec<SqlWithParams> {
    let function = format!(
        "{}.{}",
        escape_identifier(code.schema()),
        escape_identifier(&code.fts_function_name())
    );
    vec![
        SqlWithParams::of(format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $$ \
             BEGIN NEW.{fts} := {expression}; RETURN NEW; END; \
             $$ LANGUAGE plpgsql",
            fts = escape_identifier(SYS_FTS),
            expression = fts_expression("NEW.", fields, config),
        )),
        SqlWithParams::of(format!(
            "CREATE TRIGGER {trigger} BEFORE INSERT OR UPDATE OF {columns} ON {table} \
             FOR EACH ROW EXECUTE PROCEDURE {function}()",
            trigger = code.fts_trigger_name(),
            columns = column_list(fields),
            table = code.escaped_qualified_name(),
        )),
    ]
}

/// Idempotent drop of both triggers and their backing functions.
pub(crate) fn drop_triggers_ddl(code: &StorageCode) -> Vec<SqlWithParams> {
    let table = code.escaped_qualified_name();
    let schema = escape_identifier(code.schema());
    vec![
        SqlWithParams::of(format!(
            "DROP TRIGGER IF EXISTS {} ON {table}",
            code.hash_trigger_name()
        )),
        SqlWithParams::of(format!(
            "DROP TRIGGER IF EXISTS {} ON {table}",
            code.fts_trigger_name()
        )),
        SqlWithParams::of(format!(
            "DROP FUNCTION IF EXISTS {schema}.{}()",
            escape_identifier(&code.hash_function_name())
        )),
        SqlWithParams::of(format!(
            "DROP FUNCTION IF EXISTS {schema}.{}()",
            escape_identifier(&code.fts_function_name())
        )),
    ]
}

/// Create both maintenance triggers for the current field list.
pub async fn create_triggers<E: SqlExecutor>(
    exec: &mut E,
    code: &StorageCode,
    fields: &[Field],
    fts_config: &str,
) -> Result<(), StorageError> {
    debug!(storage = %code, "creating hash and fts triggers");
    for ddl in create_hash_trigger_ddl(code, fields)
        .into_iter()
        .chain(create_fts_trigger_ddl(code, fields, fts_config))
    {
        exec.execute(&ddl).await?;
    }
    Ok(())
}

/// Drop both maintenance triggers. Idempotent.
pub async fn drop_triggers<E: SqlExecutor>(
    exec: &mut E,
    code: &StorageCode,
) -> Result<(), StorageError> {
    debug!(storage = %code, "dropping hash and fts triggers");
    for ddl in drop_triggers_ddl(code) {
        exec.execute(&ddl).await?;
    }
    Ok(())
}

/// Batch recompute of `SYS_HASH` without relying on triggers, used after
/// bulk column changes.
pub async fn update_hash_rows<E: SqlExecutor>(
    exec: &mut E,
    code: &StorageCode,
    fields: &[Field],
) -> Result<u64, StorageError> {
    let update = SqlWithParams::of(format!(
        "UPDATE {table} SET {hash} = {expression}",
        table = code.escaped_qualified_name(),
        hash = escape_identifier(SYS_HASH),
        expression = hash_expression("", fields),
    ));
    exec.execute(&update).await
}

/// Batch recompute of the FTS vector without relying on triggers.
pub async fn update_fts_rows<E: SqlExecutor>(
    exec: &mut E,
    code: &StorageCode,
    fields: &[Field],
    fts_config: &str,
) -> Result<u64, StorageError> {
    let update = SqlWithParams::of(format!(
        "UPDATE {table} SET {fts} = {expression}",
        table = code.escaped_qualified_name(),
        fts = escape_identifier(SYS_FTS),
        expression = fts_expression("", fields, fts_config),
    ));
    exec.execute(&update).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code() -> StorageCode {
        "ref.countries".parse().unwrap()
    }

    fn fields() -> Vec<Field> {
        vec![
            Field::new("CODE", FieldType::String { max_length: None }),
            Field::new("REGION", FieldType::Reference),
        ]
    }

    #[test]
    fn hash_expression_matches_rust_side_canonical_form() {
        let expression = hash_expression("NEW.", &fields());
        assert_eq!(
            expression,
            "md5(concat_ws(';', coalesce(NEW.\"CODE\"::text, ''), \
             coalesce(NEW.\"REGION\" ->> 'value', '')))"
        );
    }

    #[test]
    fn hash_trigger_fires_only_on_data_columns() {
        let ddl = create_hash_trigger_ddl(&code(), &fields());
        assert_eq!(ddl.len(), 2);
        assert!(ddl[0].sql().contains("\"ref\".\"countries_hash_tf\""));
        assert!(
            ddl[1]
                .sql()
                .contains("BEFORE INSERT OR UPDATE OF \"CODE\", \"REGION\" ON")
        );
        assert!(ddl[1].sql().starts_with("CREATE TRIGGER hash_tg"));
    }

    #[test]
    fn fts_trigger_queries_both_configurations() {
        let ddl = create_fts_trigger_ddl(&code(), &fields(), DEFAULT_FTS_CONFIG);
        assert!(ddl[0].sql().contains("to_tsvector('simple'"));
        assert!(ddl[0].sql().contains("to_tsvector('english'"));
        assert!(ddl[1].sql().starts_with("CREATE TRIGGER fts_vector_tg"));
    }

    #[test]
    fn drop_is_idempotent() {
        let ddl = drop_triggers_ddl(&code());
        assert_eq!(ddl.len(), 4);
        assert!(ddl.iter().all(|q| q.sql().contains("IF EXISTS")));
    }
}
