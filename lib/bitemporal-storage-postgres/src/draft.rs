//! Draft table management.
//!
//! A storage moves through `NonExistent -> Draft -> Version -> Dropped`.
//! Drafts are the only mutable stage: rows can be added, updated and
//! deleted, fields added, removed and retyped. Every structural operation
//! follows the same recipe inside one transaction: drop triggers, perform
//! the DDL, recreate triggers with the refreshed field list, recompute the
//! hash and FTS columns.

use tracing::{debug, info};

use bitemporal_storage::{
    DataCriteria, DataPage, Field, FieldError, FieldType, Row, SYS_CLOSETIME, SYS_FTS, SYS_HASH,
    SYS_PUBLISHTIME, SYS_RECORDID, SqlWithParams, StorageCode, StorageError, escape_identifier,
};

use crate::codec::{self, ValueParts};
use crate::executor::{PgPool, SqlExecutor};
use crate::predicate;
use crate::triggers;

/// DDL creating a storage table with its sequence, primary key and indexes.
///
/// Version tables additionally carry the validity-interval columns and use a
/// non-unique hash index; drafts enforce hash uniqueness so a draft cannot
/// hold two identical rows.
pub(crate) fn create_table_ddl(
    code: &StorageCode,
    fields: &[Field],
    versioned: bool,
) -> Vec<SqlWithParams> {
    let table = code.escaped_qualified_name();
    let sequence = code.escaped_sequence_name();

    let mut columns = vec![format!(
        "{} bigint NOT NULL",
        escape_identifier(SYS_RECORDID)
    )];
    for field in fields {
        columns.push(format!(
            "{} {}",
            escape_identifier(field.name()),
            field.field_type().sql_type()
        ));
    }
    columns.push(format!("{} tsvector", escape_identifier(SYS_FTS)));
    columns.push(format!("{} char(32)", escape_identifier(SYS_HASH)));
    if versioned {
        // timestamptz: the validity bounds bind as DateTime<Utc> and must not
        // shift with the session time zone
        columns.push(format!(
            "{} timestamptz",
            escape_identifier(SYS_PUBLISHTIME)
        ));
        columns.push(format!("{} timestamptz", escape_identifier(SYS_CLOSETIME)));
    }

    let mut ddl = vec![
        SqlWithParams::of(format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            escape_identifier(code.schema())
        )),
        SqlWithParams::of(format!("CREATE TABLE {table} ({})", columns.join(", "))),
        SqlWithParams::of(format!("CREATE SEQUENCE {sequence}")),
        SqlWithParams::of(format!(
            "ALTER TABLE {table} ALTER COLUMN {id} SET DEFAULT nextval('{sequence}')",
            id = escape_identifier(SYS_RECORDID),
        )),
        SqlWithParams::of(format!(
            "ALTER TABLE {table} ADD PRIMARY KEY ({id})",
            id = escape_identifier(SYS_RECORDID),
        )),
        SqlWithParams::of(format!(
            "CREATE {unique}INDEX {ix} ON {table} ({hash})",
            unique = if versioned { "" } else { "UNIQUE " },
            ix = escape_identifier(&code.hash_index_name()),
            hash = escape_identifier(SYS_HASH),
        )),
        SqlWithParams::of(format!(
            "CREATE INDEX {ix} ON {table} USING gin ({fts})",
            ix = escape_identifier(&code.fts_index_name()),
            fts = escape_identifier(SYS_FTS),
        )),
    ];

    for field in fields {
        if field.is_searchable() || field.is_unique() {
            ddl.push(field_index_ddl(code, field, versioned));
        }
    }
    ddl
}

/// Per-field index. Unique constraints only bind on drafts; a version holds
/// many time slices of the same logical value.
fn field_index_ddl(code: &StorageCode, field: &Field, versioned: bool) -> SqlWithParams {
    let using = match field.field_type() {
        FieldType::Tree => " USING gist",
        _ => "",
    };
    SqlWithParams::of(format!(
        "CREATE {unique}INDEX {ix} ON {table}{using} ({column})",
        unique = if field.is_unique() && !versioned {
            "UNIQUE "
        } else {
            ""
        },
        ix = escape_identifier(&code.field_index_name(field.name())),
        table = code.escaped_qualified_name(),
        column = escape_identifier(field.name()),
    ))
}

/// Check table existence via the catalog.
pub async fn storage_exists<E: SqlExecutor>(
    exec: &mut E,
    code: &StorageCode,
) -> Result<bool, StorageError> {
    let mut query = SqlWithParams::of(
        "SELECT count(*) FROM information_schema.tables WHERE table_schema = ",
    );
    query.push_param(code.schema());
    query.push_sql(" AND table_name = ");
    query.push_param(code.table());
    Ok(exec.count(&query).await? > 0)
}

/// Column names and backend types of a storage, system columns excluded,
/// in ordinal order. Used for structural comparison on publish.
pub async fn table_columns<E: SqlExecutor>(
    exec: &mut E,
    code: &StorageCode,
) -> Result<Vec<(String, String)>, StorageError> {
    use sqlx::Row as _;

    let mut query = SqlWithParams::of(
        "SELECT column_name, data_type FROM information_schema.columns WHERE table_schema = ",
    );
    query.push_param(code.schema());
    query.push_sql(" AND table_name = ");
    query.push_param(code.table());
    query.push_sql(" ORDER BY ordinal_position");

    let rows = exec.fetch(&query).await?;
    let mut columns = Vec::new();
    for row in rows {
        let name: String = row.try_get(0).map_err(crate::executor::from_sqlx)?;
        let data_type: String = row.try_get(1).map_err(crate::executor::from_sqlx)?;
        if !bitemporal_storage::is_system_column(&name) {
            columns.push((name, data_type));
        }
    }
    Ok(columns)
}

/// Collect missing required values across all rows, reporting every
/// violation at once.
pub(crate) fn validate_required(fields: &[Field], rows: &[Row]) -> Result<(), StorageError> {
    let mut errors = Vec::new();
    for row in rows {
        for field in fields {
            if field.is_required() && row.value_of(field.name()).is_none() {
                errors.push(FieldError {
                    code: "storage.field.value.required",
                    field: field.name().to_string(),
                });
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StorageError::RequiredFieldErrors(errors))
    }
}

/// The system id a row-level operation targets; a row that never came from
/// the backend has none.
fn require_system_id(row: &Row) -> Result<i64, StorageError> {
    row.system_id().ok_or_else(|| {
        StorageError::Backend("row update requires a system id".to_string())
    })
}

/// Condition matching rows whose every field value is null.
fn all_fields_null_condition(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| format!("{} IS NULL", escape_identifier(f.name())))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Draft lifecycle operations over one connection pool.
#[derive(Clone, Debug)]
pub struct DraftManager {
    pool: PgPool,
    fts_config: String,
}

impl DraftManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            fts_config: triggers::DEFAULT_FTS_CONFIG.to_string(),
        }
    }

    /// Override the language-specific text search configuration.
    pub fn with_fts_config(mut self, fts_config: impl Into<String>) -> Self {
        self.fts_config = fts_config.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn fts_config(&self) -> &str {
        &self.fts_config
    }

    /// Create an empty draft table with the given fields.
    pub async fn create_draft(
        &self,
        code: &StorageCode,
        fields: &[Field],
    ) -> Result<(), StorageError> {
        let mut pool = self.pool.clone();
        if storage_exists(&mut pool, code).await? {
            return Err(StorageError::DraftAlreadyExists(code.to_string()));
        }

        let mut tx = self.pool.begin().await?;
        for ddl in create_table_ddl(code, fields, false) {
            tx.execute(&ddl).await?;
        }
        triggers::create_triggers(&mut tx, code, fields, &self.fts_config).await?;
        tx.commit().await?;
        info!(storage = %code, fields = fields.len(), "draft created");
        Ok(())
    }

    /// Drop a storage with its sequence and trigger functions.
    pub async fn drop_storage(&self, code: &StorageCode) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        tx.execute(&SqlWithParams::of(format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            code.escaped_qualified_name()
        )))
        .await?;
        tx.execute(&SqlWithParams::of(format!(
            "DROP SEQUENCE IF EXISTS {}",
            code.escaped_sequence_name()
        )))
        .await?;
        // trigger objects fall with the table; the functions do not
        for ddl in triggers::drop_triggers_ddl(code).into_iter().skip(2) {
            tx.execute(&ddl).await?;
        }
        tx.commit().await?;
        info!(storage = %code, "storage dropped");
        Ok(())
    }

    /// Drop several storages.
    pub async fn drop_storages(&self, codes: &[StorageCode]) -> Result<(), StorageError> {
        for code in codes {
            self.drop_storage(code).await?;
        }
        Ok(())
    }

    pub async fn storage_exists(&self, code: &StorageCode) -> Result<bool, StorageError> {
        let mut pool = self.pool.clone();
        storage_exists(&mut pool, code).await
    }

    /// Insert rows into a draft. Required-field violations are collected
    /// across all rows before anything executes.
    pub async fn add_rows(
        &self,
        code: &StorageCode,
        fields: &[Field],
        rows: &[Row],
    ) -> Result<(), StorageError> {
        validate_required(fields, rows)?;

        let mut tx = self.pool.begin().await?;
        for row in rows {
            let (columns, values) = codec::insert_values(fields, row);
            let mut insert = SqlWithParams::of(format!(
                "INSERT INTO {} ({}) VALUES (",
                code.escaped_qualified_name(),
                columns.join(", ")
            ));
            insert.append(values);
            insert.push_sql(")");
            tx.execute(&insert).await?;
        }
        tx.commit().await?;
        debug!(storage = %code, rows = rows.len(), "rows added");
        Ok(())
    }

    /// Update one draft row in place, identified by its system id.
    pub async fn update_row(
        &self,
        code: &StorageCode,
        fields: &[Field],
        row: &Row,
    ) -> Result<(), StorageError> {
        let system_id = require_system_id(row)?;
        validate_required(fields, std::slice::from_ref(row))?;

        let mut update = SqlWithParams::of(format!(
            "UPDATE {} SET ",
            code.escaped_qualified_name()
        ));
        update.append(codec::update_assignments(fields, row));
        update.push_sql(&format!(" WHERE {} = ", escape_identifier(SYS_RECORDID)));
        update.push_param(system_id);

        let mut pool = self.pool.clone();
        let affected = pool.execute(&update).await?;
        if affected == 0 {
            return Err(StorageError::RowNotFound(system_id));
        }
        Ok(())
    }

    /// Delete draft rows by system id.
    pub async fn delete_rows(
        &self,
        code: &StorageCode,
        system_ids: &[i64],
    ) -> Result<u64, StorageError> {
        if system_ids.is_empty() {
            return Ok(0);
        }
        let mut delete = SqlWithParams::of(format!(
            "DELETE FROM {} WHERE {} IN (",
            code.escaped_qualified_name(),
            escape_identifier(SYS_RECORDID)
        ));
        delete.push_param_list(system_ids.iter().copied());
        delete.push_sql(")");

        let mut pool = self.pool.clone();
        pool.execute(&delete).await
    }

    /// Delete every draft row.
    pub async fn delete_all_rows(&self, code: &StorageCode) -> Result<u64, StorageError> {
        let delete = SqlWithParams::of(format!(
            "DELETE FROM {}",
            code.escaped_qualified_name()
        ));
        let mut pool = self.pool.clone();
        pool.execute(&delete).await
    }

    /// Bulk copy rows from a source storage into the draft, filtered to the
    /// source's state at `at_date` when given. Hash and FTS values are
    /// recomputed by the draft's triggers on insert.
    pub async fn load_data(
        &self,
        code: &StorageCode,
        fields: &[Field],
        from_storage: &StorageCode,
        at_date: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<u64, StorageError> {
        let columns = fields
            .iter()
            .map(|f| escape_identifier(f.name()))
            .collect::<Vec<_>>()
            .join(", ");

        let mut insert = SqlWithParams::of(format!(
            "INSERT INTO {target} ({columns}) SELECT {columns} FROM {source}",
            target = code.escaped_qualified_name(),
            source = from_storage.escaped_qualified_name(),
        ));
        let criteria = DataCriteria {
            begin_date: at_date,
            end_date: at_date,
            ..DataCriteria::new()
        };
        insert.append(predicate::build_where(&criteria, &self.fts_config));

        let mut pool = self.pool.clone();
        let copied = pool.execute(&insert).await?;
        info!(storage = %code, source = %from_storage, rows = copied, "data loaded");
        Ok(copied)
    }

    /// Add a column to a draft.
    pub async fn add_field(
        &self,
        code: &StorageCode,
        fields_after: &[Field],
        field: &Field,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        triggers::drop_triggers(&mut tx, code).await?;
        tx.execute(&SqlWithParams::of(format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            code.escaped_qualified_name(),
            escape_identifier(field.name()),
            field.field_type().sql_type()
        )))
        .await?;
        if field.is_searchable() || field.is_unique() {
            tx.execute(&field_index_ddl(code, field, false)).await?;
        }
        triggers::create_triggers(&mut tx, code, fields_after, &self.fts_config).await?;
        // the new column shifts the canonical hash input of existing rows
        triggers::update_hash_rows(&mut tx, code, fields_after).await?;
        triggers::update_fts_rows(&mut tx, code, fields_after, &self.fts_config).await?;
        tx.commit().await?;
        info!(storage = %code, field = field.name(), "field added");
        Ok(())
    }

    /// Remove a column from a draft, then purge rows left fully null.
    pub async fn delete_field(
        &self,
        code: &StorageCode,
        fields_after: &[Field],
        field_name: &str,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        triggers::drop_triggers(&mut tx, code).await?;
        tx.execute(&SqlWithParams::of(format!(
            "ALTER TABLE {} DROP COLUMN {}",
            code.escaped_qualified_name(),
            escape_identifier(field_name)
        )))
        .await?;
        triggers::create_triggers(&mut tx, code, fields_after, &self.fts_config).await?;
        triggers::update_hash_rows(&mut tx, code, fields_after).await?;
        triggers::update_fts_rows(&mut tx, code, fields_after, &self.fts_config).await?;
        if !fields_after.is_empty() {
            tx.execute(&SqlWithParams::of(format!(
                "DELETE FROM {} WHERE {}",
                code.escaped_qualified_name(),
                all_fields_null_condition(fields_after)
            )))
            .await?;
        }
        tx.commit().await?;
        info!(storage = %code, field = field_name, "field deleted");
        Ok(())
    }

    /// Change a column's type, coercing existing data. A coercion the
    /// backend rejects surfaces as an incompatible-data-type failure naming
    /// the field.
    pub async fn update_field(
        &self,
        code: &StorageCode,
        fields_after: &[Field],
        field: &Field,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        triggers::drop_triggers(&mut tx, code).await?;
        let name = escape_identifier(field.name());
        let sql_type = field.field_type().sql_type();
        let retype = tx
            .execute(&SqlWithParams::of(format!(
                "ALTER TABLE {} ALTER COLUMN {name} TYPE {sql_type} USING {name}::{sql_type}",
                code.escaped_qualified_name()
            )))
            .await;
        if let Err(e) = retype {
            tx.rollback().await?;
            return Err(match e {
                StorageError::IncompatibleDataType(_) => {
                    StorageError::IncompatibleDataType(field.name().to_string())
                }
                other => other,
            });
        }
        triggers::create_triggers(&mut tx, code, fields_after, &self.fts_config).await?;
        triggers::update_hash_rows(&mut tx, code, fields_after).await?;
        triggers::update_fts_rows(&mut tx, code, fields_after, &self.fts_config).await?;
        tx.commit().await?;
        info!(storage = %code, field = field.name(), "field retyped");
        Ok(())
    }

    /// Whether every group of rows sharing the field's text representation,
    /// filtered to `as_of`, has at most one member.
    pub async fn is_field_unique(
        &self,
        code: &StorageCode,
        field: &Field,
        as_of: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<bool, StorageError> {
        let column = match field.field_type() {
            FieldType::Reference => {
                format!("{} ->> 'value'", escape_identifier(field.name()))
            }
            _ => format!("{}::text", escape_identifier(field.name())),
        };
        let mut query = SqlWithParams::of(format!(
            "SELECT count(*) FROM (SELECT {column} FROM {}",
            code.escaped_qualified_name()
        ));
        let criteria = DataCriteria {
            begin_date: as_of,
            end_date: as_of,
            ..DataCriteria::new()
        };
        query.append(predicate::build_where(&criteria, &self.fts_config));
        query.push_sql(&format!(
            " GROUP BY {column} HAVING count(*) > 1 LIMIT 1) duplicates"
        ));

        let mut pool = self.pool.clone();
        Ok(pool.count(&query).await? == 0)
    }

    /// Whether the field holds at least one non-null value.
    pub async fn is_field_not_empty(
        &self,
        code: &StorageCode,
        field_name: &str,
    ) -> Result<bool, StorageError> {
        let query = SqlWithParams::of(format!(
            "SELECT count(*) FROM (SELECT 1 FROM {} WHERE {} IS NOT NULL LIMIT 1) t",
            code.escaped_qualified_name(),
            escape_identifier(field_name)
        ));
        let mut pool = self.pool.clone();
        Ok(pool.count(&query).await? > 0)
    }

    /// Whether the field holds at least one null value.
    pub async fn is_field_contain_empty_values(
        &self,
        code: &StorageCode,
        field_name: &str,
    ) -> Result<bool, StorageError> {
        let query = SqlWithParams::of(format!(
            "SELECT count(*) FROM (SELECT 1 FROM {} WHERE {} IS NULL LIMIT 1) t",
            code.escaped_qualified_name(),
            escape_identifier(field_name)
        ));
        let mut pool = self.pool.clone();
        Ok(pool.count(&query).await? > 0)
    }

    /// Paginated search over a storage.
    pub async fn search_rows(
        &self,
        code: &StorageCode,
        fields: &[Field],
        criteria: &DataCriteria,
        parts: ValueParts,
    ) -> Result<DataPage, StorageError> {
        let where_clause = predicate::build_where(criteria, &self.fts_config);

        let mut count_query = SqlWithParams::of(format!(
            "SELECT count(*) FROM {}",
            code.escaped_qualified_name()
        ));
        count_query.append(where_clause.clone());

        let mut pool = self.pool.clone();
        let count = pool.count(&count_query).await?;
        if criteria.count_only {
            return Ok(DataPage { count, rows: Vec::new() });
        }

        let mut select = SqlWithParams::of(format!(
            "SELECT {} FROM {}",
            codec::select_columns(fields, parts),
            code.escaped_qualified_name()
        ));
        select.append(where_clause);
        select.push_sql(&format!(
            " ORDER BY {} LIMIT {} OFFSET {}",
            escape_identifier(SYS_RECORDID),
            criteria.size,
            criteria.offset()
        ));

        let rows = pool.fetch(&select).await?;
        let rows = rows
            .iter()
            .map(|row| codec::encode_row(fields, parts, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DataPage { count, rows })
    }

    /// Fetch rows by system id.
    pub async fn find_rows_by_ids(
        &self,
        code: &StorageCode,
        fields: &[Field],
        system_ids: &[i64],
        parts: ValueParts,
    ) -> Result<Vec<Row>, StorageError> {
        let criteria = DataCriteria {
            system_ids: system_ids.to_vec(),
            size: system_ids.len().min(u32::MAX as usize) as u32,
            ..DataCriteria::new()
        };
        Ok(self.search_rows(code, fields, &criteria, parts).await?.rows)
    }

    /// Fetch rows by content hash.
    pub async fn find_rows_by_hashes(
        &self,
        code: &StorageCode,
        fields: &[Field],
        hashes: &[String],
        parts: ValueParts,
    ) -> Result<Vec<Row>, StorageError> {
        let criteria = DataCriteria {
            hashes: hashes.to_vec(),
            size: hashes.len().min(u32::MAX as usize) as u32,
            ..DataCriteria::new()
        };
        Ok(self.search_rows(code, fields, &criteria, parts).await?.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitemporal_storage::{RowValue, TypedValue};

    fn code() -> StorageCode {
        "ref.countries".parse().unwrap()
    }

    fn fields() -> Vec<Field> {
        vec![
            Field::new("CODE", FieldType::String { max_length: Some(50) })
                .required()
                .unique(),
            Field::new("NAME", FieldType::String { max_length: None }).searchable(),
            Field::new("PATH", FieldType::Tree),
        ]
    }

    #[test]
    fn draft_table_ddl_has_system_columns_and_unique_hash_index() {
        let ddl = create_table_ddl(&code(), &fields(), false);
        let create = ddl[1].sql();
        assert!(create.starts_with("CREATE TABLE \"ref\".\"countries\" ("));
        assert!(create.contains("\"SYS_RECORDID\" bigint NOT NULL"));
        assert!(create.contains("\"CODE\" varchar(50)"));
        assert!(create.contains("\"PATH\" ltree"));
        assert!(create.contains("\"SYS_HASH\" char(32)"));
        assert!(!create.contains("SYS_PUBLISHTIME"));

        assert!(
            ddl.iter()
                .any(|q| q.sql().contains("CREATE UNIQUE INDEX \"countries_sys_hash_ix\""))
        );
        assert!(
            ddl.iter()
                .any(|q| q.sql().contains("DEFAULT nextval('\"ref\".\"countries_seq\"')"))
        );
    }

    #[test]
    fn version_table_ddl_adds_validity_columns_and_plain_hash_index() {
        let ddl = create_table_ddl(&code(), &fields(), true);
        let create = ddl[1].sql();
        assert!(create.contains("\"SYS_PUBLISHTIME\" timestamptz"));
        assert!(create.contains("\"SYS_CLOSETIME\" timestamptz"));
        assert!(
            ddl.iter()
                .any(|q| q.sql().contains("CREATE INDEX \"countries_sys_hash_ix\""))
        );
        // unique field constraints do not bind on versions
        assert!(
            ddl.iter()
                .any(|q| q.sql().contains("CREATE INDEX \"countries_code_ix\""))
        );
    }

    #[test]
    fn tree_field_indexes_use_gist() {
        let path = Field::new("PATH", FieldType::Tree).searchable();
        let ddl = field_index_ddl(&code(), &path, false);
        assert!(ddl.sql().contains("USING gist"));
    }

    #[test]
    fn required_violations_are_collected_across_rows() {
        let fields = fields();
        let rows = vec![
            Row::of_values(vec![RowValue::new("CODE", None)]),
            Row::of_values(vec![RowValue::new("CODE", Some(TypedValue::from("x")))]),
            Row::of_values(vec![RowValue::new("CODE", None)]),
        ];
        let err = validate_required(&fields, &rows).unwrap_err();
        match err {
            StorageError::RequiredFieldErrors(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors.iter().all(|e| e.field == "CODE"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn update_without_system_id_is_rejected_before_any_sql() {
        let row = Row::of_values(vec![RowValue::new("CODE", Some(TypedValue::from("x")))]);
        match require_system_id(&row).unwrap_err() {
            StorageError::Backend(message) => assert!(message.contains("system id")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            require_system_id(&Row::new(Some(7), None, Vec::new())).unwrap(),
            7
        );
    }

    #[test]
    fn all_fields_null_condition_joins_with_and() {
        assert_eq!(
            all_fields_null_condition(&fields()),
            "\"CODE\" IS NULL AND \"NAME\" IS NULL AND \"PATH\" IS NULL"
        );
    }
}
