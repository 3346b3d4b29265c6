//! Draft-to-version publication.
//!
//! Publishing merges a mutable draft into a new immutable version table. With
//! no base version (or a structural mismatch) the draft is copied verbatim
//! into the new window; against a base version the engine computes four row
//! classes by content-hash equality and interval overlap against the window
//! `[publish_time, close_time)`:
//!
//! 1. **actual** - version rows whose hash exists in the draft and whose
//!    interval overlaps or exactly abuts the window; merged so exactly one
//!    row per draft hash survives with an adjusted interval.
//! 2. **old** - version rows with no overlap at all; copied through.
//! 3. **closed-now** - version rows whose hash is absent from the draft but
//!    whose interval strictly overlaps the window; split at the window edges
//!    into zero, one or two rows.
//! 4. **new** - draft rows with no overlapping version counterpart; inserted
//!    fresh with the window interval.
//!
//! Every pass is a count-then-paginate loop with one backend transaction per
//! batch, so a long publication never holds a single lock for its full
//! duration. The trade-off: publication is not atomic end-to-end. A crash
//! between batches leaves the target partially populated; recovery is to
//! drop the partial target and re-run the publish from scratch.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use bitemporal_storage::{
    Field, NullKind, SYS_CLOSETIME, SYS_FTS, SYS_HASH, SYS_PUBLISHTIME, SYS_RECORDID, SqlValue,
    SqlWithParams, StorageCode, StorageError, escape_identifier,
};

use crate::draft::{create_table_ddl, storage_exists, table_columns};
use crate::executor::{PgPool, SqlExecutor};
use crate::time::truncate_to_seconds;
use crate::triggers;

/// Default number of rows moved per batch transaction.
pub const DEFAULT_BATCH_SIZE: u64 = 1000;

/// Publication window and tuning.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Start of the new validity window.
    pub publish_time: DateTime<Utc>,
    /// Exclusive end of the window; `None` is open-ended.
    pub close_time: Option<DateTime<Utc>>,
    /// Rows per batch transaction; `None` defers to the publisher's setting.
    pub batch_size: Option<u64>,
}

impl PublishOptions {
    pub fn new(publish_time: DateTime<Utc>) -> Self {
        Self {
            publish_time,
            close_time: None,
            batch_size: None,
        }
    }

    pub fn closing_at(mut self, close_time: DateTime<Utc>) -> Self {
        self.close_time = Some(close_time);
        self
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// Per-publication batch size, falling back to the publisher's default.
pub(crate) fn effective_batch_size(options: &PublishOptions, fallback: u64) -> u64 {
    options.batch_size.unwrap_or(fallback).max(1)
}

// interval endpoints of a version row, truncated to seconds, with the
// missing close bound normalized to the far end of time
const VERSION_PUBLISH: &str = "date_trunc('second', v.\"SYS_PUBLISHTIME\")";
const VERSION_CLOSE: &str =
    "coalesce(date_trunc('second', v.\"SYS_CLOSETIME\"), 'infinity'::timestamptz)";

fn close_param(close_time: Option<DateTime<Utc>>) -> SqlValue {
    close_time
        .map(SqlValue::Timestamp)
        .unwrap_or(SqlValue::Null(NullKind::Timestamp))
}

/// Offset/limit pairs covering `total` rows in `batch_size` steps.
pub(crate) fn batch_ranges(total: u64, batch_size: u64) -> Vec<(u64, u64)> {
    let batch_size = batch_size.max(1);
    (0..total)
        .step_by(batch_size as usize)
        .map(|offset| (offset, batch_size))
        .collect()
}

/// All SQL shapes of one publication, precomputed from the participating
/// storages and the window. Every query is a pure value, testable without a
/// database.
pub(crate) struct PublishPlan {
    draft_table: String,
    version_table: Option<String>,
    target_table: String,
    target_sequence: String,
    data_columns: Vec<String>,
    publish_time: DateTime<Utc>,
    close_time: Option<DateTime<Utc>>,
}

impl PublishPlan {
    pub(crate) fn new(
        draft: &StorageCode,
        version: Option<&StorageCode>,
        target: &StorageCode,
        fields: &[Field],
        publish_time: DateTime<Utc>,
        close_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            draft_table: draft.escaped_qualified_name(),
            version_table: version.map(StorageCode::escaped_qualified_name),
            target_table: target.escaped_qualified_name(),
            target_sequence: target.escaped_sequence_name(),
            data_columns: fields
                .iter()
                .map(|f| escape_identifier(f.name()))
                .collect(),
            publish_time: truncate_to_seconds(publish_time),
            close_time: close_time.map(truncate_to_seconds),
        }
    }

    fn insert_columns(&self) -> String {
        let mut columns = vec![escape_identifier(SYS_RECORDID)];
        columns.extend(self.data_columns.iter().cloned());
        columns.push(escape_identifier(SYS_FTS));
        columns.push(escape_identifier(SYS_HASH));
        columns.push(escape_identifier(SYS_PUBLISHTIME));
        columns.push(escape_identifier(SYS_CLOSETIME));
        columns.join(", ")
    }

    fn prefixed_columns(&self, prefix: &str) -> String {
        self.data_columns
            .iter()
            .map(|c| format!("{prefix}{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn version_table(&self) -> &str {
        self.version_table.as_deref().unwrap_or_default()
    }

    /// `EXISTS` probe: the version row's hash has a counterpart in the draft.
    fn draft_hash_exists(&self) -> String {
        format!(
            "EXISTS (SELECT 1 FROM {draft} d WHERE d.{hash} = v.{hash})",
            draft = self.draft_table,
            hash = escape_identifier(SYS_HASH),
        )
    }

    /// End of the window, with an open window normalized like an open close
    /// bound.
    fn push_window_close(&self, query: &mut SqlWithParams) {
        query.push_sql("coalesce(");
        query.push_param(close_param(self.close_time));
        query.push_sql(", 'infinity'::timestamptz)");
    }

    // --- simple path -----------------------------------------------------

    pub(crate) fn simple_count(&self) -> SqlWithParams {
        SqlWithParams::of(format!("SELECT count(*) FROM {}", self.draft_table))
    }

    /// Copy a draft batch verbatim into the window.
    pub(crate) fn simple_insert(&self, offset: u64, limit: u64) -> SqlWithParams {
        let mut insert = SqlWithParams::of(format!(
            "INSERT INTO {target} ({columns}) \
             SELECT nextval('{sequence}'), {data}, d.{fts}, d.{hash}, ",
            target = self.target_table,
            columns = self.insert_columns(),
            sequence = self.target_sequence,
            data = self.prefixed_columns("d."),
            fts = escape_identifier(SYS_FTS),
            hash = escape_identifier(SYS_HASH),
        ));
        insert.push_param(self.publish_time);
        insert.push_sql(", ");
        insert.push_param(close_param(self.close_time));
        insert.push_sql(&format!(
            " FROM {draft} d ORDER BY d.{id} LIMIT {limit} OFFSET {offset}",
            draft = self.draft_table,
            id = escape_identifier(SYS_RECORDID),
        ));
        insert
    }

    // --- merge path: actual ----------------------------------------------

    /// Version rows whose hash exists in the draft and whose interval
    /// overlaps or exactly abuts the window.
    fn push_actual_condition(&self, query: &mut SqlWithParams) {
        query.push_sql(VERSION_PUBLISH);
        query.push_sql(" <= ");
        self.push_window_close(query);
        query.push_sql(" AND ");
        query.push_sql(VERSION_CLOSE);
        query.push_sql(" >= ");
        query.push_param(self.publish_time);
    }

    pub(crate) fn actual_count(&self) -> SqlWithParams {
        let mut count = SqlWithParams::of(format!(
            "SELECT count(*) FROM (SELECT d.{id} FROM {draft} d \
             JOIN {version} v ON v.{hash} = d.{hash} WHERE ",
            id = escape_identifier(SYS_RECORDID),
            draft = self.draft_table,
            version = self.version_table(),
            hash = escape_identifier(SYS_HASH),
        ));
        self.push_actual_condition(&mut count);
        count.push_sql(&format!(
            " GROUP BY d.{id}) candidates",
            id = escape_identifier(SYS_RECORDID)
        ));
        count
    }

    /// Re-emit matched rows with the draft's values and a merged interval:
    /// exactly one output row per draft hash, spanning the union of the
    /// matched intervals and the window.
    pub(crate) fn actual_insert(&self, offset: u64, limit: u64) -> SqlWithParams {
        let id = escape_identifier(SYS_RECORDID);
        let hash = escape_identifier(SYS_HASH);
        let fts = escape_identifier(SYS_FTS);
        let mut insert = SqlWithParams::of(format!(
            "INSERT INTO {target} ({columns}) \
             SELECT nextval('{sequence}'), {outer_data}, s.{fts}, s.{hash}, \
             s.publish_time, s.close_time FROM (SELECT {data}, d.{fts}, d.{hash}, \
             least(min({VERSION_PUBLISH}), ",
            target = self.target_table,
            columns = self.insert_columns(),
            sequence = self.target_sequence,
            outer_data = self.prefixed_columns("s."),
            data = self.prefixed_columns("d."),
        ));
        insert.push_param(self.publish_time);
        insert.push_sql(&format!(
            ") AS publish_time, nullif(greatest(max({VERSION_CLOSE}), "
        ));
        self.push_window_close(&mut insert);
        insert.push_sql("), 'infinity'::timestamptz) AS close_time");
        insert.push_sql(&format!(
            " FROM {draft} d JOIN {version} v ON v.{hash} = d.{hash} WHERE ",
            draft = self.draft_table,
            version = self.version_table(),
        ));
        self.push_actual_condition(&mut insert);
        insert.push_sql(&format!(
            " GROUP BY d.{id} ORDER BY d.{id} LIMIT {limit} OFFSET {offset}) s",
        ));
        insert
    }

    // --- merge path: old -------------------------------------------------

    /// Version rows untouched by the window: matched hashes that do not even
    /// abut it, and unmatched hashes that do not strictly overlap it.
    fn push_old_condition(&self, query: &mut SqlWithParams) {
        let exists = self.draft_hash_exists();
        query.push_sql(&format!("({exists} AND ({VERSION_PUBLISH} > "));
        self.push_window_close(query);
        query.push_sql(&format!(" OR {VERSION_CLOSE} < "));
        query.push_param(self.publish_time);
        query.push_sql(&format!(")) OR (NOT {exists} AND ({VERSION_PUBLISH} >= "));
        self.push_window_close(query);
        query.push_sql(&format!(" OR {VERSION_CLOSE} <= "));
        query.push_param(self.publish_time);
        query.push_sql("))");
    }

    pub(crate) fn old_count(&self) -> SqlWithParams {
        let mut count = SqlWithParams::of(format!(
            "SELECT count(*) FROM {version} v WHERE ",
            version = self.version_table(),
        ));
        self.push_old_condition(&mut count);
        count
    }

    /// Copy non-overlapping version rows through unchanged.
    pub(crate) fn old_insert(&self, offset: u64, limit: u64) -> SqlWithParams {
        let mut insert = SqlWithParams::of(format!(
            "INSERT INTO {target} ({columns}) \
             SELECT nextval('{sequence}'), {data}, v.{fts}, v.{hash}, \
             v.{publish}, v.{close} FROM {version} v WHERE ",
            target = self.target_table,
            columns = self.insert_columns(),
            sequence = self.target_sequence,
            data = self.prefixed_columns("v."),
            fts = escape_identifier(SYS_FTS),
            hash = escape_identifier(SYS_HASH),
            publish = escape_identifier(SYS_PUBLISHTIME),
            close = escape_identifier(SYS_CLOSETIME),
            version = self.version_table(),
        ));
        self.push_old_condition(&mut insert);
        insert.push_sql(&format!(
            " ORDER BY v.{id} LIMIT {limit} OFFSET {offset}",
            id = escape_identifier(SYS_RECORDID),
        ));
        insert
    }

    // --- merge path: closed-now ------------------------------------------

    /// The two halves of an interval split at the window edges: the part
    /// before `publish_time` (closed now) and the part after `close_time`
    /// (reopened). A row strictly inside the window contributes neither.
    fn closed_subquery(&self) -> SqlWithParams {
        let id = escape_identifier(SYS_RECORDID);
        let fts = escape_identifier(SYS_FTS);
        let hash = escape_identifier(SYS_HASH);
        let publish = escape_identifier(SYS_PUBLISHTIME);
        let close = escape_identifier(SYS_CLOSETIME);
        let not_in_draft = format!("NOT {}", self.draft_hash_exists());
        let data = self.prefixed_columns("v.");
        let version = self.version_table();

        let mut sub = SqlWithParams::of(format!(
            "SELECT v.{id} AS origin_id, {data}, v.{fts}, v.{hash}, \
             v.{publish} AS publish_time, ",
        ));
        sub.push_param(self.publish_time);
        sub.push_sql(&format!(
            " AS close_time FROM {version} v \
             WHERE {not_in_draft} AND {VERSION_PUBLISH} < ",
        ));
        sub.push_param(self.publish_time);
        sub.push_sql(&format!(" AND {VERSION_CLOSE} > "));
        sub.push_param(self.publish_time);

        sub.push_sql(&format!(
            " UNION ALL SELECT v.{id}, {data}, v.{fts}, v.{hash}, ",
        ));
        sub.push_param(close_param(self.close_time));
        sub.push_sql(&format!(
            " AS publish_time, v.{close} AS close_time FROM {version} v \
             WHERE {not_in_draft} AND {VERSION_PUBLISH} < ",
        ));
        self.push_window_close(&mut sub);
        sub.push_sql(&format!(" AND {VERSION_CLOSE} > "));
        self.push_window_close(&mut sub);
        sub
    }

    pub(crate) fn closed_count(&self) -> SqlWithParams {
        let mut count = SqlWithParams::of("SELECT count(*) FROM (");
        count.append(self.closed_subquery());
        count.push_sql(") s");
        count
    }

    /// Split overlapped, unmatched version rows at the window edges.
    pub(crate) fn closed_insert(&self, offset: u64, limit: u64) -> SqlWithParams {
        let mut insert = SqlWithParams::of(format!(
            "INSERT INTO {target} ({columns}) \
             SELECT nextval('{sequence}'), {data}, s.{fts}, s.{hash}, \
             s.publish_time, s.close_time FROM (",
            target = self.target_table,
            columns = self.insert_columns(),
            sequence = self.target_sequence,
            data = self.prefixed_columns("s."),
            fts = escape_identifier(SYS_FTS),
            hash = escape_identifier(SYS_HASH),
        ));
        insert.append(self.closed_subquery());
        insert.push_sql(&format!(
            ") s ORDER BY s.origin_id, s.publish_time LIMIT {limit} OFFSET {offset}"
        ));
        insert
    }

    // --- merge path: new -------------------------------------------------

    /// Draft rows with no overlapping version counterpart at all.
    fn push_new_condition(&self, query: &mut SqlWithParams) {
        query.push_sql(&format!(
            "NOT EXISTS (SELECT 1 FROM {version} v WHERE v.{hash} = d.{hash} AND ",
            version = self.version_table(),
            hash = escape_identifier(SYS_HASH),
        ));
        self.push_actual_condition(query);
        query.push_sql(")");
    }

    pub(crate) fn new_count(&self) -> SqlWithParams {
        let mut count = SqlWithParams::of(format!(
            "SELECT count(*) FROM {draft} d WHERE ",
            draft = self.draft_table
        ));
        self.push_new_condition(&mut count);
        count
    }

    /// Insert unmatched draft rows fresh with the window interval.
    pub(crate) fn new_insert(&self, offset: u64, limit: u64) -> SqlWithParams {
        let mut insert = SqlWithParams::of(format!(
            "INSERT INTO {target} ({columns}) \
             SELECT nextval('{sequence}'), {data}, d.{fts}, d.{hash}, ",
            target = self.target_table,
            columns = self.insert_columns(),
            sequence = self.target_sequence,
            data = self.prefixed_columns("d."),
            fts = escape_identifier(SYS_FTS),
            hash = escape_identifier(SYS_HASH),
        ));
        insert.push_param(self.publish_time);
        insert.push_sql(", ");
        insert.push_param(close_param(self.close_time));
        insert.push_sql(&format!(
            " FROM {draft} d WHERE ",
            draft = self.draft_table
        ));
        self.push_new_condition(&mut insert);
        insert.push_sql(&format!(
            " ORDER BY d.{id} LIMIT {limit} OFFSET {offset}",
            id = escape_identifier(SYS_RECORDID),
        ));
        insert
    }

    // --- cleanup ---------------------------------------------------------

    /// Remove zero-width validity intervals, an artifact of boundary
    /// splitting.
    pub(crate) fn delete_zero_width(&self) -> SqlWithParams {
        SqlWithParams::of(format!(
            "DELETE FROM {target} WHERE date_trunc('second', {publish}) = \
             date_trunc('second', {close})",
            target = self.target_table,
            publish = escape_identifier(SYS_PUBLISHTIME),
            close = escape_identifier(SYS_CLOSETIME),
        ))
    }
}

/// Executes publications against one pool.
#[derive(Clone, Debug)]
pub struct Publisher {
    pool: PgPool,
    fts_config: String,
    batch_size: u64,
}

impl Publisher {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            fts_config: triggers::DEFAULT_FTS_CONFIG.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_fts_config(mut self, fts_config: impl Into<String>) -> Self {
        self.fts_config = fts_config.into();
        self
    }

    /// Publish a draft, optionally merging against a base version, and
    /// return the new immutable version's storage code.
    ///
    /// Not atomic end-to-end: each batch commits independently. If the
    /// operation fails partway, drop the returned partial target and retry.
    pub async fn publish(
        &self,
        draft: &StorageCode,
        fields: &[Field],
        base_version: Option<&StorageCode>,
        options: &PublishOptions,
    ) -> Result<StorageCode, StorageError> {
        let mut pool = self.pool.clone();
        if !storage_exists(&mut pool, draft).await? {
            return Err(StorageError::StorageNotFound(draft.to_string()));
        }

        // a missing or structurally different base forces the simple path
        let base = match base_version {
            Some(base) => self.structures_match(draft, base).await?.then_some(base),
            None => None,
        };

        let target = StorageCode::new(draft.schema(), &Uuid::new_v4().to_string())?;
        let mut tx = self.pool.begin().await?;
        for ddl in create_table_ddl(&target, fields, true) {
            tx.execute(&ddl).await?;
        }
        triggers::create_triggers(&mut tx, &target, fields, &self.fts_config).await?;
        tx.commit().await?;

        let plan = PublishPlan::new(
            draft,
            base,
            &target,
            fields,
            options.publish_time,
            options.close_time,
        );
        let batch_size = effective_batch_size(options, self.batch_size);

        match base {
            None => {
                info!(draft = %draft, target = %target, "publishing, simple path");
                self.run_pass("copy", &plan.simple_count(), batch_size, |o, l| {
                    plan.simple_insert(o, l)
                })
                .await?;
            }
            Some(base) => {
                info!(draft = %draft, base = %base, target = %target, "publishing, merge path");
                self.run_pass("actual", &plan.actual_count(), batch_size, |o, l| {
                    plan.actual_insert(o, l)
                })
                .await?;
                self.run_pass("old", &plan.old_count(), batch_size, |o, l| {
                    plan.old_insert(o, l)
                })
                .await?;
                self.run_pass("closed", &plan.closed_count(), batch_size, |o, l| {
                    plan.closed_insert(o, l)
                })
                .await?;
                self.run_pass("new", &plan.new_count(), batch_size, |o, l| {
                    plan.new_insert(o, l)
                })
                .await?;
            }
        }

        let mut pool = self.pool.clone();
        let dropped = pool.execute(&plan.delete_zero_width()).await?;
        if dropped > 0 {
            debug!(target = %target, rows = dropped, "zero-width intervals removed");
        }
        info!(target = %target, "publication complete");
        Ok(target)
    }

    /// One count-then-paginate pass, one transaction per batch.
    async fn run_pass<F>(
        &self,
        pass: &'static str,
        count_query: &SqlWithParams,
        batch_size: u64,
        insert_query: F,
    ) -> Result<(), StorageError>
    where
        F: Fn(u64, u64) -> SqlWithParams,
    {
        let mut pool = self.pool.clone();
        let total = pool.count(count_query).await?;
        debug!(pass, total, "publication pass started");

        for (offset, limit) in batch_ranges(total, batch_size) {
            let mut tx = self.pool.begin().await?;
            let inserted = tx.execute(&insert_query(offset, limit)).await?;
            tx.commit().await?;
            debug!(pass, offset, inserted, "batch committed");
        }
        Ok(())
    }

    /// Column names and types must agree for the merge path to apply.
    async fn structures_match(
        &self,
        draft: &StorageCode,
        version: &StorageCode,
    ) -> Result<bool, StorageError> {
        let mut pool = self.pool.clone();
        if !storage_exists(&mut pool, version).await? {
            return Err(StorageError::StorageNotFound(version.to_string()));
        }
        let draft_columns = table_columns(&mut pool, draft).await?;
        let version_columns = table_columns(&mut pool, version).await?;
        Ok(draft_columns == version_columns)
    }
}
