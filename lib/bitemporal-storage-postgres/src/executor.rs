//! PostgreSQL query execution.
//!
//! The whole engine issues SQL through one primitive: bind a
//! [`SqlWithParams`], get rows or a row count back. The [`SqlExecutor`]
//! trait is implemented for both the pool and an open transaction, so every
//! operation can run standalone or inside an explicit transaction boundary.

const DEFAULT_MAX_CONNECTIONS: u32 = 16;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Arguments, Postgres, Row, Transaction};
use std::ops::Deref;

use bitemporal_storage::{NullKind, SqlValue, SqlWithParams, StorageError};

/// Connection configuration for the PostgreSQL backend.
///
/// This enum is extensible for future authentication methods.
#[derive(Debug, Clone)]
pub enum ConnectionConfig {
    /// Connect using a database URL string.
    Url(String),
}

impl From<&str> for ConnectionConfig {
    fn from(url: &str) -> Self {
        ConnectionConfig::Url(url.to_string())
    }
}

impl From<String> for ConnectionConfig {
    fn from(url: String) -> Self {
        ConnectionConfig::Url(url)
    }
}

/// Wrapper around sqlx::PgPool implementing [`SqlExecutor`].
#[derive(Clone, Debug)]
pub struct PgPool(sqlx::PgPool);

impl PgPool {
    /// Create a new PgPool from an sqlx PgPool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self(pool)
    }

    /// Connect to a PostgreSQL database.
    pub async fn connect(config: impl Into<ConnectionConfig>) -> Result<Self, StorageError> {
        let ConnectionConfig::Url(url) = config.into();
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&url)
            .await
            .map_err(from_sqlx)?;
        Ok(Self(pool))
    }

    /// Get the inner sqlx::PgPool.
    pub fn inner(&self) -> &sqlx::PgPool {
        &self.0
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> Result<PgTransaction, StorageError> {
        let tx = self.0.begin().await.map_err(from_sqlx)?;
        Ok(PgTransaction { tx })
    }
}

impl Deref for PgPool {
    type Target = sqlx::PgPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Trait for executing parameterized SQL against the backend.
#[async_trait]
pub trait SqlExecutor: Send {
    /// Execute a SELECT and return all rows.
    async fn fetch(&mut self, query: &SqlWithParams) -> Result<Vec<PgRow>, StorageError>;

    /// Execute a statement and return the number of rows affected.
    async fn execute(&mut self, query: &SqlWithParams) -> Result<u64, StorageError>;

    /// Execute a SELECT and return at most one row.
    async fn fetch_optional(
        &mut self,
        query: &SqlWithParams,
    ) -> Result<Option<PgRow>, StorageError> {
        let rows = self.fetch(query).await?;
        Ok(rows.into_iter().next())
    }

    /// Execute a single-column count query.
    async fn count(&mut self, query: &SqlWithParams) -> Result<u64, StorageError> {
        let row = self
            .fetch_optional(query)
            .await?
            .ok_or_else(|| StorageError::Backend("count query returned no rows".to_string()))?;
        let n: i64 = row.try_get(0).map_err(from_sqlx)?;
        Ok(n.max(0) as u64)
    }
}

#[async_trait]
impl SqlExecutor for PgPool {
    async fn fetch(&mut self, query: &SqlWithParams) -> Result<Vec<PgRow>, StorageError> {
        let sql = query.to_positional();
        let args = bind_params(query.params())?;
        sqlx::query_with(&sql, args)
            .fetch_all(&self.0)
            .await
            .map_err(from_sqlx)
    }

    async fn execute(&mut self, query: &SqlWithParams) -> Result<u64, StorageError> {
        let sql = query.to_positional();
        let args = bind_params(query.params())?;
        let result = sqlx::query_with(&sql, args)
            .execute(&self.0)
            .await
            .map_err(from_sqlx)?;
        Ok(result.rows_affected())
    }
}

/// PostgreSQL transaction wrapper implementing [`SqlExecutor`].
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    pub async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(from_sqlx)
    }

    pub async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await.map_err(from_sqlx)
    }
}

#[async_trait]
impl SqlExecutor for PgTransaction {
    async fn fetch(&mut self, query: &SqlWithParams) -> Result<Vec<PgRow>, StorageError> {
        let sql = query.to_positional();
        let args = bind_params(query.params())?;
        sqlx::query_with(&sql, args)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(from_sqlx)
    }

    async fn execute(&mut self, query: &SqlWithParams) -> Result<u64, StorageError> {
        let sql = query.to_positional();
        let args = bind_params(query.params())?;
        let result = sqlx::query_with(&sql, args)
            .execute(&mut *self.tx)
            .await
            .map_err(from_sqlx)?;
        Ok(result.rows_affected())
    }
}

/// Bind parameter values to PgArguments in order.
fn bind_params(params: &[SqlValue]) -> Result<PgArguments, StorageError> {
    let mut args = PgArguments::default();
    for value in params {
        bind_value(&mut args, value)?;
    }
    Ok(args)
}

fn bind_value(args: &mut PgArguments, value: &SqlValue) -> Result<(), StorageError> {
    let result = match value {
        SqlValue::String(s) => args.add(s.as_str()),
        SqlValue::Int(n) => args.add(*n),
        SqlValue::Float(n) => args.add(*n),
        SqlValue::Bool(b) => args.add(*b),
        SqlValue::Date(d) => args.add(*d),
        SqlValue::Timestamp(ts) => args.add(*ts),
        SqlValue::Json(v) => args.add(v.clone()),
        SqlValue::Null(kind) => match kind {
            NullKind::Text => args.add(None::<String>),
            NullKind::Int => args.add(None::<i64>),
            NullKind::Float => args.add(None::<f64>),
            NullKind::Bool => args.add(None::<bool>),
            NullKind::Date => args.add(None::<chrono::NaiveDate>),
            NullKind::Timestamp => args.add(None::<chrono::DateTime<chrono::Utc>>),
            NullKind::Json => args.add(None::<serde_json::Value>),
        },
    };
    result.map_err(|e| StorageError::Backend(e.to_string()))
}

/// Translate an sqlx error into the storage taxonomy.
///
/// Unique-constraint rejections and type-coercion failures get distinct
/// variants; everything else passes through as a backend error. The
/// coercion variant is re-labelled with the offending field by the caller
/// that knows it.
pub(crate) fn from_sqlx(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(ref db) = e {
        match db.code().as_deref() {
            // unique_violation
            Some("23505") => {
                return StorageError::NotUnique(
                    db.constraint().unwrap_or_default().to_string(),
                );
            }
            // invalid_text_representation, datatype_mismatch, numeric_value_out_of_range
            Some("22P02") | Some("42804") | Some("22003") => {
                return StorageError::IncompatibleDataType(String::new());
            }
            _ => {}
        }
    }
    StorageError::Backend(e.to_string())
}
