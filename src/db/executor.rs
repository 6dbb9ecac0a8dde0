use async_trait::async_trait;
use std::sync::Arc;

use super::error::BackendError;
use super::value::{CellValue, QueryResult, SqlValue};

/// A ready-to-run statement with positional parameters.
///
/// Placeholders in `sql` follow the dialect that produced it (`$1` for
/// PostgreSQL, `:1` for Oracle); `params[0]` binds to the first one.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

/// The connection/engine handle every generator runs its statements on.
///
/// Each call is one round-trip that commits (or fails) on its own; there
/// is no transaction spanning several calls.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a statement and return the number of affected rows.
    async fn execute(&self, stmt: &Statement) -> Result<u64, BackendError>;

    /// Run a statement and return its rows.
    async fn query(&self, stmt: &Statement) -> Result<QueryResult, BackendError>;

    /// Stream a query result out through the backend's bulk-copy path as CSV
    /// with a header line. NULL cells are written as `null`; non-NULL text
    /// equal to it is quoted.
    async fn copy_out_csv(&self, _sql: &str, _null: &str) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::unsupported("bulk copy"))
    }

    /// First column of the first row, if any.
    async fn query_scalar(&self, stmt: &Statement) -> Result<Option<CellValue>, BackendError> {
        let result = self.query(stmt).await?;
        Ok(result.scalar().cloned())
    }

    /// Whether the query returned at least one row.
    async fn query_exists(&self, stmt: &Statement) -> Result<bool, BackendError> {
        Ok(!self.query(stmt).await?.is_empty())
    }
}

#[async_trait]
impl<E: Executor + ?Sized> Executor for Arc<E> {
    async fn execute(&self, stmt: &Statement) -> Result<u64, BackendError> {
        self.as_ref().execute(stmt).await
    }

    async fn query(&self, stmt: &Statement) -> Result<QueryResult, BackendError> {
        self.as_ref().query(stmt).await
    }

    async fn copy_out_csv(&self, sql: &str, null: &str) -> Result<Vec<u8>, BackendError> {
        self.as_ref().copy_out_csv(sql, null).await
    }
}
