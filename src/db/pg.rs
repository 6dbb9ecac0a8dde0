//! `Executor` implementations over tokio-postgres clients and deadpool pools.

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use std::error::Error as StdError;
use std::time::Instant;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, Row};

use super::error::{BackendError, ErrorCategory};
use super::executor::{Executor, Statement};
use super::value::{CellValue, ColumnInfo, QueryResult, SqlValue};

/// NULL that binds to a parameter of any type.
#[derive(Debug)]
struct SqlNull;

impl ToSql for SqlNull {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind_params(params: &[SqlValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .map(|p| -> Box<dyn ToSql + Sync + Send> {
            match p {
                SqlValue::Null => Box::new(SqlNull),
                SqlValue::Bool(b) => Box::new(*b),
                SqlValue::Int(i) => Box::new(*i),
                SqlValue::Float(f) => Box::new(*f),
                SqlValue::Text(s) | SqlValue::Clob(s) => Box::new(s.clone()),
                SqlValue::Date(d) => Box::new(*d),
                SqlValue::Timestamp(ts) => Box::new(*ts),
                SqlValue::Json(j) => Box::new(j.clone()),
                SqlValue::TextArray(a) => Box::new(a.clone()),
                SqlValue::IntArray(a) => Box::new(a.clone()),
            }
        })
        .collect()
}

async fn run_execute(client: &Client, stmt: &Statement) -> Result<u64, BackendError> {
    let boxed = bind_params(&stmt.params);
    let params: Vec<&(dyn ToSql + Sync)> = boxed
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    client
        .execute(stmt.sql.as_str(), &params)
        .await
        .map_err(|e| BackendError::from_pg_error(&e, &stmt.sql))
}

async fn run_query(client: &Client, stmt: &Statement) -> Result<QueryResult, BackendError> {
    let start = Instant::now();
    let prepared = client
        .prepare(&stmt.sql)
        .await
        .map_err(|e| BackendError::from_pg_error(&e, &stmt.sql))?;
    let boxed = bind_params(&stmt.params);
    let params: Vec<&(dyn ToSql + Sync)> = boxed
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    let rows = client
        .query(&prepared, &params)
        .await
        .map_err(|e| BackendError::from_pg_error(&e, &stmt.sql))?;

    let columns = prepared
        .columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_().name()))
        .collect();
    let mut result = QueryResult::new(columns, parse_rows(&rows));
    result.execution_time = start.elapsed();
    Ok(result)
}

async fn run_copy_out(client: &Client, sql: &str, null: &str) -> Result<Vec<u8>, BackendError> {
    let copy = format!(
        "COPY ({}) TO STDOUT WITH (FORMAT csv, HEADER true, NULL '{}')",
        sql,
        null.replace('\'', "''")
    );
    let stream = client
        .copy_out(copy.as_str())
        .await
        .map_err(|e| BackendError::from_pg_error(&e, &copy))?;
    futures::pin_mut!(stream);

    let mut buf = Vec::new();
    while let Some(chunk) = stream
        .try_next()
        .await
        .map_err(|e| BackendError::from_pg_error(&e, &copy))?
    {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

#[async_trait]
impl Executor for Client {
    async fn execute(&self, stmt: &Statement) -> Result<u64, BackendError> {
        run_execute(self, stmt).await
    }

    async fn query(&self, stmt: &Statement) -> Result<QueryResult, BackendError> {
        run_query(self, stmt).await
    }

    async fn copy_out_csv(&self, sql: &str, null: &str) -> Result<Vec<u8>, BackendError> {
        run_copy_out(self, sql, null).await
    }
}

fn pool_error(err: deadpool_postgres::PoolError) -> BackendError {
    match err {
        deadpool_postgres::PoolError::Backend(e) => BackendError::from_pg_error(&e, ""),
        other => BackendError::new(ErrorCategory::Connection, other.to_string()),
    }
}

#[async_trait]
impl Executor for deadpool_postgres::Pool {
    async fn execute(&self, stmt: &Statement) -> Result<u64, BackendError> {
        let client = self.get().await.map_err(pool_error)?;
        run_execute(&client, stmt).await
    }

    async fn query(&self, stmt: &Statement) -> Result<QueryResult, BackendError> {
        let client = self.get().await.map_err(pool_error)?;
        run_query(&client, stmt).await
    }

    async fn copy_out_csv(&self, sql: &str, null: &str) -> Result<Vec<u8>, BackendError> {
        let client = self.get().await.map_err(pool_error)?;
        run_copy_out(&client, sql, null).await
    }
}

fn parse_rows(rows: &[Row]) -> Vec<Vec<CellValue>> {
    rows.iter()
        .map(|row| {
            row.columns()
                .iter()
                .enumerate()
                .map(|(i, col)| extract_value(row, i, col.type_()))
                .collect()
        })
        .collect()
}

fn get_or_null<'a, T, F>(row: &'a Row, idx: usize, wrap: F) -> CellValue
where
    T: tokio_postgres::types::FromSql<'a>,
    F: FnOnce(T) -> CellValue,
{
    row.try_get::<_, Option<T>>(idx)
        .ok()
        .flatten()
        .map(wrap)
        .unwrap_or(CellValue::Null)
}

fn get_array<'a, T, F>(row: &'a Row, idx: usize, wrap: F) -> CellValue
where
    T: tokio_postgres::types::FromSql<'a>,
    F: Fn(T) -> CellValue,
{
    row.try_get::<_, Option<Vec<Option<T>>>>(idx)
        .ok()
        .flatten()
        .map(|items| {
            CellValue::Array(
                items
                    .into_iter()
                    .map(|item| item.map(&wrap).unwrap_or(CellValue::Null))
                    .collect(),
            )
        })
        .unwrap_or(CellValue::Null)
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => get_or_null::<bool, _>(row, idx, CellValue::Bool),
        Type::INT2 => get_or_null::<i16, _>(row, idx, CellValue::Int16),
        Type::INT4 => get_or_null::<i32, _>(row, idx, CellValue::Int32),
        Type::INT8 => get_or_null::<i64, _>(row, idx, CellValue::Int64),
        Type::FLOAT4 => get_or_null::<f32, _>(row, idx, CellValue::Float32),
        Type::FLOAT8 => get_or_null::<f64, _>(row, idx, CellValue::Float64),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => {
            get_or_null::<String, _>(row, idx, CellValue::Text)
        }
        Type::BYTEA => get_or_null::<Vec<u8>, _>(row, idx, CellValue::Bytes),
        Type::DATE => get_or_null::<NaiveDate, _>(row, idx, CellValue::Date),
        Type::TIME => get_or_null::<NaiveTime, _>(row, idx, CellValue::Time),
        Type::TIMESTAMP => get_or_null::<NaiveDateTime, _>(row, idx, CellValue::DateTime),
        Type::TIMESTAMPTZ => get_or_null::<DateTime<Utc>, _>(row, idx, CellValue::TimestampTz),
        Type::JSON | Type::JSONB => get_or_null::<serde_json::Value, _>(row, idx, CellValue::Json),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get_array::<String, _>(row, idx, CellValue::Text),
        Type::INT4_ARRAY => get_array::<i32, _>(row, idx, CellValue::Int32),
        Type::INT8_ARRAY => get_array::<i64, _>(row, idx, CellValue::Int64),
        Type::TIMESTAMP_ARRAY => get_array::<NaiveDateTime, _>(row, idx, CellValue::DateTime),
        _ => {
            // Fallback: try to get as string
            get_or_null::<String, _>(row, idx, CellValue::Text)
        }
    }
}
