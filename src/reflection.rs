//! Table introspection helpers dispatched through the adapter.

use tracing::trace;

use crate::adapter::DatabaseAdapter;
use crate::db::{Executor, Statement};
use crate::error::Result;

/// Whether `table` (optionally `schema.table`) exists.
pub async fn table_exists(
    adapter: &dyn DatabaseAdapter,
    exec: &dyn Executor,
    table: &str,
) -> Result<bool> {
    let stmt = adapter.table_exists_query(table)?;
    trace!("{}", stmt.sql);
    Ok(exec.query_exists(&stmt).await?)
}

/// Whether `table` exists and holds at least one row.
pub async fn table_has_data(
    adapter: &dyn DatabaseAdapter,
    exec: &dyn Executor,
    table: &str,
) -> Result<bool> {
    if !table_exists(adapter, exec, table).await? {
        return Ok(false);
    }
    let stmt = Statement::new(adapter.has_data_query(table)?);
    trace!("{}", stmt.sql);
    Ok(exec.query_exists(&stmt).await?)
}

pub async fn table_row_count(
    adapter: &dyn DatabaseAdapter,
    exec: &dyn Executor,
    table: &str,
) -> Result<i64> {
    let stmt = Statement::new(adapter.row_count_query(table)?);
    trace!("{}", stmt.sql);
    Ok(exec
        .query_scalar(&stmt)
        .await?
        .and_then(|c| c.as_i64())
        .unwrap_or(0))
}

/// Whether any combination of `columns` occurs more than once.
pub async fn table_has_duplicates(
    adapter: &dyn DatabaseAdapter,
    exec: &dyn Executor,
    table: &str,
    columns: &[&str],
) -> Result<bool> {
    let stmt = Statement::new(adapter.duplicates_query(table, columns)?);
    trace!("{}", stmt.sql);
    Ok(exec.query_exists(&stmt).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{OracleAdapter, PostgresAdapter};
    use crate::db::testing::ScriptedExecutor;
    use crate::db::{CellValue, ErrorCategory};
    use crate::error::TriageError;

    #[tokio::test]
    async fn test_has_data_short_circuits_missing_table() {
        let exec = ScriptedExecutor::new();
        let adapter = PostgresAdapter::new();
        assert!(!table_has_data(&adapter, &exec, "cohort_abc").await.unwrap());
        assert_eq!(exec.executed_sql().len(), 1);
    }

    #[tokio::test]
    async fn test_has_data_with_rows() {
        let exec = ScriptedExecutor::new().respond(|_| Some(ScriptedExecutor::one_row()));
        let adapter = OracleAdapter::new();
        assert!(table_has_data(&adapter, &exec, "features.cohort_abc").await.unwrap());
        let sql = exec.executed_sql();
        assert!(sql[0].contains("all_tables"));
        assert!(sql[1].contains("ROWNUM <= 1"));
    }

    #[tokio::test]
    async fn test_row_count_accepts_numeric_text() {
        let exec = ScriptedExecutor::new()
            .respond(|_| Some(ScriptedExecutor::scalar(CellValue::Text("12".into()))));
        assert_eq!(
            table_row_count(&OracleAdapter::new(), &exec, "cohort_abc")
                .await
                .unwrap(),
            12
        );
        let empty = ScriptedExecutor::new();
        assert_eq!(
            table_row_count(&PostgresAdapter::new(), &empty, "cohort_abc")
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_duplicates_query_groups_on_columns() {
        let exec = ScriptedExecutor::new();
        let dup = table_has_duplicates(
            &PostgresAdapter::new(),
            &exec,
            "cohort_abc",
            &["entity_id", "as_of_date"],
        )
        .await
        .unwrap();
        assert!(!dup);
        assert!(exec.executed_sql()[0]
            .contains("GROUP BY entity_id, as_of_date HAVING COUNT(*) > 1"));
    }

    #[tokio::test]
    async fn test_invalid_name_never_reaches_backend() {
        let exec = ScriptedExecutor::new();
        assert!(table_exists(&PostgresAdapter::new(), &exec, "x; drop table y")
            .await
            .is_err());
        assert!(exec.executed_sql().is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_surfaces_after_existence_check() {
        let exec = ScriptedExecutor::new()
            .respond(|_| Some(ScriptedExecutor::one_row()))
            .fail_on("ROWNUM <= 1", ErrorCategory::Connection);
        let err = table_has_data(&OracleAdapter::new(), &exec, "cohort_abc")
            .await
            .unwrap_err();
        match err {
            TriageError::Backend(backend) => {
                assert_eq!(backend.category, ErrorCategory::Connection);
                assert!(backend.message.contains("ROWNUM <= 1"));
            }
            other => panic!("expected a backend error, got {other:?}"),
        }
        assert_eq!(exec.executed_sql().len(), 2);
    }
}
