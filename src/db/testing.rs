//! Scripted executor used by unit tests.
//!
//! Records every statement it receives and answers queries through
//! responders registered by the test; the first responder that returns
//! `Some` wins, otherwise the query yields no rows.

use async_trait::async_trait;
use std::sync::Mutex;

use super::error::{BackendError, ErrorCategory};
use super::executor::{Executor, Statement};
use super::value::{CellValue, ColumnInfo, QueryResult};

type Responder = Box<dyn Fn(&Statement) -> Option<QueryResult> + Send + Sync>;
type CopyResponder = Box<dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync>;
type Failure = (Box<dyn Fn(&Statement) -> bool + Send + Sync>, BackendError);

#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    log: Mutex<Vec<Statement>>,
    responders: Vec<Responder>,
    failures: Vec<Failure>,
    copy_responder: Option<CopyResponder>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond<F>(mut self, f: F) -> Self
    where
        F: Fn(&Statement) -> Option<QueryResult> + Send + Sync + 'static,
    {
        self.responders.push(Box::new(f));
        self
    }

    /// Fail any statement whose SQL contains `needle`.
    pub fn fail_on(self, needle: &str, category: ErrorCategory) -> Self {
        let owned = needle.to_string();
        let message = format!("scripted failure on {:?}", needle);
        self.fail_when(move |stmt| stmt.sql.contains(&owned), category, message)
    }

    /// Fail every statement matching `predicate`.
    pub fn fail_when<F>(mut self, predicate: F, category: ErrorCategory, message: impl Into<String>) -> Self
    where
        F: Fn(&Statement) -> bool + Send + Sync + 'static,
    {
        self.failures
            .push((Box::new(predicate), BackendError::new(category, message)));
        self
    }

    pub fn with_copy_output(self, bytes: &[u8]) -> Self {
        let bytes = bytes.to_vec();
        self.respond_copy(move |_| Some(bytes.clone()))
    }

    /// Answer bulk copies of `sql`; `None` reports the copy path as unsupported.
    pub fn respond_copy<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.copy_responder = Some(Box::new(f));
        self
    }

    pub fn scalar(value: CellValue) -> QueryResult {
        QueryResult::new(vec![ColumnInfo::new("?column?", "")], vec![vec![value]])
    }

    pub fn one_row() -> QueryResult {
        Self::scalar(CellValue::Int32(1))
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.statements().into_iter().map(|s| s.sql).collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.executed_sql()
            .iter()
            .filter(|sql| sql.contains(needle))
            .count()
    }

    fn record(&self, stmt: &Statement) -> Result<(), BackendError> {
        if let Ok(mut log) = self.log.lock() {
            log.push(stmt.clone());
        }
        match self.failures.iter().find(|(matches, _)| matches(stmt)) {
            Some((_, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, stmt: &Statement) -> Result<u64, BackendError> {
        self.record(stmt)?;
        Ok(self
            .responders
            .iter()
            .find_map(|r| r(stmt))
            .map(|r| r.row_count as u64)
            .unwrap_or(0))
    }

    async fn query(&self, stmt: &Statement) -> Result<QueryResult, BackendError> {
        self.record(stmt)?;
        Ok(self
            .responders
            .iter()
            .find_map(|r| r(stmt))
            .unwrap_or_else(QueryResult::empty))
    }

    async fn copy_out_csv(&self, sql: &str, _null: &str) -> Result<Vec<u8>, BackendError> {
        self.record(&Statement::new(sql))?;
        self.copy_responder
            .as_ref()
            .and_then(|respond| respond(sql))
            .ok_or_else(|| BackendError::unsupported("bulk copy"))
    }
}
