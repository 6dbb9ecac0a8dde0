//! User query templates parameterized on `{as_of_date}`.

use chrono::NaiveDateTime;
use sqlparser::ast::Statement as SqlStatement;
use sqlparser::dialect::{Dialect as ParserDialect, GenericDialect, PostgreSqlDialect};
use sqlparser::parser::Parser as SqlParser;
use tracing::debug;

use crate::adapter::ident::iso_format;
use crate::adapter::Dialect;
use crate::error::{Result, TriageError};

const PLACEHOLDER: &str = "{as_of_date}";

/// A date-parameterized query. `{as_of_date}` is replaced by the ISO-8601
/// date; `{{` and `}}` stand for literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate(String);

impl QueryTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        QueryTemplate(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Renders in one left-to-right pass, so an escaped `{{as_of_date}}`
    /// comes out as the literal `{as_of_date}`.
    pub fn render(&self, as_of_date: &NaiveDateTime) -> String {
        let date = iso_format(as_of_date);
        let mut out = String::with_capacity(self.0.len() + date.len());
        let mut rest = self.0.as_str();
        while let Some(at) = rest.find(['{', '}']) {
            out.push_str(&rest[..at]);
            rest = &rest[at..];
            if rest.starts_with("{{") {
                out.push('{');
                rest = &rest[2..];
            } else if rest.starts_with("}}") {
                out.push('}');
                rest = &rest[2..];
            } else if rest.starts_with(PLACEHOLDER) {
                out.push_str(&date);
                rest = &rest[PLACEHOLDER.len()..];
            } else {
                out.push_str(&rest[..1]);
                rest = &rest[1..];
            }
        }
        out.push_str(rest);
        out
    }
}

impl From<&str> for QueryTemplate {
    fn from(template: &str) -> Self {
        QueryTemplate::new(template)
    }
}

impl From<String> for QueryTemplate {
    fn from(template: String) -> Self {
        QueryTemplate(template)
    }
}

/// Reject SQL that parses but is not exactly one query. Text the parser
/// cannot handle (vendor syntax, unquoted dates) is passed through to the
/// backend.
pub fn check_single_query(dialect: Dialect, sql: &str) -> Result<()> {
    let parser_dialect: Box<dyn ParserDialect> = match dialect {
        Dialect::Postgres => Box::new(PostgreSqlDialect {}),
        Dialect::Oracle => Box::new(GenericDialect {}),
    };
    let statements = match SqlParser::parse_sql(parser_dialect.as_ref(), sql) {
        Ok(statements) => statements,
        Err(e) => {
            debug!("query not checked, parser rejected it: {}", e);
            return Ok(());
        }
    };
    match statements.as_slice() {
        [SqlStatement::Query(_)] => Ok(()),
        [_] => Err(TriageError::InvalidQuery(
            "expected a SELECT query, found another kind of statement".to_string(),
        )),
        many => Err(TriageError::InvalidQuery(format!(
            "expected 1 statement, found {}",
            many.len()
        ))),
    }
}
