use std::fmt;

/// Categorized error types for native backend failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors, including pool exhaustion
    Connection,
    /// The executor does not implement the requested capability
    Unsupported,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unsupported => write!(f, "Unsupported Operation"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// A native execution failure, described in backend-neutral terms.
///
/// Executors build one of these for every failed round-trip and hand it
/// back untouched; nothing in this crate retries or swallows them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub category: ErrorCategory,
    /// Backend severity (ERROR, FATAL, ...)
    pub severity: String,
    /// SQLSTATE or ORA- code, empty when the failure never reached the server
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character position of the failure in the statement text
    pub position: Option<u32>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
    /// Computed line/column (1-based) from `position`, if available
    pub line: Option<usize>,
    pub col: Option<usize>,
}

impl BackendError {
    /// Build an error for executors that do not speak the PostgreSQL protocol.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        BackendError {
            category,
            severity: "ERROR".to_string(),
            code: String::new(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            schema: None,
            table: None,
            column: None,
            constraint: None,
            line: None,
            col: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn unsupported(operation: &str) -> Self {
        BackendError::new(
            ErrorCategory::Unsupported,
            format!("{} is not supported by this executor", operation),
        )
    }

    /// Create a BackendError from a tokio_postgres error, using the statement
    /// text to compute line/column from the byte position.
    #[cfg(feature = "postgres")]
    pub fn from_pg_error(err: &tokio_postgres::Error, sql: &str) -> Self {
        use std::error::Error as StdError;

        if let Some(db_err) = err.as_db_error() {
            let code = db_err.code().code().to_string();
            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });
            let (line, col) = match position {
                Some(pos) => byte_offset_to_line_col(sql, pos as usize),
                None => (None, None),
            };

            BackendError {
                category: categorize_sqlstate(&code),
                severity: db_err.severity().to_string(),
                code,
                message: db_err.message().to_string(),
                detail: db_err.detail().map(|s| s.to_string()),
                hint: db_err.hint().map(|s| s.to_string()),
                position,
                schema: db_err.schema().map(|s| s.to_string()),
                table: db_err.table().map(|s| s.to_string()),
                column: db_err.column().map(|s| s.to_string()),
                constraint: db_err.constraint().map(|s| s.to_string()),
                line,
                col,
            }
        } else {
            // Non-database error (connection, protocol, etc.)
            let category = if err.is_closed() || err.source().is_some() {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            let mut backend = BackendError::new(category, err.to_string());
            backend.detail = err.source().map(|e| e.to_string());
            backend
        }
    }

    /// Format as a rich multi-line string for logs and CLI output.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.category, self.message)];

        if let (Some(line), Some(col)) = (self.line, self.col) {
            lines.push(format!("  at line {}, column {}", line, col));
        }
        if !self.code.is_empty() {
            lines.push(format!("  Code: {}", self.code));
        }
        if let Some(detail) = &self.detail {
            lines.push(format!("  Detail: {}", detail));
        }
        if let Some(hint) = &self.hint {
            lines.push(format!("  Hint: {}", hint));
        }
        match (&self.schema, &self.table, &self.column) {
            (Some(schema), Some(table), Some(column)) => {
                lines.push(format!("  Object: {}.{}.{}", schema, table, column))
            }
            (Some(schema), Some(table), None) => {
                lines.push(format!("  Object: {}.{}", schema, table))
            }
            (None, Some(table), _) => lines.push(format!("  Table: {}", table)),
            _ => {}
        }
        if let Some(constraint) = &self.constraint {
            lines.push(format!("  Constraint: {}", constraint));
        }

        lines.join("\n")
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() {
            write!(f, "{}: {}", self.category, self.message)
        } else {
            write!(f, "{} [{}]: {}", self.category, self.code, self.message)
        }
    }
}

impl std::error::Error for BackendError {}

/// Convert a 1-based byte offset in a statement to (line, column), both 1-based.
pub(crate) fn byte_offset_to_line_col(sql: &str, byte_pos: usize) -> (Option<usize>, Option<usize>) {
    if byte_pos == 0 || sql.is_empty() {
        return (Some(1), Some(1));
    }
    let target = (byte_pos - 1).min(sql.len());
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in sql.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (Some(line), Some(col))
}

/// Categorize a SQLSTATE code into an ErrorCategory.
pub(crate) fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        // 42601 = syntax_error; the rest of class 42 is undefined objects etc.
        "42" if code == "42601" || code == "42000" => ErrorCategory::Syntax,
        "42" => ErrorCategory::Semantic,
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}
