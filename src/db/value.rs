use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::time::Duration;

/// A value bound to a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Character data the backend must bind as a large object rather than
    /// a bounded string.
    Clob(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Json(serde_json::Value),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(value: NaiveDate) -> Self {
        SqlValue::Date(value)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(value: NaiveDateTime) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(value: serde_json::Value) -> Self {
        SqlValue::Json(value)
    }
}

impl SqlValue {
    /// SQL literal rendering, for statements that cannot carry bound
    /// parameters (bulk copy).
    pub fn to_literal(&self) -> String {
        fn quote(s: &str) -> String {
            format!("'{}'", s.replace('\'', "''"))
        }
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => {
                if *b {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            SqlValue::Int(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Text(s) | SqlValue::Clob(s) => quote(s),
            SqlValue::Date(d) => quote(&d.format("%Y-%m-%d").to_string()),
            SqlValue::Timestamp(ts) => quote(&ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            SqlValue::Json(j) => quote(&j.to_string()),
            SqlValue::TextArray(items) => {
                let items: Vec<String> = items.iter().map(|s| quote(s)).collect();
                format!("ARRAY[{}]", items.join(", "))
            }
            SqlValue::IntArray(items) => {
                let items: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                format!("ARRAY[{}]", items.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Array(Vec<CellValue>),
    Unknown(String),
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int16(i) => i.to_string(),
            CellValue::Int32(i) => i.to_string(),
            CellValue::Int64(i) => i.to_string(),
            CellValue::Float32(f) => f.to_string(),
            CellValue::Float64(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::Time(t) => t.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_string(),
            CellValue::Json(j) => j.to_string(),
            CellValue::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.display()).collect();
                format!("{{{}}}", items.join(","))
            }
            CellValue::Unknown(s) => s.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Integer view of the cell, accepting numeric text (Oracle NUMBER columns
    /// frequently arrive as strings).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int16(i) => Some(*i as i64),
            CellValue::Int32(i) => Some(*i as i64),
            CellValue::Int64(i) => Some(*i),
            CellValue::Float64(f) if f.fract() == 0.0 => Some(*f as i64),
            CellValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) | CellValue::Unknown(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a text rendering (as written by a CSV bulk copy) back into the
    /// cell the row path would have produced for `type_name`. Types without
    /// a scalar mapping, and text that does not parse, stay `Text`.
    pub fn from_text(text: &str, type_name: &str) -> CellValue {
        let parsed = match type_name {
            "bool" => match text {
                "t" | "true" => Some(CellValue::Bool(true)),
                "f" | "false" => Some(CellValue::Bool(false)),
                _ => None,
            },
            "int2" => text.parse().ok().map(CellValue::Int16),
            "int4" => text.parse().ok().map(CellValue::Int32),
            "int8" => text.parse().ok().map(CellValue::Int64),
            "float4" => text.parse().ok().map(CellValue::Float32),
            "float8" => text.parse().ok().map(CellValue::Float64),
            "date" => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(CellValue::Date),
            "time" => NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .ok()
                .map(CellValue::Time),
            "timestamp" => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(CellValue::DateTime),
            "timestamptz" => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .ok()
                .map(|ts| CellValue::TimestampTz(ts.with_timezone(&Utc))),
            "json" | "jsonb" => serde_json::from_str(text).ok().map(CellValue::Json),
            _ => None,
        };
        parsed.unwrap_or_else(|| CellValue::Text(text.to_string()))
    }

    /// Text rendering used when a cell lands in a string column; NULL stays empty.
    pub fn to_text(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            other => other.display(),
        }
    }
}

/// Rows returned by a query, with column metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<CellValue>>,
    pub row_count: usize,
    pub execution_time: Duration,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: vec![],
            rows: vec![],
            row_count: 0,
            execution_time: Duration::ZERO,
        }
    }

    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<CellValue>>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            execution_time: Duration::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First cell of the first row.
    pub fn scalar(&self) -> Option<&CellValue> {
        self.rows.first().and_then(|row| row.first())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Option<Vec<&CellValue>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().filter_map(|row| row.get(idx)).collect())
    }

    /// Retype text cells to `columns`, matched by position. NULL and
    /// already-typed cells are left alone.
    pub fn apply_column_types(&mut self, columns: &[ColumnInfo]) {
        for row in &mut self.rows {
            for (cell, column) in row.iter_mut().zip(columns) {
                if let CellValue::Text(text) = cell {
                    *cell = CellValue::from_text(text, &column.type_name);
                }
            }
        }
        for (mine, typed) in self.columns.iter_mut().zip(columns) {
            mine.type_name = typed.type_name.clone();
        }
    }

    /// Remove a column and its values from every row.
    pub fn drop_column(&mut self, name: &str) -> bool {
        match self.column_index(name) {
            Some(idx) => {
                self.columns.remove(idx);
                for row in &mut self.rows {
                    if idx < row.len() {
                        row.remove(idx);
                    }
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_result() -> QueryResult {
        QueryResult::new(
            vec![
                ColumnInfo::new("entity_id", "int4"),
                ColumnInfo::new("as_of_date", "timestamp"),
                ColumnInfo::new("cohort_hash", "text"),
            ],
            vec![
                vec![
                    CellValue::Int32(1),
                    CellValue::Text("2016-01-01".into()),
                    CellValue::Text("abc".into()),
                ],
                vec![
                    CellValue::Int32(2),
                    CellValue::Text("2016-01-01".into()),
                    CellValue::Text("abc".into()),
                ],
            ],
        )
    }

    #[test]
    fn test_sql_literal() {
        assert_eq!(SqlValue::Text("O'Brien".into()).to_literal(), "'O''Brien'");
        assert_eq!(SqlValue::Null.to_literal(), "NULL");
        let ts = NaiveDate::from_ymd_opt(2016, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(SqlValue::Timestamp(ts).to_literal(), "'2016-01-01 00:00:00'");
        assert_eq!(
            SqlValue::TextArray(vec!["a".into(), "b".into()]).to_literal(),
            "ARRAY['a', 'b']"
        );
        assert_eq!(SqlValue::IntArray(vec![]).to_literal(), "ARRAY[]");
    }

    #[test]
    fn test_display() {
        assert_eq!(CellValue::Null.display(), "NULL");
        assert_eq!(CellValue::Bool(true).display(), "true");
        assert_eq!(CellValue::Int64(9_999_999).display(), "9999999");
        assert_eq!(CellValue::Bytes(vec![1, 2, 3]).display(), "[3 bytes]");
        let arr = CellValue::Array(vec![CellValue::Int32(1), CellValue::Int32(2)]);
        assert_eq!(arr.display(), "{1,2}");
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(CellValue::Int32(7).as_i64(), Some(7));
        assert_eq!(CellValue::Text(" 42 ".into()).as_i64(), Some(42));
        assert_eq!(CellValue::Float64(3.0).as_i64(), Some(3));
        assert_eq!(CellValue::Float64(3.5).as_i64(), None);
        assert_eq!(CellValue::Null.as_i64(), None);
    }

    #[test]
    fn test_to_text_keeps_null_empty() {
        assert_eq!(CellValue::Null.to_text(), "");
        assert_eq!(CellValue::Int16(3).to_text(), "3");
    }

    #[test]
    fn test_scalar_and_columns() {
        let result = make_result();
        assert_eq!(result.scalar(), Some(&CellValue::Int32(1)));
        assert_eq!(result.column_index("AS_OF_DATE"), Some(1));
        let ids = result.column_values("entity_id").unwrap();
        assert_eq!(ids, vec![&CellValue::Int32(1), &CellValue::Int32(2)]);
        assert!(QueryResult::empty().scalar().is_none());
    }

    #[test]
    fn test_drop_column() {
        let mut result = make_result();
        assert!(result.drop_column("cohort_hash"));
        assert_eq!(result.columns.len(), 2);
        assert!(result.rows.iter().all(|r| r.len() == 2));
        assert!(!result.drop_column("cohort_hash"));
    }

    #[test]
    fn test_from_text_by_type() {
        assert_eq!(CellValue::from_text("t", "bool"), CellValue::Bool(true));
        assert_eq!(CellValue::from_text("42", "int4"), CellValue::Int32(42));
        assert_eq!(CellValue::from_text("9000000000", "int8"), CellValue::Int64(9_000_000_000));
        assert_eq!(CellValue::from_text("2.5", "float8"), CellValue::Float64(2.5));
        assert_eq!(
            CellValue::from_text("2020-06-01", "date"),
            CellValue::Date(NaiveDate::from_ymd_opt(2020, 6, 1).unwrap())
        );
        assert_eq!(
            CellValue::from_text("2020-06-01 12:30:00", "timestamp"),
            CellValue::DateTime(
                NaiveDate::from_ymd_opt(2020, 6, 1)
                    .unwrap()
                    .and_hms_opt(12, 30, 0)
                    .unwrap()
            )
        );
        assert_eq!(
            CellValue::from_text("2020-06-01 00:00:00+00", "timestamptz"),
            CellValue::TimestampTz(
                NaiveDate::from_ymd_opt(2020, 6, 1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc()
            )
        );
        assert_eq!(
            CellValue::from_text(r#"{"a": 1}"#, "jsonb"),
            CellValue::Json(serde_json::json!({"a": 1}))
        );
        assert_eq!(CellValue::from_text("", "text"), CellValue::Text(String::new()));
        assert_eq!(CellValue::from_text("{a,b}", "_text"), CellValue::Text("{a,b}".into()));
        assert_eq!(CellValue::from_text("n/a", "int4"), CellValue::Text("n/a".into()));
    }

    #[test]
    fn test_apply_column_types() {
        let mut result = QueryResult::new(
            vec![ColumnInfo::new("entity_id", "text"), ColumnInfo::new("as_of_date", "text")],
            vec![
                vec![CellValue::Text("1".into()), CellValue::Text("2016-01-01".into())],
                vec![CellValue::Text("2".into()), CellValue::Null],
            ],
        );
        result.apply_column_types(&[
            ColumnInfo::new("entity_id", "int4"),
            ColumnInfo::new("as_of_date", "date"),
        ]);
        assert_eq!(result.rows[0][0], CellValue::Int32(1));
        assert_eq!(
            result.rows[0][1],
            CellValue::Date(NaiveDate::from_ymd_opt(2016, 1, 1).unwrap())
        );
        assert_eq!(result.rows[1][1], CellValue::Null);
        assert_eq!(result.columns[1].type_name, "date");
    }
}
