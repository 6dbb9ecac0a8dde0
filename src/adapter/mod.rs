//! The dialect seam: every backend-specific SQL fragment, DDL statement and
//! type mapping used by the generators goes through [`DatabaseAdapter`].
//!
//! Statement builders are pure and return either SQL text or a
//! [`Statement`] with bound parameters. Only `get_model_group_id`,
//! `query_to_frame` and `export_query_to_csv` touch the database.

mod codec;
pub mod ident;
pub mod interval;
mod oracle;
mod postgres;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io::Write;

pub use codec::{canonical_json, cell_to_value, compare_values, sorted_values};
pub use oracle::OracleAdapter;
pub use postgres::PostgresAdapter;

use crate::db::{CellValue, Executor, QueryResult, SqlValue, Statement};
use crate::error::Result;
use crate::model_group::ModelGroupKey;
use ident::validate_identifier;

/// Schemas the results pipeline writes into.
pub const METADATA_SCHEMAS: [&str; 4] = [
    "triage_metadata",
    "test_results",
    "train_results",
    "triage_production",
];

pub const MODEL_GROUPS_TABLE: &str = "triage_metadata.model_groups";
pub const MODEL_GROUP_FUNCTION: &str = "get_model_group_id";
pub const INDIVIDUAL_IMPORTANCES_TABLE: &str = "test_results.individual_importances";

/// Capacity of Oracle VARRAY column types.
pub const VARRAY_CAPACITY: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[serde(alias = "postgresql")]
    Postgres,
    Oracle,
}

impl Dialect {
    /// Dialect named by a connection URL, matched on keyword.
    pub fn from_url(url: &str) -> Option<Self> {
        let url = url.to_ascii_lowercase();
        if url.contains("postgresql") || url.contains("postgres") {
            Some(Dialect::Postgres)
        } else if url.contains("oracle") {
            Some(Dialect::Oracle)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgresql",
            Dialect::Oracle => "oracle",
        }
    }

    pub fn adapter(self) -> std::sync::Arc<dyn DatabaseAdapter> {
        match self {
            Dialect::Postgres => std::sync::Arc::new(PostgresAdapter::new()),
            Dialect::Oracle => std::sync::Arc::new(OracleAdapter::new()),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Backend-agnostic scalar column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    SmallInt,
    Integer,
    BigInt,
    Float,
    Boolean,
    Text,
    Varchar,
    Date,
    Timestamp,
    Interval,
    Json,
}

impl ScalarType {
    pub fn postgres_name(self) -> &'static str {
        match self {
            ScalarType::SmallInt => "smallint",
            ScalarType::Integer => "integer",
            ScalarType::BigInt => "bigint",
            ScalarType::Float => "double precision",
            ScalarType::Boolean => "boolean",
            ScalarType::Text => "text",
            ScalarType::Varchar => "varchar",
            ScalarType::Date => "date",
            ScalarType::Timestamp => "timestamp",
            ScalarType::Interval => "interval",
            ScalarType::Json => "jsonb",
        }
    }

    pub fn oracle_name(self) -> &'static str {
        match self {
            ScalarType::SmallInt => "NUMBER(5)",
            ScalarType::Integer => "NUMBER(10)",
            ScalarType::BigInt => "NUMBER(19)",
            ScalarType::Float => "BINARY_DOUBLE",
            ScalarType::Boolean => "NUMBER(1)",
            ScalarType::Text | ScalarType::Varchar => "VARCHAR2(4000)",
            ScalarType::Date => "DATE",
            ScalarType::Timestamp => "TIMESTAMP",
            ScalarType::Interval => "VARCHAR2(50)",
            ScalarType::Json => "CLOB",
        }
    }

    /// Element types an Oracle VARRAY can hold directly.
    pub fn is_primitive(self) -> bool {
        !matches!(self, ScalarType::Json | ScalarType::Interval)
    }

    fn oracle_tag(self) -> &'static str {
        match self {
            ScalarType::SmallInt | ScalarType::Integer | ScalarType::BigInt => "NUMBER",
            ScalarType::Float => "DOUBLE",
            ScalarType::Boolean => "BOOL",
            ScalarType::Date => "DATE",
            ScalarType::Timestamp => "TIMESTAMP",
            _ => "VARCHAR",
        }
    }
}

/// Column type chosen for JSON and array columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// PostgreSQL `JSONB`.
    Jsonb,
    /// Oracle `CLOB` constrained to hold JSON.
    ClobJson,
    /// PostgreSQL native array of the element type.
    Array(ScalarType),
    /// Oracle bounded collection type.
    VArray { item: ScalarType, capacity: u32 },
    /// Array stored as a JSON document in a `CLOB`.
    JsonArray(ScalarType),
}

impl ColumnType {
    pub fn sql(&self) -> String {
        match self {
            ColumnType::Jsonb => "JSONB".to_string(),
            ColumnType::ClobJson | ColumnType::JsonArray(_) => "CLOB".to_string(),
            ColumnType::Array(item) => format!("{}[]", item.postgres_name()),
            ColumnType::VArray { item, .. } => varray_type_name(*item),
        }
    }

    pub fn is_json_encoded(&self) -> bool {
        matches!(
            self,
            ColumnType::Jsonb | ColumnType::ClobJson | ColumnType::JsonArray(_)
        )
    }

    /// Table constraint needed for the column, if any.
    pub fn check_constraint(&self, column: &str) -> Option<String> {
        match self {
            ColumnType::ClobJson | ColumnType::JsonArray(_) => {
                Some(format!("CHECK ({} IS JSON)", column))
            }
            _ => None,
        }
    }
}

pub fn varray_type_name(item: ScalarType) -> String {
    format!("TRIAGE_{}_VARRAY", item.oracle_tag())
}

/// Everything needed to build the protected-groups insert for one date.
#[derive(Debug, Clone)]
pub struct ProtectedGroupsInsert<'a> {
    pub table_name: &'a str,
    pub as_of_date: NaiveDateTime,
    pub attribute_columns: &'a [String],
    pub cohort_hash: &'a str,
    pub cohort_table_name: &'a str,
    /// Table name or parenthesized subquery (with alias) holding the attributes.
    pub from_obj: &'a str,
    pub entity_id_column: &'a str,
    pub knowledge_date_column: &'a str,
}

/// `from_obj` may be a subquery supplied by configuration; plain names are
/// validated like any other identifier.
pub(crate) fn validate_from_obj(from_obj: &str) -> Result<&str> {
    if from_obj.trim_start().starts_with('(') {
        Ok(from_obj)
    } else {
        validate_identifier(from_obj)
    }
}

/// Dialect-specific behavior needed by the generators and the identity
/// resolver.
///
/// Implementations are stateless. Portable statements are provided as
/// default methods built from the placeholder and type hooks.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync + fmt::Debug {
    fn dialect(&self) -> Dialect;

    // ----- type resolution -----

    fn json_column_type(&self) -> ColumnType;

    fn array_column_type(&self, item: ScalarType) -> ColumnType;

    fn sql_type(&self, ty: ScalarType) -> &'static str;

    /// Placeholder for the `n`-th (1-based) bound parameter. Integer
    /// parameters are always bound as 64-bit values, so callers pass
    /// `ScalarType::BigInt` for them.
    fn param(&self, n: usize, ty: ScalarType) -> String;

    fn bool_literal(&self, value: bool) -> &'static str;

    /// Expression truncating a timestamp expression to its date.
    fn date_of(&self, expr: &str) -> String;

    // ----- codec -----

    fn store_json(&self, value: &Value) -> Result<String> {
        Ok(serde_json::to_string(&canonical_json(value))?)
    }

    fn retrieve_json(&self, cell: &CellValue) -> Result<Map<String, Value>>;

    /// Sort ascending (duplicates kept) and convert to a bindable value.
    fn serialize_array(&self, values: Vec<Value>) -> SqlValue;

    fn deserialize_array(&self, cell: &CellValue) -> Vec<Value>;

    /// Set expression usable on the right of `IN`.
    fn format_timestamp_array(&self, dates: &[NaiveDateTime]) -> String;

    // ----- DDL -----

    fn create_schemas(&self) -> Vec<String>;

    fn labels_table_ddl(&self, table: &str) -> Result<String> {
        let table = validate_identifier(table)?;
        Ok(format!(
            "CREATE TABLE {} (entity_id {}, as_of_date {}, label_timespan {}, \
             label_name {}, label_type {}, label {})",
            table,
            self.sql_type(ScalarType::Integer),
            self.sql_type(ScalarType::Timestamp),
            self.sql_type(ScalarType::Interval),
            self.sql_type(ScalarType::Varchar),
            self.sql_type(ScalarType::Varchar),
            self.sql_type(ScalarType::SmallInt),
        ))
    }

    fn entity_date_table_ddl(&self, table: &str) -> Result<String> {
        let table = validate_identifier(table)?;
        Ok(format!(
            "CREATE TABLE {} (entity_id {}, as_of_date {}, active {})",
            table,
            self.sql_type(ScalarType::Integer),
            self.sql_type(ScalarType::Timestamp),
            self.sql_type(ScalarType::Boolean),
        ))
    }

    fn protected_groups_table_ddl(&self, table: &str, attribute_columns: &[String]) -> Result<String> {
        let table = validate_identifier(table)?;
        let text = self.sql_type(ScalarType::Text);
        let mut columns = vec![
            format!("entity_id {}", self.sql_type(ScalarType::Integer)),
            format!("as_of_date {}", self.sql_type(ScalarType::Date)),
        ];
        for col in ident::validate_identifiers(attribute_columns)? {
            columns.push(format!("{} {}", col, text));
        }
        columns.push(format!("cohort_hash {}", text));
        Ok(format!("CREATE TABLE {} ({})", table, columns.join(", ")))
    }

    fn model_groups_table_ddl(&self) -> String;

    /// Index over `columns`; `name` is required by some backends and derived
    /// when absent.
    fn create_index(&self, table: &str, columns: &[&str], name: Option<&str>) -> Result<String>;

    fn drop_table_if_exists(&self, table: &str) -> Result<String>;

    fn create_table_as(&self, table: &str, select: &str) -> Result<String>;

    /// Statements installing backend support objects (routines, types, the
    /// model groups table).
    fn setup_statements(&self) -> Vec<String>;

    // ----- labels -----

    fn cast_to_interval(&self, value: &str) -> Result<String>;

    fn existing_labels_check(
        &self,
        labels_table: &str,
        as_of_date: NaiveDateTime,
        label_timespan: &str,
        label_name: &str,
    ) -> Result<Statement> {
        let table = validate_identifier(labels_table)?;
        let timespan = interval::Interval::parse(label_timespan)?;
        let sql = format!(
            "SELECT 1 FROM {} WHERE as_of_date = {} AND label_timespan = {} AND label_name = {}",
            table,
            self.param(1, ScalarType::Timestamp),
            self.param(2, ScalarType::Interval),
            self.param(3, ScalarType::Varchar),
        );
        Ok(Statement::new(self.limit_query(&sql, 1))
            .bind(as_of_date)
            .bind(timespan.to_string())
            .bind(label_name))
    }

    /// Insert the `(entity_id, outcome)` rows of an already dated label query.
    fn label_insert(
        &self,
        labels_table: &str,
        as_of_date: NaiveDateTime,
        label_timespan: &str,
        label_name: &str,
        label_query: &str,
    ) -> Result<Statement> {
        let table = validate_identifier(labels_table)?;
        let timespan = interval::Interval::parse(label_timespan)?;
        let sql = format!(
            "INSERT INTO {} (entity_id, as_of_date, label_timespan, label_name, label_type, label) \
             SELECT q.entity_id, {}, {}, {}, 'binary', q.outcome FROM ({}) q",
            table,
            self.param(1, ScalarType::Timestamp),
            self.param(2, ScalarType::Interval),
            self.param(3, ScalarType::Varchar),
            label_query,
        );
        Ok(Statement::new(sql)
            .bind(as_of_date)
            .bind(timespan.to_string())
            .bind(label_name))
    }

    // ----- entity-date tables -----

    fn entity_date_check(&self, table: &str, as_of_date: NaiveDateTime) -> Result<Statement> {
        let table = validate_identifier(table)?;
        let sql = format!(
            "SELECT 1 FROM {} WHERE as_of_date = {}",
            table,
            self.param(1, ScalarType::Timestamp)
        );
        Ok(Statement::new(self.limit_query(&sql, 1)).bind(as_of_date))
    }

    fn entity_date_insert(
        &self,
        table: &str,
        as_of_date: NaiveDateTime,
        dated_query: &str,
    ) -> Result<Statement> {
        let table = validate_identifier(table)?;
        let sql = format!(
            "INSERT INTO {} (entity_id, as_of_date, active) \
             SELECT q.entity_id, {}, {} FROM ({}) q GROUP BY q.entity_id",
            table,
            self.param(1, ScalarType::Timestamp),
            self.bool_literal(true),
            dated_query,
        );
        Ok(Statement::new(sql).bind(as_of_date))
    }

    /// Like [`entity_date_insert`](Self::entity_date_insert) but restricted
    /// to entities present in `cohort_table` on the same date.
    fn subset_entity_date_insert(
        &self,
        table: &str,
        as_of_date: NaiveDateTime,
        dated_query: &str,
        cohort_table: &str,
    ) -> Result<Statement> {
        let table = validate_identifier(table)?;
        let cohort = validate_identifier(cohort_table)?;
        let sql = format!(
            "INSERT INTO {} (entity_id, as_of_date, active) \
             SELECT s.entity_id, {}, {} FROM ({}) s \
             JOIN {} c ON s.entity_id = c.entity_id AND c.as_of_date = {} \
             GROUP BY s.entity_id",
            table,
            self.param(1, ScalarType::Timestamp),
            self.bool_literal(true),
            dated_query,
            cohort,
            self.param(2, ScalarType::Timestamp),
        );
        Ok(Statement::new(sql).bind(as_of_date).bind(as_of_date))
    }

    /// Copy labels-table entity-dates whose date is not yet present at all.
    fn labels_to_entity_date(&self, table: &str, labels_table: &str) -> Result<String> {
        let table = validate_identifier(table)?;
        let labels = validate_identifier(labels_table)?;
        Ok(format!(
            "INSERT INTO {t} (entity_id, as_of_date, active) \
             SELECT DISTINCT l.entity_id, l.as_of_date, {active} FROM {labels} l \
             WHERE NOT EXISTS (SELECT 1 FROM {t} e WHERE {e_date} = {l_date})",
            t = table,
            labels = labels,
            active = self.bool_literal(true),
            e_date = self.date_of("e.as_of_date"),
            l_date = self.date_of("l.as_of_date"),
        ))
    }

    /// Dates present in both the target table and the labels table.
    fn existing_label_dates(&self, table: &str, labels_table: &str) -> Result<String> {
        let table = validate_identifier(table)?;
        let labels = validate_identifier(labels_table)?;
        Ok(format!(
            "SELECT DISTINCT {e_date} AS as_of_date FROM {t} e \
             WHERE EXISTS (SELECT 1 FROM {labels} l WHERE {l_date} = {e_date}) \
             ORDER BY 1",
            t = table,
            labels = labels,
            e_date = self.date_of("e.as_of_date"),
            l_date = self.date_of("l.as_of_date"),
        ))
    }

    // ----- protected groups -----

    fn protected_groups_check(
        &self,
        table: &str,
        as_of_date: NaiveDateTime,
        cohort_hash: &str,
    ) -> Result<Statement> {
        let table = validate_identifier(table)?;
        let sql = format!(
            "SELECT 1 FROM {} WHERE as_of_date = {} AND cohort_hash = {}",
            table,
            self.param(1, ScalarType::Date),
            self.param(2, ScalarType::Text),
        );
        Ok(Statement::new(self.limit_query(&sql, 1))
            .bind(as_of_date.date())
            .bind(cohort_hash))
    }

    /// One row per cohort entity carrying the most recent attributes known
    /// strictly before the as-of-date.
    fn protected_groups_insert(&self, insert: &ProtectedGroupsInsert<'_>) -> Result<Statement>;

    fn protected_groups_delete(&self, table: &str, cohort_hash: &str) -> Result<Statement> {
        let table = validate_identifier(table)?;
        let sql = format!(
            "DELETE FROM {} WHERE cohort_hash = {}",
            table,
            self.param(1, ScalarType::Text)
        );
        Ok(Statement::new(sql).bind(cohort_hash))
    }

    fn protected_groups_select(
        &self,
        table: &str,
        attribute_columns: &[String],
        as_of_dates: &[NaiveDateTime],
        cohort_hash: &str,
    ) -> Result<Statement> {
        let table = validate_identifier(table)?;
        let mut columns = vec!["entity_id", "as_of_date"];
        columns.extend(ident::validate_identifiers(attribute_columns)?);
        columns.push("cohort_hash");
        let sql = format!(
            "SELECT {} FROM {} WHERE cohort_hash = {} AND as_of_date IN {} \
             ORDER BY entity_id, as_of_date",
            columns.join(", "),
            table,
            self.param(1, ScalarType::Text),
            self.format_timestamp_array(as_of_dates),
        );
        Ok(Statement::new(sql).bind(cohort_hash))
    }

    // ----- introspection -----

    /// Ordered column names of a table, minus `exclude`.
    fn table_columns_query(&self, table: &str, schema: &str, exclude: &[String]) -> Result<Statement>;

    fn array_contains(&self, column: &str, value: &str, data_type: ScalarType) -> Result<String>;

    fn array_categorical_choice(&self, choice: &str) -> String;

    /// Direct check; errors on the backend when the table is absent.
    fn table_exists_check(&self, schema: Option<&str>, table: &str) -> Result<String> {
        let name = match schema {
            Some(schema) => format!("{}.{}", schema, table),
            None => table.to_string(),
        };
        let name = validate_identifier(&name)?;
        Ok(self.limit_query(&format!("SELECT 1 FROM {}", name), 1))
    }

    /// Catalog lookup returning a row when the (optionally schema-qualified)
    /// table exists.
    fn table_exists_query(&self, table: &str) -> Result<Statement>;

    fn row_count_query(&self, table: &str) -> Result<String> {
        Ok(format!("SELECT COUNT(*) FROM {}", validate_identifier(table)?))
    }

    fn has_data_query(&self, table: &str) -> Result<String> {
        let table = validate_identifier(table)?;
        Ok(self.limit_query(&format!("SELECT 1 FROM {}", table), 1))
    }

    fn duplicates_query(&self, table: &str, columns: &[&str]) -> Result<String> {
        let table = validate_identifier(table)?;
        let columns = ident::validate_identifiers(columns)?.join(", ");
        let sql = format!(
            "SELECT {cols}, COUNT(*) FROM {t} GROUP BY {cols} HAVING COUNT(*) > 1",
            cols = columns,
            t = table
        );
        Ok(self.limit_query(&sql, 1))
    }

    fn explain_prefix(&self) -> &'static str;

    fn limit_clause(&self, n: usize) -> String;

    /// Wrap a complete query so that it returns at most `n` rows.
    fn limit_query(&self, sql: &str, n: usize) -> String;

    // ----- results tables -----

    fn existing_importances_count(
        &self,
        model_id: i64,
        as_of_date: NaiveDateTime,
        method: &str,
    ) -> Statement {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE model_id = {} AND as_of_date = {} AND method = {}",
            INDIVIDUAL_IMPORTANCES_TABLE,
            self.param(1, ScalarType::BigInt),
            self.param(2, ScalarType::Timestamp),
            self.param(3, ScalarType::Text),
        );
        Statement::new(sql).bind(model_id).bind(as_of_date).bind(method)
    }

    fn delete_individual_importances(
        &self,
        model_id: i64,
        as_of_date: NaiveDateTime,
        method: &str,
    ) -> Statement {
        let sql = format!(
            "DELETE FROM {} WHERE model_id = {} AND as_of_date = {} AND method = {}",
            INDIVIDUAL_IMPORTANCES_TABLE,
            self.param(1, ScalarType::BigInt),
            self.param(2, ScalarType::Timestamp),
            self.param(3, ScalarType::Text),
        );
        Statement::new(sql).bind(model_id).bind(as_of_date).bind(method)
    }

    fn subset_table_query(&self, as_of_dates: &[NaiveDateTime], subset_table: &str) -> Result<String> {
        let table = validate_identifier(subset_table)?;
        Ok(format!(
            "SELECT entity_id, as_of_date, active FROM {} WHERE as_of_date IN {}",
            table,
            self.format_timestamp_array(as_of_dates)
        ))
    }

    fn model_group_function_exists_query(&self) -> Statement;

    // ----- executing operations -----

    /// Read-or-create the id of a model group. `None` when the backend has
    /// neither the identity routine nor the model groups table.
    async fn get_model_group_id(
        &self,
        exec: &dyn Executor,
        key: &ModelGroupKey,
    ) -> Result<Option<i64>>;

    /// Run a query and return all of its rows.
    async fn query_to_frame(&self, exec: &dyn Executor, stmt: &Statement) -> Result<QueryResult>;

    /// Write a query result to `out` as CSV.
    async fn export_query_to_csv(
        &self,
        exec: &dyn Executor,
        stmt: &Statement,
        out: &mut (dyn Write + Send),
        include_header: bool,
    ) -> Result<()>;
}
