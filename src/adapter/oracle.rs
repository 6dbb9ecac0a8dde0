use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use std::io::Write;
use tracing::{debug, trace, warn};

use super::codec::{cell_to_value, native_array, sorted_values};
use super::ident::{
    quote_literal, split_qualified, timestamp_literal, validate_identifier, validate_identifiers,
};
use super::interval::Interval;
use super::{
    validate_from_obj, varray_type_name, ColumnType, DatabaseAdapter, Dialect,
    ProtectedGroupsInsert, ScalarType, METADATA_SCHEMAS, MODEL_GROUPS_TABLE, MODEL_GROUP_FUNCTION,
    VARRAY_CAPACITY,
};
use crate::db::{CellValue, Executor, QueryResult, SqlValue, Statement};
use crate::error::{Result, TriageError};
use crate::export;
use crate::model_group::ModelGroupKey;

/// ORA-00942: table or view does not exist
const ORA_TABLE_MISSING: i32 = -942;
/// ORA-00955: name is already used by an existing object
const ORA_NAME_IN_USE: i32 = -955;
/// ORA-01920: user name conflicts with another user or role name
const ORA_USER_EXISTS: i32 = -1920;

const MAX_IDENTIFIER_LEN: usize = 128;

/// Element types that get a VARRAY type installed by `setup_statements`.
const VARRAY_ITEMS: [ScalarType; 6] = [
    ScalarType::Varchar,
    ScalarType::BigInt,
    ScalarType::Float,
    ScalarType::Boolean,
    ScalarType::Date,
    ScalarType::Timestamp,
];

/// Oracle dialect: JSON in constrained CLOBs, VARRAY collections, `:n`
/// placeholders, `ROWNUM` row limiting.
///
/// There is no server-side bulk copy; reads and CSV exports fetch every row
/// into memory first.
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleAdapter;

impl OracleAdapter {
    pub fn new() -> Self {
        OracleAdapter
    }

    async fn call_model_group_function(
        &self,
        exec: &dyn Executor,
        key: &ModelGroupKey,
    ) -> Result<Option<i64>> {
        let features = key.sorted_feature_names().join(",");
        let stmt = Statement::new(format!(
            "SELECT {}(in_model_type => :1, in_hyperparameters => :2, \
             in_feature_list => :3, in_model_config => :4) FROM DUAL",
            MODEL_GROUP_FUNCTION
        ))
        .bind(model_type_param(key))
        .bind(SqlValue::Clob(self.store_json(&key.parameters_value())?))
        .bind(if features.is_empty() {
            SqlValue::Null
        } else {
            SqlValue::Clob(features)
        })
        .bind(SqlValue::Clob(self.store_json(&key.model_config_value())?));
        trace!("{}", stmt.sql);
        Ok(exec.query_scalar(&stmt).await?.and_then(|c| c.as_i64()))
    }

    async fn resolve_model_group(
        &self,
        exec: &dyn Executor,
        key: &ModelGroupKey,
    ) -> Result<Option<i64>> {
        // DECODE treats two NULLs as equal; an empty class path binds as NULL.
        let select = self.bind_identity(
            Statement::new(format!(
                "SELECT model_group_id FROM {} WHERE DECODE(model_type, :1, 1, 0) = 1 \
                 AND DBMS_LOB.COMPARE(hyperparameters, :2) = 0 \
                 AND DBMS_LOB.COMPARE(feature_list, :3) = 0 \
                 AND DBMS_LOB.COMPARE(model_config, :4) = 0",
                MODEL_GROUPS_TABLE
            )),
            key,
        )?;
        trace!("{}", select.sql);
        if let Some(id) = exec.query_scalar(&select).await?.and_then(|c| c.as_i64()) {
            return Ok(Some(id));
        }

        let insert = self.bind_identity(
            Statement::new(format!(
                "INSERT INTO {} (model_type, hyperparameters, feature_list, model_config) \
                 VALUES (:1, :2, :3, :4)",
                MODEL_GROUPS_TABLE
            )),
            key,
        )?;
        trace!("{}", insert.sql);
        exec.execute(&insert).await?;
        Ok(exec.query_scalar(&select).await?.and_then(|c| c.as_i64()))
    }

    /// Binds the identity tuple for the native table. Every CLOB column gets
    /// a non-empty JSON document, so no value degrades to NULL on the way in.
    fn bind_identity(&self, stmt: Statement, key: &ModelGroupKey) -> Result<Statement> {
        Ok(stmt
            .bind(model_type_param(key))
            .bind(SqlValue::Clob(self.store_json(&key.parameters_value())?))
            .bind(SqlValue::Clob(serde_json::to_string(
                &key.sorted_feature_names(),
            )?))
            .bind(SqlValue::Clob(self.store_json(&key.model_config_value())?)))
    }
}

/// Oracle reads `''` as NULL; bind it as NULL outright.
fn model_type_param(key: &ModelGroupKey) -> SqlValue {
    if key.class_path.is_empty() {
        SqlValue::Null
    } else {
        SqlValue::Text(key.class_path.clone())
    }
}

/// PL/SQL block running `sql` and ignoring one expected error code.
fn ignoring_error(sql: &str, code: i32) -> String {
    format!(
        "BEGIN EXECUTE IMMEDIATE {}; EXCEPTION WHEN OTHERS THEN IF SQLCODE != {} THEN RAISE; END IF; END;",
        quote_literal(sql),
        code
    )
}

fn varray_element(item: ScalarType) -> &'static str {
    match item {
        ScalarType::SmallInt | ScalarType::Integer | ScalarType::BigInt => "NUMBER",
        other => other.oracle_name(),
    }
}

fn derived_index_name(table: &str, columns: &[&str]) -> String {
    let (schema, base) = split_qualified(table);
    let mut name = format!("{}_{}_idx", base, columns.join("_"));
    if name.len() > MAX_IDENTIFIER_LEN {
        name.truncate(MAX_IDENTIFIER_LEN - 4);
        name.push_str("_idx");
    }
    match schema {
        Some(schema) => format!("{}.{}", schema, name),
        None => name,
    }
}

#[async_trait]
impl DatabaseAdapter for OracleAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Oracle
    }

    fn json_column_type(&self) -> ColumnType {
        ColumnType::ClobJson
    }

    fn array_column_type(&self, item: ScalarType) -> ColumnType {
        if item.is_primitive() {
            ColumnType::VArray {
                item,
                capacity: VARRAY_CAPACITY,
            }
        } else {
            ColumnType::JsonArray(item)
        }
    }

    fn sql_type(&self, ty: ScalarType) -> &'static str {
        ty.oracle_name()
    }

    fn param(&self, n: usize, _ty: ScalarType) -> String {
        format!(":{}", n)
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn date_of(&self, expr: &str) -> String {
        format!("TRUNC({})", expr)
    }

    fn retrieve_json(&self, cell: &CellValue) -> Result<Map<String, Value>> {
        Ok(match cell {
            CellValue::Json(Value::Object(map)) => map.clone(),
            CellValue::Text(text) => match serde_json::from_str(text) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            },
            _ => Map::new(),
        })
    }

    fn serialize_array(&self, values: Vec<Value>) -> SqlValue {
        let sorted = sorted_values(values);
        native_array(&sorted).unwrap_or_else(|| SqlValue::Text(Value::Array(sorted).to_string()))
    }

    fn deserialize_array(&self, cell: &CellValue) -> Vec<Value> {
        match cell {
            CellValue::Array(items) => items.iter().map(cell_to_value).collect(),
            CellValue::Json(Value::Array(items)) => items.clone(),
            CellValue::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Vec::new();
                }
                match serde_json::from_str(text) {
                    Ok(Value::Array(items)) => items,
                    _ => text
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn format_timestamp_array(&self, dates: &[NaiveDateTime]) -> String {
        if dates.is_empty() {
            return "(SELECT NULL FROM DUAL WHERE 1 = 0)".to_string();
        }
        let rows: Vec<String> = dates
            .iter()
            .map(|d| format!("(TIMESTAMP {})", quote_literal(&timestamp_literal(d))))
            .collect();
        format!("(SELECT d FROM (VALUES {}) v (d))", rows.join(", "))
    }

    /// Schema-only accounts: they own objects but cannot log in.
    fn create_schemas(&self) -> Vec<String> {
        METADATA_SCHEMAS
            .iter()
            .flat_map(|schema| {
                [
                    ignoring_error(
                        &format!("CREATE USER {} NO AUTHENTICATION", schema),
                        ORA_USER_EXISTS,
                    ),
                    format!("ALTER USER {} QUOTA UNLIMITED ON USERS", schema),
                ]
            })
            .collect()
    }

    fn model_groups_table_ddl(&self) -> String {
        let json = self.json_column_type();
        format!(
            "CREATE TABLE {} (model_group_id NUMBER GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY, \
             model_type VARCHAR2(4000), hyperparameters {}, feature_list CLOB, model_config {}, \
             {}, {})",
            MODEL_GROUPS_TABLE,
            json.sql(),
            json.sql(),
            json.check_constraint("hyperparameters").unwrap_or_default(),
            json.check_constraint("model_config").unwrap_or_default(),
        )
    }

    fn create_index(&self, table: &str, columns: &[&str], name: Option<&str>) -> Result<String> {
        let table = validate_identifier(table)?;
        let columns = validate_identifiers(columns)?;
        let name = match name {
            Some(name) => validate_identifier(name)?.to_string(),
            None => derived_index_name(table, &columns),
        };
        Ok(format!(
            "CREATE INDEX {} ON {} ({})",
            name,
            table,
            columns.join(", ")
        ))
    }

    fn drop_table_if_exists(&self, table: &str) -> Result<String> {
        let table = validate_identifier(table)?;
        Ok(ignoring_error(
            &format!("DROP TABLE {}", table),
            ORA_TABLE_MISSING,
        ))
    }

    fn create_table_as(&self, table: &str, select: &str) -> Result<String> {
        Ok(format!(
            "CREATE TABLE {} AS {}",
            validate_identifier(table)?,
            select
        ))
    }

    fn setup_statements(&self) -> Vec<String> {
        let mut statements: Vec<String> = VARRAY_ITEMS
            .iter()
            .map(|item| {
                ignoring_error(
                    &format!(
                        "CREATE TYPE {} AS VARRAY({}) OF {}",
                        varray_type_name(*item),
                        VARRAY_CAPACITY,
                        varray_element(*item)
                    ),
                    ORA_NAME_IN_USE,
                )
            })
            .collect();
        statements.push(ignoring_error(
            &self.model_groups_table_ddl(),
            ORA_NAME_IN_USE,
        ));
        statements
    }

    fn cast_to_interval(&self, value: &str) -> Result<String> {
        let interval = Interval::parse(value)?;
        let (months, seconds) = (interval.months()?, interval.seconds()?);
        match (months, seconds) {
            (m, 0) if m % 12 == 0 => Ok(format!("NUMTOYMINTERVAL({}, 'YEAR')", m / 12)),
            (m, 0) => Ok(format!("NUMTOYMINTERVAL({}, 'MONTH')", m)),
            (0, s) if s % 86_400 == 0 => Ok(format!("NUMTODSINTERVAL({}, 'DAY')", s / 86_400)),
            (0, s) if s % 3_600 == 0 => Ok(format!("NUMTODSINTERVAL({}, 'HOUR')", s / 3_600)),
            (0, s) if s % 60 == 0 => Ok(format!("NUMTODSINTERVAL({}, 'MINUTE')", s / 60)),
            (0, s) => Ok(format!("NUMTODSINTERVAL({}, 'SECOND')", s)),
            // year-month and day-second intervals cannot be added together
            _ => Err(TriageError::InvalidInterval(value.to_string())),
        }
    }

    fn protected_groups_insert(&self, insert: &ProtectedGroupsInsert<'_>) -> Result<Statement> {
        let table = validate_identifier(insert.table_name)?;
        let cohort = validate_identifier(insert.cohort_table_name)?;
        let from_obj = validate_from_obj(insert.from_obj)?;
        let entity_id = validate_identifier(insert.entity_id_column)?;
        let knowledge_date = validate_identifier(insert.knowledge_date_column)?;
        let columns = validate_identifiers(insert.attribute_columns)?;

        let ranked_columns: Vec<String> = columns
            .iter()
            .map(|c| format!("TO_CHAR(from_obj.{c}) AS {c}", c = c))
            .collect();
        let sql = format!(
            "INSERT INTO {table} (entity_id, as_of_date, {columns}, cohort_hash) \
             SELECT ranked.entity_id, :1, {ranked_select}, :2 FROM (\
             SELECT cohort.entity_id, {ranked_columns}, \
             ROW_NUMBER() OVER (PARTITION BY cohort.entity_id, cohort.as_of_date \
             ORDER BY from_obj.{knowledge_date} DESC NULLS LAST) AS rn \
             FROM {cohort} cohort \
             LEFT JOIN (SELECT * FROM {from_obj}) from_obj \
             ON cohort.entity_id = from_obj.{entity_id} \
             AND cohort.as_of_date > from_obj.{knowledge_date} \
             WHERE cohort.as_of_date = :3) ranked \
             WHERE ranked.rn = 1",
            table = table,
            columns = columns.join(", "),
            ranked_select = columns
                .iter()
                .map(|c| format!("ranked.{}", c))
                .collect::<Vec<_>>()
                .join(", "),
            ranked_columns = ranked_columns.join(", "),
            cohort = cohort,
            from_obj = from_obj,
            entity_id = entity_id,
            knowledge_date = knowledge_date,
        );
        Ok(Statement::new(sql)
            .bind(insert.as_of_date.date())
            .bind(insert.cohort_hash)
            .bind(insert.as_of_date))
    }

    fn table_columns_query(&self, table: &str, schema: &str, exclude: &[String]) -> Result<Statement> {
        let table = validate_identifier(table)?;
        let schema = validate_identifier(schema)?;
        let mut sql = String::from(
            "SELECT LOWER(column_name) AS column_name FROM all_tab_columns \
             WHERE owner = UPPER(:1) AND table_name = UPPER(:2)",
        );
        if !exclude.is_empty() {
            let placeholders: Vec<String> = (0..exclude.len()).map(|i| format!(":{}", i + 3)).collect();
            sql.push_str(&format!(
                " AND LOWER(column_name) NOT IN ({})",
                placeholders.join(", ")
            ));
        }
        sql.push_str(" ORDER BY column_id");

        let mut stmt = Statement::new(sql).bind(schema).bind(table);
        for column in exclude {
            stmt = stmt.bind(column.to_lowercase());
        }
        Ok(stmt)
    }

    fn array_contains(&self, column: &str, value: &str, data_type: ScalarType) -> Result<String> {
        let column = validate_identifier(column)?;
        let literal = match data_type {
            ScalarType::Text | ScalarType::Varchar => quote_literal(value),
            other => format!("CAST({} AS {})", quote_literal(value), varray_element(other)),
        };
        Ok(format!(
            "EXISTS (SELECT 1 FROM TABLE({}) WHERE COLUMN_VALUE = {})",
            column, literal
        ))
    }

    fn array_categorical_choice(&self, choice: &str) -> String {
        quote_literal(choice)
    }

    fn table_exists_query(&self, table: &str) -> Result<Statement> {
        let table = validate_identifier(table)?;
        let stmt = match split_qualified(table) {
            (Some(owner), name) => Statement::new(self.limit_query(
                "SELECT 1 FROM all_tables WHERE owner = UPPER(:1) AND table_name = UPPER(:2)",
                1,
            ))
            .bind(owner)
            .bind(name),
            (None, name) => Statement::new(
                self.limit_query("SELECT 1 FROM user_tables WHERE table_name = UPPER(:1)", 1),
            )
            .bind(name),
        };
        Ok(stmt)
    }

    fn explain_prefix(&self) -> &'static str {
        "EXPLAIN PLAN FOR"
    }

    fn limit_clause(&self, n: usize) -> String {
        format!("FETCH FIRST {} ROWS ONLY", n)
    }

    fn limit_query(&self, sql: &str, n: usize) -> String {
        format!("SELECT * FROM ({}) WHERE ROWNUM <= {}", sql, n)
    }

    fn model_group_function_exists_query(&self) -> Statement {
        Statement::new(self.limit_query(
            "SELECT 1 FROM all_objects WHERE object_type = 'FUNCTION' AND object_name = UPPER(:1)",
            1,
        ))
        .bind(MODEL_GROUP_FUNCTION)
    }

    async fn get_model_group_id(
        &self,
        exec: &dyn Executor,
        key: &ModelGroupKey,
    ) -> Result<Option<i64>> {
        if exec
            .query_exists(&self.model_group_function_exists_query())
            .await?
        {
            return self.call_model_group_function(exec, key).await;
        }
        debug!(
            "{} not installed, resolving model group against {}",
            MODEL_GROUP_FUNCTION, MODEL_GROUPS_TABLE
        );
        if exec
            .query_exists(&self.table_exists_query(MODEL_GROUPS_TABLE)?)
            .await?
        {
            return self.resolve_model_group(exec, key).await;
        }
        warn!(
            "neither {} nor {} exists; model group cannot be resolved",
            MODEL_GROUP_FUNCTION, MODEL_GROUPS_TABLE
        );
        Ok(None)
    }

    async fn query_to_frame(&self, exec: &dyn Executor, stmt: &Statement) -> Result<QueryResult> {
        trace!("{}", stmt.sql);
        Ok(exec.query(stmt).await?)
    }

    async fn export_query_to_csv(
        &self,
        exec: &dyn Executor,
        stmt: &Statement,
        out: &mut (dyn Write + Send),
        include_header: bool,
    ) -> Result<()> {
        trace!("{}", stmt.sql);
        let result = exec.query(stmt).await?;
        debug!("encoding {} fetched rows as csv", result.row_count);
        export::write_csv(&result, out, include_header)
    }
}
