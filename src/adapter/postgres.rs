use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use std::io::Write;
use tracing::{debug, trace, warn};

use super::codec::{cell_to_value, native_array, sorted_values};
use super::ident::{quote_literal, timestamp_literal, validate_identifier, validate_identifiers};
use super::interval::Interval;
use super::{
    validate_from_obj, ColumnType, DatabaseAdapter, Dialect, ProtectedGroupsInsert, ScalarType,
    METADATA_SCHEMAS, MODEL_GROUPS_TABLE, MODEL_GROUP_FUNCTION,
};
use crate::db::{CellValue, ErrorCategory, Executor, QueryResult, SqlValue, Statement};
use crate::error::Result;
use crate::export;
use crate::model_group::ModelGroupKey;

/// PostgreSQL dialect: native `JSONB` and arrays, `$n::type` placeholders,
/// `COPY` for bulk reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdapter;

impl PostgresAdapter {
    pub fn new() -> Self {
        PostgresAdapter
    }

    async fn call_model_group_function(
        &self,
        exec: &dyn Executor,
        key: &ModelGroupKey,
    ) -> Result<Option<i64>> {
        let stmt = Statement::new(format!(
            "SELECT public.{}($1::text, $2::jsonb, $3::text[], $4::jsonb)",
            MODEL_GROUP_FUNCTION
        ));
        let stmt = bind_key(stmt, key);
        trace!("{}", stmt.sql);
        Ok(exec.query_scalar(&stmt).await?.and_then(|c| c.as_i64()))
    }

    async fn resolve_model_group(
        &self,
        exec: &dyn Executor,
        key: &ModelGroupKey,
    ) -> Result<Option<i64>> {
        let select = bind_key(
            Statement::new(format!(
                "SELECT model_group_id FROM {} WHERE model_type = $1::text \
                 AND hyperparameters = $2::jsonb AND feature_list = $3::text[] \
                 AND model_config = $4::jsonb",
                MODEL_GROUPS_TABLE
            )),
            key,
        );
        trace!("{}", select.sql);
        if let Some(id) = exec.query_scalar(&select).await?.and_then(|c| c.as_i64()) {
            return Ok(Some(id));
        }

        let insert = bind_key(
            Statement::new(format!(
                "INSERT INTO {} (model_type, hyperparameters, feature_list, model_config) \
                 VALUES ($1::text, $2::jsonb, $3::text[], $4::jsonb) RETURNING model_group_id",
                MODEL_GROUPS_TABLE
            )),
            key,
        );
        trace!("{}", insert.sql);
        Ok(exec.query_scalar(&insert).await?.and_then(|c| c.as_i64()))
    }
}

fn bind_key(stmt: Statement, key: &ModelGroupKey) -> Statement {
    stmt.bind(key.class_path.as_str())
        .bind(key.parameters_value())
        .bind(SqlValue::TextArray(key.sorted_feature_names()))
        .bind(key.model_config_value())
}

/// NULL marker for frame reads, so empty strings survive the CSV trip.
const FRAME_NULL: &str = "\\N";

/// Replace `$n` placeholders outside string literals with the literal form
/// of the bound value.
pub(crate) fn inline_params(stmt: &Statement) -> String {
    let mut out = String::with_capacity(stmt.sql.len());
    let mut chars = stmt.sql.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if c == '\'' {
            in_string = !in_string;
            out.push(c);
            continue;
        }
        if c != '$' || in_string {
            out.push(c);
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            digits.push(*d);
            chars.next();
        }
        let value = digits
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| stmt.params.get(i));
        match value {
            Some(value) => out.push_str(&value.to_literal()),
            None => {
                out.push('$');
                out.push_str(&digits);
            }
        }
    }
    out
}

const MODEL_GROUP_FUNCTION_SQL: &str = r#"CREATE OR REPLACE FUNCTION public.get_model_group_id(
    in_model_type TEXT,
    in_hyperparameters JSONB,
    in_feature_list TEXT[],
    in_model_config JSONB
) RETURNS INTEGER AS $$
DECLARE
    model_group_return_id INTEGER;
BEGIN
    SELECT model_group_id INTO model_group_return_id
    FROM triage_metadata.model_groups
    WHERE model_type = in_model_type
      AND hyperparameters = in_hyperparameters
      AND feature_list = ARRAY(SELECT unnest(in_feature_list) ORDER BY 1)
      AND model_config = in_model_config;

    IF NOT FOUND THEN
        INSERT INTO triage_metadata.model_groups
            (model_type, hyperparameters, feature_list, model_config)
        VALUES
            (in_model_type, in_hyperparameters,
             ARRAY(SELECT unnest(in_feature_list) ORDER BY 1), in_model_config)
        RETURNING model_group_id INTO model_group_return_id;
    END IF;

    RETURN model_group_return_id;
END;
$$ LANGUAGE plpgsql"#;

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn json_column_type(&self) -> ColumnType {
        ColumnType::Jsonb
    }

    fn array_column_type(&self, item: ScalarType) -> ColumnType {
        ColumnType::Array(item)
    }

    fn sql_type(&self, ty: ScalarType) -> &'static str {
        ty.postgres_name()
    }

    fn param(&self, n: usize, ty: ScalarType) -> String {
        match ty {
            // String parameters only bind to text-like types
            ScalarType::Interval => format!("CAST(${}::text AS interval)", n),
            other => format!("${}::{}", n, other.postgres_name()),
        }
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    fn date_of(&self, expr: &str) -> String {
        format!("{}::date", expr)
    }

    fn retrieve_json(&self, cell: &CellValue) -> Result<Map<String, Value>> {
        match cell {
            CellValue::Json(Value::Object(map)) => Ok(map.clone()),
            CellValue::Text(text) => match serde_json::from_str(text)? {
                Value::Object(map) => Ok(map),
                _ => Ok(Map::new()),
            },
            _ => Ok(Map::new()),
        }
    }

    fn serialize_array(&self, values: Vec<Value>) -> SqlValue {
        let sorted = sorted_values(values);
        native_array(&sorted).unwrap_or(SqlValue::Json(Value::Array(sorted)))
    }

    fn deserialize_array(&self, cell: &CellValue) -> Vec<Value> {
        match cell {
            CellValue::Array(items) => items.iter().map(cell_to_value).collect(),
            CellValue::Json(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    fn format_timestamp_array(&self, dates: &[NaiveDateTime]) -> String {
        if dates.is_empty() {
            return "(SELECT NULL WHERE FALSE)".to_string();
        }
        let items: Vec<String> = dates
            .iter()
            .map(|d| quote_literal(&timestamp_literal(d)))
            .collect();
        format!("(SELECT (UNNEST (ARRAY[{}]::timestamp[])))", items.join(", "))
    }

    fn create_schemas(&self) -> Vec<String> {
        METADATA_SCHEMAS
            .iter()
            .map(|schema| format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .collect()
    }

    fn model_groups_table_ddl(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (model_group_id SERIAL PRIMARY KEY, \
             model_type TEXT, hyperparameters {}, feature_list {}, model_config {})",
            MODEL_GROUPS_TABLE,
            self.json_column_type().sql(),
            self.array_column_type(ScalarType::Text).sql(),
            self.json_column_type().sql(),
        )
    }

    fn create_index(&self, table: &str, columns: &[&str], name: Option<&str>) -> Result<String> {
        let table = validate_identifier(table)?;
        let columns = validate_identifiers(columns)?.join(", ");
        Ok(match name {
            Some(name) => format!(
                "CREATE INDEX {} ON {} ({})",
                validate_identifier(name)?,
                table,
                columns
            ),
            None => format!("CREATE INDEX ON {} ({})", table, columns),
        })
    }

    fn drop_table_if_exists(&self, table: &str) -> Result<String> {
        Ok(format!("DROP TABLE IF EXISTS {}", validate_identifier(table)?))
    }

    fn create_table_as(&self, table: &str, select: &str) -> Result<String> {
        Ok(format!(
            "CREATE TABLE {} AS ({})",
            validate_identifier(table)?,
            select
        ))
    }

    fn setup_statements(&self) -> Vec<String> {
        vec![
            self.model_groups_table_ddl(),
            MODEL_GROUP_FUNCTION_SQL.to_string(),
        ]
    }

    fn cast_to_interval(&self, value: &str) -> Result<String> {
        let interval = Interval::parse(value)?;
        Ok(format!("{}::interval", quote_literal(&interval.to_string())))
    }

    fn protected_groups_insert(&self, insert: &ProtectedGroupsInsert<'_>) -> Result<Statement> {
        let table = validate_identifier(insert.table_name)?;
        let cohort = validate_identifier(insert.cohort_table_name)?;
        let from_obj = validate_from_obj(insert.from_obj)?;
        let entity_id = validate_identifier(insert.entity_id_column)?;
        let knowledge_date = validate_identifier(insert.knowledge_date_column)?;
        let columns = validate_identifiers(insert.attribute_columns)?;

        let selected: Vec<String> = columns
            .iter()
            .map(|c| format!("from_obj.{}::text", c))
            .collect();
        let mut select_list = vec!["cohort.entity_id".to_string(), "$1::date".to_string()];
        select_list.extend(selected);
        select_list.push("$2::text".to_string());

        let sql = format!(
            "INSERT INTO {table} (entity_id, as_of_date, {columns}, cohort_hash) \
             SELECT DISTINCT ON (cohort.entity_id, cohort.as_of_date) {select_list} \
             FROM {cohort} cohort \
             LEFT JOIN (SELECT * FROM {from_obj}) from_obj \
             ON cohort.entity_id = from_obj.{entity_id} \
             AND cohort.as_of_date > from_obj.{knowledge_date} \
             WHERE cohort.as_of_date = $3::timestamp \
             ORDER BY cohort.entity_id, cohort.as_of_date, from_obj.{knowledge_date} DESC NULLS LAST",
            table = table,
            columns = columns.join(", "),
            select_list = select_list.join(", "),
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
        Ok(Statement::new(
            "SELECT column_name::text AS column_name FROM information_schema.columns \
             WHERE table_schema = $1::text AND table_name = $2::text \
             AND NOT (column_name::text = ANY($3::text[])) \
             ORDER BY ordinal_position",
        )
        .bind(schema)
        .bind(table)
        .bind(SqlValue::TextArray(exclude.to_vec())))
    }

    fn array_contains(&self, column: &str, value: &str, data_type: ScalarType) -> Result<String> {
        Ok(format!(
            "{}::{} = ANY({})",
            quote_literal(value),
            data_type.postgres_name(),
            validate_identifier(column)?
        ))
    }

    fn array_categorical_choice(&self, choice: &str) -> String {
        format!("array[{}::varchar]", quote_literal(choice))
    }

    fn table_exists_query(&self, table: &str) -> Result<Statement> {
        let table = validate_identifier(table)?;
        Ok(Statement::new("SELECT 1 WHERE to_regclass($1::text) IS NOT NULL").bind(table))
    }

    fn explain_prefix(&self) -> &'static str {
        "EXPLAIN"
    }

    fn limit_clause(&self, n: usize) -> String {
        format!("LIMIT {}", n)
    }

    fn limit_query(&self, sql: &str, n: usize) -> String {
        format!("{} {}", sql, self.limit_clause(n))
    }

    fn model_group_function_exists_query(&self) -> Statement {
        Statement::new(
            "SELECT 1 FROM pg_proc p JOIN pg_namespace n ON n.oid = p.pronamespace \
             WHERE n.nspname = 'public' AND p.proname = $1::text",
        )
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

    /// Rows travel through `COPY` as CSV, then are retyped with the column
    /// types of a zero-row run of the same statement, so the frame matches
    /// what the row path returns.
    async fn query_to_frame(&self, exec: &dyn Executor, stmt: &Statement) -> Result<QueryResult> {
        let sql = inline_params(stmt);
        trace!("{}", sql);
        match exec.copy_out_csv(&sql, FRAME_NULL).await {
            Ok(bytes) => {
                let mut frame = export::read_csv(&bytes, FRAME_NULL)?;
                let describe = Statement::with_params(
                    format!("SELECT * FROM ({}) AS frame LIMIT 0", stmt.sql),
                    stmt.params.clone(),
                );
                let typed = exec.query(&describe).await?;
                frame.apply_column_types(&typed.columns);
                Ok(frame)
            }
            Err(err) if err.category == ErrorCategory::Unsupported => {
                debug!("bulk copy unavailable, fetching rows directly");
                Ok(exec.query(stmt).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn export_query_to_csv(
        &self,
        exec: &dyn Executor,
        stmt: &Statement,
        out: &mut (dyn Write + Send),
        include_header: bool,
    ) -> Result<()> {
        let sql = inline_params(stmt);
        trace!("{}", sql);
        match exec.copy_out_csv(&sql, "").await {
            Ok(bytes) => {
                let body = if include_header {
                    &bytes[..]
                } else {
                    export::strip_header(&bytes)?
                };
                out.write_all(body)?;
                Ok(())
            }
            Err(err) if err.category == ErrorCategory::Unsupported => {
                let result = exec.query(stmt).await?;
                export::write_csv(&result, out, include_header)
            }
            Err(err) => Err(err.into()),
        }
    }
}
