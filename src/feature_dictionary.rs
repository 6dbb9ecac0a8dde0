//! Feature names per imputed aggregation table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

use crate::adapter::DatabaseAdapter;
use crate::db::Executor;
use crate::error::Result;

/// Substring that marks the tables holding final (imputed) features.
pub const IMPUTED_TABLE_MARKER: &str = "aggregation_imputed";

/// Feature table name to its feature columns, in table order.
pub type FeatureDictionary = BTreeMap<String, Vec<String>>;

pub struct FeatureDictionaryCreator {
    features_schema_name: String,
    adapter: Arc<dyn DatabaseAdapter>,
    exec: Arc<dyn Executor>,
}

impl FeatureDictionaryCreator {
    pub fn new(
        features_schema_name: impl Into<String>,
        adapter: Arc<dyn DatabaseAdapter>,
        exec: Arc<dyn Executor>,
    ) -> Self {
        Self {
            features_schema_name: features_schema_name.into(),
            adapter,
            exec,
        }
    }

    /// Columns of every imputed table in `feature_table_names`, minus the
    /// index columns listed for that table in `index_columns`.
    pub async fn feature_dictionary(
        &self,
        feature_table_names: &[String],
        index_columns: &HashMap<String, Vec<String>>,
    ) -> Result<FeatureDictionary> {
        let mut dictionary = FeatureDictionary::new();
        for table in feature_table_names
            .iter()
            .filter(|t| t.contains(IMPUTED_TABLE_MARKER))
        {
            let exclude = index_columns.get(table).map(Vec::as_slice).unwrap_or(&[]);
            let stmt = self
                .adapter
                .table_columns_query(table, &self.features_schema_name, exclude)?;
            trace!(
                "Extracting all possible feature names for table {} with query {}",
                table,
                stmt.sql
            );
            let result = self.exec.query(&stmt).await?;
            let names = result
                .rows
                .iter()
                .filter_map(|row| row.first())
                .map(|cell| cell.to_text())
                .collect();
            dictionary.insert(table.clone(), names);
        }
        trace!("Feature dictionary built: {:?}", dictionary);
        Ok(dictionary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Dialect, OracleAdapter};
    use crate::db::testing::ScriptedExecutor;
    use crate::db::{CellValue, ColumnInfo, QueryResult, SqlValue};

    fn columns(names: &[&str]) -> QueryResult {
        QueryResult::new(
            vec![ColumnInfo::new("column_name", "text")],
            names
                .iter()
                .map(|n| vec![CellValue::Text(n.to_string())])
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_only_imputed_tables_are_read() {
        let exec = Arc::new(ScriptedExecutor::new().respond(|stmt| {
            (stmt.params.get(1) == Some(&SqlValue::Text("prefix_aggregation_imputed".into())))
                .then(|| columns(&["prefix_entity_id_all_a_sum", "prefix_entity_id_all_b_max"]))
        }));
        let creator = FeatureDictionaryCreator::new("features", Dialect::Postgres.adapter(), exec.clone());
        let index: HashMap<String, Vec<String>> = [(
            "prefix_aggregation_imputed".to_string(),
            vec!["entity_id".to_string(), "as_of_date".to_string()],
        )]
        .into_iter()
        .collect();

        let dictionary = creator
            .feature_dictionary(
                &[
                    "prefix_aggregation".to_string(),
                    "prefix_aggregation_imputed".to_string(),
                ],
                &index,
            )
            .await
            .unwrap();

        assert_eq!(dictionary.len(), 1);
        assert_eq!(
            dictionary["prefix_aggregation_imputed"],
            vec!["prefix_entity_id_all_a_sum", "prefix_entity_id_all_b_max"]
        );
        let stmts = exec.statements();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].params[0], SqlValue::Text("features".into()));
    }

    #[tokio::test]
    async fn test_oracle_excludes_index_columns_by_binding() {
        let exec = Arc::new(ScriptedExecutor::new());
        let creator = FeatureDictionaryCreator::new("features", Arc::new(OracleAdapter::new()), exec.clone());
        let index: HashMap<String, Vec<String>> =
            [("x_aggregation_imputed".to_string(), vec!["ENTITY_ID".to_string()])]
                .into_iter()
                .collect();
        let dictionary = creator
            .feature_dictionary(&["x_aggregation_imputed".to_string()], &index)
            .await
            .unwrap();
        assert_eq!(dictionary["x_aggregation_imputed"], Vec::<String>::new());
        let stmt = &exec.statements()[0];
        assert!(stmt.sql.contains("NOT IN (:3)"));
        assert_eq!(stmt.params[2], SqlValue::Text("entity_id".into()));
    }
}
