//! Model group identity: a stable integer id per (class path,
//! hyperparameters, feature set, model config) tuple.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::adapter::{canonical_json, DatabaseAdapter, MODEL_GROUP_FUNCTION};
use crate::db::Executor;
use crate::error::{Result, TriageError};

/// Matrix metadata keys used to build `model_config` when no custom
/// grouping keys are configured.
pub const DEFAULT_KEYS: [&str; 7] = [
    "label_timespan",
    "label_name",
    "as_of_date_frequency",
    "max_training_history",
    "state",
    "cohort_name",
    "feature_groups",
];

/// The canonical tuple a model group is keyed on.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelGroupKey {
    pub class_path: String,
    pub parameters: Map<String, Value>,
    pub feature_names: Vec<String>,
    pub model_config: Map<String, Value>,
}

impl ModelGroupKey {
    /// Feature names in ascending order; identity ignores input order.
    pub fn sorted_feature_names(&self) -> Vec<String> {
        let mut names = self.feature_names.clone();
        names.sort();
        names
    }

    pub fn parameters_value(&self) -> Value {
        canonical_json(&Value::Object(self.parameters.clone()))
    }

    pub fn model_config_value(&self) -> Value {
        canonical_json(&Value::Object(self.model_config.clone()))
    }
}

fn feature_names(metadata: &Map<String, Value>) -> Result<Vec<String>> {
    let names = metadata
        .get("feature_names")
        .ok_or_else(|| TriageError::MissingMetadata("feature_names".to_string()))?;
    Ok(match names {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    })
}

fn metadata_value(metadata: &Map<String, Value>, key: &str) -> Result<Value> {
    metadata
        .get(key)
        .cloned()
        .ok_or_else(|| TriageError::MissingMetadata(key.to_string()))
}

/// Assigns model group ids through the adapter's read-or-create operation.
pub struct ModelGrouper {
    keys: BTreeSet<String>,
    adapter: Arc<dyn DatabaseAdapter>,
    exec: Arc<dyn Executor>,
}

impl ModelGrouper {
    /// `keys` selects the matrix metadata keys that define a group; empty
    /// means [`DEFAULT_KEYS`]. `class_path`, `parameters` and
    /// `feature_names` may be listed to take part in a custom grouping.
    pub fn new<I, S>(keys: I, adapter: Arc<dyn DatabaseAdapter>, exec: Arc<dyn Executor>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            adapter,
            exec,
        }
    }

    pub fn model_group_key(
        &self,
        class_path: &str,
        parameters: &Map<String, Value>,
        matrix_metadata: &Map<String, Value>,
    ) -> Result<ModelGroupKey> {
        if self.keys.is_empty() {
            let mut model_config = Map::new();
            for key in DEFAULT_KEYS {
                model_config.insert(key.to_string(), metadata_value(matrix_metadata, key)?);
            }
            return Ok(ModelGroupKey {
                class_path: class_path.to_string(),
                parameters: parameters.clone(),
                feature_names: feature_names(matrix_metadata)?,
                model_config,
            });
        }

        let mut group = ModelGroupKey::default();
        for key in &self.keys {
            match key.as_str() {
                "class_path" => group.class_path = class_path.to_string(),
                "parameters" => group.parameters = parameters.clone(),
                "feature_names" => group.feature_names = feature_names(matrix_metadata)?,
                other => {
                    group
                        .model_config
                        .insert(other.to_string(), metadata_value(matrix_metadata, other)?);
                }
            }
        }
        Ok(group)
    }

    /// Id of the group the model belongs to, created on first sight. `None`
    /// when the backend cannot resolve groups at all.
    pub async fn get_model_group_id(
        &self,
        class_path: &str,
        parameters: &Map<String, Value>,
        matrix_metadata: &Map<String, Value>,
    ) -> Result<Option<i64>> {
        let key = self.model_group_key(class_path, parameters, matrix_metadata)?;
        debug!(
            "resolving model group for {} with {} features",
            key.class_path,
            key.feature_names.len()
        );
        let id = self
            .adapter
            .get_model_group_id(self.exec.as_ref(), &key)
            .await?;
        if id.is_none() {
            warn!("no model group id assigned for {}", class_path);
        }
        Ok(id)
    }

    /// Like [`get_model_group_id`](Self::get_model_group_id), but an
    /// unresolvable group is an error.
    pub async fn require_model_group_id(
        &self,
        class_path: &str,
        parameters: &Map<String, Value>,
        matrix_metadata: &Map<String, Value>,
    ) -> Result<i64> {
        self.get_model_group_id(class_path, parameters, matrix_metadata)
            .await?
            .ok_or_else(|| {
                TriageError::MissingCapability(format!(
                    "{} routine or model groups table on the {} backend",
                    MODEL_GROUP_FUNCTION,
                    self.adapter.dialect()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Dialect, OracleAdapter, PostgresAdapter};
    use crate::db::testing::ScriptedExecutor;
    use crate::db::{CellValue, SqlValue, Statement};
    use serde_json::json;
    use std::sync::Mutex;

    fn metadata() -> Map<String, Value> {
        json!({
            "feature_names": ["z_feature", "a_feature"],
            "label_timespan": "1 year",
            "label_name": "booking",
            "as_of_date_frequency": "1 month",
            "max_training_history": "2 years",
            "state": "active",
            "cohort_name": "all_entities",
            "feature_groups": ["prefix: bookings"],
            "indices": ["entity_id", "as_of_date"],
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn params() -> Map<String, Value> {
        json!({"max_depth": 5, "criterion": "gini"})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn grouper(keys: &[&str], exec: Arc<ScriptedExecutor>) -> ModelGrouper {
        ModelGrouper::new(keys.iter().copied(), Dialect::Postgres.adapter(), exec)
    }

    #[test]
    fn test_default_keys() {
        let exec = Arc::new(ScriptedExecutor::new());
        let key = grouper(&[], exec)
            .model_group_key("sklearn.tree.DecisionTreeClassifier", &params(), &metadata())
            .unwrap();
        assert_eq!(key.class_path, "sklearn.tree.DecisionTreeClassifier");
        assert_eq!(key.parameters, params());
        assert_eq!(key.feature_names, vec!["z_feature", "a_feature"]);
        assert_eq!(key.model_config.len(), DEFAULT_KEYS.len());
        assert!(!key.model_config.contains_key("indices"));
    }

    #[test]
    fn test_custom_keys() {
        let exec = Arc::new(ScriptedExecutor::new());
        let key = grouper(&["label_name", "feature_names"], exec)
            .model_group_key("sklearn.tree.DecisionTreeClassifier", &params(), &metadata())
            .unwrap();
        assert_eq!(key.class_path, "");
        assert!(key.parameters.is_empty());
        assert_eq!(key.sorted_feature_names(), vec!["a_feature", "z_feature"]);
        assert_eq!(key.model_config_value(), json!({"label_name": "booking"}));
    }

    #[test]
    fn test_missing_metadata_key() {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut meta = metadata();
        meta.remove("state");
        let err = grouper(&[], exec)
            .model_group_key("x", &params(), &meta)
            .unwrap_err();
        assert!(matches!(err, TriageError::MissingMetadata(k) if k == "state"));
    }

    #[test]
    fn test_dates_serialize_as_iso() {
        let date = chrono::NaiveDate::from_ymd_opt(2016, 1, 1).unwrap();
        assert_eq!(serde_json::to_value(date).unwrap(), json!("2016-01-01"));
    }

    /// In-memory model_groups table keyed on the bound identity tuple.
    fn stateful_executor() -> Arc<ScriptedExecutor> {
        let groups: Arc<Mutex<Vec<Vec<SqlValue>>>> = Arc::new(Mutex::new(Vec::new()));
        let exec = ScriptedExecutor::new().respond(move |stmt: &Statement| {
            if stmt.sql.contains("to_regclass") || stmt.sql.contains("all_tables") {
                return Some(ScriptedExecutor::one_row());
            }
            let mut groups = groups.lock().unwrap();
            let position = groups.iter().position(|g| g == &stmt.params);
            if stmt.sql.starts_with("SELECT model_group_id") {
                position.map(|i| ScriptedExecutor::scalar(CellValue::Int32(i as i32 + 1)))
            } else if stmt.sql.starts_with("INSERT") {
                groups.push(stmt.params.clone());
                Some(ScriptedExecutor::scalar(CellValue::Int32(groups.len() as i32)))
            } else {
                None
            }
        });
        Arc::new(exec)
    }

    #[tokio::test]
    async fn test_identity_is_stable_and_order_independent() {
        let exec = stateful_executor();
        let grouper = grouper(&[], exec.clone());
        let first = grouper
            .get_model_group_id("sklearn.tree.DecisionTreeClassifier", &params(), &metadata())
            .await
            .unwrap();

        let mut reordered = metadata();
        reordered.insert("feature_names".into(), json!(["a_feature", "z_feature"]));
        let second = grouper
            .get_model_group_id("sklearn.tree.DecisionTreeClassifier", &params(), &reordered)
            .await
            .unwrap();
        assert_eq!(first, Some(1));
        assert_eq!(first, second);
        assert_eq!(exec.count_containing("INSERT"), 1);
    }

    #[tokio::test]
    async fn test_changed_grouping_key_gets_new_id() {
        let exec = stateful_executor();
        let grouper = grouper(&[], exec.clone());
        let first = grouper
            .get_model_group_id("sklearn.tree.DecisionTreeClassifier", &params(), &metadata())
            .await
            .unwrap();
        let mut changed = metadata();
        changed.insert("label_timespan".into(), json!("6 months"));
        let second = grouper
            .get_model_group_id("sklearn.tree.DecisionTreeClassifier", &params(), &changed)
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(second, Some(2));
    }

    #[tokio::test]
    async fn test_require_reports_missing_capability() {
        let exec = Arc::new(ScriptedExecutor::new());
        let grouper = ModelGrouper::new(
            Vec::<String>::new(),
            Arc::new(PostgresAdapter::new()),
            exec,
        );
        let err = grouper
            .require_model_group_id("x", &params(), &metadata())
            .await
            .unwrap_err();
        assert!(matches!(err, TriageError::MissingCapability(_)));
    }

    #[tokio::test]
    async fn test_custom_keys_resolve_to_one_group_on_oracle() {
        let exec = stateful_executor();
        let grouper = ModelGrouper::new(["label_name"], Arc::new(OracleAdapter::new()), exec.clone());
        let first = grouper
            .get_model_group_id("sklearn.tree.DecisionTreeClassifier", &params(), &metadata())
            .await
            .unwrap();
        let second = grouper
            .get_model_group_id("sklearn.svm.SVC", &Map::new(), &metadata())
            .await
            .unwrap();
        assert_eq!(first, Some(1));
        assert_eq!(first, second);
        assert_eq!(exec.count_containing("INSERT"), 1);

        let lookup = exec
            .statements()
            .into_iter()
            .find(|s| s.sql.starts_with("SELECT model_group_id"))
            .unwrap();
        assert_eq!(lookup.params[0], SqlValue::Null);
        assert_eq!(lookup.params[2], SqlValue::Clob("[]".into()));
        for stmt in exec.statements() {
            assert!(
                !stmt.params.iter().any(|p| matches!(
                    p,
                    SqlValue::Text(t) | SqlValue::Clob(t) if t.is_empty()
                )),
                "empty string bound in {}",
                stmt.sql
            );
        }
    }
}
