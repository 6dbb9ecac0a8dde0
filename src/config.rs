//! The `triage.toml` configuration file.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::adapter::DatabaseAdapter;
use crate::db::{ConnectionConfig, Executor};
use crate::entity_date::{CohortTableGenerator, EntityDateTableGenerator};
use crate::model_group::ModelGrouper;
use crate::protected_groups::{ProtectedGroups, ProtectedGroupsGenerator, ProtectedGroupsSource};

fn default_true() -> bool {
    true
}

fn default_entity_id_column() -> String {
    "entity_id".to_string()
}

fn default_knowledge_date_column() -> String {
    "knowledge_date".to_string()
}

fn default_protected_groups_table() -> String {
    "protected_groups".to_string()
}

fn default_features_schema() -> String {
    "features".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriageConfig {
    pub database: ConnectionConfig,
    #[serde(default)]
    pub cohort: Option<CohortConfig>,
    #[serde(default)]
    pub subset: Option<SubsetConfig>,
    #[serde(default)]
    pub protected_groups: Option<ProtectedGroupsConfig>,
    #[serde(default)]
    pub model_grouping: ModelGroupingConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CohortConfig {
    pub table_name: String,
    /// Query template with an `{as_of_date}` placeholder.
    #[serde(default)]
    pub query: Option<String>,
    /// Labels table to derive entity-dates from when no query is given.
    #[serde(default)]
    pub labels_table: Option<String>,
    #[serde(default = "default_true")]
    pub replace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubsetConfig {
    pub table_name: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_true")]
    pub replace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtectedGroupsConfig {
    pub from_obj: String,
    pub attribute_columns: Vec<String>,
    #[serde(default = "default_entity_id_column")]
    pub entity_id_column: String,
    #[serde(default = "default_knowledge_date_column")]
    pub knowledge_date_column: String,
    #[serde(default = "default_protected_groups_table")]
    pub table_name: String,
    #[serde(default = "default_true")]
    pub replace: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelGroupingConfig {
    /// Matrix metadata keys defining a model group; empty uses the defaults.
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeaturesConfig {
    #[serde(default = "default_features_schema")]
    pub schema_name: String,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            schema_name: default_features_schema(),
        }
    }
}

impl TriageConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("triage")
            .join("triage.toml")
    }

    /// Read `path`, or the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The configured cohort builder, or the no-op variant without a
    /// `[cohort]` section.
    pub fn cohort_generator(
        &self,
        adapter: Arc<dyn DatabaseAdapter>,
        exec: Arc<dyn Executor>,
    ) -> CohortTableGenerator {
        let Some(cohort) = &self.cohort else {
            return CohortTableGenerator::NoOp;
        };
        let mut generator =
            EntityDateTableGenerator::new(&cohort.table_name, adapter, exec).replace(cohort.replace);
        if let Some(query) = &cohort.query {
            generator = generator.with_query(query.as_str());
        }
        if let Some(labels_table) = &cohort.labels_table {
            generator = generator.with_labels_table(labels_table);
        }
        generator.into()
    }

    /// Subset builder restricted to `cohort_table`, if a `[subset]` section
    /// exists.
    pub fn subset_generator(
        &self,
        cohort_table: &str,
        adapter: Arc<dyn DatabaseAdapter>,
        exec: Arc<dyn Executor>,
    ) -> Option<EntityDateTableGenerator> {
        let subset = self.subset.as_ref()?;
        let mut generator = EntityDateTableGenerator::new(&subset.table_name, adapter, exec)
            .restricted_to(cohort_table)
            .replace(subset.replace);
        if let Some(query) = &subset.query {
            generator = generator.with_query(query.as_str());
        }
        Some(generator)
    }

    pub fn protected_groups(
        &self,
        adapter: Arc<dyn DatabaseAdapter>,
        exec: Arc<dyn Executor>,
    ) -> ProtectedGroups {
        let Some(pg) = &self.protected_groups else {
            return ProtectedGroups::NoOp;
        };
        let source = ProtectedGroupsSource {
            from_obj: pg.from_obj.clone(),
            attribute_columns: pg.attribute_columns.clone(),
            entity_id_column: pg.entity_id_column.clone(),
            knowledge_date_column: pg.knowledge_date_column.clone(),
        };
        ProtectedGroupsGenerator::new(source, &pg.table_name, adapter, exec)
            .replace(pg.replace)
            .into()
    }

    pub fn model_grouper(
        &self,
        adapter: Arc<dyn DatabaseAdapter>,
        exec: Arc<dyn Executor>,
    ) -> ModelGrouper {
        ModelGrouper::new(self.model_grouping.keys.iter().cloned(), adapter, exec)
    }
}

/// Parse an as-of-date given either as a date or an ISO-8601 timestamp.
pub fn parse_as_of_date(value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(dt);
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid as-of-date: {:?}", value))?;
    Ok(date.and_time(chrono::NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Dialect;
    use crate::db::testing::ScriptedExecutor;

    const FULL: &str = r#"
        [database]
        url = "postgresql://triage@db:5432/warehouse"
        ssl_mode = "disable"

        [cohort]
        table_name = "cohort_all_entities_abc"
        query = "select entity_id from events where outcome_date < '{as_of_date}'"
        replace = false

        [subset]
        table_name = "subset_vip_abc"
        query = "select entity_id from vip"

        [protected_groups]
        from_obj = "raw.demographics"
        attribute_columns = ["race", "sex"]
        knowledge_date_column = "event_date"

        [model_grouping]
        keys = ["label_name", "feature_names"]
    "#;

    #[test]
    fn test_full_config() {
        let config = TriageConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.database.dialect(), Some(Dialect::Postgres));
        let cohort = config.cohort.as_ref().unwrap();
        assert!(!cohort.replace);
        assert_eq!(cohort.labels_table, None);
        assert!(config.subset.as_ref().unwrap().replace);

        let pg = config.protected_groups.as_ref().unwrap();
        assert_eq!(pg.entity_id_column, "entity_id");
        assert_eq!(pg.knowledge_date_column, "event_date");
        assert_eq!(pg.table_name, "protected_groups");
        assert_eq!(config.model_grouping.keys.len(), 2);
        assert_eq!(config.features.schema_name, "features");
    }

    #[test]
    fn test_missing_sections_give_noop_variants() {
        let config = TriageConfig::from_toml_str(
            r#"
            [database]
            url = "oracle://scott@db:1521/orcl"
            "#,
        )
        .unwrap();
        let adapter = Dialect::Oracle.adapter();
        let exec: Arc<dyn Executor> = Arc::new(ScriptedExecutor::new());
        assert!(matches!(
            config.cohort_generator(adapter.clone(), exec.clone()),
            CohortTableGenerator::NoOp
        ));
        assert!(config
            .subset_generator("cohort_abc", adapter.clone(), exec.clone())
            .is_none());
        assert!(matches!(
            config.protected_groups(adapter, exec),
            ProtectedGroups::NoOp
        ));
    }

    #[test]
    fn test_generators_from_config() {
        let config = TriageConfig::from_toml_str(FULL).unwrap();
        let adapter = Dialect::Postgres.adapter();
        let exec: Arc<dyn Executor> = Arc::new(ScriptedExecutor::new());
        let cohort = config.cohort_generator(adapter.clone(), exec.clone());
        assert_eq!(cohort.table_name(), Some("cohort_all_entities_abc"));
        let subset = config
            .subset_generator("cohort_all_entities_abc", adapter, exec)
            .unwrap();
        assert!(subset.is_subset());
        assert_eq!(subset.table_name(), "subset_vip_abc");
    }

    #[test]
    fn test_missing_database_section_fails() {
        assert!(TriageConfig::from_toml_str("[cohort]\ntable_name = \"c\"").is_err());
    }

    #[test]
    fn test_parse_as_of_date() {
        let midnight = NaiveDate::from_ymd_opt(2016, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(parse_as_of_date("2016-01-01").unwrap(), midnight);
        assert_eq!(parse_as_of_date("2016-01-01T00:00:00").unwrap(), midnight);
        assert_eq!(parse_as_of_date(" 2016-01-01 00:00:00 ").unwrap(), midnight);
        assert!(parse_as_of_date("01/01/2016").is_err());
    }

    #[test]
    fn test_default_path() {
        assert!(TriageConfig::default_path().ends_with("triage/triage.toml"));
    }
}
