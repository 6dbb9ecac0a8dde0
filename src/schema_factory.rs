//! Dialect-appropriate column types for schema definitions.
//!
//! Components normally receive their adapter explicitly. The process-wide
//! registry below exists for code that defines columns without knowing the
//! backend; bind it once at startup, before any concurrent use.

use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::adapter::ident::validate_identifier;
use crate::adapter::{ColumnType, DatabaseAdapter, Dialect, ScalarType};
use crate::error::Result;

static FACTORY: RwLock<Option<Arc<SchemaFactory>>> = RwLock::new(None);

/// A column definition ready to be placed in a `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub constraint: Option<String>,
}

impl ColumnDef {
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn ddl(&self) -> String {
        let mut ddl = format!("{} {}", self.name, self.sql_type);
        if !self.nullable {
            ddl.push_str(" NOT NULL");
        }
        if let Some(constraint) = &self.constraint {
            ddl.push(' ');
            ddl.push_str(constraint);
        }
        ddl
    }
}

#[derive(Debug, Clone)]
pub struct SchemaFactory {
    adapter: Arc<dyn DatabaseAdapter>,
}

impl SchemaFactory {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self { adapter }
    }

    /// Adapter named by `db_url`, else the first backend whose driver is
    /// available, else PostgreSQL.
    pub fn auto_detect(db_url: Option<&str>) -> Self {
        Self::auto_detect_with(db_url, driver_available)
    }

    pub fn auto_detect_with<F>(db_url: Option<&str>, is_available: F) -> Self
    where
        F: Fn(Dialect) -> bool,
    {
        let dialect = db_url
            .and_then(Dialect::from_url)
            .or_else(|| {
                [Dialect::Postgres, Dialect::Oracle]
                    .into_iter()
                    .find(|d| is_available(*d))
            })
            .unwrap_or(Dialect::Postgres);
        debug!("schema factory bound to {} adapter", dialect);
        Self::new(dialect.adapter())
    }

    pub fn adapter(&self) -> Arc<dyn DatabaseAdapter> {
        self.adapter.clone()
    }

    pub fn dialect(&self) -> Dialect {
        self.adapter.dialect()
    }

    pub fn json_column_type(&self) -> ColumnType {
        self.adapter.json_column_type()
    }

    pub fn array_column_type(&self, item: ScalarType) -> ColumnType {
        self.adapter.array_column_type(item)
    }

    pub fn scalar_column(&self, name: &str, ty: ScalarType) -> Result<ColumnDef> {
        Ok(ColumnDef {
            name: validate_identifier(name)?.to_string(),
            sql_type: self.adapter.sql_type(ty).to_string(),
            nullable: true,
            constraint: None,
        })
    }

    pub fn json_column(&self, name: &str) -> Result<ColumnDef> {
        self.typed_column(name, self.json_column_type())
    }

    pub fn array_column(&self, name: &str, item: ScalarType) -> Result<ColumnDef> {
        self.typed_column(name, self.array_column_type(item))
    }

    fn typed_column(&self, name: &str, column_type: ColumnType) -> Result<ColumnDef> {
        let name = validate_identifier(name)?;
        Ok(ColumnDef {
            name: name.to_string(),
            sql_type: column_type.sql(),
            nullable: true,
            constraint: column_type.check_constraint(name),
        })
    }

    pub fn create_table_ddl(&self, table: &str, columns: &[ColumnDef]) -> Result<String> {
        let table = validate_identifier(table)?;
        let columns: Vec<String> = columns.iter().map(ColumnDef::ddl).collect();
        Ok(format!("CREATE TABLE {} ({})", table, columns.join(", ")))
    }
}

/// Whether a client for the backend is usable from this process.
fn driver_available(dialect: Dialect) -> bool {
    match dialect {
        Dialect::Postgres => cfg!(feature = "postgres"),
        Dialect::Oracle => std::env::var_os("ORACLE_HOME").is_some(),
    }
}

/// Bind the process-wide factory, replacing any earlier binding.
pub fn set_schema_factory(factory: SchemaFactory) {
    let mut slot = FACTORY.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(Arc::new(factory));
}

pub fn set_schema_factory_from_url(db_url: &str) {
    set_schema_factory(SchemaFactory::auto_detect(Some(db_url)));
}

/// The bound factory, auto-detected on first use when none was set.
pub fn get_schema_factory() -> Arc<SchemaFactory> {
    if let Some(factory) = FACTORY.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
        return factory.clone();
    }
    let mut slot = FACTORY.write().unwrap_or_else(|e| e.into_inner());
    slot.get_or_insert_with(|| Arc::new(SchemaFactory::auto_detect(None)))
        .clone()
}

pub fn json_column(name: &str) -> Result<ColumnDef> {
    get_schema_factory().json_column(name)
}

pub fn array_column(name: &str, item: ScalarType) -> Result<ColumnDef> {
    get_schema_factory().array_column(name, item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::OracleAdapter;

    #[test]
    fn test_auto_detect_prefers_url() {
        let factory = SchemaFactory::auto_detect_with(Some("oracle://scott@db/orcl"), |_| true);
        assert_eq!(factory.dialect(), Dialect::Oracle);
        let factory =
            SchemaFactory::auto_detect_with(Some("postgresql://u@db/warehouse"), |_| false);
        assert_eq!(factory.dialect(), Dialect::Postgres);
    }

    #[test]
    fn test_auto_detect_tries_drivers_in_order() {
        let factory = SchemaFactory::auto_detect_with(None, |d| d == Dialect::Oracle);
        assert_eq!(factory.dialect(), Dialect::Oracle);
        let factory = SchemaFactory::auto_detect_with(None, |_| true);
        assert_eq!(factory.dialect(), Dialect::Postgres);
        let factory = SchemaFactory::auto_detect_with(Some("mysql://db"), |_| false);
        assert_eq!(factory.dialect(), Dialect::Postgres);
    }

    #[test]
    fn test_columns_follow_adapter() {
        let pg = SchemaFactory::new(Dialect::Postgres.adapter());
        assert_eq!(pg.json_column("hyperparameters").unwrap().ddl(), "hyperparameters JSONB");
        assert_eq!(
            pg.array_column("feature_list", ScalarType::Text).unwrap().ddl(),
            "feature_list text[]"
        );

        let ora = SchemaFactory::new(Arc::new(OracleAdapter::new()));
        assert_eq!(
            ora.json_column("hyperparameters").unwrap().not_null().ddl(),
            "hyperparameters CLOB NOT NULL CHECK (hyperparameters IS JSON)"
        );
        assert_eq!(
            ora.array_column("feature_list", ScalarType::Varchar).unwrap().ddl(),
            "feature_list TRIAGE_VARCHAR_VARRAY"
        );
        assert!(ora.json_column("bad name").is_err());
    }

    #[test]
    fn test_create_table_ddl() {
        let factory = SchemaFactory::new(Dialect::Postgres.adapter());
        let columns = vec![
            factory.scalar_column("model_id", ScalarType::Integer).unwrap().not_null(),
            factory.json_column("model_config").unwrap(),
        ];
        assert_eq!(
            factory.create_table_ddl("models", &columns).unwrap(),
            "CREATE TABLE models (model_id integer NOT NULL, model_config JSONB)"
        );
    }

    #[test]
    fn test_global_registry_lazy_then_replaced() {
        // the registry is process-wide, so this is the only test touching it
        let first = get_schema_factory();
        assert!(Arc::ptr_eq(&first, &get_schema_factory()));

        set_schema_factory(SchemaFactory::new(Arc::new(OracleAdapter::new())));
        assert_eq!(get_schema_factory().dialect(), Dialect::Oracle);
        assert_eq!(json_column("x").unwrap().sql_type, "CLOB");

        set_schema_factory_from_url("postgresql://u@db/warehouse");
        assert_eq!(get_schema_factory().dialect(), Dialect::Postgres);
        assert_eq!(
            array_column("features", ScalarType::Varchar).unwrap().sql_type,
            "varchar[]"
        );
    }
}
