pub mod adapter;
pub mod config;
pub mod db;
pub mod entity_date;
pub mod error;
pub mod export;
pub mod feature_dictionary;
pub mod model_group;
pub mod protected_groups;
pub mod reflection;
pub mod schema_factory;
pub mod template;

pub use adapter::{DatabaseAdapter, Dialect, OracleAdapter, PostgresAdapter};
pub use db::{Executor, QueryResult, Statement};
pub use entity_date::{CohortTableGenerator, EntityDateTableGenerator};
pub use error::{Result, TriageError};
pub use model_group::{ModelGroupKey, ModelGrouper};
pub use protected_groups::{ProtectedGroups, ProtectedGroupsGenerator, ProtectedGroupsSource};
pub use schema_factory::{get_schema_factory, set_schema_factory, SchemaFactory};
