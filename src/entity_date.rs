//! Entity-date tables: the `(entity_id, as_of_date, active)` relation that
//! records cohort (or subset) membership per as-of-date.

use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::adapter::DatabaseAdapter;
use crate::db::{Executor, Statement};
use crate::error::{Result, TriageError};
use crate::reflection;
use crate::template::{check_single_query, QueryTemplate};

/// Number of as-of-dates quoted in an empty-table error.
const DATE_PREVIEW: usize = 5;

const KEY_COLUMNS: [&str; 2] = ["entity_id", "as_of_date"];

/// Builds an entity-date table either by replaying a dated query or by
/// copying entity-dates out of a labels table.
///
/// With [`restricted_to`](Self::restricted_to) the generator builds a subset
/// table: query rows are kept only for entities already in the cohort
/// table on the same date, and an empty result is allowed.
pub struct EntityDateTableGenerator {
    table_name: String,
    query: Option<QueryTemplate>,
    labels_table_name: Option<String>,
    cohort_table_name: Option<String>,
    replace: bool,
    adapter: Arc<dyn DatabaseAdapter>,
    exec: Arc<dyn Executor>,
}

impl EntityDateTableGenerator {
    pub fn new(
        table_name: impl Into<String>,
        adapter: Arc<dyn DatabaseAdapter>,
        exec: Arc<dyn Executor>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            query: None,
            labels_table_name: None,
            cohort_table_name: None,
            replace: true,
            adapter,
            exec,
        }
    }

    pub fn with_query(mut self, query: impl Into<QueryTemplate>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_labels_table(mut self, labels_table: impl Into<String>) -> Self {
        self.labels_table_name = Some(labels_table.into());
        self
    }

    /// Keep only entities present in `cohort_table` on the same date.
    pub fn restricted_to(mut self, cohort_table: impl Into<String>) -> Self {
        self.cohort_table_name = Some(cohort_table.into());
        self
    }

    /// When false, an existing table is kept and dates already present are
    /// skipped.
    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn is_subset(&self) -> bool {
        self.cohort_table_name.is_some()
    }

    async fn run(&self, stmt: &Statement) -> Result<u64> {
        trace!("{}", stmt.sql);
        Ok(self.exec.execute(stmt).await?)
    }

    /// Populate the table for `as_of_dates` and validate the result.
    pub async fn generate_entity_date_table(&self, as_of_dates: &[NaiveDateTime]) -> Result<()> {
        if self.is_subset() {
            return self.generate_subset_table(as_of_dates).await;
        }

        if let Some(query) = &self.query {
            info!("Generating entity_date table {} using as_of_dates", self.table_name);
            self.maybe_create_table().await?;
            self.generate_from_query(query, as_of_dates, None).await?;
        } else if let Some(labels_table) = &self.labels_table_name {
            info!("Generating entity_date table {} from labels", self.table_name);
            self.maybe_create_table().await?;
            self.generate_from_labels(labels_table).await?;
        } else {
            return Err(TriageError::Configuration(
                "a query or a labels table is required to build an entity_date table".to_string(),
            ));
        }

        self.check_not_empty(as_of_dates).await?;
        self.check_no_duplicates().await?;
        self.log_row_count().await
    }

    async fn generate_subset_table(&self, as_of_dates: &[NaiveDateTime]) -> Result<()> {
        let (Some(query), Some(cohort_table)) = (&self.query, &self.cohort_table_name) else {
            warn!(
                "No subset query is available, so subset table {} will not be created",
                self.table_name
            );
            return Ok(());
        };
        info!(
            "Generating subset table {} restricted to {}",
            self.table_name, cohort_table
        );
        self.maybe_create_table().await?;
        self.generate_from_query(query, as_of_dates, Some(cohort_table))
            .await?;
        self.check_no_duplicates().await?;
        self.log_row_count().await
    }

    async fn maybe_create_table(&self) -> Result<()> {
        let exists =
            reflection::table_exists(self.adapter.as_ref(), self.exec.as_ref(), &self.table_name)
                .await?;
        if !self.replace && exists {
            info!(
                "Not dropping and recreating {} table because replace flag was set to False \
                 and table was found to exist",
                self.table_name
            );
            return Ok(());
        }
        self.run(&self.adapter.drop_table_if_exists(&self.table_name)?.into())
            .await?;
        self.run(&self.adapter.entity_date_table_ddl(&self.table_name)?.into())
            .await?;
        self.run(
            &self
                .adapter
                .create_index(&self.table_name, &KEY_COLUMNS, None)?
                .into(),
        )
        .await?;
        debug!("created entity_date table {}", self.table_name);
        Ok(())
    }

    async fn generate_from_query(
        &self,
        query: &QueryTemplate,
        as_of_dates: &[NaiveDateTime],
        cohort_table: Option<&str>,
    ) -> Result<()> {
        for as_of_date in as_of_dates {
            let check = self.adapter.entity_date_check(&self.table_name, *as_of_date)?;
            trace!("{}", check.sql);
            if self.exec.query_exists(&check).await? {
                info!(
                    "Since >0 entity_date rows found for date {}, skipping",
                    as_of_date
                );
                continue;
            }

            let dated_query = query.render(as_of_date);
            check_single_query(self.adapter.dialect(), &dated_query)?;
            let insert = match cohort_table {
                Some(cohort) => self.adapter.subset_entity_date_insert(
                    &self.table_name,
                    *as_of_date,
                    &dated_query,
                    cohort,
                )?,
                None => self
                    .adapter
                    .entity_date_insert(&self.table_name, *as_of_date, &dated_query)?,
            };
            let inserted = self.run(&insert).await?;
            debug!("{} entity_date rows inserted for {}", inserted, as_of_date);
        }
        Ok(())
    }

    async fn generate_from_labels(&self, labels_table: &str) -> Result<()> {
        if !reflection::table_exists(self.adapter.as_ref(), self.exec.as_ref(), labels_table)
            .await?
        {
            warn!(
                "Labels table {} does not exist, no entity_date rows can be derived",
                labels_table
            );
            return Ok(());
        }

        let overlap: Statement = self
            .adapter
            .existing_label_dates(&self.table_name, labels_table)?
            .into();
        trace!("{}", overlap.sql);
        let existing = self.exec.query(&overlap).await?;
        if !existing.is_empty() {
            let dates: Vec<String> = existing
                .rows
                .iter()
                .filter_map(|row| row.first())
                .map(|cell| cell.display())
                .collect();
            info!(
                "Existing as_of_dates in {} also found in labels, these will not be added \
                 again: {}",
                self.table_name,
                dates.join(", ")
            );
        }

        let insert: Statement = self
            .adapter
            .labels_to_entity_date(&self.table_name, labels_table)?
            .into();
        let inserted = self.run(&insert).await?;
        debug!("{} entity_date rows derived from {}", inserted, labels_table);
        Ok(())
    }

    async fn check_not_empty(&self, as_of_dates: &[NaiveDateTime]) -> Result<()> {
        if reflection::table_has_data(self.adapter.as_ref(), self.exec.as_ref(), &self.table_name)
            .await?
        {
            return Ok(());
        }
        let mut preview: Vec<String> = as_of_dates
            .iter()
            .take(DATE_PREVIEW)
            .map(|d| d.to_string())
            .collect();
        if as_of_dates.len() > DATE_PREVIEW {
            preview.push("…".to_string());
        }
        let source = match &self.query {
            Some(query) => query.as_str().to_string(),
            None => "labels table".to_string(),
        };
        Err(TriageError::EmptyResult(format!(
            "Query does not return any rows for the given as_of_dates:\n    {}\n    '{}'",
            preview.join(", "),
            source
        )))
    }

    async fn check_no_duplicates(&self) -> Result<()> {
        if reflection::table_has_duplicates(
            self.adapter.as_ref(),
            self.exec.as_ref(),
            &self.table_name,
            &KEY_COLUMNS,
        )
        .await?
        {
            return Err(TriageError::DuplicateKey {
                table: self.table_name.clone(),
            });
        }
        Ok(())
    }

    async fn log_row_count(&self) -> Result<()> {
        let count =
            reflection::table_row_count(self.adapter.as_ref(), self.exec.as_ref(), &self.table_name)
                .await?;
        trace!("entity_date table {} has {} rows", self.table_name, count);
        Ok(())
    }

    /// Ask the backend to plan the dated query without running it.
    pub async fn validate_query(&self, as_of_date: &NaiveDateTime) -> Result<()> {
        let Some(query) = &self.query else {
            return Ok(());
        };
        let dated_query = query.render(as_of_date);
        check_single_query(self.adapter.dialect(), &dated_query)?;
        let explain = Statement::new(format!("{} {}", self.adapter.explain_prefix(), dated_query));
        trace!("{}", explain.sql);
        self.exec.execute(&explain).await?;
        Ok(())
    }

    pub async fn clean_up(&self) -> Result<()> {
        info!("Dropping entity_date table {}", self.table_name);
        self.run(&self.adapter.drop_table_if_exists(&self.table_name)?.into())
            .await?;
        Ok(())
    }
}

/// Cohort builder as seen by orchestration code. `NoOp` stands in when no
/// cohort is configured: it touches nothing and has no table.
pub enum CohortTableGenerator {
    Table(EntityDateTableGenerator),
    NoOp,
}

impl CohortTableGenerator {
    pub fn table_name(&self) -> Option<&str> {
        match self {
            CohortTableGenerator::Table(generator) => Some(generator.table_name()),
            CohortTableGenerator::NoOp => None,
        }
    }

    pub async fn generate_entity_date_table(&self, as_of_dates: &[NaiveDateTime]) -> Result<()> {
        match self {
            CohortTableGenerator::Table(generator) => {
                generator.generate_entity_date_table(as_of_dates).await
            }
            CohortTableGenerator::NoOp => {
                warn!("No cohort configuration is available, so no cohort will be created");
                Ok(())
            }
        }
    }

    pub async fn validate_query(&self, as_of_date: &NaiveDateTime) -> Result<()> {
        match self {
            CohortTableGenerator::Table(generator) => generator.validate_query(as_of_date).await,
            CohortTableGenerator::NoOp => Ok(()),
        }
    }

    pub async fn clean_up(&self) -> Result<()> {
        match self {
            CohortTableGenerator::Table(generator) => generator.clean_up().await,
            CohortTableGenerator::NoOp => {
                info!("No cohort table exists, so nothing to tear down");
                Ok(())
            }
        }
    }
}

impl From<EntityDateTableGenerator> for CohortTableGenerator {
    fn from(generator: EntityDateTableGenerator) -> Self {
        CohortTableGenerator::Table(generator)
    }
}
