//! Protected-group attributes per cohort snapshot, used by bias audits.

use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::adapter::{DatabaseAdapter, ProtectedGroupsInsert};
use crate::db::{CellValue, Executor, QueryResult, Statement};
use crate::error::Result;
use crate::reflection;

/// Where the attributes come from and which of them to keep.
#[derive(Debug, Clone)]
pub struct ProtectedGroupsSource {
    /// Table name or parenthesized subquery with an alias.
    pub from_obj: String,
    pub attribute_columns: Vec<String>,
    pub entity_id_column: String,
    pub knowledge_date_column: String,
}

pub struct ProtectedGroupsGenerator {
    source: ProtectedGroupsSource,
    table_name: String,
    replace: bool,
    adapter: Arc<dyn DatabaseAdapter>,
    exec: Arc<dyn Executor>,
}

impl ProtectedGroupsGenerator {
    pub fn new(
        source: ProtectedGroupsSource,
        table_name: impl Into<String>,
        adapter: Arc<dyn DatabaseAdapter>,
        exec: Arc<dyn Executor>,
    ) -> Self {
        Self {
            source,
            table_name: table_name.into(),
            replace: true,
            adapter,
            exec,
        }
    }

    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn run(&self, stmt: &Statement) -> Result<u64> {
        trace!("{}", stmt.sql);
        Ok(self.exec.execute(stmt).await?)
    }

    /// Resolve attributes for every cohort entity on each as-of-date.
    ///
    /// With `replace`, rows of `cohort_hash` are deleted first and every date
    /// is regenerated; otherwise dates that already have rows are skipped.
    pub async fn generate_all_dates(
        &self,
        as_of_dates: &[NaiveDateTime],
        cohort_table_name: &str,
        cohort_hash: &str,
    ) -> Result<()> {
        trace!("Creating protected groups table");
        let table_is_new =
            !reflection::table_exists(self.adapter.as_ref(), self.exec.as_ref(), &self.table_name)
                .await?;
        if table_is_new {
            let ddl = self
                .adapter
                .protected_groups_table_ddl(&self.table_name, &self.source.attribute_columns)?;
            self.run(&ddl.into()).await?;
            debug!("Protected groups table {} created", self.table_name);
        } else {
            debug!("Protected groups table {} exists", self.table_name);
        }

        if self.replace {
            let delete = self
                .adapter
                .protected_groups_delete(&self.table_name, cohort_hash)?;
            self.run(&delete).await?;
            debug!(
                "Removed from {} all rows from cohort {}",
                self.table_name, cohort_hash
            );
        }

        trace!("Creating protected_groups for {} as of dates", as_of_dates.len());
        for as_of_date in as_of_dates {
            if !self.replace {
                let check =
                    self.adapter
                        .protected_groups_check(&self.table_name, *as_of_date, cohort_hash)?;
                trace!("{}", check.sql);
                if self.exec.query_exists(&check).await? {
                    debug!(
                        "Since nonzero existing protected_groups found for {}, skipping",
                        as_of_date
                    );
                    continue;
                }
            }
            self.generate(*as_of_date, cohort_table_name, cohort_hash)
                .await?;
        }

        if table_is_new {
            let index =
                self.adapter
                    .create_index(&self.table_name, &["cohort_hash", "as_of_date"], None)?;
            self.run(&index.into()).await?;
        }

        let nrows =
            reflection::table_row_count(self.adapter.as_ref(), self.exec.as_ref(), &self.table_name)
                .await?;
        if nrows == 0 {
            warn!("Done creating protected_groups, but no rows in protected_groups table!");
        } else {
            info!(
                "Protected groups stored in the table {} successfully",
                self.table_name
            );
            trace!("Protected groups table has {} rows", nrows);
        }
        Ok(())
    }

    /// Insert the attribute rows of one as-of-date.
    pub async fn generate(
        &self,
        as_of_date: NaiveDateTime,
        cohort_table_name: &str,
        cohort_hash: &str,
    ) -> Result<()> {
        let insert = self.adapter.protected_groups_insert(&ProtectedGroupsInsert {
            table_name: &self.table_name,
            as_of_date,
            attribute_columns: &self.source.attribute_columns,
            cohort_hash,
            cohort_table_name,
            from_obj: &self.source.from_obj,
            entity_id_column: &self.source.entity_id_column,
            knowledge_date_column: &self.source.knowledge_date_column,
        })?;
        debug!("Running protected_groups creation query for {}", as_of_date);
        self.run(&insert).await?;
        Ok(())
    }

    /// Stored attributes for the given dates, with attribute values as text
    /// and without the `cohort_hash` column.
    pub async fn as_frame(
        &self,
        as_of_dates: &[NaiveDateTime],
        cohort_hash: &str,
    ) -> Result<QueryResult> {
        let select = self.adapter.protected_groups_select(
            &self.table_name,
            &self.source.attribute_columns,
            as_of_dates,
            cohort_hash,
        )?;
        let mut frame = self
            .adapter
            .query_to_frame(self.exec.as_ref(), &select)
            .await?;

        let attribute_indexes: Vec<usize> = self
            .source
            .attribute_columns
            .iter()
            .filter_map(|col| frame.column_index(col))
            .collect();
        for row in &mut frame.rows {
            for &idx in &attribute_indexes {
                if let Some(cell) = row.get_mut(idx) {
                    if !cell.is_null() {
                        *cell = CellValue::Text(cell.display());
                    }
                }
            }
        }
        for &idx in &attribute_indexes {
            if let Some(column) = frame.columns.get_mut(idx) {
                column.type_name = "text".to_string();
            }
        }
        frame.drop_column("cohort_hash");
        Ok(frame)
    }
}

/// Protected-groups builder as seen by orchestration code. `NoOp` stands in
/// when no bias audit is configured.
pub enum ProtectedGroups {
    Generator(ProtectedGroupsGenerator),
    NoOp,
}

impl ProtectedGroups {
    pub async fn generate_all_dates(
        &self,
        as_of_dates: &[NaiveDateTime],
        cohort_table_name: &str,
        cohort_hash: &str,
    ) -> Result<()> {
        match self {
            ProtectedGroups::Generator(generator) => {
                generator
                    .generate_all_dates(as_of_dates, cohort_table_name, cohort_hash)
                    .await
            }
            ProtectedGroups::NoOp => {
                info!("No bias audit configuration is available, so protected groups will not be created");
                Ok(())
            }
        }
    }

    pub async fn as_frame(
        &self,
        as_of_dates: &[NaiveDateTime],
        cohort_hash: &str,
    ) -> Result<QueryResult> {
        match self {
            ProtectedGroups::Generator(generator) => {
                generator.as_frame(as_of_dates, cohort_hash).await
            }
            ProtectedGroups::NoOp => {
                info!(
                    "No bias audit configuration is available, so protected groups were not \
                     created: returning an empty frame"
                );
                Ok(QueryResult::empty())
            }
        }
    }
}

impl From<ProtectedGroupsGenerator> for ProtectedGroups {
    fn from(generator: ProtectedGroupsGenerator) -> Self {
        ProtectedGroups::Generator(generator)
    }
}
