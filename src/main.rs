use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use triage_db::config::{parse_as_of_date, TriageConfig};
use triage_db::db::{create_pool, Executor, Statement};
use triage_db::feature_dictionary::FeatureDictionaryCreator;
use triage_db::schema_factory::{get_schema_factory, set_schema_factory, SchemaFactory};
use triage_db::Dialect;

/// Build cohort, subset and protected-group tables for a Triage experiment
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create result schemas and install the model group routine
    Setup,
    /// Build the cohort table for the given as-of-dates
    Cohort {
        #[arg(long = "as-of-date", required = true)]
        as_of_dates: Vec<String>,
        /// Only check that the cohort query plans for the first date
        #[arg(long)]
        validate_only: bool,
    },
    /// Build the subset table, restricted to an existing cohort table
    Subset {
        #[arg(long)]
        cohort_table: String,
        #[arg(long = "as-of-date", required = true)]
        as_of_dates: Vec<String>,
    },
    /// Resolve protected-group attributes for a cohort
    ProtectedGroups {
        #[arg(long)]
        cohort_table: String,
        #[arg(long)]
        cohort_hash: String,
        #[arg(long = "as-of-date", required = true)]
        as_of_dates: Vec<String>,
    },
    /// Drop the cohort table
    CleanUp,
    /// Print feature names per imputed feature table as JSON
    FeatureDictionary {
        #[arg(long = "table", required = true)]
        tables: Vec<String>,
        /// Index columns excluded from every table
        #[arg(long = "index-column", default_values_t = [String::from("entity_id"), String::from("as_of_date")])]
        index_columns: Vec<String>,
    },
}

fn parse_dates(values: &[String]) -> Result<Vec<chrono::NaiveDateTime>> {
    values.iter().map(|v| parse_as_of_date(v)).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = TriageConfig::load(cli.config.as_deref())?;

    let dialect = config.database.dialect().unwrap_or(Dialect::Postgres);
    if dialect == Dialect::Oracle {
        bail!(
            "no Oracle driver is built into this binary; use the library with an Oracle executor"
        );
    }
    set_schema_factory(SchemaFactory::new(dialect.adapter()));
    let adapter = get_schema_factory().adapter();

    let pool = create_pool(&config.database)?;
    let exec: Arc<dyn Executor> = Arc::new(pool);

    match cli.command {
        Command::Setup => {
            for sql in adapter
                .create_schemas()
                .into_iter()
                .chain(adapter.setup_statements())
            {
                exec.execute(&Statement::new(sql))
                    .await
                    .context("Setup statement failed")?;
            }
            tracing::info!("schemas and support objects installed");
        }
        Command::Cohort {
            as_of_dates,
            validate_only,
        } => {
            let dates = parse_dates(&as_of_dates)?;
            let cohort = config.cohort_generator(adapter, exec);
            if validate_only {
                if let Some(first) = dates.first() {
                    cohort.validate_query(first).await?;
                }
            } else {
                cohort.generate_entity_date_table(&dates).await?;
            }
        }
        Command::Subset {
            cohort_table,
            as_of_dates,
        } => {
            let dates = parse_dates(&as_of_dates)?;
            let Some(subset) = config.subset_generator(&cohort_table, adapter, exec) else {
                bail!("no [subset] section in the config");
            };
            subset.generate_entity_date_table(&dates).await?;
        }
        Command::ProtectedGroups {
            cohort_table,
            cohort_hash,
            as_of_dates,
        } => {
            let dates = parse_dates(&as_of_dates)?;
            config
                .protected_groups(adapter, exec)
                .generate_all_dates(&dates, &cohort_table, &cohort_hash)
                .await?;
        }
        Command::CleanUp => {
            config.cohort_generator(adapter, exec).clean_up().await?;
        }
        Command::FeatureDictionary {
            tables,
            index_columns,
        } => {
            let index: HashMap<String, Vec<String>> = tables
                .iter()
                .map(|t| (t.clone(), index_columns.clone()))
                .collect();
            let dictionary = FeatureDictionaryCreator::new(&config.features.schema_name, adapter, exec)
                .feature_dictionary(&tables, &index)
                .await?;
            println!("{}", serde_json::to_string_pretty(&dictionary)?);
        }
    }

    Ok(())
}
