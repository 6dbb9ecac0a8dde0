//! Identifier allow-listing and literal rendering.
//!
//! Table and column names cannot be bound as statement parameters, so every
//! name that reaches generated SQL passes through [`validate_identifier`].

use chrono::{NaiveDateTime, Timelike};
use regex::Regex;
use std::sync::LazyLock;

use crate::error::{Result, TriageError};

static IDENT_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("static regex"));

const MAX_PARTS: usize = 3;

/// Accept `name`, `schema.name` or `db.schema.name` built from plain
/// identifier characters; return the input unchanged.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > MAX_PARTS || parts.iter().any(|p| !IDENT_PART.is_match(p)) {
        return Err(TriageError::InvalidIdentifier(name.to_string()));
    }
    Ok(name)
}

pub fn validate_identifiers<S: AsRef<str>>(names: &[S]) -> Result<Vec<&str>> {
    names
        .iter()
        .map(|n| validate_identifier(n.as_ref()))
        .collect()
}

/// Split `schema.table` into its parts; unqualified names have no schema.
pub fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.rsplit_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}

/// Render a string as a single-quoted SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// ISO-8601 rendering of an as-of-date, the form substituted into
/// `{as_of_date}` placeholders of cohort queries.
pub fn iso_format(ts: &NaiveDateTime) -> String {
    if ts.nanosecond() == 0 {
        ts.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }
}

/// Space-separated timestamp literal body, accepted by both backends.
pub fn timestamp_literal(ts: &NaiveDateTime) -> String {
    if ts.nanosecond() == 0 {
        ts.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
    }
}
