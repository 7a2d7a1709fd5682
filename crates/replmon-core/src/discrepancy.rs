//! Row-count comparison between a source database and its target.
//!
//! Read-only: both sides are asked for `count(*)` of each table and the
//! difference is reported. Nothing is repaired. Table names are quoted as SQL
//! identifiers before they reach either database.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog::{CatalogError, TableName};
use crate::collector::SnapshotCollector;
use crate::model::Role;

/// Tables to compare, and optionally which pair of databases to compare them on.
///
/// `source` and `target` may be omitted when the configuration has exactly
/// one database of that role.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscrepancyRequest {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    pub tables: Vec<String>,
}

/// Comparison result for one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDiscrepancy {
    pub source: String,
    pub target: String,
    pub table_name: String,
    pub source_count: Option<i64>,
    pub target_count: Option<i64>,
    /// `source_count - target_count`, when both are known.
    pub discrepancy: Option<i64>,
    pub has_discrepancy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error type for requests that cannot be checked at all.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscrepancyError {
    UnknownDatabase(String),
    WrongRole { name: String, expected: Role },
    /// No database of this role was named and there is no single default.
    AmbiguousDefault(Role),
    InvalidTable(String),
}

impl fmt::Display for DiscrepancyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscrepancyError::UnknownDatabase(name) => write!(f, "unknown database {}", name),
            DiscrepancyError::WrongRole { name, expected } => {
                write!(f, "database {} is not a {} database", name, expected)
            }
            DiscrepancyError::AmbiguousDefault(role) => write!(
                f,
                "no {} database given and the configuration does not have exactly one",
                role
            ),
            DiscrepancyError::InvalidTable(table) => write!(f, "invalid table name {:?}", table),
        }
    }
}

impl std::error::Error for DiscrepancyError {}

type BatchCounts = Result<Vec<Result<i64, CatalogError>>, CatalogError>;

/// Counts every requested table on both databases concurrently and compares.
///
/// Per-table failures (missing relation, unreachable side) are reported in
/// that table's `error` and never fail the request as a whole.
pub async fn check(
    collector: &SnapshotCollector,
    request: &DiscrepancyRequest,
) -> Result<Vec<TableDiscrepancy>, DiscrepancyError> {
    let source = resolve(collector, request.source.as_deref(), Role::Source)?;
    let target = resolve(collector, request.target.as_deref(), Role::Target)?;
    let tables = request
        .tables
        .iter()
        .map(|t| TableName::parse(t).ok_or_else(|| DiscrepancyError::InvalidTable(t.clone())))
        .collect::<Result<Vec<_>, _>>()?;

    if tables.is_empty() {
        return Ok(Vec::new());
    }

    let (source_counts, target_counts) = tokio::join!(
        collector.count_rows(&source, tables.clone()),
        collector.count_rows(&target, tables.clone()),
    );

    let results: Vec<TableDiscrepancy> = tables
        .iter()
        .enumerate()
        .map(|(i, table)| {
            let source_count = side(&source_counts, i);
            let target_count = side(&target_counts, i);

            let mut errors = Vec::new();
            if let Err(e) = &source_count {
                errors.push(format!("{}: {}", source, e));
            }
            if let Err(e) = &target_count {
                errors.push(format!("{}: {}", target, e));
            }

            let source_count = source_count.ok();
            let target_count = target_count.ok();
            let discrepancy = source_count.zip(target_count).map(|(s, t)| s - t);

            TableDiscrepancy {
                source: source.clone(),
                target: target.clone(),
                table_name: table.to_string(),
                source_count,
                target_count,
                discrepancy,
                has_discrepancy: discrepancy.is_some_and(|d| d != 0),
                error: (!errors.is_empty()).then(|| errors.join("; ")),
            }
        })
        .collect();

    info!(
        source = %source,
        target = %target,
        tables = results.len(),
        mismatched = results.iter().filter(|r| r.has_discrepancy).count(),
        failed = results.iter().filter(|r| r.error.is_some()).count(),
        "discrepancy check completed"
    );

    Ok(results)
}

fn side(counts: &BatchCounts, index: usize) -> Result<i64, String> {
    match counts {
        Ok(per_table) => match per_table.get(index) {
            Some(Ok(count)) => Ok(*count),
            Some(Err(e)) => Err(e.to_string()),
            None => Err("no result".to_string()),
        },
        Err(e) => Err(e.to_string()),
    }
}

fn resolve(
    collector: &SnapshotCollector,
    name: Option<&str>,
    role: Role,
) -> Result<String, DiscrepancyError> {
    match name {
        Some(name) => {
            let descriptor = collector
                .sources()
                .find(|d| d.name == name)
                .ok_or_else(|| DiscrepancyError::UnknownDatabase(name.to_string()))?;
            if descriptor.role != role {
                return Err(DiscrepancyError::WrongRole {
                    name: name.to_string(),
                    expected: role,
                });
            }
            Ok(descriptor.name.clone())
        }
        None => {
            let mut candidates = collector.sources().filter(|d| d.role == role);
            match (candidates.next(), candidates.next()) {
                (Some(only), None) => Ok(only.name.clone()),
                _ => Err(DiscrepancyError::AmbiguousDefault(role)),
            }
        }
    }
}
