//! Catalog readers.
//!
//! A [`CatalogReader`] owns the connection to one monitored database and
//! answers the catalog queries the collector needs. Calls are blocking; the
//! collector runs each reader on the blocking pool under a deadline.
//!
//! - `postgres`: [`PgCatalogReader`] over a `postgres::Client`
//! - `queries`: SQL text for the PostgreSQL reader

mod postgres;
mod queries;

use std::fmt;
use std::time::Duration;

use crate::model::{Publication, ReplicationSlot, ReplicationStat, Subscription, SubscriptionStat};

pub use self::postgres::PgCatalogReader;

/// Error type for catalog reads.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogError {
    /// Connection could not be established or the liveness probe failed.
    Connection(String),
    /// A query failed on an otherwise healthy connection.
    Query(String),
    /// The reader is still held by an earlier poll.
    Busy,
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Connection(msg) => write!(f, "connection failed: {}", msg),
            CatalogError::Query(msg) => write!(f, "query failed: {}", msg),
            CatalogError::Busy => f.write_str("previous poll still in progress"),
        }
    }
}

impl std::error::Error for CatalogError {}

/// WAL settings relevant to logical replication (`pg_settings`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationSettings {
    pub wal_level: String,
    /// `rds.logical_replication`; empty outside RDS.
    pub logical_replication: String,
}

/// A table reference, optionally schema-qualified.
///
/// Both parts are stored unquoted; [`TableName::quoted`] renders them as SQL
/// identifiers, so arbitrary names cannot change the statement they end up in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    /// Parses `table` or `schema.table`. Returns `None` for empty parts,
    /// more than one dot, or embedded NUL bytes.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.contains('\0') {
            return None;
        }
        let (schema, name) = match input.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, input),
        };
        if name.is_empty() || name.contains('.') || schema.is_some_and(str::is_empty) {
            return None;
        }
        Some(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    /// SQL form with each part double-quoted and embedded quotes doubled.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Blocking access to the replication catalog of one database.
pub trait CatalogReader: Send {
    /// Verifies the connection is alive, (re)connecting if needed.
    fn ping(&mut self, timeout: Duration) -> Result<(), CatalogError>;

    fn replication_settings(&mut self) -> Result<ReplicationSettings, CatalogError>;

    /// Current WAL write position.
    fn current_lsn(&mut self) -> Result<String, CatalogError>;

    fn publications(&mut self) -> Result<Vec<Publication>, CatalogError>;

    fn replication_slots(&mut self) -> Result<Vec<ReplicationSlot>, CatalogError>;

    fn replication_stats(&mut self) -> Result<Vec<ReplicationStat>, CatalogError>;

    fn subscriptions(&mut self) -> Result<Vec<Subscription>, CatalogError>;

    fn subscription_stats(&mut self) -> Result<Vec<SubscriptionStat>, CatalogError>;

    /// Exact row count of `table`.
    fn count_rows(&mut self, table: &TableName) -> Result<i64, CatalogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_parses_optional_schema() {
        let plain = TableName::parse("orders").unwrap();
        assert_eq!(plain.schema, None);
        assert_eq!(plain.quoted(), "\"orders\"");

        let qualified = TableName::parse(" sales.Orders ").unwrap();
        assert_eq!(qualified.schema.as_deref(), Some("sales"));
        assert_eq!(qualified.to_string(), "sales.Orders");
        assert_eq!(qualified.quoted(), "\"sales\".\"Orders\"");
    }

    #[test]
    fn table_name_quoting_neutralises_injection() {
        let table = TableName::parse("public.t\"; DROP TABLE users; --").unwrap();
        assert_eq!(
            table.quoted(),
            "\"public\".\"t\"\"; DROP TABLE users; --\""
        );
    }

    #[test]
    fn table_name_rejects_malformed_input() {
        for input in ["", ".orders", "public.", "a.b.c", "bad\0name"] {
            assert!(TableName::parse(input).is_none(), "{input:?}");
        }
    }
}
