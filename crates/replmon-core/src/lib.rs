//! replmon-core: logical replication monitoring for PostgreSQL.
//!
//! Provides:
//! - `model`: per-database status, summary and snapshot types (the wire format)
//! - `catalog`: catalog reader abstraction and its PostgreSQL implementation
//! - `aggregate`: health classification over a set of database statuses
//! - `collector`: concurrent, deadline-bounded polling of all databases
//! - `hub`: subscriber registry and periodic snapshot broadcast
//! - `discrepancy`: source/target row-count comparison
//! - `config`: YAML configuration file

pub mod aggregate;
pub mod catalog;
pub mod collector;
pub mod config;
pub mod discrepancy;
pub mod hub;
pub mod model;

#[cfg(test)]
mod testing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
