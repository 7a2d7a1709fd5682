//! In-memory catalog reader shared by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::catalog::{CatalogError, CatalogReader, ReplicationSettings, TableName};
use crate::model::{Publication, ReplicationSlot, ReplicationStat, Subscription, SubscriptionStat};

/// Reader with scripted answers.
#[derive(Clone, Default)]
pub(crate) struct ScriptedReader {
    pub(crate) unreachable: bool,
    /// Blocks inside `ping` for this long.
    pub(crate) stall: Option<Duration>,
    pub(crate) fail_publications: bool,
    pub(crate) slots: Vec<ReplicationSlot>,
    /// Row counts keyed by `schema.table`; unknown tables fail.
    pub(crate) row_counts: HashMap<String, i64>,
    /// Number of catalog queries answered (ping excluded).
    pub(crate) queries: Arc<AtomicUsize>,
}

impl ScriptedReader {
    pub(crate) fn reachable() -> Self {
        Self::default()
    }

    pub(crate) fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub(crate) fn stalled(stall: Duration) -> Self {
        Self {
            stall: Some(stall),
            ..Self::default()
        }
    }

    pub(crate) fn with_rows(mut self, table: &str, count: i64) -> Self {
        self.row_counts.insert(table.to_string(), count);
        self
    }

    fn count(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }
}

impl CatalogReader for ScriptedReader {
    fn ping(&mut self, _timeout: Duration) -> Result<(), CatalogError> {
        if let Some(stall) = self.stall {
            std::thread::sleep(stall);
        }
        if self.unreachable {
            return Err(CatalogError::Connection("connection refused".to_string()));
        }
        Ok(())
    }

    fn replication_settings(&mut self) -> Result<ReplicationSettings, CatalogError> {
        self.count();
        Ok(ReplicationSettings {
            wal_level: "logical".to_string(),
            logical_replication: String::new(),
        })
    }

    fn current_lsn(&mut self) -> Result<String, CatalogError> {
        self.count();
        Ok("0/3000".to_string())
    }

    fn publications(&mut self) -> Result<Vec<Publication>, CatalogError> {
        self.count();
        if self.fail_publications {
            return Err(CatalogError::Query("permission denied".to_string()));
        }
        Ok(vec![Publication {
            pub_name: "pub_all".to_string(),
            pub_owner: "postgres".to_string(),
            all_tables: true,
            pub_insert: true,
            pub_update: true,
            pub_delete: true,
            pub_truncate: true,
            table_count: 0,
            tables: Vec::new(),
        }])
    }

    fn replication_slots(&mut self) -> Result<Vec<ReplicationSlot>, CatalogError> {
        self.count();
        Ok(self.slots.clone())
    }

    fn replication_stats(&mut self) -> Result<Vec<ReplicationStat>, CatalogError> {
        self.count();
        Ok(Vec::new())
    }

    fn subscriptions(&mut self) -> Result<Vec<Subscription>, CatalogError> {
        self.count();
        Ok(Vec::new())
    }

    fn subscription_stats(&mut self) -> Result<Vec<SubscriptionStat>, CatalogError> {
        self.count();
        Ok(Vec::new())
    }

    fn count_rows(&mut self, table: &TableName) -> Result<i64, CatalogError> {
        self.count();
        self.row_counts
            .get(&table.to_string())
            .copied()
            .ok_or_else(|| CatalogError::Query(format!("relation \"{}\" does not exist", table)))
    }
}

pub(crate) fn slot(name: &str, active: bool) -> ReplicationSlot {
    ReplicationSlot {
        slot_name: name.to_string(),
        plugin: "pgoutput".to_string(),
        slot_type: "logical".to_string(),
        database: "app".to_string(),
        active,
        restart_lsn: "0/1000".to_string(),
        confirmed_flush_lsn: "0/2000".to_string(),
        wal_status: "reserved".to_string(),
        safe_wal_size: None,
        last_updated: Utc::now(),
    }
}
