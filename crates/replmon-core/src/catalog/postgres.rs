//! PostgreSQL catalog reader.
//!
//! Holds one `postgres::Client` per monitored database. The connection is
//! opened lazily and dropped whenever the liveness probe fails, so the next
//! poll reconnects from scratch.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use postgres::{Client, Row};
use postgres_native_tls::MakeTlsConnector;
use tracing::{debug, info, warn};

use super::queries;
use super::{CatalogError, CatalogReader, ReplicationSettings, TableName};
use crate::model::{Publication, ReplicationSlot, ReplicationStat, Subscription, SubscriptionStat};

/// [`CatalogReader`] backed by a blocking PostgreSQL connection.
pub struct PgCatalogReader {
    name: String,
    connection_string: String,
    tls: MakeTlsConnector,
    client: Option<Client>,
}

impl PgCatalogReader {
    /// Creates a reader for `connection_string` (libpq key=value format).
    ///
    /// No connection is attempted until the first [`CatalogReader::ping`].
    pub fn new(
        name: impl Into<String>,
        connection_string: String,
        accept_invalid_certs: bool,
    ) -> Result<Self, CatalogError> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| CatalogError::Connection(format!("TLS setup: {}", e)))?;
        Ok(Self {
            name: name.into(),
            connection_string,
            tls: MakeTlsConnector::new(connector),
            client: None,
        })
    }

    fn ensure_connected(&mut self) -> Result<&mut Client, CatalogError> {
        if self.client.is_none() {
            match Client::connect(&self.connection_string, self.tls.clone()) {
                Ok(client) => {
                    info!(source = %self.name, "connected");
                    self.client = Some(client);
                }
                Err(e) => return Err(CatalogError::Connection(format_postgres_error(&e))),
            }
        }
        self.client
            .as_mut()
            .ok_or_else(|| CatalogError::Connection("not connected".to_string()))
    }

    fn client(&mut self) -> Result<&mut Client, CatalogError> {
        self.client
            .as_mut()
            .ok_or_else(|| CatalogError::Connection("not connected".to_string()))
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Row>, CatalogError> {
        self.client()?
            .query(sql, &[])
            .map_err(|e| CatalogError::Query(format_postgres_error(&e)))
    }

    fn replay_lag_seconds(&mut self) -> Option<f64> {
        let client = self.client.as_mut()?;
        client
            .query_one(queries::REPLAY_LAG_SECONDS, &[])
            .ok()
            .and_then(|row| row.try_get::<_, Option<f64>>(0).ok())
            .flatten()
    }

    /// Decodes every row with `decode`, dropping (and logging) rows that fail.
    fn decode_rows<T>(
        &self,
        what: &str,
        rows: &[Row],
        decode: impl Fn(&Row) -> Result<T, postgres::Error>,
    ) -> Vec<T> {
        rows.iter()
            .filter_map(|row| match decode(row) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(source = %self.name, what, error = %e, "skipping undecodable row");
                    None
                }
            })
            .collect()
    }
}

impl CatalogReader for PgCatalogReader {
    fn ping(&mut self, timeout: Duration) -> Result<(), CatalogError> {
        let client = self.ensure_connected()?;
        if let Err(e) = client.is_valid(timeout) {
            self.client = None;
            return Err(CatalogError::Connection(format_postgres_error(&e)));
        }
        Ok(())
    }

    fn replication_settings(&mut self) -> Result<ReplicationSettings, CatalogError> {
        let rows = self.query(queries::REPLICATION_SETTINGS)?;
        let mut settings = ReplicationSettings::default();
        for row in &rows {
            let (Ok(name), Ok(setting)) = (row.try_get::<_, String>(0), row.try_get::<_, String>(1))
            else {
                continue;
            };
            match name.as_str() {
                "wal_level" => settings.wal_level = setting,
                "rds.logical_replication" => settings.logical_replication = setting,
                _ => {}
            }
        }
        Ok(settings)
    }

    fn current_lsn(&mut self) -> Result<String, CatalogError> {
        self.client()?
            .query_one(queries::CURRENT_LSN, &[])
            .and_then(|row| row.try_get::<_, String>(0))
            .map_err(|e| CatalogError::Query(format_postgres_error(&e)))
    }

    fn publications(&mut self) -> Result<Vec<Publication>, CatalogError> {
        let rows = self.query(queries::PUBLICATIONS)?;

        // One pass over pg_publication_tables instead of one query per publication.
        let listing: Vec<(String, String)> = match self.query(queries::PUBLICATION_TABLES) {
            Ok(table_rows) => table_rows
                .iter()
                .filter_map(|row| Some((row.try_get(0).ok()?, row.try_get(1).ok()?)))
                .collect(),
            Err(e) => {
                warn!(source = %self.name, error = %e, "publication tables unavailable");
                Vec::new()
            }
        };

        let mut publications = self.decode_rows("publication", &rows, |row| {
            Ok(Publication {
                pub_name: row.try_get(0)?,
                pub_owner: row.try_get(1)?,
                all_tables: row.try_get(2)?,
                pub_insert: row.try_get(3)?,
                pub_update: row.try_get(4)?,
                pub_delete: row.try_get(5)?,
                pub_truncate: row.try_get(6)?,
                table_count: 0,
                tables: Vec::new(),
            })
        });
        attach_tables(&mut publications, listing);
        Ok(publications)
    }

    fn replication_slots(&mut self) -> Result<Vec<ReplicationSlot>, CatalogError> {
        let rows = self.query(queries::REPLICATION_SLOTS)?;
        let now = Utc::now();
        Ok(self.decode_rows("replication slot", &rows, |row| {
            Ok(ReplicationSlot {
                slot_name: row.try_get(0)?,
                plugin: row.try_get(1)?,
                slot_type: row.try_get(2)?,
                database: row.try_get(3)?,
                active: row.try_get(4)?,
                restart_lsn: row.try_get(5)?,
                confirmed_flush_lsn: row.try_get(6)?,
                wal_status: row.try_get(7)?,
                safe_wal_size: row.try_get(8)?,
                last_updated: now,
            })
        }))
    }

    fn replication_stats(&mut self) -> Result<Vec<ReplicationStat>, CatalogError> {
        let rows = self.query(queries::REPLICATION_STATS)?;
        let lag = self.replay_lag_seconds();
        let now = Utc::now();
        Ok(self.decode_rows("replication stat", &rows, |row| {
            let distance: i64 = row.try_get(3)?;
            let distance = u64::try_from(distance).unwrap_or(0);
            Ok(ReplicationStat {
                slot_name: row.try_get(0)?,
                current_wal_lsn: row.try_get(1)?,
                confirmed_flush_lsn: row.try_get(2)?,
                lsn_distance: distance,
                lsn_distance_bytes: distance,
                replication_lag_sec: lag,
                active: row.try_get(4)?,
                last_updated: now,
            })
        }))
    }

    fn subscriptions(&mut self) -> Result<Vec<Subscription>, CatalogError> {
        let rows = self.query(queries::SUBSCRIPTIONS)?;
        let now = Utc::now();
        Ok(self.decode_rows("subscription", &rows, |row| {
            Ok(Subscription {
                sub_name: row.try_get(0)?,
                sub_owner: row.try_get(1)?,
                enabled: row.try_get(2)?,
                publication: row.try_get(3)?,
                conn_info: row.try_get(4)?,
                slot_name: row.try_get(5)?,
                sync_commit: row.try_get(6)?,
                last_updated: now,
            })
        }))
    }

    fn subscription_stats(&mut self) -> Result<Vec<SubscriptionStat>, CatalogError> {
        let rows = self.query(queries::SUBSCRIPTION_STATS)?;
        let now = Utc::now();
        Ok(self.decode_rows("subscription stat", &rows, |row| {
            Ok(SubscriptionStat {
                sub_name: row.try_get(0)?,
                received_lsn: row.try_get(1)?,
                last_msg_send_time: row.try_get(2)?,
                last_msg_receipt_time: row.try_get(3)?,
                latest_end_lsn: row.try_get(4)?,
                latest_end_time: row.try_get(5)?,
                last_updated: now,
            })
        }))
    }

    fn count_rows(&mut self, table: &TableName) -> Result<i64, CatalogError> {
        let sql = format!("SELECT count(*)::bigint FROM {}", table.quoted());
        self.client()?
            .query_one(sql.as_str(), &[])
            .and_then(|row| row.try_get::<_, i64>(0))
            .map_err(|e| CatalogError::Query(format_postgres_error(&e)))
    }
}

/// Distributes `(pubname, table)` pairs onto their publications. Publications
/// absent from the listing keep an empty table list.
fn attach_tables(publications: &mut [Publication], listing: Vec<(String, String)>) {
    let mut tables: HashMap<String, Vec<String>> = HashMap::new();
    for (pubname, table) in listing {
        tables.entry(pubname).or_default().push(table);
    }
    for publication in publications {
        publication.tables = tables.remove(&publication.pub_name).unwrap_or_default();
        publication.table_count = publication.tables.len();
    }
}

/// Condenses a PostgreSQL error into a single status line.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publication(name: &str) -> Publication {
        Publication {
            pub_name: name.to_string(),
            pub_owner: "postgres".to_string(),
            all_tables: false,
            pub_insert: true,
            pub_update: true,
            pub_delete: true,
            pub_truncate: false,
            table_count: 0,
            tables: Vec::new(),
        }
    }

    #[test]
    fn tables_are_grouped_by_publication() {
        let mut pubs = vec![publication("orders_pub"), publication("audit_pub")];
        let listing = vec![
            ("orders_pub".to_string(), "public.orders".to_string()),
            ("orders_pub".to_string(), "public.order_items".to_string()),
            ("other_pub".to_string(), "public.ignored".to_string()),
        ];

        attach_tables(&mut pubs, listing);

        assert_eq!(pubs[0].table_count, 2);
        assert_eq!(pubs[0].tables, ["public.orders", "public.order_items"]);
        assert_eq!(pubs[1].table_count, 0);
        assert!(pubs[1].tables.is_empty());
    }

    #[test]
    fn missing_table_listing_keeps_every_publication() {
        let mut pubs = vec![publication("orders_pub"), publication("audit_pub")];

        attach_tables(&mut pubs, Vec::new());

        assert_eq!(pubs.len(), 2);
        assert!(pubs.iter().all(|p| p.table_count == 0 && p.tables.is_empty()));
    }
}
