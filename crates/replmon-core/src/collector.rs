//! Snapshot collector.
//!
//! Polls every configured database in parallel and folds the results into a
//! [`Snapshot`]. One task per source runs the blocking [`CatalogReader`] on
//! the blocking pool under a deadline; results come back over a bounded
//! channel sized to the source count and are drained until every task has
//! reported.
//!
//! Each reader sits behind an async mutex. A poll that finds the reader in
//! use waits for it, and the wait counts against the same deadline; only a
//! poll that cannot obtain the reader in time reports the source as busy.
//!
//! Failures never escape a single source: an unreachable, stalled or
//! panicking poll becomes a disconnected [`SourceStatus`] and the rest of the
//! snapshot is unaffected. Statuses arrive in completion order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinError;
use tracing::{debug, error, warn};

use crate::aggregate::{Thresholds, summarize};
use crate::catalog::{CatalogError, CatalogReader, PgCatalogReader, TableName};
use crate::config::MonitorConfig;
use crate::model::{Role, RolePayload, Snapshot, SourcePayload, SourceStatus, TargetPayload};

/// Identity of one monitored database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: String,
    pub role: Role,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }
}

type SharedReader = Arc<Mutex<Box<dyn CatalogReader>>>;

struct Source {
    descriptor: SourceDescriptor,
    reader: SharedReader,
}

/// Parallel poller over a fixed set of databases.
pub struct SnapshotCollector {
    sources: Vec<Source>,
    thresholds: Thresholds,
    poll_timeout: Duration,
}

impl SnapshotCollector {
    /// Creates a collector with no sources.
    pub fn new(thresholds: Thresholds, poll_timeout: Duration) -> Self {
        Self {
            sources: Vec::new(),
            thresholds,
            poll_timeout,
        }
    }

    /// Adds a source polled through `reader`.
    pub fn with_source(
        mut self,
        descriptor: SourceDescriptor,
        reader: impl CatalogReader + 'static,
    ) -> Self {
        let reader: Box<dyn CatalogReader> = Box::new(reader);
        self.sources.push(Source {
            descriptor,
            reader: Arc::new(Mutex::new(reader)),
        });
        self
    }

    /// Builds a collector with one [`PgCatalogReader`] per configured database.
    ///
    /// No connection is opened here; each reader connects on its first poll.
    pub fn from_config(config: &MonitorConfig) -> Result<Self, CatalogError> {
        let poll_timeout = config.monitoring.poll_timeout();
        let mut collector = Self::new(config.monitoring.thresholds(), poll_timeout);
        for db in &config.databases {
            let reader = PgCatalogReader::new(
                db.name.clone(),
                db.connection_string(poll_timeout),
                db.accept_invalid_certs,
            )?;
            collector = collector.with_source(SourceDescriptor::new(db.name.clone(), db.role), reader);
        }
        Ok(collector)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.iter().map(|s| &s.descriptor)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Counts the rows of every table in `tables` on the named source.
    ///
    /// Runs under the same reader lock and deadline as a regular poll. The
    /// outer error covers the whole batch (unknown source, busy, unreachable,
    /// timed out); the inner results are per table.
    pub async fn count_rows(
        &self,
        name: &str,
        tables: Vec<TableName>,
    ) -> Result<Vec<Result<i64, CatalogError>>, CatalogError> {
        let source = self
            .sources
            .iter()
            .find(|s| s.descriptor.name == name)
            .ok_or_else(|| CatalogError::Connection(format!("unknown database {}", name)))?;
        let deadline = self.poll_timeout;

        let counted = run_exclusive(&source.reader, deadline, move |reader| {
            reader.ping(deadline)?;
            Ok::<_, CatalogError>(tables.iter().map(|t| reader.count_rows(t)).collect::<Vec<_>>())
        })
        .await;

        match counted {
            Ok(result) => result,
            Err(e) => {
                warn!(source = %name, error = %e, "row count aborted");
                Err(e.into_catalog_error(deadline))
            }
        }
    }

    /// Polls every source and summarizes the result. Never fails as a whole.
    pub async fn collect(&self) -> Snapshot {
        let timestamp = Utc::now();
        let t0 = Instant::now();

        let databases = self.collect_statuses().await;
        let summary = summarize(&databases, &self.thresholds);

        debug!(
            sources = databases.len(),
            duration_ms = t0.elapsed().as_millis() as u64,
            health = ?summary.health_status,
            issues = summary.issues.len(),
            "snapshot collected"
        );

        Snapshot {
            timestamp,
            databases,
            summary,
        }
    }

    /// Polls every source in parallel and returns exactly one status per
    /// source, in completion order.
    pub async fn collect_statuses(&self) -> Vec<SourceStatus> {
        let (tx, mut rx) = mpsc::channel(self.sources.len().max(1));

        for source in &self.sources {
            let tx = tx.clone();
            let descriptor = source.descriptor.clone();
            let reader = Arc::clone(&source.reader);
            let deadline = self.poll_timeout;
            tokio::spawn(async move {
                let status = poll_with_deadline(descriptor, reader, deadline).await;
                let _ = tx.send(status).await;
            });
        }
        drop(tx);

        let mut statuses = Vec::with_capacity(self.sources.len());
        while let Some(status) = rx.recv().await {
            statuses.push(status);
        }

        // A task that died before reporting still gets a status.
        if statuses.len() < self.sources.len() {
            let reported: HashSet<String> = statuses.iter().map(|s| s.name.clone()).collect();
            for source in &self.sources {
                let d = &source.descriptor;
                if !reported.contains(&d.name) {
                    error!(source = %d.name, "poll task ended without reporting");
                    statuses.push(SourceStatus::unreachable(
                        d.name.clone(),
                        d.role,
                        "poll task aborted",
                    ));
                }
            }
        }

        statuses
    }
}

/// Why a reader could not be run to completion.
#[derive(Debug)]
enum RunError {
    /// The reader stayed locked by an earlier poll for the whole deadline.
    Busy,
    /// The blocking task panicked or was cancelled.
    Failed(JoinError),
    TimedOut,
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Busy => f.write_str("reader busy"),
            RunError::Failed(e) => write!(f, "task failed: {}", e),
            RunError::TimedOut => f.write_str("timed out"),
        }
    }
}

impl RunError {
    fn into_catalog_error(self, deadline: Duration) -> CatalogError {
        match self {
            RunError::Busy => CatalogError::Busy,
            RunError::Failed(e) => CatalogError::Connection(format!("poll task failed: {}", e)),
            RunError::TimedOut => {
                CatalogError::Connection(format!("poll timed out after {:?}", deadline))
            }
        }
    }
}

/// Locks `reader` and runs `f` on the blocking pool, all within `deadline`.
///
/// The lock guard moves into the blocking task, so a call that outlives its
/// deadline keeps the reader until the driver returns.
async fn run_exclusive<T, F>(reader: &SharedReader, deadline: Duration, f: F) -> Result<T, RunError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn CatalogReader) -> T + Send + 'static,
{
    let t0 = Instant::now();
    let mut guard = tokio::time::timeout(deadline, Arc::clone(reader).lock_owned())
        .await
        .map_err(|_| RunError::Busy)?;

    let remaining = deadline.saturating_sub(t0.elapsed());
    let task = tokio::task::spawn_blocking(move || f(&mut **guard));

    match tokio::time::timeout(remaining, task).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RunError::Failed(e)),
        Err(_) => Err(RunError::TimedOut),
    }
}

async fn poll_with_deadline(
    descriptor: SourceDescriptor,
    reader: SharedReader,
    deadline: Duration,
) -> SourceStatus {
    let name = descriptor.name.clone();
    let role = descriptor.role;

    let polled = run_exclusive(&reader, deadline, move |reader| {
        poll_source(&descriptor, reader, deadline)
    })
    .await;

    match polled {
        Ok(status) => status,
        Err(RunError::Failed(e)) => {
            error!(source = %name, error = %e, "poll task failed");
            SourceStatus::unreachable(name, role, format!("poll task failed: {}", e))
        }
        Err(e) => {
            warn!(
                source = %name,
                timeout_ms = deadline.as_millis() as u64,
                error = %e,
                "poll did not finish in time"
            );
            SourceStatus::unreachable(name, role, e.into_catalog_error(deadline).to_string())
        }
    }
}

/// Runs one blocking poll. Liveness is checked first; if it fails nothing
/// else is queried. Individual query failures leave their field empty.
fn poll_source(
    descriptor: &SourceDescriptor,
    reader: &mut dyn CatalogReader,
    ping_timeout: Duration,
) -> SourceStatus {
    let name = descriptor.name.as_str();

    if let Err(e) = reader.ping(ping_timeout) {
        warn!(source = %name, error = %e, "source unreachable");
        return SourceStatus::unreachable(name, descriptor.role, e.to_string());
    }

    let mut status = SourceStatus::connected(name, descriptor.role);

    if let Some(settings) = best_effort(name, "replication_settings", reader.replication_settings()) {
        status.wal_level = settings.wal_level;
        status.logical_replication = settings.logical_replication;
    }
    if let Some(lsn) = best_effort(name, "current_lsn", reader.current_lsn()) {
        status.current_lsn = lsn;
    }

    status.payload = match descriptor.role {
        Role::Source => RolePayload::Source(SourcePayload {
            publications: best_effort(name, "publications", reader.publications())
                .unwrap_or_default(),
            replication_slots: best_effort(name, "replication_slots", reader.replication_slots())
                .unwrap_or_default(),
            replication_stats: best_effort(name, "replication_stats", reader.replication_stats())
                .unwrap_or_default(),
        }),
        Role::Target => RolePayload::Target(TargetPayload {
            subscriptions: best_effort(name, "subscriptions", reader.subscriptions())
                .unwrap_or_default(),
            subscription_stats: best_effort(
                name,
                "subscription_stats",
                reader.subscription_stats(),
            )
            .unwrap_or_default(),
        }),
    };

    status
}

fn best_effort<T>(source: &str, query: &'static str, result: Result<T, CatalogError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(source, query, error = %e, "catalog query failed");
            None
        }
    }
}
