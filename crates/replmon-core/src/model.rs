//! Snapshot data model.
//!
//! Every value here is built fresh on each collection cycle and is never
//! mutated after the [`Snapshot`] that owns it is published. Field names are
//! the JSON wire contract consumed by existing dashboards; LSNs stay opaque
//! strings (`"0/16B3748"`) and are never parsed by this layer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared replication role of a monitored database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Source,
    Target,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Target => f.write_str("target"),
        }
    }
}

/// Global health classification of a snapshot.
///
/// Ordered by severity so that `max` never downgrades a state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Healthy,
    Warning,
    Critical,
}

/// Logical replication slot (`pg_replication_slots`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSlot {
    pub slot_name: String,
    pub plugin: String,
    pub slot_type: String,
    pub database: String,
    pub active: bool,
    pub restart_lsn: String,
    pub confirmed_flush_lsn: String,
    pub wal_status: String,
    /// Bytes that can still be written before the slot is invalidated.
    pub safe_wal_size: Option<i64>,
    pub last_updated: DateTime<Utc>,
}

/// Source-side publication (`pg_publication`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub pub_name: String,
    pub pub_owner: String,
    pub all_tables: bool,
    pub pub_insert: bool,
    pub pub_update: bool,
    pub pub_delete: bool,
    pub pub_truncate: bool,
    pub table_count: usize,
    /// Published tables as `schema.table`, sorted.
    pub tables: Vec<String>,
}

/// Target-side subscription (`pg_subscription`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub sub_name: String,
    pub sub_owner: String,
    pub enabled: bool,
    /// Comma-separated publication names the subscription consumes.
    pub publication: String,
    pub conn_info: String,
    pub slot_name: String,
    pub sync_commit: String,
    pub last_updated: DateTime<Utc>,
}

/// Per-slot lag measurement on a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStat {
    pub slot_name: String,
    pub current_wal_lsn: String,
    pub confirmed_flush_lsn: String,
    pub lsn_distance: u64,
    pub lsn_distance_bytes: u64,
    /// `None` when the server cannot report a replay timestamp.
    pub replication_lag_sec: Option<f64>,
    pub active: bool,
    pub last_updated: DateTime<Utc>,
}

/// Per-subscription apply progress on a target (`pg_stat_subscription`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStat {
    pub sub_name: String,
    pub received_lsn: String,
    pub last_msg_send_time: Option<DateTime<Utc>>,
    pub last_msg_receipt_time: Option<DateTime<Utc>>,
    pub latest_end_lsn: String,
    pub latest_end_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

/// Catalog data collected from a `source` database.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourcePayload {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<Publication>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replication_slots: Vec<ReplicationSlot>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replication_stats: Vec<ReplicationStat>,
}

/// Catalog data collected from a `target` database.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TargetPayload {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<Subscription>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subscription_stats: Vec<SubscriptionStat>,
}

/// Role-conditional payload. The variant always matches the declared role,
/// so a status can never carry both kinds of data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RolePayload {
    Source(SourcePayload),
    Target(TargetPayload),
}

impl RolePayload {
    /// Empty payload of the variant selected by `role`.
    pub fn empty(role: Role) -> Self {
        match role {
            Role::Source => RolePayload::Source(SourcePayload::default()),
            Role::Target => RolePayload::Target(TargetPayload::default()),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            RolePayload::Source(_) => Role::Source,
            RolePayload::Target(_) => Role::Target,
        }
    }
}

/// Health of one configured database at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub role: Role,
    pub connected: bool,
    pub wal_level: String,
    pub logical_replication: String,
    pub current_lsn: String,
    #[serde(flatten)]
    pub payload: RolePayload,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceStatus {
    /// A connected status with no data yet.
    pub fn connected(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            connected: true,
            wal_level: String::new(),
            logical_replication: String::new(),
            current_lsn: String::new(),
            payload: RolePayload::empty(role),
            last_updated: Utc::now(),
            error: None,
        }
    }

    /// A disconnected status carrying `error` and an empty payload.
    pub fn unreachable(name: impl Into<String>, role: Role, error: impl Into<String>) -> Self {
        Self {
            connected: false,
            error: Some(error.into()),
            ..Self::connected(name, role)
        }
    }

    pub fn publications(&self) -> &[Publication] {
        match &self.payload {
            RolePayload::Source(p) => &p.publications,
            RolePayload::Target(_) => &[],
        }
    }

    pub fn replication_slots(&self) -> &[ReplicationSlot] {
        match &self.payload {
            RolePayload::Source(p) => &p.replication_slots,
            RolePayload::Target(_) => &[],
        }
    }

    pub fn replication_stats(&self) -> &[ReplicationStat] {
        match &self.payload {
            RolePayload::Source(p) => &p.replication_stats,
            RolePayload::Target(_) => &[],
        }
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        match &self.payload {
            RolePayload::Target(p) => &p.subscriptions,
            RolePayload::Source(_) => &[],
        }
    }

    pub fn subscription_stats(&self) -> &[SubscriptionStat] {
        match &self.payload {
            RolePayload::Target(p) => &p.subscription_stats,
            RolePayload::Source(_) => &[],
        }
    }
}

/// Derived totals and classification over all statuses of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub total_publications: usize,
    pub total_subscriptions: usize,
    pub total_slots: usize,
    pub active_slots: usize,
    pub max_lag_bytes: u64,
    pub max_lag_seconds: f64,
    pub health_status: HealthState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

/// Point-in-time view of every configured database.
///
/// `databases` is in completion order of the per-source polls, not config
/// order. Consumers that need a stable order must sort by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Wall-clock start of the collection cycle.
    pub timestamp: DateTime<Utc>,
    pub databases: Vec<SourceStatus>,
    pub summary: Summary,
}

impl Snapshot {
    pub fn status(&self, name: &str) -> Option<&SourceStatus> {
        self.databases.iter().find(|s| s.name == name)
    }
}
