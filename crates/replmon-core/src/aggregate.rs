//! Health aggregation: turns per-source statuses into a [`Summary`].
//!
//! Classification, highest wins and never downgraded:
//! - `critical`: some database is not connected;
//! - `warning`: some replication slot is inactive, or some slot's LSN
//!   distance exceeds the byte threshold (or its lag exceeds the optional
//!   seconds threshold);
//! - `healthy`: otherwise.
//!
//! Every triggering condition appends one issue line. Issues follow the order
//! of the input statuses, which for a collected snapshot is poll completion
//! order.

use serde::{Deserialize, Serialize};

use crate::model::{HealthState, SourceStatus, Summary};

/// Default LSN distance above which a slot is reported as lagging (100 MiB).
pub const DEFAULT_LAG_BYTES_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Limits consulted by [`summarize`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub lag_bytes: u64,
    /// Unset means lag in seconds is reported but never classified.
    pub lag_seconds: Option<f64>,
    /// Reserved. Inactivity is flagged immediately regardless of this value.
    pub inactive_slot: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            lag_bytes: DEFAULT_LAG_BYTES_THRESHOLD,
            lag_seconds: None,
            inactive_slot: 0,
        }
    }
}

/// Builds the summary for `statuses`. Pure: the same input always yields the
/// same summary.
pub fn summarize(statuses: &[SourceStatus], thresholds: &Thresholds) -> Summary {
    let mut summary = Summary::default();

    for status in statuses {
        if !status.connected {
            let issue = match &status.error {
                Some(err) => format!("Database {} is not connected: {}", status.name, err),
                None => format!("Database {} is not connected", status.name),
            };
            raise(&mut summary, HealthState::Critical, issue);
        }

        summary.total_publications += status.publications().len();
        summary.total_subscriptions += status.subscriptions().len();

        for slot in status.replication_slots() {
            summary.total_slots += 1;
            if slot.active {
                summary.active_slots += 1;
            } else {
                raise(
                    &mut summary,
                    HealthState::Warning,
                    format!(
                        "Replication slot {} on {} is inactive",
                        slot.slot_name, status.name
                    ),
                );
            }
        }

        for stat in status.replication_stats() {
            summary.max_lag_bytes = summary.max_lag_bytes.max(stat.lsn_distance_bytes);
            if let Some(lag) = stat.replication_lag_sec {
                summary.max_lag_seconds = summary.max_lag_seconds.max(lag);
            }

            if stat.lsn_distance_bytes > thresholds.lag_bytes {
                raise(
                    &mut summary,
                    HealthState::Warning,
                    format!(
                        "High replication lag on slot {} ({}): {} bytes",
                        stat.slot_name, status.name, stat.lsn_distance_bytes
                    ),
                );
            }

            if let (Some(limit), Some(lag)) = (thresholds.lag_seconds, stat.replication_lag_sec)
                && lag > limit
            {
                raise(
                    &mut summary,
                    HealthState::Warning,
                    format!(
                        "High replication lag on slot {} ({}): {:.1} seconds",
                        stat.slot_name, status.name, lag
                    ),
                );
            }
        }
    }

    summary
}

fn raise(summary: &mut Summary, state: HealthState, issue: String) {
    summary.health_status = summary.health_status.max(state);
    summary.issues.push(issue);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ReplicationSlot, ReplicationStat, Role, RolePayload, SourcePayload, Subscription,
        TargetPayload,
    };
    use chrono::{DateTime, Utc};

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    fn slot(name: &str, active: bool) -> ReplicationSlot {
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
            last_updated: epoch(),
        }
    }

    fn stat(name: &str, bytes: u64, lag: Option<f64>) -> ReplicationStat {
        ReplicationStat {
            slot_name: name.to_string(),
            current_wal_lsn: "0/3000".to_string(),
            confirmed_flush_lsn: "0/2000".to_string(),
            lsn_distance: bytes,
            lsn_distance_bytes: bytes,
            replication_lag_sec: lag,
            active: true,
            last_updated: epoch(),
        }
    }

    fn source(name: &str, slots: Vec<ReplicationSlot>, stats: Vec<ReplicationStat>) -> SourceStatus {
        let mut status = SourceStatus::connected(name, Role::Source);
        status.last_updated = epoch();
        status.payload = RolePayload::Source(SourcePayload {
            publications: Vec::new(),
            replication_slots: slots,
            replication_stats: stats,
        });
        status
    }

    fn target(name: &str, subs: usize) -> SourceStatus {
        let mut status = SourceStatus::connected(name, Role::Target);
        status.last_updated = epoch();
        status.payload = RolePayload::Target(TargetPayload {
            subscriptions: (0..subs)
                .map(|i| Subscription {
                    sub_name: format!("sub_{i}"),
                    sub_owner: "postgres".to_string(),
                    enabled: true,
                    publication: "pub_all".to_string(),
                    conn_info: "host=src1".to_string(),
                    slot_name: format!("sub_{i}"),
                    sync_commit: "off".to_string(),
                    last_updated: epoch(),
                })
                .collect(),
            subscription_stats: Vec::new(),
        });
        status
    }

    #[test]
    fn empty_input_is_healthy() {
        let summary = summarize(&[], &Thresholds::default());
        assert_eq!(summary.health_status, HealthState::Healthy);
        assert_eq!(summary.max_lag_bytes, 0);
        assert_eq!(summary.max_lag_seconds, 0.0);
        assert!(summary.issues.is_empty());
    }

    #[test]
    fn counts_slots_and_subscriptions() {
        let statuses = vec![
            source("src1", vec![slot("a", true), slot("b", true)], vec![]),
            source("src2", vec![slot("c", true)], vec![]),
            target("tgt1", 2),
        ];
        let summary = summarize(&statuses, &Thresholds::default());
        assert_eq!(summary.total_slots, 3);
        assert_eq!(summary.active_slots, 3);
        assert_eq!(summary.total_subscriptions, 2);
        assert_eq!(summary.health_status, HealthState::Healthy);
    }

    #[test]
    fn inactive_slot_is_warning() {
        let statuses = vec![source("src1", vec![slot("a", true), slot("b", false)], vec![])];
        let summary = summarize(&statuses, &Thresholds::default());
        assert_eq!(summary.health_status, HealthState::Warning);
        assert_eq!(summary.active_slots, 1);
        assert_eq!(summary.issues, vec!["Replication slot b on src1 is inactive"]);
    }

    #[test]
    fn lag_above_threshold_is_warning_and_equal_is_not() {
        let thresholds = Thresholds {
            lag_bytes: 1000,
            ..Thresholds::default()
        };
        let at_limit = vec![source("src1", vec![], vec![stat("a", 1000, None)])];
        assert_eq!(
            summarize(&at_limit, &thresholds).health_status,
            HealthState::Healthy
        );

        let over = vec![source("src1", vec![], vec![stat("a", 1001, None)])];
        let summary = summarize(&over, &thresholds);
        assert_eq!(summary.health_status, HealthState::Warning);
        assert_eq!(summary.issues.len(), 1);
        assert!(summary.issues[0].contains("1001 bytes"));
    }

    #[test]
    fn disconnect_wins_and_issues_accumulate() {
        let thresholds = Thresholds {
            lag_bytes: 10,
            ..Thresholds::default()
        };
        let statuses = vec![
            source("src1", vec![], vec![stat("a", 500, Some(3.0))]),
            SourceStatus::unreachable("tgt1", Role::Target, "connection refused"),
        ];
        let summary = summarize(&statuses, &thresholds);
        assert_eq!(summary.health_status, HealthState::Critical);
        assert_eq!(summary.issues.len(), 2);

        // A later warning never downgrades critical.
        let reversed: Vec<_> = statuses.into_iter().rev().collect();
        let summary = summarize(&reversed, &thresholds);
        assert_eq!(summary.health_status, HealthState::Critical);
        assert!(summary.issues[0].contains("tgt1"));
    }

    #[test]
    fn maxima_cover_all_sources() {
        let statuses = vec![
            source("src1", vec![], vec![stat("a", 10, Some(1.5)), stat("b", 70, None)]),
            source("src2", vec![], vec![stat("c", 40, Some(4.25))]),
        ];
        let summary = summarize(&statuses, &Thresholds::default());
        assert_eq!(summary.max_lag_bytes, 70);
        assert_eq!(summary.max_lag_seconds, 4.25);
        assert_eq!(summary.health_status, HealthState::Healthy);
    }

    #[test]
    fn lag_seconds_threshold_only_applies_when_set() {
        let statuses = vec![source("src1", vec![], vec![stat("a", 0, Some(120.0))])];
        assert_eq!(
            summarize(&statuses, &Thresholds::default()).health_status,
            HealthState::Healthy
        );

        let thresholds = Thresholds {
            lag_seconds: Some(60.0),
            ..Thresholds::default()
        };
        let summary = summarize(&statuses, &thresholds);
        assert_eq!(summary.health_status, HealthState::Warning);
        assert!(summary.issues[0].contains("120.0 seconds"));
    }

    #[test]
    fn summarize_is_deterministic() {
        let statuses = vec![
            source("src1", vec![slot("a", false)], vec![stat("a", 1 << 30, Some(2.0))]),
            SourceStatus::unreachable("tgt1", Role::Target, "timeout"),
            target("tgt2", 1),
        ];
        let first = serde_json::to_string(&summarize(&statuses, &Thresholds::default())).unwrap();
        let second = serde_json::to_string(&summarize(&statuses, &Thresholds::default())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn numeric_aggregates_ignore_order() {
        let statuses = vec![
            source("src1", vec![slot("a", true), slot("b", false)], vec![stat("a", 5, Some(1.0))]),
            source("src2", vec![slot("c", true)], vec![stat("c", 9, Some(0.5))]),
            target("tgt1", 3),
        ];
        let forward = summarize(&statuses, &Thresholds::default());
        let reversed: Vec<_> = statuses.into_iter().rev().collect();
        let backward = summarize(&reversed, &Thresholds::default());

        assert_eq!(forward.total_slots, backward.total_slots);
        assert_eq!(forward.active_slots, backward.active_slots);
        assert_eq!(forward.max_lag_bytes, backward.max_lag_bytes);
        assert_eq!(forward.max_lag_seconds, backward.max_lag_seconds);
        assert_eq!(forward.health_status, backward.health_status);
    }
}
