//! SQL text used by [`super::PgCatalogReader`].
//!
//! LSN columns are cast to text so they travel as opaque strings; distances
//! are cast to bigint because `pg_lsn - pg_lsn` yields numeric.

pub(super) const REPLICATION_SETTINGS: &str = "\
    SELECT name, setting \
    FROM pg_settings \
    WHERE name IN ('wal_level', 'rds.logical_replication')";

pub(super) const CURRENT_LSN: &str = "SELECT pg_current_wal_lsn()::text";

pub(super) const PUBLICATIONS: &str = "\
    SELECT \
        p.pubname, \
        r.rolname AS pubowner, \
        p.puballtables, \
        p.pubinsert, \
        p.pubupdate, \
        p.pubdelete, \
        p.pubtruncate \
    FROM pg_publication p \
    JOIN pg_roles r ON p.pubowner = r.oid \
    ORDER BY p.pubname";

pub(super) const PUBLICATION_TABLES: &str = "\
    SELECT pubname, schemaname || '.' || tablename AS table_name \
    FROM pg_publication_tables \
    ORDER BY pubname, schemaname, tablename";

pub(super) const REPLICATION_SLOTS: &str = "\
    SELECT \
        slot_name::text, \
        coalesce(plugin::text, ''), \
        slot_type, \
        coalesce(database::text, ''), \
        active, \
        coalesce(restart_lsn::text, ''), \
        coalesce(confirmed_flush_lsn::text, ''), \
        coalesce(wal_status, ''), \
        safe_wal_size \
    FROM pg_replication_slots \
    WHERE slot_type = 'logical' \
    ORDER BY slot_name";

pub(super) const REPLICATION_STATS: &str = "\
    SELECT \
        slot_name::text, \
        pg_current_wal_lsn()::text AS current_wal_lsn, \
        coalesce(confirmed_flush_lsn::text, '0/0') AS confirmed_flush_lsn, \
        coalesce(pg_wal_lsn_diff(pg_current_wal_lsn(), confirmed_flush_lsn), 0)::bigint \
            AS lsn_distance, \
        active \
    FROM pg_replication_slots \
    WHERE slot_type = 'logical' \
    ORDER BY slot_name";

/// NULL on servers that have never replayed a transaction (any primary).
pub(super) const REPLAY_LAG_SECONDS: &str =
    "SELECT EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))::float8";

pub(super) const SUBSCRIPTIONS: &str = "\
    SELECT \
        s.subname::text, \
        r.rolname::text AS subowner, \
        s.subenabled, \
        array_to_string(s.subpublications, ',') AS publication, \
        s.subconninfo, \
        coalesce(s.subslotname::text, ''), \
        s.subsynccommit \
    FROM pg_subscription s \
    JOIN pg_roles r ON s.subowner = r.oid \
    ORDER BY s.subname";

pub(super) const SUBSCRIPTION_STATS: &str = "\
    SELECT \
        s.subname::text, \
        coalesce(ss.received_lsn::text, '0/0') AS received_lsn, \
        ss.last_msg_send_time, \
        ss.last_msg_receipt_time, \
        coalesce(ss.latest_end_lsn::text, '0/0') AS latest_end_lsn, \
        ss.latest_end_time \
    FROM pg_subscription s \
    LEFT JOIN pg_stat_subscription ss ON s.oid = ss.subid \
    ORDER BY s.subname";
