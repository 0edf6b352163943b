//! SQLite-backed store for history, node state, peers and the administered
//! blacklist / version tables.
//!
//! The store owns a single connection behind a mutex. Multi-statement work goes
//! through [`Store::in_transaction`]; the free functions below take a plain
//! `&Connection` so they run equally on a connection or a transaction.

use crate::config::StorageConfig;
use crate::error::{Result, TelemetryError};
use crate::types::{ErrorReport, HistoryRecord, NodeState, PeerIdentity, VersionGate};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const MIGRATION_SQL: &str = include_str!("../migrations/001_init.sql");

/// How an [`Store::in_transaction`] closure wants its transaction finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxFinish {
    Commit,
    Rollback,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database file named in `config` and migrate it.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&config.database_path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %config.database_path.display(), "Opened telemetry store");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(MIGRATION_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| TelemetryError::StorePoisoned)
    }

    /// Run `f` against the connection outside any explicit transaction.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside one transaction. An error from `f` rolls back; otherwise the
    /// returned [`TxFinish`] decides.
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<(T, TxFinish)>,
    ) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let (value, finish) = f(&tx)?;
        match finish {
            TxFinish::Commit => tx.commit()?,
            TxFinish::Rollback => tx.rollback()?,
        }
        Ok(value)
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {millis}").into(),
        )
    })
}

fn guid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(idx, row.get(idx)?)
}

// Node state

pub fn load_node_state(conn: &Connection, guid: Uuid) -> Result<Option<NodeState>> {
    let state = conn
        .query_row(
            "SELECT guid, last_contact, last_tick FROM node_state WHERE guid = ?1",
            params![guid.to_string()],
            |row| {
                Ok(NodeState {
                    guid: guid_at(row, 0)?,
                    last_contact_time: time_at(row, 1)?,
                    last_tick_number: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(state)
}

pub fn save_node_state(conn: &Connection, state: &NodeState) -> Result<()> {
    conn.execute(
        "INSERT INTO node_state (guid, last_contact, last_tick) VALUES (?1, ?2, ?3)
         ON CONFLICT(guid) DO UPDATE SET last_contact=excluded.last_contact, last_tick=excluded.last_tick",
        params![
            state.guid.to_string(),
            to_millis(state.last_contact_time),
            state.last_tick_number
        ],
    )?;
    Ok(())
}

pub fn clear_node_state(conn: &Connection, guid: Uuid) -> Result<()> {
    conn.execute(
        "DELETE FROM node_state WHERE guid = ?1",
        params![guid.to_string()],
    )?;
    Ok(())
}

// History

/// Insert one normalized row. Returns whether the species was blacklisted at insert time.
pub fn insert_history(conn: &Connection, record: &HistoryRecord) -> Result<bool> {
    let blacklisted = is_blacklisted(conn, &record.species_name)?;
    let contact_time = record
        .contact_time
        .ok_or_else(|| TelemetryError::MissingField("contactTime".to_string()))?;
    conn.execute(
        "INSERT INTO history (
            guid, species_name, tick_number, population, birth_count, teleported_to_count,
            starved_count, killed_count, teleported_from_count, error_count, timeout_count,
            sick_count, old_age_count, security_violation_count, client_time, contact_time,
            correct_time, blacklisted
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            record.guid.to_string(),
            record.species_name,
            record.tick_number,
            record.population,
            record.birth_count,
            record.teleported_to_count,
            record.starved_count,
            record.killed_count,
            record.teleported_from_count,
            record.error_count,
            record.timeout_count,
            record.sick_count,
            record.old_age_count,
            record.security_violation_count,
            to_millis(record.client_time),
            to_millis(contact_time),
            record.correct_time,
            blacklisted,
        ],
    )?;
    Ok(blacklisted)
}

pub fn history_for_guid(conn: &Connection, guid: Uuid) -> Result<Vec<HistoryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT guid, species_name, tick_number, population, birth_count, teleported_to_count,
                starved_count, killed_count, teleported_from_count, error_count, timeout_count,
                sick_count, old_age_count, security_violation_count, client_time, contact_time,
                correct_time
         FROM history WHERE guid = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![guid.to_string()], |row| {
        Ok(HistoryRecord {
            guid: guid_at(row, 0)?,
            species_name: row.get(1)?,
            tick_number: row.get(2)?,
            population: row.get(3)?,
            birth_count: row.get(4)?,
            teleported_to_count: row.get(5)?,
            starved_count: row.get(6)?,
            killed_count: row.get(7)?,
            teleported_from_count: row.get(8)?,
            error_count: row.get(9)?,
            timeout_count: row.get(10)?,
            sick_count: row.get(11)?,
            old_age_count: row.get(12)?,
            security_violation_count: row.get(13)?,
            client_time: time_at(row, 14)?,
            contact_time: Some(time_at(row, 15)?),
            correct_time: row.get(16)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_history(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?)
}

// Blacklist

pub fn is_blacklisted(conn: &Connection, species_name: &str) -> Result<bool> {
    let flag: Option<bool> = conn
        .query_row(
            "SELECT blacklisted FROM blacklist WHERE species_name = ?1",
            params![species_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(flag.unwrap_or(false))
}

pub fn set_blacklisted(conn: &Connection, species_name: &str, blacklisted: bool) -> Result<()> {
    conn.execute(
        "INSERT INTO blacklist (species_name, blacklisted) VALUES (?1, ?2)
         ON CONFLICT(species_name) DO UPDATE SET blacklisted=excluded.blacklisted",
        params![species_name, blacklisted],
    )?;
    Ok(())
}

// Version gate

pub fn version_gate(conn: &Connection, version: &str) -> Result<Option<VersionGate>> {
    let gate = conn
        .query_row(
            "SELECT disabled, message FROM version_gate WHERE version = ?1",
            params![version],
            |row| {
                Ok(VersionGate {
                    disabled: row.get(0)?,
                    message: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(gate)
}

pub fn set_version_gate(conn: &Connection, version: &str, gate: &VersionGate) -> Result<()> {
    conn.execute(
        "INSERT INTO version_gate (version, disabled, message) VALUES (?1, ?2, ?3)
         ON CONFLICT(version) DO UPDATE SET disabled=excluded.disabled, message=excluded.message",
        params![version, gate.disabled, gate.message],
    )?;
    Ok(())
}

// Peers

pub fn upsert_peer(conn: &Connection, peer: &PeerIdentity, full_version: &str) -> Result<()> {
    let contact = to_millis(peer.last_contact_time);
    conn.execute(
        "INSERT INTO peers (guid, source_address, version, full_version, channel, first_contact, last_contact)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(guid) DO UPDATE SET
            source_address=excluded.source_address,
            version=excluded.version,
            full_version=excluded.full_version,
            channel=excluded.channel,
            last_contact=excluded.last_contact",
        params![
            peer.guid.to_string(),
            peer.source_address,
            peer.version,
            full_version,
            peer.channel,
            contact
        ],
    )?;
    Ok(())
}

pub fn count_live_peers(
    conn: &Connection,
    version: &str,
    channel: &str,
    since: DateTime<Utc>,
) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM peers WHERE version = ?1 AND channel = ?2 AND last_contact >= ?3",
        params![version, channel, to_millis(since)],
        |row| row.get(0),
    )?)
}

/// Live peers in scope, most recently seen first, excluding `exclude`.
pub fn live_peers(
    conn: &Connection,
    version: &str,
    channel: &str,
    since: DateTime<Utc>,
    exclude: Uuid,
    limit: usize,
) -> Result<Vec<PeerIdentity>> {
    let mut stmt = conn.prepare(
        "SELECT p.guid, p.source_address, p.version, p.channel, p.last_contact, n.last_tick
         FROM peers p LEFT JOIN node_state n ON n.guid = p.guid
         WHERE p.version = ?1 AND p.channel = ?2 AND p.last_contact >= ?3 AND p.guid <> ?4
         ORDER BY p.last_contact DESC
         LIMIT ?5",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(
        params![
            version,
            channel,
            to_millis(since),
            exclude.to_string(),
            limit
        ],
        |row| {
            Ok(PeerIdentity {
                guid: guid_at(row, 0)?,
                source_address: row.get(1)?,
                version: row.get(2)?,
                channel: row.get(3)?,
                last_contact_time: time_at(row, 4)?,
                last_tick_number: row.get(5)?,
            })
        },
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// Users

pub fn upsert_user(conn: &Connection, email: &str, address: &str, now: DateTime<Utc>) -> Result<()> {
    let now = to_millis(now);
    conn.execute(
        "INSERT INTO users (email, ip_address, registered_at, last_seen) VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(email, ip_address) DO UPDATE SET last_seen=excluded.last_seen",
        params![email, address, now],
    )?;
    Ok(())
}

pub fn count_users(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
}

// Error reports

pub fn insert_error_report(
    conn: &Connection,
    report: &ErrorReport,
    machine_name: &str,
    received_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO error_reports (
            log_type, machine_name, os_version, game_version, runtime_version,
            error_log, user_email, user_comment, received_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            report.log_type,
            machine_name,
            report.os_version,
            report.game_version,
            report.runtime_version,
            report.error_log,
            report.user_email,
            report.user_comment,
            to_millis(received_at),
        ],
    )?;
    Ok(())
}

/// `(machine_name, log_type)` of every stored error report, oldest first.
pub fn error_report_sources(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT machine_name, log_type FROM error_reports ORDER BY id")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn record(guid: Uuid, species: &str) -> HistoryRecord {
        HistoryRecord {
            guid,
            species_name: species.to_string(),
            tick_number: 7,
            population: 12,
            birth_count: 1,
            teleported_to_count: 0,
            starved_count: 2,
            killed_count: 0,
            teleported_from_count: 0,
            error_count: 0,
            timeout_count: 0,
            sick_count: 0,
            old_age_count: 3,
            security_violation_count: 0,
            client_time: t0(),
            contact_time: Some(t0()),
            correct_time: true,
        }
    }

    #[test]
    fn test_node_state_upsert_and_clear() {
        let store = Store::open_in_memory().unwrap();
        let guid = Uuid::new_v4();
        store
            .with_connection(|conn| {
                assert!(load_node_state(conn, guid)?.is_none());
                let state = NodeState {
                    guid,
                    last_contact_time: t0(),
                    last_tick_number: 5,
                };
                save_node_state(conn, &state)?;
                save_node_state(
                    conn,
                    &NodeState {
                        last_tick_number: 9,
                        ..state
                    },
                )?;
                assert_eq!(load_node_state(conn, guid)?.unwrap().last_tick_number, 9);
                clear_node_state(conn, guid)?;
                assert!(load_node_state(conn, guid)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_rollback_discards_rows() {
        let store = Store::open_in_memory().unwrap();
        let guid = Uuid::new_v4();
        store
            .in_transaction(|tx| {
                insert_history(tx, &record(guid, "Grazer"))?;
                Ok(((), TxFinish::Rollback))
            })
            .unwrap();
        assert_eq!(store.with_connection(count_history).unwrap(), 0);

        store
            .in_transaction(|tx| {
                insert_history(tx, &record(guid, "Grazer"))?;
                Ok(((), TxFinish::Commit))
            })
            .unwrap();
        let rows = store.with_connection(|c| history_for_guid(c, guid)).unwrap();
        assert_eq!(rows, vec![record(guid, "Grazer")]);
    }

    #[test]
    fn test_error_in_transaction_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let guid = Uuid::new_v4();
        let result: Result<()> = store.in_transaction(|tx| {
            insert_history(tx, &record(guid, "Grazer"))?;
            Err(TelemetryError::MissingField("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.with_connection(count_history).unwrap(), 0);
    }

    #[test]
    fn test_insert_reports_blacklisted_species() {
        let store = Store::open_in_memory().unwrap();
        let guid = Uuid::new_v4();
        store
            .with_connection(|conn| {
                set_blacklisted(conn, "Cheater", true)?;
                assert!(insert_history(conn, &record(guid, "Cheater"))?);
                assert!(!insert_history(conn, &record(guid, "Grazer"))?);
                set_blacklisted(conn, "Cheater", false)?;
                assert!(!is_blacklisted(conn, "Cheater")?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_insert_requires_contact_time() {
        let store = Store::open_in_memory().unwrap();
        let mut row = record(Uuid::new_v4(), "Grazer");
        row.contact_time = None;
        let err = store.with_connection(|c| insert_history(c, &row)).unwrap_err();
        assert!(matches!(err, TelemetryError::MissingField(_)));
    }

    #[test]
    fn test_live_peers_scope_and_order() {
        let store = Store::open_in_memory().unwrap();
        let me = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let peer = |guid, channel: &str, at| PeerIdentity {
            guid,
            source_address: "10.0.0.1".to_string(),
            version: "1.2.3".to_string(),
            channel: channel.to_string(),
            last_contact_time: at,
            last_tick_number: None,
        };
        store
            .with_connection(|conn| {
                upsert_peer(conn, &peer(me, "main", t0()), "1.2.3.0")?;
                upsert_peer(conn, &peer(a, "main", t0() - chrono::Duration::minutes(2)), "1.2.3.0")?;
                upsert_peer(conn, &peer(b, "main", t0() - chrono::Duration::minutes(1)), "1.2.3.0")?;
                upsert_peer(conn, &peer(stale, "main", t0() - chrono::Duration::hours(2)), "1.2.3.0")?;
                upsert_peer(conn, &peer(Uuid::new_v4(), "beta", t0()), "1.2.3.0")?;

                let since = t0() - chrono::Duration::minutes(15);
                assert_eq!(count_live_peers(conn, "1.2.3", "main", since)?, 3);

                let listed = live_peers(conn, "1.2.3", "main", since, me, 10)?;
                let guids: Vec<Uuid> = listed.iter().map(|p| p.guid).collect();
                assert_eq!(guids, vec![b, a]);

                assert_eq!(live_peers(conn, "1.2.3", "main", since, me, 1)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_user_upsert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_connection(|conn| {
                upsert_user(conn, "a@example.com", "10.0.0.1", t0())?;
                upsert_user(conn, "a@example.com", "10.0.0.1", t0())?;
                upsert_user(conn, "a@example.com", "10.0.0.2", t0())?;
                assert_eq!(count_users(conn)?, 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_open_file_store_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            database_path: dir.path().join("nested").join("telemetry.db"),
            busy_timeout_ms: 100,
        };
        let store = Store::open(&config).unwrap();
        store
            .with_connection(|c| set_version_gate(c, "1.0.0", &VersionGate { disabled: false, message: String::new() }))
            .unwrap();
        drop(store);

        // Reopening runs the idempotent migration against existing tables
        let reopened = Store::open(&config).unwrap();
        let gate = reopened.with_connection(|c| version_gate(c, "1.0.0")).unwrap();
        assert_eq!(gate.map(|g| g.disabled), Some(false));
        assert!(PathBuf::from(&config.database_path).exists());
    }
}
