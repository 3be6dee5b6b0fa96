//! Durable SQLite store backing the sync manager.
//!
//! # Schema
//! - `event_log`: append-only log of changes awaiting uplink, keyed by a
//!   monotone `seq_id` allocated from `log_state`.
//! - `attributes`: `(tenant, entity, scope, key)` addressed values; holds
//!   the sync cursor and the connectivity attributes.
//! - `edge_settings`: per-tenant settings row rewritten on handshake.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON.  PRAGMA integrity_check runs at open; returns error if
//! it fails.

use crate::model::{EdgeSettings, EntityType, EventAction, EventLogEntry};
use rusqlite::{Connection, params};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One page of an ascending seq-ordered range scan.
#[derive(Debug)]
pub struct Page<T> {
    pub entries: Vec<T>,
    /// True when the scan stopped at the page size, not at the range end.
    pub has_next: bool,
}

impl<T> Page<T> {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// SyncStore
// ---------------------------------------------------------------------------

/// The durable store for a single edge instance.
pub struct SyncStore {
    conn: Connection,
}

impl SyncStore {
    /// Open (or create) the store at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates tables if
    /// needed.  Returns `Err` if integrity_check fails.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = SyncStore { conn };
        store.apply_pragmas()?;
        store.integrity_check()?;
        store.apply_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SyncStore { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    pub fn integrity_check(&self) -> StoreResult<()> {
        let result: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(StoreError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    /// Append an event, allocating the next `seq_id` from `log_state`.
    ///
    /// Returns the stored entry, including the assigned seq and uuid.
    pub fn append_event(
        &mut self,
        tenant_id: Uuid,
        entity_type: EntityType,
        action: EventAction,
        entity_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> StoreResult<EventLogEntry> {
        let tx = self.conn.transaction()?;
        let seq_id: i64 =
            tx.query_row("SELECT next_seq FROM log_state WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        tx.execute("UPDATE log_state SET next_seq = next_seq + 1 WHERE id = 1", [])?;

        let uuid = Uuid::now_v7();
        let created_ts = chrono::Utc::now().timestamp_millis();
        tx.execute(
            "INSERT INTO event_log
                 (uuid, seq_id, tenant_id, entity_type, action, entity_id, payload, created_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                uuid.to_string(),
                seq_id,
                tenant_id.to_string(),
                entity_type.as_str(),
                action.as_str(),
                entity_id.map(|id| id.to_string()),
                payload.to_string(),
                created_ts,
            ],
        )?;
        tx.commit()?;

        Ok(EventLogEntry {
            uuid,
            seq_id,
            tenant_id,
            entity_type,
            action,
            entity_id,
            payload,
            created_ts,
        })
    }

    /// Range-scan events with `seq_id > seq_gt` (and `<= seq_lte` when
    /// bounded) inside the `[ts_ge, ts_le]` time window, ascending by seq.
    ///
    /// Fetches one row beyond `limit` to report `has_next` without a second
    /// query.
    pub fn read_events(
        &self,
        seq_gt: i64,
        seq_lte: Option<i64>,
        ts_ge: i64,
        ts_le: i64,
        limit: u32,
    ) -> StoreResult<Page<EventLogEntry>> {
        let seq_upper = seq_lte.unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT uuid, seq_id, tenant_id, entity_type, action, entity_id, payload, created_ts
             FROM event_log
             WHERE seq_id > ?1 AND seq_id <= ?2 AND created_ts >= ?3 AND created_ts <= ?4
             ORDER BY seq_id ASC
             LIMIT ?5",
        )?;
        let probe_limit = i64::from(limit) + 1;
        let rows = stmt.query_map(
            params![seq_gt, seq_upper, ts_ge, ts_le, probe_limit],
            map_raw_event,
        )?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(decode_event(row?)?);
        }
        let has_next = entries.len() > limit as usize;
        entries.truncate(limit as usize);
        Ok(Page { entries, has_next })
    }

    /// Restart seq numbering at 1 (log cycle).
    ///
    /// Shipped events are pruned in the same step; a reader that still sees
    /// seq 1 in its window treats it as wraparound.
    pub fn cycle_log(&mut self, prune_through_seq: i64) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM event_log WHERE seq_id <= ?1",
            params![prune_through_seq],
        )?;
        tx.execute("UPDATE log_state SET next_seq = 1 WHERE id = 1", [])?;
        tx.commit()?;
        Ok(())
    }

    /// Total events currently in the log.
    pub fn event_count(&self) -> StoreResult<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM event_log", [], |row| row.get(0))?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    /// Read an attribute and interpret it as an integer.
    ///
    /// Returns `None` when the key is absent or holds a non-numeric value.
    pub fn find_long_attr(
        &self,
        tenant_id: Uuid,
        entity_id: Uuid,
        scope: &str,
        key: &str,
    ) -> StoreResult<Option<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT value FROM attributes
             WHERE tenant_id = ?1 AND entity_id = ?2 AND scope = ?3 AND key = ?4",
        )?;
        let mut rows = stmt.query_map(
            params![tenant_id.to_string(), entity_id.to_string(), scope, key],
            |row| row.get::<_, String>(0),
        )?;
        match rows.next().transpose()? {
            None => Ok(None),
            Some(raw) => Ok(serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .and_then(|v| v.as_i64())),
        }
    }

    /// Upsert a list of attributes with a shared update timestamp.
    pub fn save_attributes(
        &mut self,
        tenant_id: Uuid,
        entity_id: Uuid,
        scope: &str,
        entries: &[(&str, serde_json::Value)],
        ts: i64,
    ) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        for (key, value) in entries {
            tx.execute(
                "INSERT OR REPLACE INTO attributes
                     (tenant_id, entity_id, scope, key, value, last_update_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    tenant_id.to_string(),
                    entity_id.to_string(),
                    scope,
                    key,
                    value.to_string(),
                    ts,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Edge settings
    // -----------------------------------------------------------------------

    pub fn load_edge_settings(&self, tenant_id: Uuid) -> StoreResult<Option<EdgeSettings>> {
        let mut stmt = self.conn.prepare(
            "SELECT edge_id, customer_id, name, edge_type, routing_key, full_sync_required
             FROM edge_settings WHERE tenant_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![tenant_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;
        let Some(raw) = rows.next().transpose()? else {
            return Ok(None);
        };
        let (edge_id, customer_id, name, edge_type, routing_key, full_sync_required) = raw;
        Ok(Some(EdgeSettings {
            edge_id: parse_uuid(&edge_id)?,
            tenant_id,
            customer_id: customer_id.as_deref().map(parse_uuid).transpose()?,
            name,
            edge_type,
            routing_key,
            full_sync_required,
        }))
    }

    pub fn save_edge_settings(&mut self, settings: &EdgeSettings) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO edge_settings
                 (tenant_id, edge_id, customer_id, name, edge_type, routing_key, full_sync_required)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                settings.tenant_id.to_string(),
                settings.edge_id.to_string(),
                settings.customer_id.map(|id| id.to_string()),
                settings.name,
                settings.edge_type,
                settings.routing_key,
                settings.full_sync_required,
            ],
        )?;
        Ok(())
    }

    /// Drop all tenant-scoped state: attributes (cursor included) and the
    /// settings row.  Invoked when a handshake arrives with a different
    /// edge id than the stored one.
    pub fn purge_tenant(&mut self, tenant_id: Uuid) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM attributes WHERE tenant_id = ?1",
            params![tenant_id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM edge_settings WHERE tenant_id = ?1",
            params![tenant_id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn apply_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

// Raw row before uuid/enum decoding.
type RawEvent = (
    String,
    i64,
    String,
    String,
    String,
    Option<String>,
    String,
    i64,
);

fn map_raw_event(row: &rusqlite::Row<'_>) -> Result<RawEvent, rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_event(raw: RawEvent) -> StoreResult<EventLogEntry> {
    let (uuid, seq_id, tenant_id, entity_type, action, entity_id, payload, created_ts) = raw;
    Ok(EventLogEntry {
        uuid: parse_uuid(&uuid)?,
        seq_id,
        tenant_id: parse_uuid(&tenant_id)?,
        entity_type: entity_type
            .parse()
            .map_err(StoreError::InvalidData)?,
        action: action.parse().map_err(StoreError::InvalidData)?,
        entity_id: entity_id.as_deref().map(parse_uuid).transpose()?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| StoreError::InvalidData(format!("payload JSON: {e}")))?,
        created_ts,
    })
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("uuid '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenant() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn append_allocates_monotone_seq_ids() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let t = tenant();
        for expected in 1..=4 {
            let entry = store
                .append_event(t, EntityType::Device, EventAction::Added, None, json!({}))
                .unwrap();
            assert_eq!(entry.seq_id, expected);
        }
    }

    #[test]
    fn read_events_pages_in_seq_order() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let t = tenant();
        for i in 0..5 {
            store
                .append_event(
                    t,
                    EntityType::Asset,
                    EventAction::Updated,
                    Some(Uuid::new_v4()),
                    json!({ "i": i }),
                )
                .unwrap();
        }

        let page = store.read_events(0, None, 0, i64::MAX, 3).unwrap();
        assert_eq!(page.entries.len(), 3);
        assert!(page.has_next);
        assert_eq!(
            page.entries.iter().map(|e| e.seq_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let rest = store.read_events(3, None, 0, i64::MAX, 3).unwrap();
        assert_eq!(rest.entries.len(), 2);
        assert!(!rest.has_next);
    }

    #[test]
    fn cycle_restarts_seq_at_one() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let t = tenant();
        for _ in 0..3 {
            store
                .append_event(t, EntityType::Device, EventAction::Added, None, json!({}))
                .unwrap();
        }
        store.cycle_log(3).unwrap();
        assert_eq!(store.event_count().unwrap(), 0);

        let entry = store
            .append_event(t, EntityType::Device, EventAction::Added, None, json!({}))
            .unwrap();
        assert_eq!(entry.seq_id, 1);
    }

    #[test]
    fn attributes_upsert_and_typed_read() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let t = tenant();
        let e = Uuid::new_v4();
        store
            .save_attributes(t, e, "server", &[("queueStartTs", json!(1234))], 1)
            .unwrap();
        assert_eq!(
            store.find_long_attr(t, e, "server", "queueStartTs").unwrap(),
            Some(1234)
        );
        // overwrite
        store
            .save_attributes(t, e, "server", &[("queueStartTs", json!(5678))], 2)
            .unwrap();
        assert_eq!(
            store.find_long_attr(t, e, "server", "queueStartTs").unwrap(),
            Some(5678)
        );
        // missing key
        assert_eq!(store.find_long_attr(t, e, "server", "nope").unwrap(), None);
        // non-numeric value
        store
            .save_attributes(t, e, "server", &[("label", json!("edge-1"))], 3)
            .unwrap();
        assert_eq!(store.find_long_attr(t, e, "server", "label").unwrap(), None);
    }

    #[test]
    fn edge_settings_round_trip_and_purge() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let t = tenant();
        let settings = EdgeSettings {
            edge_id: Uuid::new_v4(),
            tenant_id: t,
            customer_id: Some(Uuid::new_v4()),
            name: "edge-1".to_owned(),
            edge_type: "default".to_owned(),
            routing_key: "rk".to_owned(),
            full_sync_required: false,
        };
        store.save_edge_settings(&settings).unwrap();
        assert_eq!(store.load_edge_settings(t).unwrap(), Some(settings));

        store.purge_tenant(t).unwrap();
        assert_eq!(store.load_edge_settings(t).unwrap(), None);
    }
}
