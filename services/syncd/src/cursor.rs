//! Durable sync cursor.
//!
//! The cursor `(start_ts, seq_id_offset)` marks the next event to ship and
//! lives in two well-known attribute keys under the tenant entity.  Loads
//! default each missing key to 0; stores are fire-and-forget (logged on
//! failure, never propagated into the sync loop).

use crate::storage::{StoreError, SyncStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{trace, warn};
use uuid::Uuid;

/// Attribute scope the cursor and connectivity keys live under.
pub const SCOPE_SERVER: &str = "server";
pub const ATTR_QUEUE_START_TS: &str = "queueStartTs";
pub const ATTR_QUEUE_SEQ_ID_OFFSET: &str = "queueSeqIdOffset";

#[derive(Clone)]
pub struct CursorStore {
    store: Arc<Mutex<SyncStore>>,
}

impl CursorStore {
    pub fn new(store: Arc<Mutex<SyncStore>>) -> Self {
        CursorStore { store }
    }

    /// Load `(start_ts, seq_id_offset)`, defaulting each missing key to 0.
    pub async fn load(&self, tenant_id: Uuid) -> Result<(i64, i64), StoreError> {
        let store = self.store.lock().await;
        let start_ts = store
            .find_long_attr(tenant_id, tenant_id, SCOPE_SERVER, ATTR_QUEUE_START_TS)?
            .unwrap_or(0);
        let seq_id_offset = store
            .find_long_attr(tenant_id, tenant_id, SCOPE_SERVER, ATTR_QUEUE_SEQ_ID_OFFSET)?
            .unwrap_or(0);
        Ok((start_ts, seq_id_offset))
    }

    /// Persist both cursor keys as of the current wall clock.
    ///
    /// Failures are logged; the next loop iteration re-reads the old cursor
    /// and may re-send (idempotent on the cloud side).
    pub async fn store(&self, tenant_id: Uuid, start_ts: i64, seq_id_offset: i64) {
        let now = chrono::Utc::now().timestamp_millis();
        let mut store = self.store.lock().await;
        let result = store.save_attributes(
            tenant_id,
            tenant_id,
            SCOPE_SERVER,
            &[
                (ATTR_QUEUE_START_TS, serde_json::json!(start_ts)),
                (ATTR_QUEUE_SEQ_ID_OFFSET, serde_json::json!(seq_id_offset)),
            ],
            now,
        );
        match result {
            Ok(()) => trace!(start_ts, seq_id_offset, "cursor stored"),
            Err(e) => warn!(error = %e, start_ts, seq_id_offset, "failed to store cursor"),
        }
    }
}
