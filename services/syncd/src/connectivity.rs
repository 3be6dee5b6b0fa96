//! Connectivity reporting.
//!
//! Publishes liveness under the tenant's server scope: `active` plus the
//! matching transition timestamp.  Writes are best-effort — trace on
//! success, warn on failure — and never gate the session lifecycle.

use crate::cursor::SCOPE_SERVER;
use crate::state::SharedState;
use crate::storage::SyncStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{trace, warn};

pub const ATTR_ACTIVE: &str = "active";
pub const ATTR_LAST_CONNECT_TIME: &str = "lastConnectTime";
pub const ATTR_LAST_DISCONNECT_TIME: &str = "lastDisconnectTime";

#[derive(Clone)]
pub struct ConnectivityReporter {
    store: Arc<Mutex<SyncStore>>,
    state: Arc<SharedState>,
}

impl ConnectivityReporter {
    pub fn new(store: Arc<Mutex<SyncStore>>, state: Arc<SharedState>) -> Self {
        ConnectivityReporter { store, state }
    }

    /// Publish the connectivity transition.  No-op before the tenant is known.
    pub async fn publish(&self, active: bool) {
        let Some(tenant_id) = self.state.tenant() else {
            return;
        };
        let now = chrono::Utc::now().timestamp_millis();
        let ts_key = if active {
            ATTR_LAST_CONNECT_TIME
        } else {
            ATTR_LAST_DISCONNECT_TIME
        };
        let mut store = self.store.lock().await;
        let result = store.save_attributes(
            tenant_id,
            tenant_id,
            SCOPE_SERVER,
            &[
                (ATTR_ACTIVE, serde_json::json!(active)),
                (ts_key, serde_json::json!(now)),
            ],
            now,
        );
        match result {
            Ok(()) => trace!(active, "connectivity published"),
            Err(e) => warn!(error = %e, active, "failed to publish connectivity"),
        }
    }
}
