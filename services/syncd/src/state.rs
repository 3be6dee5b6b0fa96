//! Shared mutable state of the sync manager.
//!
//! Written during handshake (identity, settings) and by the downlink/batch
//! paths (flags); read from every worker.  Flags use atomics; identity
//! fields sit behind std RwLocks and are only rewritten between sessions.

use crate::model::EdgeSettings;
use el_protocol::WsMessage;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct SharedState {
    initialized: AtomicBool,
    sync_in_progress: AtomicBool,
    queue_start_ts: AtomicI64,
    max_inbound_message_size: AtomicUsize,
    tenant_id: RwLock<Option<Uuid>>,
    customer_id: RwLock<Option<Uuid>>,
    settings: RwLock<Option<EdgeSettings>>,
    uplink_tx: RwLock<Option<mpsc::Sender<WsMessage>>>,
}

impl SharedState {
    pub fn new() -> Self {
        SharedState {
            initialized: AtomicBool::new(false),
            sync_in_progress: AtomicBool::new(false),
            queue_start_ts: AtomicI64::new(0),
            max_inbound_message_size: AtomicUsize::new(usize::MAX),
            tenant_id: RwLock::new(None),
            customer_id: RwLock::new(None),
            settings: RwLock::new(None),
            uplink_tx: RwLock::new(None),
        }
    }

    // -- flags --

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self, value: bool) {
        self.initialized.store(value, Ordering::Release);
    }

    pub fn sync_in_progress(&self) -> bool {
        self.sync_in_progress.load(Ordering::Acquire)
    }

    pub fn set_sync_in_progress(&self, value: bool) {
        self.sync_in_progress.store(value, Ordering::Release);
    }

    // -- identity --

    pub fn tenant(&self) -> Option<Uuid> {
        *self.tenant_id.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_tenant(&self, tenant_id: Uuid) {
        *self.tenant_id.write().unwrap_or_else(|e| e.into_inner()) = Some(tenant_id);
    }

    pub fn customer(&self) -> Option<Uuid> {
        *self.customer_id.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the customer id, reporting whether it actually changed.
    pub fn replace_customer(&self, customer_id: Option<Uuid>) -> bool {
        let mut guard = self.customer_id.write().unwrap_or_else(|e| e.into_inner());
        let changed = *guard != customer_id;
        *guard = customer_id;
        changed
    }

    pub fn settings(&self) -> Option<EdgeSettings> {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_settings(&self, settings: EdgeSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = Some(settings);
    }

    pub fn queue_start_ts(&self) -> i64 {
        self.queue_start_ts.load(Ordering::Acquire)
    }

    pub fn set_queue_start_ts(&self, ts: i64) {
        self.queue_start_ts.store(ts, Ordering::Release);
    }

    pub fn max_inbound_message_size(&self) -> usize {
        self.max_inbound_message_size.load(Ordering::Acquire)
    }

    pub fn set_max_inbound_message_size(&self, size: usize) {
        self.max_inbound_message_size.store(size, Ordering::Release);
    }

    // -- outbound channel to the active session --

    pub fn set_uplink_sender(&self, tx: mpsc::Sender<WsMessage>) {
        *self.uplink_tx.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    pub fn clear_uplink_sender(&self) {
        *self.uplink_tx.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Queue a message for the active session's write pump.
    ///
    /// Returns false when there is no active session or the session is
    /// tearing down; callers treat that as a transport-unavailable signal,
    /// never an error.
    pub async fn send_to_cloud(&self, msg: WsMessage) -> bool {
        let tx = {
            let guard = self.uplink_tx.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        match tx {
            Some(tx) => tx.send(msg).await.is_ok(),
            None => false,
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_customer_reports_change() {
        let state = SharedState::new();
        let c1 = Uuid::new_v4();
        assert!(state.replace_customer(Some(c1)));
        assert!(!state.replace_customer(Some(c1)));
        assert!(state.replace_customer(None));
        assert!(state.replace_customer(Some(c1)));
    }

    #[tokio::test]
    async fn send_without_session_reports_unavailable() {
        let state = SharedState::new();
        let sent = state
            .send_to_cloud(WsMessage::SyncRequestMsg(el_protocol::SyncRequestMsg {
                full_sync: true,
            }))
            .await;
        assert!(!sent);
    }
}
