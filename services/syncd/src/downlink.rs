//! Downlink handling: process cloud-to-edge messages and answer each one.
//!
//! Processing runs in its own task per message, so responses go out in
//! future-completion order, not arrival order.  Downlink consumers on the
//! cloud side are expected to be idempotent.

use crate::state::SharedState;
use crate::storage::{StoreError, SyncStore};
use async_trait::async_trait;
use el_protocol::{DownlinkMsg, DownlinkPayload, DownlinkResponseMsg, SyncRequestMsg, WsMessage};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DownlinkError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Failed(String),
}

/// Consumer of downlink payloads.
///
/// Implementations apply the cloud's state pushes to the edge; the handler
/// only cares about success or failure.
#[async_trait]
pub trait DownlinkProcessor: Send + Sync {
    async fn process(&self, payloads: Vec<DownlinkPayload>) -> Result<(), DownlinkError>;
}

/// Production processor: persists attribute pushes into the local store and
/// logs the payload kinds it has no local consumer for.
pub struct StoreDownlinkProcessor {
    store: Arc<Mutex<SyncStore>>,
    state: Arc<SharedState>,
}

impl StoreDownlinkProcessor {
    pub fn new(store: Arc<Mutex<SyncStore>>, state: Arc<SharedState>) -> Self {
        StoreDownlinkProcessor { store, state }
    }
}

#[async_trait]
impl DownlinkProcessor for StoreDownlinkProcessor {
    async fn process(&self, payloads: Vec<DownlinkPayload>) -> Result<(), DownlinkError> {
        let Some(tenant_id) = self.state.tenant() else {
            return Err(DownlinkError::Failed("tenant not established".to_owned()));
        };
        let now = chrono::Utc::now().timestamp_millis();
        for payload in payloads {
            match payload {
                DownlinkPayload::AttributesUpdate {
                    entity_id,
                    scope,
                    attributes,
                } => {
                    let entries: Vec<(&str, serde_json::Value)> = attributes
                        .as_object()
                        .map(|obj| {
                            obj.iter()
                                .map(|(k, v)| (k.as_str(), v.clone()))
                                .collect()
                        })
                        .unwrap_or_default();
                    let mut store = self.store.lock().await;
                    store.save_attributes(tenant_id, entity_id, &scope, &entries, now)?;
                }
                other => {
                    debug!(?other, "downlink payload without local consumer");
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DownlinkHandler {
    state: Arc<SharedState>,
    processor: Arc<dyn DownlinkProcessor>,
}

impl DownlinkHandler {
    pub fn new(state: Arc<SharedState>, processor: Arc<dyn DownlinkProcessor>) -> Self {
        DownlinkHandler { state, processor }
    }

    /// Handle one inbound downlink.  Never blocks the caller: processing is
    /// spawned, and the response is emitted when it completes.
    pub fn handle(&self, msg: DownlinkMsg) {
        let customer_updated = match &msg.edge_configuration {
            Some(cfg) => self.state.replace_customer(cfg.customer_id),
            None => false,
        };
        let had_configuration = msg.edge_configuration.is_some();

        if self.state.sync_in_progress() && msg.sync_completed {
            info!("sync completed");
            self.state.set_sync_in_progress(false);
        }

        let state = self.state.clone();
        let processor = self.processor.clone();
        tokio::spawn(async move {
            let downlink_msg_id = msg.downlink_msg_id;
            match processor.process(msg.payloads).await {
                Ok(()) => {
                    let sent = state
                        .send_to_cloud(WsMessage::DownlinkResponseMsg(DownlinkResponseMsg {
                            downlink_msg_id,
                            success: true,
                            error_msg: None,
                        }))
                        .await;
                    if !sent {
                        debug!(downlink_msg_id, "session gone before downlink response");
                    }
                    if had_configuration && customer_updated && !state.sync_in_progress() {
                        info!("edge customer changed, requesting full sync");
                        let requested = state
                            .send_to_cloud(WsMessage::SyncRequestMsg(SyncRequestMsg {
                                full_sync: true,
                            }))
                            .await;
                        if requested {
                            state.set_sync_in_progress(true);
                        }
                    }
                }
                Err(e) => {
                    warn!(downlink_msg_id, error = %e, "downlink processing failed");
                    let _ = state
                        .send_to_cloud(WsMessage::DownlinkResponseMsg(DownlinkResponseMsg {
                            downlink_msg_id,
                            success: false,
                            error_msg: Some(flatten_cause(&e)),
                        }))
                        .await;
                }
            }
        });
    }
}

/// Flatten an error and its source chain into one line.
pub fn flatten_cause(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use el_protocol::EdgeConfiguration;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct OkProcessor;

    #[async_trait]
    impl DownlinkProcessor for OkProcessor {
        async fn process(&self, _payloads: Vec<DownlinkPayload>) -> Result<(), DownlinkError> {
            Ok(())
        }
    }

    struct FailProcessor;

    #[async_trait]
    impl DownlinkProcessor for FailProcessor {
        async fn process(&self, _payloads: Vec<DownlinkPayload>) -> Result<(), DownlinkError> {
            Err(DownlinkError::Failed("boom".to_owned()))
        }
    }

    fn edge_configuration(customer_id: Option<Uuid>) -> EdgeConfiguration {
        EdgeConfiguration {
            tenant_id: Uuid::new_v4(),
            edge_id: Uuid::new_v4(),
            customer_id,
            name: "edge".to_owned(),
            edge_type: "default".to_owned(),
            routing_key: "rk".to_owned(),
            cloud_type: "CE".to_owned(),
            max_inbound_message_size: 65536,
        }
    }

    fn downlink(id: i32) -> DownlinkMsg {
        DownlinkMsg {
            downlink_msg_id: id,
            edge_configuration: None,
            sync_completed: false,
            payloads: vec![],
        }
    }

    async fn recv_response(rx: &mut mpsc::Receiver<WsMessage>) -> WsMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("response in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn success_emits_positive_response() {
        let state = Arc::new(SharedState::new());
        let (tx, mut rx) = mpsc::channel(8);
        state.set_uplink_sender(tx);
        let handler = DownlinkHandler::new(state, Arc::new(OkProcessor));

        handler.handle(downlink(5));
        match recv_response(&mut rx).await {
            WsMessage::DownlinkResponseMsg(r) => {
                assert_eq!(r.downlink_msg_id, 5);
                assert!(r.success);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_emits_negative_response_with_cause() {
        let state = Arc::new(SharedState::new());
        let (tx, mut rx) = mpsc::channel(8);
        state.set_uplink_sender(tx);
        let handler = DownlinkHandler::new(state, Arc::new(FailProcessor));

        handler.handle(downlink(9));
        match recv_response(&mut rx).await {
            WsMessage::DownlinkResponseMsg(r) => {
                assert_eq!(r.downlink_msg_id, 9);
                assert!(!r.success);
                assert_eq!(r.error_msg.as_deref(), Some("boom"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sync_completed_clears_flag() {
        let state = Arc::new(SharedState::new());
        let (tx, _rx) = mpsc::channel(8);
        state.set_uplink_sender(tx);
        state.set_sync_in_progress(true);
        let handler = DownlinkHandler::new(state.clone(), Arc::new(OkProcessor));

        let mut msg = downlink(1);
        msg.sync_completed = true;
        handler.handle(msg);
        assert!(!state.sync_in_progress());
    }

    #[tokio::test]
    async fn customer_change_requests_follow_up_sync() {
        let state = Arc::new(SharedState::new());
        let (tx, mut rx) = mpsc::channel(8);
        state.set_uplink_sender(tx);
        let handler = DownlinkHandler::new(state.clone(), Arc::new(OkProcessor));

        let mut msg = downlink(2);
        msg.edge_configuration = Some(edge_configuration(Some(Uuid::new_v4())));
        handler.handle(msg);

        // Positive response first, then the sync request.
        assert!(matches!(
            recv_response(&mut rx).await,
            WsMessage::DownlinkResponseMsg(_)
        ));
        match recv_response(&mut rx).await {
            WsMessage::SyncRequestMsg(r) => assert!(r.full_sync),
            other => panic!("expected sync request, got {other:?}"),
        }
        assert!(state.sync_in_progress());
    }

    #[tokio::test]
    async fn sync_in_progress_suppresses_follow_up_request() {
        let state = Arc::new(SharedState::new());
        let (tx, mut rx) = mpsc::channel(8);
        state.set_uplink_sender(tx);
        state.set_sync_in_progress(true);
        let handler = DownlinkHandler::new(state.clone(), Arc::new(OkProcessor));

        let mut msg = downlink(3);
        msg.edge_configuration = Some(edge_configuration(Some(Uuid::new_v4())));
        handler.handle(msg);

        assert!(matches!(
            recv_response(&mut rx).await,
            WsMessage::DownlinkResponseMsg(_)
        ));
        // No follow-up sync request while one is already running.
        let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err(), "unexpected frame: {extra:?}");
    }

    #[test]
    fn flatten_cause_joins_source_chain() {
        let err = DownlinkError::Store(StoreError::IntegrityCheckFailed("bad page".to_owned()));
        let flat = flatten_cause(&err);
        assert!(flat.starts_with("store: Integrity: bad page"), "got: {flat}");
        assert!(flat.ends_with(": Integrity: bad page"), "got: {flat}");
    }
}
