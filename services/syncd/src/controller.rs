//! Session lifecycle: connect, handshake, run, reconnect.
//!
//! The controller owns the connection state machine.  A completed handshake
//! flips the manager to initialized; any session exit flips it back,
//! publishes disconnection, and schedules a fixed-rate reconnect.  The one
//! fatal path is a handshake from an incompatible cloud build, which is
//! surfaced to `main` as an exit request rather than retried.

use crate::batcher::AckRegistry;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityReporter;
use crate::cursor::CursorStore;
use crate::downlink::{DownlinkHandler, DownlinkProcessor};
use crate::model::{EdgeSettings, EntityType, EventAction};
use crate::session::CloudSession;
use crate::state::SharedState;
use crate::storage::{StoreError, SyncStore};
use el_protocol::{EdgeConfiguration, SyncRequestMsg, WsMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{error, info, warn};

/// The cloud build variant this edge accepts.
pub const SUPPORTED_CLOUD_TYPE: &str = "CE";

/// Why the controller wants the process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Handshake arrived from a non-CE cloud; the deployment is wrong and
    /// retrying cannot fix it.
    CloudTypeMismatch,
}

#[derive(Debug, thiserror::Error)]
enum HandshakeError {
    #[error("incompatible cloud type")]
    Incompatible,
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

pub struct SessionController {
    cfg: SyncConfig,
    store: Arc<Mutex<SyncStore>>,
    state: Arc<SharedState>,
    registry: Arc<AckRegistry>,
    processor: Arc<dyn DownlinkProcessor>,
    cursor: CursorStore,
    connectivity: ConnectivityReporter,
}

impl SessionController {
    pub fn new(
        cfg: SyncConfig,
        store: Arc<Mutex<SyncStore>>,
        state: Arc<SharedState>,
        registry: Arc<AckRegistry>,
        processor: Arc<dyn DownlinkProcessor>,
    ) -> Self {
        let cursor = CursorStore::new(store.clone());
        let connectivity = ConnectivityReporter::new(store.clone(), state.clone());
        SessionController {
            cfg,
            store,
            state,
            registry,
            processor,
            cursor,
            connectivity,
        }
    }

    /// Drive connect/handshake/run/reconnect until shutdown or a fatal
    /// handshake.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Option<ExitReason> {
        let reconnect = Duration::from_millis(self.cfg.cloud.reconnect_timeout_ms);
        loop {
            if *shutdown.borrow() {
                return None;
            }

            match CloudSession::connect(&self.cfg.cloud).await {
                Err(e) => warn!(error = %e, "cloud connect failed"),
                Ok(session) => {
                    let edge_cfg = session.configuration().clone();
                    // Outbound frames (sync requests, uplinks, downlink
                    // responses) queue here until the frame loop drains them.
                    let (tx, rx) = mpsc::channel::<WsMessage>(64);
                    self.state.set_uplink_sender(tx);

                    match self.process_handshake(&edge_cfg).await {
                        Err(HandshakeError::Incompatible) => {
                            self.state.clear_uplink_sender();
                            return Some(ExitReason::CloudTypeMismatch);
                        }
                        Err(HandshakeError::Store(e)) => {
                            warn!(error = %e, "handshake failed");
                            self.state.clear_uplink_sender();
                        }
                        Ok(()) => {
                            self.connectivity.publish(true).await;
                            self.state.set_initialized(true);
                            info!(
                                edge_id = %edge_cfg.edge_id,
                                tenant_id = %edge_cfg.tenant_id,
                                "edge session established"
                            );

                            let handler =
                                DownlinkHandler::new(self.state.clone(), self.processor.clone());
                            let result = session
                                .run(self.registry.clone(), handler, rx, shutdown.clone())
                                .await;

                            self.state.set_initialized(false);
                            self.state.set_sync_in_progress(false);
                            self.state.clear_uplink_sender();
                            self.connectivity.publish(false).await;

                            match result {
                                Ok(()) => return None,
                                Err(e) => warn!(error = %e, "session ended"),
                            }
                        }
                    }
                }
            }

            if !idle(&mut shutdown, reconnect).await {
                return None;
            }
        }
    }

    /// Apply the handshake payload: identity, settings reconciliation,
    /// cursor bootstrap, sync request, bootstrap events.
    async fn process_handshake(&self, cfg: &EdgeConfiguration) -> Result<(), HandshakeError> {
        if cfg.cloud_type != SUPPORTED_CLOUD_TYPE {
            error!(
                cloud_type = %cfg.cloud_type,
                "edge only supports {SUPPORTED_CLOUD_TYPE} cloud, shutting down"
            );
            return Err(HandshakeError::Incompatible);
        }

        self.state.set_tenant(cfg.tenant_id);
        self.state
            .set_max_inbound_message_size(cfg.max_inbound_message_size as usize);

        let current = {
            let mut store = self.store.lock().await;
            match store.load_edge_settings(cfg.tenant_id)? {
                Some(cur) if cur.edge_id != cfg.edge_id => {
                    warn!(
                        stored_edge_id = %cur.edge_id,
                        edge_id = %cfg.edge_id,
                        "edge id changed, purging stale tenant state"
                    );
                    store.purge_tenant(cfg.tenant_id)?;
                    None
                }
                other => other,
            }
        };

        let (queue_start_ts, _) = self.cursor.load(cfg.tenant_id).await?;
        self.state.set_queue_start_ts(queue_start_ts);

        let previous_customer = current.as_ref().and_then(|s| s.customer_id);
        let customer_updated = previous_customer != cfg.customer_id;
        self.state.replace_customer(cfg.customer_id);
        let full_sync_required = current.as_ref().is_none_or(|s| s.full_sync_required);
        let full_sync = full_sync_required | customer_updated;

        if self
            .state
            .send_to_cloud(WsMessage::SyncRequestMsg(SyncRequestMsg { full_sync }))
            .await
        {
            self.state.set_sync_in_progress(true);
            info!(full_sync, "sync requested");
        } else {
            warn!("failed to queue sync request");
        }

        let settings = EdgeSettings {
            edge_id: cfg.edge_id,
            tenant_id: cfg.tenant_id,
            customer_id: cfg.customer_id,
            name: cfg.name.clone(),
            edge_type: cfg.edge_type.clone(),
            routing_key: cfg.routing_key.clone(),
            // The sync request for this connection is already queued.
            full_sync_required: false,
        };
        {
            let mut store = self.store.lock().await;
            store.save_edge_settings(&settings)?;
            // Bootstrap requests for the edge's own attributes and relations
            // flow through the normal uplink path.
            store.append_event(
                cfg.tenant_id,
                EntityType::Edge,
                EventAction::AttributesRequest,
                Some(cfg.edge_id),
                serde_json::json!({}),
            )?;
            store.append_event(
                cfg.tenant_id,
                EntityType::Edge,
                EventAction::RelationRequest,
                Some(cfg.edge_id),
                serde_json::json!({}),
            )?;
        }
        self.state.set_settings(settings);

        Ok(())
    }
}

/// Sleep that wakes early on shutdown.  Returns false when shutting down.
pub(crate) async fn idle(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        _ = shutdown.changed() => !*shutdown.borrow(),
    }
}
