//! Mock cloud server for integration testing.
//!
//! Binds to port 0 (random) and exposes the actual bound port.  Each test
//! can spin up its own isolated server instance.
//!
//! # Protocol behavior
//!
//! - First message from a client must be `edge_hello`.  The server answers
//!   with the configured `edge_configuration`.
//! - Subsequent `uplink_msg` frames are answered per the current
//!   [`AckPolicy`].
//! - Downlinks and other server-initiated frames are injected through the
//!   [`CloudHandle`]; a forced disconnect closes every live connection.

use el_protocol::{EdgeConfiguration, UplinkResponseMsg, WsMessage};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::Message;

/// How the server answers incoming uplink messages.
#[derive(Debug, Clone)]
pub enum AckPolicy {
    /// Positive ack for everything.
    AckAll,
    /// Never answer; the client's latch waits run into their timeout.
    Silent,
    /// Swallow the ack for each listed id once, then ack normally.
    DropOnce(HashSet<i32>),
    /// Negative ack for each listed id once, then ack normally.
    NackOnce(HashSet<i32>),
}

#[derive(Debug, Clone)]
enum ServerCmd {
    Inject(WsMessage),
    Disconnect,
}

struct CloudShared {
    edge_configuration: Mutex<EdgeConfiguration>,
    ack_policy: Mutex<AckPolicy>,
    received: Mutex<Vec<WsMessage>>,
    cmd_tx: broadcast::Sender<ServerCmd>,
}

/// Cloneable handle to observe and script a running [`MockCloudServer`].
#[derive(Clone)]
pub struct CloudHandle {
    inner: Arc<CloudShared>,
}

impl CloudHandle {
    pub fn set_ack_policy(&self, policy: AckPolicy) {
        *self.inner.ack_policy.lock().unwrap() = policy;
    }

    /// Replace the handshake payload served to the next connection.
    pub fn set_edge_configuration(&self, cfg: EdgeConfiguration) {
        *self.inner.edge_configuration.lock().unwrap() = cfg;
    }

    /// Push a server-initiated frame (downlink, error) to every connection.
    pub fn inject(&self, msg: WsMessage) {
        let _ = self.inner.cmd_tx.send(ServerCmd::Inject(msg));
    }

    /// Close every live connection.
    pub fn disconnect_all(&self) {
        let _ = self.inner.cmd_tx.send(ServerCmd::Disconnect);
    }

    /// Snapshot of every frame received so far, oldest first.
    pub fn received(&self) -> Vec<WsMessage> {
        self.inner.received.lock().unwrap().clone()
    }

    /// Received uplink messages only.
    pub fn uplinks(&self) -> Vec<el_protocol::UplinkMsg> {
        self.received()
            .into_iter()
            .filter_map(|m| match m {
                WsMessage::UplinkMsg(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    /// Received sync requests only.
    pub fn sync_requests(&self) -> Vec<el_protocol::SyncRequestMsg> {
        self.received()
            .into_iter()
            .filter_map(|m| match m {
                WsMessage::SyncRequestMsg(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// Poll until `pred` holds over the received frames, or time out.
    pub async fn wait_for<F>(&self, mut pred: F, timeout: Duration) -> bool
    where
        F: FnMut(&[WsMessage]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred(&self.received()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A mock cloud server for integration testing.
pub struct MockCloudServer {
    addr: SocketAddr,
    handle: CloudHandle,
    /// Handle to the background accept loop; dropped when the server is dropped.
    _task: tokio::task::JoinHandle<()>,
}

impl MockCloudServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start(
        edge_configuration: EdgeConfiguration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (cmd_tx, _) = broadcast::channel(64);
        let shared = Arc::new(CloudShared {
            edge_configuration: Mutex::new(edge_configuration),
            ack_policy: Mutex::new(AckPolicy::AckAll),
            received: Mutex::new(Vec::new()),
            cmd_tx,
        });
        let handle = CloudHandle {
            inner: shared.clone(),
        };

        let task = tokio::spawn(async move {
            Self::accept_loop(listener, shared).await;
        });

        Ok(Self {
            addr,
            handle,
            _task: task,
        })
    }

    /// Return the address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL of this server.
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn handle(&self) -> CloudHandle {
        self.handle.clone()
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, shared: Arc<CloudShared>) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        // Connection errors are expected in tests (client drops).
                        let _ = Self::handle_connection(stream, shared).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        shared: Arc<CloudShared>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut ws = tokio_tungstenite::accept_async(stream).await?;
        let mut cmd_rx = shared.cmd_tx.subscribe();
        let mut hello_received = false;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Ok(ServerCmd::Inject(msg)) => {
                            let json = serde_json::to_string(&msg)?;
                            ws.send(Message::Text(json.into())).await?;
                        }
                        Ok(ServerCmd::Disconnect) => {
                            let _ = ws.close(None).await;
                            return Ok(());
                        }
                        Err(_) => return Ok(()),
                    }
                }
                frame = ws.next() => {
                    let msg = match frame {
                        None => return Ok(()),
                        Some(Err(_)) => return Ok(()),
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(_))) => return Ok(()),
                        Some(Ok(Message::Ping(data))) => {
                            ws.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(_)) => continue,
                    };
                    let ws_msg: WsMessage = serde_json::from_str(&msg)?;
                    shared.received.lock().unwrap().push(ws_msg.clone());

                    match ws_msg {
                        WsMessage::EdgeHello(_) if !hello_received => {
                            hello_received = true;
                            let cfg = shared.edge_configuration.lock().unwrap().clone();
                            let json = serde_json::to_string(&WsMessage::EdgeConfiguration(cfg))?;
                            ws.send(Message::Text(json.into())).await?;
                        }
                        WsMessage::UplinkMsg(uplink) => {
                            let response = Self::ack_for(&shared, uplink.uplink_msg_id);
                            if let Some(resp) = response {
                                let json = serde_json::to_string(
                                    &WsMessage::UplinkResponseMsg(resp),
                                )?;
                                ws.send(Message::Text(json.into())).await?;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn ack_for(shared: &CloudShared, uplink_msg_id: i32) -> Option<UplinkResponseMsg> {
        let mut policy = shared.ack_policy.lock().unwrap();
        match &mut *policy {
            AckPolicy::AckAll => Some(UplinkResponseMsg {
                uplink_msg_id,
                success: true,
                error_msg: None,
            }),
            AckPolicy::Silent => None,
            AckPolicy::DropOnce(ids) => {
                if ids.remove(&uplink_msg_id) {
                    None
                } else {
                    Some(UplinkResponseMsg {
                        uplink_msg_id,
                        success: true,
                        error_msg: None,
                    })
                }
            }
            AckPolicy::NackOnce(ids) => {
                if ids.remove(&uplink_msg_id) {
                    Some(UplinkResponseMsg {
                        uplink_msg_id,
                        success: false,
                        error_msg: Some("rejected".to_owned()),
                    })
                } else {
                    Some(UplinkResponseMsg {
                        uplink_msg_id,
                        success: true,
                        error_msg: None,
                    })
                }
            }
        }
    }
}

/// A plausible default handshake payload for tests.
pub fn default_edge_configuration() -> EdgeConfiguration {
    EdgeConfiguration {
        tenant_id: uuid::Uuid::new_v4(),
        edge_id: uuid::Uuid::new_v4(),
        customer_id: None,
        name: "test-edge".to_owned(),
        edge_type: "default".to_owned(),
        routing_key: "test-routing-key".to_owned(),
        cloud_type: "CE".to_owned(),
        max_inbound_message_size: 65536,
    }
}
