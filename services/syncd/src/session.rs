//! Cloud WebSocket session.
//!
//! Connects to the cloud, performs the hello/edge-configuration handshake,
//! then runs the frame loop: outbound messages drain from a channel, inbound
//! frames dispatch to the ack registry (uplink responses) or the downlink
//! handler.  The loop never blocks on dispatch; acks only flip state and
//! count latches down.
//!
//! # Protocol
//! 1. Connect to `cloud.base_url + ws_path` (ws:// or wss://), secret as
//!    `Authorization: Bearer` header
//! 2. Send `EdgeHello` with the routing key
//! 3. Receive `EdgeConfiguration` — the session identity for this connection
//! 4. Exchange `UplinkMsg`/`UplinkResponseMsg`, `DownlinkMsg`/
//!    `DownlinkResponseMsg`, `SyncRequestMsg` frames

use crate::batcher::AckRegistry;
use crate::config::CloudConfig;
use crate::downlink::DownlinkHandler;
use el_protocol::{EdgeConfiguration, EdgeHello, WsMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connect: {0}")]
    Connect(String),
    #[error("WS: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Protocol: {0}")]
    Protocol(String),
    #[error("Disconnected")]
    Disconnected,
}

/// An established session holding the handshake configuration.
pub struct CloudSession {
    ws: WsStream,
    configuration: EdgeConfiguration,
}

impl CloudSession {
    /// Connect and complete the handshake.
    pub async fn connect(cloud: &CloudConfig) -> Result<Self, SessionError> {
        use tokio_tungstenite::connect_async;

        let request = build_ws_request(&cloud.ws_url(), &cloud.secret)?;
        let (mut ws, _response) = connect_async(request)
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;

        let hello = WsMessage::EdgeHello(EdgeHello {
            routing_key: cloud.routing_key.clone(),
        });
        let json = serde_json::to_string(&hello)?;
        ws.send(Message::Text(json.into())).await?;

        let configuration = match recv_ws_message(&mut ws).await? {
            WsMessage::EdgeConfiguration(cfg) => cfg,
            WsMessage::Error(e) => {
                return Err(SessionError::Protocol(format!(
                    "cloud error: {} - {}",
                    e.code, e.message
                )));
            }
            other => {
                return Err(SessionError::Protocol(format!(
                    "expected EdgeConfiguration, got: {other:?}"
                )));
            }
        };

        Ok(CloudSession { ws, configuration })
    }

    /// The handshake payload received from the cloud.
    pub fn configuration(&self) -> &EdgeConfiguration {
        &self.configuration
    }

    /// Run the frame loop until shutdown, close, or a transport error.
    ///
    /// Returns `Ok(())` only on shutdown; every other exit is an error the
    /// controller answers with a reconnect.
    pub async fn run(
        self,
        registry: Arc<AckRegistry>,
        downlink: DownlinkHandler,
        mut outbound: mpsc::Receiver<WsMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let mut ws = self.ws;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                }
                out = outbound.recv() => {
                    match out {
                        Some(msg) => {
                            let json = serde_json::to_string(&msg)?;
                            ws.send(Message::Text(json.into())).await?;
                        }
                        // All senders dropped: session is being torn down.
                        None => return Ok(()),
                    }
                }
                frame = ws.next() => {
                    match frame {
                        None => return Err(SessionError::Disconnected),
                        Some(Err(e)) => return Err(SessionError::Ws(e)),
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<WsMessage>(&text) {
                                Ok(WsMessage::UplinkResponseMsg(resp)) => registry.on_response(&resp),
                                Ok(WsMessage::DownlinkMsg(msg)) => downlink.handle(msg),
                                Ok(WsMessage::Error(e)) => {
                                    warn!(code = %e.code, message = %e.message, "cloud reported error");
                                }
                                Ok(other) => debug!(?other, "ignoring unexpected frame"),
                                Err(e) => warn!(error = %e, "failed to deserialize frame"),
                            }
                        }
                        Some(Ok(Message::Close(_))) => return Err(SessionError::Disconnected),
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws.send(Message::Pong(data)).await;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

async fn recv_ws_message(ws: &mut WsStream) -> Result<WsMessage, SessionError> {
    loop {
        match ws.next().await {
            None => return Err(SessionError::Disconnected),
            Some(Err(e)) => return Err(SessionError::Ws(e)),
            Some(Ok(msg)) => match msg {
                Message::Text(t) => {
                    let ws_msg: WsMessage = serde_json::from_str(&t)
                        .map_err(|e| SessionError::Protocol(format!("JSON parse: {e}")))?;
                    return Ok(ws_msg);
                }
                Message::Close(_) => return Err(SessionError::Disconnected),
                Message::Ping(data) => {
                    let _ = ws.send(Message::Pong(data)).await;
                    continue;
                }
                _ => continue,
            },
        }
    }
}

fn build_ws_request(
    url: &str,
    secret: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SessionError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| SessionError::Connect(format!("invalid URL '{url}': {e}")))?;

    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {secret}").parse().map_err(
            |e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
                SessionError::Connect(format!("invalid auth header: {e}"))
            },
        )?,
    );

    Ok(request)
}
