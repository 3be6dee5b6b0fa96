// el-protocol: Edge-to-cloud sync protocol types and serialization.
//
// All WebSocket messages use a top-level `kind` field for discriminated
// deserialization.  The enum variants map 1:1 to the frozen v1 message kinds.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Handshake messages
// ---------------------------------------------------------------------------

/// Edge hello message.
///
/// Sent as the first frame after connecting.  Does NOT carry the secret --
/// the secret travels in the `Authorization` header of the WS upgrade
/// request.  The cloud answers with `edge_configuration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeHello {
    /// Routing key identifying this edge; must match the credentials the
    /// connection authenticated with.
    pub routing_key: String,
}

/// Cloud-to-edge handshake payload.
///
/// Sent once as the first frame after a valid `edge_hello`, and possibly
/// again mid-session inside a `downlink_msg` when the edge's attribution
/// changes on the cloud side (e.g. customer reassignment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeConfiguration {
    pub tenant_id: Uuid,
    pub edge_id: Uuid,
    /// Absent when the edge is not assigned to a customer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<Uuid>,
    pub name: String,
    pub edge_type: String,
    pub routing_key: String,
    /// Cloud build variant.  This edge build only accepts `"CE"`.
    pub cloud_type: String,
    /// Largest serialized uplink message the cloud will accept, in bytes.
    pub max_inbound_message_size: u32,
}

// ---------------------------------------------------------------------------
// Uplink (edge -> cloud)
// ---------------------------------------------------------------------------

/// One typed payload inside an uplink message.
///
/// Entity lifecycle variants carry the action verb plus the entity body as
/// it was captured in the edge event log.  The request family asks the
/// cloud to push state back down via downlinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum UplinkPayload {
    DeviceUpdate {
        action: String,
        entity_id: Uuid,
        entity: serde_json::Value,
    },
    AssetUpdate {
        action: String,
        entity_id: Uuid,
        entity: serde_json::Value,
    },
    DashboardUpdate {
        action: String,
        entity_id: Uuid,
        entity: serde_json::Value,
    },
    EntityViewUpdate {
        action: String,
        entity_id: Uuid,
        entity: serde_json::Value,
    },
    AlarmUpdate {
        action: String,
        entity_id: Uuid,
        entity: serde_json::Value,
    },
    RelationUpdate {
        action: String,
        relation: serde_json::Value,
    },
    /// Attribute writes/deletes and timeseries points for one entity.
    TelemetryData {
        entity_id: Uuid,
        action: String,
        data: serde_json::Value,
    },
    /// Ask the cloud to resend current attributes of an entity.
    AttributesRequest { entity_id: Uuid },
    /// Ask the cloud to resend relations touching an entity.
    RelationRequest { entity_id: Uuid },
    RuleChainMetadataRequest { rule_chain_id: Uuid },
    CredentialsRequest { entity_id: Uuid },
    /// Response leg of an edge-originated RPC exchange.
    RpcResponse {
        device_id: Uuid,
        request_id: i32,
        response: serde_json::Value,
    },
    WidgetBundleTypesRequest { bundle_id: Uuid },
    EntityViewRequest { entity_id: Uuid },
}

/// A single uplink message.
///
/// `uplink_msg_id` is unique within one batch and is the correlation key
/// for `uplink_response_msg` acks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkMsg {
    pub uplink_msg_id: i32,
    pub payloads: Vec<UplinkPayload>,
}

impl UplinkMsg {
    /// Serialized wire size in bytes.
    ///
    /// Used by the batcher to drop messages exceeding the cloud's negotiated
    /// max inbound size before they reach the socket.
    pub fn serialized_size(&self) -> usize {
        serde_json::to_string(&WsMessage::UplinkMsg(self.clone()))
            .map(|s| s.len())
            .unwrap_or(usize::MAX)
    }
}

/// Cloud acknowledgement of a single uplink message.
///
/// `success = false` means the cloud saw the message but rejected it; the
/// edge keeps it pending and resends on the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkResponseMsg {
    pub uplink_msg_id: i32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

// ---------------------------------------------------------------------------
// Downlink (cloud -> edge)
// ---------------------------------------------------------------------------

/// One typed payload inside a downlink message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum DownlinkPayload {
    EntityUpdate {
        entity_type: String,
        action: String,
        entity_id: Uuid,
        entity: serde_json::Value,
    },
    AttributesUpdate {
        entity_id: Uuid,
        scope: String,
        attributes: serde_json::Value,
    },
    TelemetryData {
        entity_id: Uuid,
        data: serde_json::Value,
    },
    RelationUpdate {
        action: String,
        relation: serde_json::Value,
    },
    RpcRequest {
        device_id: Uuid,
        request_id: i32,
        method: String,
        params: serde_json::Value,
    },
}

/// A cloud-to-edge message.
///
/// May carry a fresh `edge_configuration` (customer reassignment), a
/// `sync_completed` marker ending a full-sync window, payloads, or any
/// combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownlinkMsg {
    pub downlink_msg_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_configuration: Option<EdgeConfiguration>,
    #[serde(default)]
    pub sync_completed: bool,
    #[serde(default)]
    pub payloads: Vec<DownlinkPayload>,
}

/// Edge acknowledgement of a downlink message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownlinkResponseMsg {
    pub downlink_msg_id: i32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

// ---------------------------------------------------------------------------
// Sync control
// ---------------------------------------------------------------------------

/// Edge-to-cloud request to (re)send the state the edge should mirror.
///
/// `full_sync = true` asks for everything; `false` asks for the delta since
/// the last completed sync.  The cloud marks the end of the window with a
/// `downlink_msg` carrying `sync_completed = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequestMsg {
    pub full_sync: bool,
}

/// Protocol error message (cloud -> edge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

/// Frozen v1 error codes.
pub mod error_codes {
    pub const INVALID_CREDENTIALS: &str = "INVALID_CREDENTIALS";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All WebSocket message kinds in the v1 edge sync protocol.
///
/// Serializes/deserializes using the `kind` field as a tag.
///
/// ```json
/// { "kind": "uplink_msg", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum WsMessage {
    EdgeHello(EdgeHello),
    EdgeConfiguration(EdgeConfiguration),
    UplinkMsg(UplinkMsg),
    UplinkResponseMsg(UplinkResponseMsg),
    DownlinkMsg(DownlinkMsg),
    DownlinkResponseMsg(DownlinkResponseMsg),
    SyncRequestMsg(SyncRequestMsg),
    Error(ErrorMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_message_round_trips_with_kind_tag() {
        let msg = WsMessage::UplinkResponseMsg(UplinkResponseMsg {
            uplink_msg_id: 7,
            success: true,
            error_msg: None,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"uplink_response_msg\""));
        let back: WsMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn downlink_optional_fields_default() {
        let json = r#"{"kind":"downlink_msg","downlink_msg_id":3}"#;
        let msg: WsMessage = serde_json::from_str(json).unwrap();
        match msg {
            WsMessage::DownlinkMsg(d) => {
                assert_eq!(d.downlink_msg_id, 3);
                assert!(d.edge_configuration.is_none());
                assert!(!d.sync_completed);
                assert!(d.payloads.is_empty());
            }
            other => panic!("expected DownlinkMsg, got {other:?}"),
        }
    }

    #[test]
    fn serialized_size_grows_with_payload() {
        let small = UplinkMsg {
            uplink_msg_id: 1,
            payloads: vec![UplinkPayload::AttributesRequest {
                entity_id: Uuid::nil(),
            }],
        };
        let big = UplinkMsg {
            uplink_msg_id: 1,
            payloads: vec![UplinkPayload::TelemetryData {
                entity_id: Uuid::nil(),
                action: "timeseries_updated".to_owned(),
                data: serde_json::json!({ "values": vec![0u8; 64] }),
            }],
        };
        assert!(big.serialized_size() > small.serialized_size());
    }
}
