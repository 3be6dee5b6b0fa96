//! Event-to-uplink translation.
//!
//! Every log entry is routed to one domain translator.  Lifecycle actions
//! route by entity type; telemetry and request actions route by the action
//! itself.  A translator returning `Ok(None)` marks an unsupported
//! combination (skipped, debug-logged); a translator error drops only that
//! event and the batch continues.

use crate::model::{EntityType, EventAction, EventLogEntry};
use el_protocol::{UplinkMsg, UplinkPayload};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

pub trait EventTranslator: Send + Sync {
    fn translate(&self, entry: &EventLogEntry) -> Result<Option<UplinkPayload>, TranslateError>;
}

fn require_entity_id(entry: &EventLogEntry) -> Result<Uuid, TranslateError> {
    entry.entity_id.ok_or(TranslateError::MissingField("entity_id"))
}

// ---------------------------------------------------------------------------
// Domain translators
// ---------------------------------------------------------------------------

struct DeviceTranslator;

impl EventTranslator for DeviceTranslator {
    fn translate(&self, entry: &EventLogEntry) -> Result<Option<UplinkPayload>, TranslateError> {
        if entry.action.is_lifecycle() {
            return Ok(Some(UplinkPayload::DeviceUpdate {
                action: entry.action.as_str().to_owned(),
                entity_id: require_entity_id(entry)?,
                entity: entry.payload.clone(),
            }));
        }
        if entry.action == EventAction::RpcCall {
            let request_id = entry
                .payload
                .get("request_id")
                .and_then(serde_json::Value::as_i64)
                .ok_or(TranslateError::MissingField("request_id"))?;
            let response = entry
                .payload
                .get("response")
                .cloned()
                .ok_or(TranslateError::MissingField("response"))?;
            return Ok(Some(UplinkPayload::RpcResponse {
                device_id: require_entity_id(entry)?,
                request_id: request_id as i32,
                response,
            }));
        }
        Ok(None)
    }
}

struct AssetTranslator;

impl EventTranslator for AssetTranslator {
    fn translate(&self, entry: &EventLogEntry) -> Result<Option<UplinkPayload>, TranslateError> {
        if !entry.action.is_lifecycle() {
            return Ok(None);
        }
        Ok(Some(UplinkPayload::AssetUpdate {
            action: entry.action.as_str().to_owned(),
            entity_id: require_entity_id(entry)?,
            entity: entry.payload.clone(),
        }))
    }
}

struct DashboardTranslator;

impl EventTranslator for DashboardTranslator {
    fn translate(&self, entry: &EventLogEntry) -> Result<Option<UplinkPayload>, TranslateError> {
        if !entry.action.is_lifecycle() {
            return Ok(None);
        }
        Ok(Some(UplinkPayload::DashboardUpdate {
            action: entry.action.as_str().to_owned(),
            entity_id: require_entity_id(entry)?,
            entity: entry.payload.clone(),
        }))
    }
}

struct EntityViewTranslator;

impl EventTranslator for EntityViewTranslator {
    fn translate(&self, entry: &EventLogEntry) -> Result<Option<UplinkPayload>, TranslateError> {
        if entry.action.is_lifecycle() {
            return Ok(Some(UplinkPayload::EntityViewUpdate {
                action: entry.action.as_str().to_owned(),
                entity_id: require_entity_id(entry)?,
                entity: entry.payload.clone(),
            }));
        }
        if entry.action == EventAction::EntityViewRequest {
            return Ok(Some(UplinkPayload::EntityViewRequest {
                entity_id: require_entity_id(entry)?,
            }));
        }
        Ok(None)
    }
}

struct RelationTranslator;

impl EventTranslator for RelationTranslator {
    fn translate(&self, entry: &EventLogEntry) -> Result<Option<UplinkPayload>, TranslateError> {
        match entry.action {
            EventAction::RelationAddOrUpdate | EventAction::RelationDeleted => {
                Ok(Some(UplinkPayload::RelationUpdate {
                    action: entry.action.as_str().to_owned(),
                    relation: entry.payload.clone(),
                }))
            }
            EventAction::RelationRequest => Ok(Some(UplinkPayload::RelationRequest {
                entity_id: require_entity_id(entry)?,
            })),
            _ => Ok(None),
        }
    }
}

struct AlarmTranslator;

impl EventTranslator for AlarmTranslator {
    fn translate(&self, entry: &EventLogEntry) -> Result<Option<UplinkPayload>, TranslateError> {
        if !entry.action.is_lifecycle() {
            return Ok(None);
        }
        Ok(Some(UplinkPayload::AlarmUpdate {
            action: entry.action.as_str().to_owned(),
            entity_id: require_entity_id(entry)?,
            entity: entry.payload.clone(),
        }))
    }
}

struct TelemetryTranslator;

impl EventTranslator for TelemetryTranslator {
    fn translate(&self, entry: &EventLogEntry) -> Result<Option<UplinkPayload>, TranslateError> {
        match entry.action {
            EventAction::AttributesUpdated
            | EventAction::PostAttributes
            | EventAction::AttributesDeleted
            | EventAction::TimeseriesUpdated => Ok(Some(UplinkPayload::TelemetryData {
                entity_id: require_entity_id(entry)?,
                action: entry.action.as_str().to_owned(),
                data: entry.payload.clone(),
            })),
            EventAction::AttributesRequest => Ok(Some(UplinkPayload::AttributesRequest {
                entity_id: require_entity_id(entry)?,
            })),
            _ => Ok(None),
        }
    }
}

struct RuleChainTranslator;

impl EventTranslator for RuleChainTranslator {
    fn translate(&self, entry: &EventLogEntry) -> Result<Option<UplinkPayload>, TranslateError> {
        if entry.action == EventAction::RuleChainMetadataRequest {
            return Ok(Some(UplinkPayload::RuleChainMetadataRequest {
                rule_chain_id: require_entity_id(entry)?,
            }));
        }
        Ok(None)
    }
}

struct EntityTranslator;

impl EventTranslator for EntityTranslator {
    fn translate(&self, entry: &EventLogEntry) -> Result<Option<UplinkPayload>, TranslateError> {
        if entry.action == EventAction::CredentialsRequest {
            return Ok(Some(UplinkPayload::CredentialsRequest {
                entity_id: require_entity_id(entry)?,
            }));
        }
        Ok(None)
    }
}

struct WidgetBundleTranslator;

impl EventTranslator for WidgetBundleTranslator {
    fn translate(&self, entry: &EventLogEntry) -> Result<Option<UplinkPayload>, TranslateError> {
        if entry.action == EventAction::WidgetBundleTypesRequest {
            return Ok(Some(UplinkPayload::WidgetBundleTypesRequest {
                bundle_id: require_entity_id(entry)?,
            }));
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Dispatches each event to the right domain translator.
pub struct TranslatorRegistry {
    device: Arc<dyn EventTranslator>,
    asset: Arc<dyn EventTranslator>,
    dashboard: Arc<dyn EventTranslator>,
    entity_view: Arc<dyn EventTranslator>,
    relation: Arc<dyn EventTranslator>,
    alarm: Arc<dyn EventTranslator>,
    telemetry: Arc<dyn EventTranslator>,
    rule_chain: Arc<dyn EventTranslator>,
    entity: Arc<dyn EventTranslator>,
    widget_bundle: Arc<dyn EventTranslator>,
}

impl TranslatorRegistry {
    pub fn with_defaults() -> Self {
        TranslatorRegistry {
            device: Arc::new(DeviceTranslator),
            asset: Arc::new(AssetTranslator),
            dashboard: Arc::new(DashboardTranslator),
            entity_view: Arc::new(EntityViewTranslator),
            relation: Arc::new(RelationTranslator),
            alarm: Arc::new(AlarmTranslator),
            telemetry: Arc::new(TelemetryTranslator),
            rule_chain: Arc::new(RuleChainTranslator),
            entity: Arc::new(EntityTranslator),
            widget_bundle: Arc::new(WidgetBundleTranslator),
        }
    }

    fn route(&self, entry: &EventLogEntry) -> Option<&Arc<dyn EventTranslator>> {
        if entry.action.is_lifecycle() {
            return match entry.entity_type {
                EntityType::Device => Some(&self.device),
                EntityType::Asset => Some(&self.asset),
                EntityType::Dashboard => Some(&self.dashboard),
                EntityType::EntityView => Some(&self.entity_view),
                EntityType::Relation => Some(&self.relation),
                EntityType::Alarm => Some(&self.alarm),
                _ => None,
            };
        }
        match entry.action {
            EventAction::AttributesUpdated
            | EventAction::PostAttributes
            | EventAction::AttributesDeleted
            | EventAction::TimeseriesUpdated
            | EventAction::AttributesRequest => Some(&self.telemetry),
            EventAction::RelationRequest => Some(&self.relation),
            EventAction::RuleChainMetadataRequest => Some(&self.rule_chain),
            EventAction::CredentialsRequest => Some(&self.entity),
            EventAction::RpcCall => Some(&self.device),
            EventAction::WidgetBundleTypesRequest => Some(&self.widget_bundle),
            EventAction::EntityViewRequest => Some(&self.entity_view),
            _ => None,
        }
    }

    /// Translate a page of events into uplink messages.
    ///
    /// `uplink_msg_id` is assigned per batch, starting at 1.  Failed or
    /// unsupported events are dropped individually; the rest of the batch
    /// is unaffected.
    pub fn translate_all(&self, entries: &[EventLogEntry]) -> Vec<UplinkMsg> {
        let mut msgs = Vec::with_capacity(entries.len());
        let mut next_id: i32 = 1;
        for entry in entries {
            let Some(translator) = self.route(entry) else {
                debug!(
                    entity_type = %entry.entity_type,
                    action = %entry.action,
                    "no translator for event, skipping"
                );
                continue;
            };
            match translator.translate(entry) {
                Ok(Some(payload)) => {
                    msgs.push(UplinkMsg {
                        uplink_msg_id: next_id,
                        payloads: vec![payload],
                    });
                    next_id += 1;
                }
                Ok(None) => {
                    debug!(
                        entity_type = %entry.entity_type,
                        action = %entry.action,
                        "unsupported event combination, skipping"
                    );
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        seq_id = entry.seq_id,
                        entity_type = %entry.entity_type,
                        action = %entry.action,
                        "translation failed, dropping event"
                    );
                }
            }
        }
        msgs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(entity_type: EntityType, action: EventAction, payload: serde_json::Value) -> EventLogEntry {
        EventLogEntry {
            uuid: Uuid::now_v7(),
            seq_id: 1,
            tenant_id: Uuid::new_v4(),
            entity_type,
            action,
            entity_id: Some(Uuid::new_v4()),
            payload,
            created_ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[test]
    fn lifecycle_routes_by_entity_type() {
        let registry = TranslatorRegistry::with_defaults();
        let msgs = registry.translate_all(&[
            entry(EntityType::Device, EventAction::Added, json!({"name": "d"})),
            entry(EntityType::Asset, EventAction::Updated, json!({"name": "a"})),
            entry(EntityType::Alarm, EventAction::AlarmAck, json!({"sev": "minor"})),
        ]);
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[0].payloads[0], UplinkPayload::DeviceUpdate { .. }));
        assert!(matches!(msgs[1].payloads[0], UplinkPayload::AssetUpdate { .. }));
        assert!(matches!(msgs[2].payloads[0], UplinkPayload::AlarmUpdate { .. }));
    }

    #[test]
    fn telemetry_and_request_actions_route_by_action() {
        let registry = TranslatorRegistry::with_defaults();
        let msgs = registry.translate_all(&[
            entry(EntityType::Device, EventAction::TimeseriesUpdated, json!({"t": 1})),
            entry(EntityType::Device, EventAction::AttributesRequest, json!({})),
            entry(EntityType::RuleChain, EventAction::RuleChainMetadataRequest, json!({})),
            entry(EntityType::WidgetBundle, EventAction::WidgetBundleTypesRequest, json!({})),
        ]);
        assert_eq!(msgs.len(), 4);
        assert!(matches!(msgs[0].payloads[0], UplinkPayload::TelemetryData { .. }));
        assert!(matches!(msgs[1].payloads[0], UplinkPayload::AttributesRequest { .. }));
        assert!(matches!(msgs[2].payloads[0], UplinkPayload::RuleChainMetadataRequest { .. }));
        assert!(matches!(msgs[3].payloads[0], UplinkPayload::WidgetBundleTypesRequest { .. }));
    }

    #[test]
    fn msg_ids_are_batch_unique_from_one() {
        let registry = TranslatorRegistry::with_defaults();
        let msgs = registry.translate_all(&[
            entry(EntityType::Device, EventAction::Added, json!({})),
            entry(EntityType::Device, EventAction::Updated, json!({})),
            entry(EntityType::Device, EventAction::Deleted, json!({})),
        ]);
        assert_eq!(
            msgs.iter().map(|m| m.uplink_msg_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn translator_failure_drops_only_that_event() {
        let registry = TranslatorRegistry::with_defaults();
        // RPC_CALL without request_id fails; neighbors survive.
        let msgs = registry.translate_all(&[
            entry(EntityType::Device, EventAction::Added, json!({})),
            entry(EntityType::Device, EventAction::RpcCall, json!({"no": "fields"})),
            entry(EntityType::Device, EventAction::Deleted, json!({})),
        ]);
        assert_eq!(msgs.len(), 2);
        assert_eq!(
            msgs.iter().map(|m| m.uplink_msg_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn unsupported_combination_is_skipped() {
        let registry = TranslatorRegistry::with_defaults();
        // Lifecycle action on a RULE_CHAIN entity has no translator route.
        let msgs = registry.translate_all(&[entry(
            EntityType::RuleChain,
            EventAction::Updated,
            json!({}),
        )]);
        assert!(msgs.is_empty());
    }

    #[test]
    fn rpc_call_translates_to_rpc_response() {
        let registry = TranslatorRegistry::with_defaults();
        let msgs = registry.translate_all(&[entry(
            EntityType::Device,
            EventAction::RpcCall,
            json!({"request_id": 9, "response": {"ok": true}}),
        )]);
        assert_eq!(msgs.len(), 1);
        match &msgs[0].payloads[0] {
            UplinkPayload::RpcResponse { request_id, .. } => assert_eq!(*request_id, 9),
            other => panic!("expected RpcResponse, got {other:?}"),
        }
    }
}
