//! Core data model of the edge event log.
//!
//! Entries are immutable once appended.  `uuid` is a time-ordered v7 UUID,
//! so the wall-clock millisecond of creation is recoverable from the id
//! itself; `seq_id` is a monotone int64 that restarts at 1 when the log
//! cycles.

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Entity types
// ---------------------------------------------------------------------------

/// Kind of entity an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Device,
    Asset,
    Dashboard,
    EntityView,
    Relation,
    Alarm,
    RuleChain,
    WidgetBundle,
    Edge,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Device => "DEVICE",
            EntityType::Asset => "ASSET",
            EntityType::Dashboard => "DASHBOARD",
            EntityType::EntityView => "ENTITY_VIEW",
            EntityType::Relation => "RELATION",
            EntityType::Alarm => "ALARM",
            EntityType::RuleChain => "RULE_CHAIN",
            EntityType::WidgetBundle => "WIDGET_BUNDLE",
            EntityType::Edge => "EDGE",
        }
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEVICE" => Ok(EntityType::Device),
            "ASSET" => Ok(EntityType::Asset),
            "DASHBOARD" => Ok(EntityType::Dashboard),
            "ENTITY_VIEW" => Ok(EntityType::EntityView),
            "RELATION" => Ok(EntityType::Relation),
            "ALARM" => Ok(EntityType::Alarm),
            "RULE_CHAIN" => Ok(EntityType::RuleChain),
            "WIDGET_BUNDLE" => Ok(EntityType::WidgetBundle),
            "EDGE" => Ok(EntityType::Edge),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event actions
// ---------------------------------------------------------------------------

/// What happened to the entity (or what is being requested from the cloud).
///
/// Actions split into two routing families: entity lifecycle actions route
/// by `EntityType`, the rest route directly by action.  See
/// [`EventAction::is_lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Added,
    Updated,
    Deleted,
    AlarmAck,
    AlarmClear,
    CredentialsUpdated,
    RelationAddOrUpdate,
    RelationDeleted,
    AssignedToCustomer,
    UnassignedFromCustomer,
    AttributesUpdated,
    PostAttributes,
    AttributesDeleted,
    TimeseriesUpdated,
    AttributesRequest,
    RelationRequest,
    RuleChainMetadataRequest,
    CredentialsRequest,
    RpcCall,
    WidgetBundleTypesRequest,
    EntityViewRequest,
}

impl EventAction {
    /// True for the entity lifecycle family, which routes by entity type.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EventAction::Added
                | EventAction::Updated
                | EventAction::Deleted
                | EventAction::AlarmAck
                | EventAction::AlarmClear
                | EventAction::CredentialsUpdated
                | EventAction::RelationAddOrUpdate
                | EventAction::RelationDeleted
                | EventAction::AssignedToCustomer
                | EventAction::UnassignedFromCustomer
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Added => "ADDED",
            EventAction::Updated => "UPDATED",
            EventAction::Deleted => "DELETED",
            EventAction::AlarmAck => "ALARM_ACK",
            EventAction::AlarmClear => "ALARM_CLEAR",
            EventAction::CredentialsUpdated => "CREDENTIALS_UPDATED",
            EventAction::RelationAddOrUpdate => "RELATION_ADD_OR_UPDATE",
            EventAction::RelationDeleted => "RELATION_DELETED",
            EventAction::AssignedToCustomer => "ASSIGNED_TO_CUSTOMER",
            EventAction::UnassignedFromCustomer => "UNASSIGNED_FROM_CUSTOMER",
            EventAction::AttributesUpdated => "ATTRIBUTES_UPDATED",
            EventAction::PostAttributes => "POST_ATTRIBUTES",
            EventAction::AttributesDeleted => "ATTRIBUTES_DELETED",
            EventAction::TimeseriesUpdated => "TIMESERIES_UPDATED",
            EventAction::AttributesRequest => "ATTRIBUTES_REQUEST",
            EventAction::RelationRequest => "RELATION_REQUEST",
            EventAction::RuleChainMetadataRequest => "RULE_CHAIN_METADATA_REQUEST",
            EventAction::CredentialsRequest => "CREDENTIALS_REQUEST",
            EventAction::RpcCall => "RPC_CALL",
            EventAction::WidgetBundleTypesRequest => "WIDGET_BUNDLE_TYPES_REQUEST",
            EventAction::EntityViewRequest => "ENTITY_VIEW_REQUEST",
        }
    }
}

impl FromStr for EventAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADDED" => Ok(EventAction::Added),
            "UPDATED" => Ok(EventAction::Updated),
            "DELETED" => Ok(EventAction::Deleted),
            "ALARM_ACK" => Ok(EventAction::AlarmAck),
            "ALARM_CLEAR" => Ok(EventAction::AlarmClear),
            "CREDENTIALS_UPDATED" => Ok(EventAction::CredentialsUpdated),
            "RELATION_ADD_OR_UPDATE" => Ok(EventAction::RelationAddOrUpdate),
            "RELATION_DELETED" => Ok(EventAction::RelationDeleted),
            "ASSIGNED_TO_CUSTOMER" => Ok(EventAction::AssignedToCustomer),
            "UNASSIGNED_FROM_CUSTOMER" => Ok(EventAction::UnassignedFromCustomer),
            "ATTRIBUTES_UPDATED" => Ok(EventAction::AttributesUpdated),
            "POST_ATTRIBUTES" => Ok(EventAction::PostAttributes),
            "ATTRIBUTES_DELETED" => Ok(EventAction::AttributesDeleted),
            "TIMESERIES_UPDATED" => Ok(EventAction::TimeseriesUpdated),
            "ATTRIBUTES_REQUEST" => Ok(EventAction::AttributesRequest),
            "RELATION_REQUEST" => Ok(EventAction::RelationRequest),
            "RULE_CHAIN_METADATA_REQUEST" => Ok(EventAction::RuleChainMetadataRequest),
            "CREDENTIALS_REQUEST" => Ok(EventAction::CredentialsRequest),
            "RPC_CALL" => Ok(EventAction::RpcCall),
            "WIDGET_BUNDLE_TYPES_REQUEST" => Ok(EventAction::WidgetBundleTypesRequest),
            "ENTITY_VIEW_REQUEST" => Ok(EventAction::EntityViewRequest),
            other => Err(format!("unknown event action: {other}")),
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event log entry
// ---------------------------------------------------------------------------

/// One immutable record of the local event log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLogEntry {
    /// Time-ordered v7 UUID assigned at append time.
    pub uuid: Uuid,
    /// Monotone within a log generation; restarts at 1 on log cycle.
    pub seq_id: i64,
    pub tenant_id: Uuid,
    pub entity_type: EntityType,
    pub action: EventAction,
    pub entity_id: Option<Uuid>,
    pub payload: serde_json::Value,
    /// Wall-clock ms at append time (same instant the uuid encodes).
    pub created_ts: i64,
}

impl EventLogEntry {
    /// Millisecond unix timestamp encoded in the v7 uuid.
    ///
    /// Falls back to `created_ts` for uuids without an embedded timestamp.
    pub fn ts_millis(&self) -> i64 {
        match self.uuid.get_timestamp() {
            Some(ts) => {
                let (secs, nanos) = ts.to_unix();
                secs as i64 * 1000 + i64::from(nanos) / 1_000_000
            }
            None => self.created_ts,
        }
    }
}

// ---------------------------------------------------------------------------
// Edge settings record
// ---------------------------------------------------------------------------

/// The per-tenant settings row, rewritten on every completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeSettings {
    pub edge_id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub name: String,
    pub edge_type: String,
    pub routing_key: String,
    /// True until the first sync request for this settings row has been
    /// issued; forces `full_sync` on the next handshake.
    pub full_sync_required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_round_trips_through_str() {
        for t in [
            EntityType::Device,
            EntityType::Asset,
            EntityType::Dashboard,
            EntityType::EntityView,
            EntityType::Relation,
            EntityType::Alarm,
            EntityType::RuleChain,
            EntityType::WidgetBundle,
            EntityType::Edge,
        ] {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
    }

    #[test]
    fn action_families_partition() {
        assert!(EventAction::AssignedToCustomer.is_lifecycle());
        assert!(EventAction::CredentialsUpdated.is_lifecycle());
        assert!(!EventAction::AttributesRequest.is_lifecycle());
        assert!(!EventAction::TimeseriesUpdated.is_lifecycle());
        assert!(!EventAction::RpcCall.is_lifecycle());
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!("NOT_AN_ACTION".parse::<EventAction>().is_err());
    }

    #[test]
    fn v7_uuid_timestamp_is_recovered() {
        let uuid = Uuid::now_v7();
        let entry = EventLogEntry {
            uuid,
            seq_id: 1,
            tenant_id: Uuid::new_v4(),
            entity_type: EntityType::Device,
            action: EventAction::Added,
            entity_id: None,
            payload: serde_json::Value::Null,
            created_ts: 0,
        };
        let now = chrono::Utc::now().timestamp_millis();
        let ts = entry.ts_millis();
        assert!((now - ts).abs() < 5_000, "uuid ts {ts} too far from now {now}");
    }
}
