//! Staff domain events and their routing keys.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{StaffRole, StaffStatus, UpdateStaffRequest};

pub const STAFF_CREATED: &str = "staff.created";
pub const STAFF_UPDATED: &str = "staff.updated";
pub const STAFF_DELETED: &str = "staff.deleted";
pub const STAFF_ASSIGNED_BUS: &str = "staff.assigned.bus";
pub const STAFF_ASSIGNED_ROUTE: &str = "staff.assigned.route";
pub const STAFF_STATUS_UPDATED: &str = "staff.status.updated";

/// Marker carried by unassignment events.
pub const UNASSIGNED_ACTION: &str = "unassigned";

/// An event emitted after a staff mutation.
///
/// Serializes to the bare payload; the routing key travels separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum StaffEvent {
    Created {
        staff_id: Uuid,
        role: StaffRole,
    },
    Updated {
        staff_id: Uuid,
        updates: UpdateStaffRequest,
    },
    BusUnassigned {
        staff_id: Uuid,
        previous_bus_id: String,
        action: String,
    },
    RouteUnassigned {
        staff_id: Uuid,
        previous_route_id: String,
        action: String,
    },
    BusAssigned {
        staff_id: Uuid,
        bus_id: String,
    },
    RouteAssigned {
        staff_id: Uuid,
        route_id: String,
    },
    StatusUpdated {
        staff_id: Uuid,
        status: StaffStatus,
    },
    Deleted {
        staff_id: Uuid,
    },
}

impl StaffEvent {
    pub fn bus_unassigned(staff_id: Uuid, previous_bus_id: String) -> Self {
        StaffEvent::BusUnassigned {
            staff_id,
            previous_bus_id,
            action: UNASSIGNED_ACTION.to_string(),
        }
    }

    pub fn route_unassigned(staff_id: Uuid, previous_route_id: String) -> Self {
        StaffEvent::RouteUnassigned {
            staff_id,
            previous_route_id,
            action: UNASSIGNED_ACTION.to_string(),
        }
    }

    /// Routing key this event is published under.
    pub fn routing_key(&self) -> &'static str {
        match self {
            StaffEvent::Created { .. } => STAFF_CREATED,
            StaffEvent::Updated { .. } => STAFF_UPDATED,
            StaffEvent::Deleted { .. } => STAFF_DELETED,
            StaffEvent::BusAssigned { .. } | StaffEvent::BusUnassigned { .. } => STAFF_ASSIGNED_BUS,
            StaffEvent::RouteAssigned { .. } | StaffEvent::RouteUnassigned { .. } => {
                STAFF_ASSIGNED_ROUTE
            }
            StaffEvent::StatusUpdated { .. } => STAFF_STATUS_UPDATED,
        }
    }

    pub fn staff_id(&self) -> Uuid {
        match self {
            StaffEvent::Created { staff_id, .. }
            | StaffEvent::Updated { staff_id, .. }
            | StaffEvent::Deleted { staff_id }
            | StaffEvent::BusAssigned { staff_id, .. }
            | StaffEvent::BusUnassigned { staff_id, .. }
            | StaffEvent::RouteAssigned { staff_id, .. }
            | StaffEvent::RouteUnassigned { staff_id, .. }
            | StaffEvent::StatusUpdated { staff_id, .. } => *staff_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_created_payload() {
        let id = Uuid::new_v4();
        let event = StaffEvent::Created {
            staff_id: id,
            role: StaffRole::Driver,
        };
        assert_eq!(event.routing_key(), "staff.created");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"staffId": id.to_string(), "role": "DRIVER"})
        );
    }

    #[test]
    fn test_unassign_payload_shares_assign_key() {
        let id = Uuid::new_v4();
        let event = StaffEvent::bus_unassigned(id, "bus-12".to_string());
        assert_eq!(event.routing_key(), "staff.assigned.bus");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"staffId": id.to_string(), "previousBusId": "bus-12", "action": "unassigned"})
        );
    }

    #[test]
    fn test_updated_payload_carries_only_set_fields() {
        let id = Uuid::new_v4();
        let event = StaffEvent::Updated {
            staff_id: id,
            updates: UpdateStaffRequest {
                status: Some(StaffStatus::Inactive),
                ..Default::default()
            },
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"staffId": id.to_string(), "updates": {"status": "INACTIVE"}})
        );
    }

    #[test]
    fn test_deleted_round_trip() {
        let id = Uuid::new_v4();
        let event = StaffEvent::Deleted { staff_id: id };
        let value = serde_json::to_value(&event).unwrap();
        let back: StaffEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.staff_id(), id);
        assert_eq!(back.routing_key(), "staff.deleted");
    }
}
