//! Staff domain service.
//!
//! Every mutation writes to the store first and then publishes exactly one
//! event. The two steps are independent: if the publish fails the error is
//! returned to the caller, but the stored change stays.

use std::sync::Arc;

use tracing::{error, info, instrument};
use uuid::Uuid;

use super::error::{StaffError, StaffResult};
use super::store::StaffStore;
use super::validation::{validate_create, validate_update};
use crate::messaging::EventPublisher;
use crate::types::{
    CreateStaffRequest, Staff, StaffEvent, StaffFilter, StaffPage, StaffStatus,
    UpdateStaffRequest,
};

/// Default page size for listings.
pub const DEFAULT_PAGE_LIMIT: usize = 10;

pub struct StaffService {
    store: Arc<dyn StaffStore>,
    publisher: EventPublisher,
}

impl StaffService {
    pub fn new(store: Arc<dyn StaffStore>, publisher: EventPublisher) -> Self {
        Self { store, publisher }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    async fn publish(&self, event: StaffEvent) -> StaffResult<()> {
        if let Err(e) = self.publisher.publish_staff_event(&event).await {
            error!(
                staff_id = %event.staff_id(),
                routing_key = %event.routing_key(),
                error = %e,
                "Staff change stored but event not published"
            );
            return Err(StaffError::EventPublish(e));
        }
        Ok(())
    }

    async fn load(&self, id: Uuid) -> StaffResult<Staff> {
        self.store.get(id).await.ok_or(StaffError::NotFound)
    }

    #[instrument(skip(self, request), fields(email = %request.email))]
    pub async fn create_staff(&self, request: CreateStaffRequest) -> StaffResult<Staff> {
        validate_create(&request).map_err(StaffError::Validation)?;

        if self.store.find_by_email(&request.email).await.is_some() {
            return Err(StaffError::Conflict(
                "Staff with this email already exists".to_string(),
            ));
        }

        let staff = Staff::new(request);
        if !self.store.insert(staff.clone()).await {
            return Err(StaffError::Conflict(
                "Staff with this email already exists".to_string(),
            ));
        }

        self.publish(StaffEvent::Created {
            staff_id: staff.id,
            role: staff.role,
        })
        .await?;

        info!(staff_id = %staff.id, role = %staff.role, "Staff created");
        Ok(staff)
    }

    pub async fn get_staff(&self, id: Uuid) -> StaffResult<Staff> {
        self.load(id).await
    }

    /// One page of staff matching `filter`. `page` is 1-based; zero values fall back to defaults.
    pub async fn list_staff(&self, page: usize, limit: usize, filter: &StaffFilter) -> StaffPage {
        let page = page.max(1);
        let limit = if limit == 0 { DEFAULT_PAGE_LIMIT } else { limit };
        let offset = (page - 1).saturating_mul(limit);
        let (staff, total) = self.store.list(filter, offset, limit).await;
        StaffPage { staff, total }
    }

    #[instrument(skip(self, update))]
    pub async fn update_staff(&self, id: Uuid, update: UpdateStaffRequest) -> StaffResult<Staff> {
        if update.is_empty() {
            return Err(StaffError::BadRequest("No update data provided".to_string()));
        }
        validate_update(&update).map_err(StaffError::Validation)?;

        let mut staff = self.load(id).await?;

        if let Some(email) = &update.email {
            if let Some(other) = self.store.find_by_email(email).await {
                if other.id != id {
                    return Err(StaffError::Conflict(
                        "Staff with this email already exists".to_string(),
                    ));
                }
            }
        }

        staff.apply(&update);
        if !self.store.update(staff.clone()).await {
            return Err(StaffError::NotFound);
        }

        self.publish(StaffEvent::Updated {
            staff_id: id,
            updates: update,
        })
        .await?;

        info!(staff_id = %id, "Staff updated");
        Ok(staff)
    }

    #[instrument(skip(self))]
    pub async fn delete_staff(&self, id: Uuid) -> StaffResult<()> {
        self.store.delete(id).await.ok_or(StaffError::NotFound)?;

        self.publish(StaffEvent::Deleted { staff_id: id }).await?;

        info!(staff_id = %id, "Staff deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn assign_to_bus(&self, id: Uuid, bus_id: String) -> StaffResult<Staff> {
        let mut staff = self.load(id).await?;
        if !staff.is_active() {
            return Err(StaffError::BadRequest("Staff is not active".to_string()));
        }

        staff.assigned_bus_id = Some(bus_id.clone());
        self.save(&mut staff).await?;

        self.publish(StaffEvent::BusAssigned { staff_id: id, bus_id }).await?;
        Ok(staff)
    }

    #[instrument(skip(self))]
    pub async fn assign_to_route(&self, id: Uuid, route_id: String) -> StaffResult<Staff> {
        let mut staff = self.load(id).await?;
        if !staff.is_active() {
            return Err(StaffError::BadRequest("Staff is not active".to_string()));
        }

        staff.assigned_route_id = Some(route_id.clone());
        self.save(&mut staff).await?;

        self.publish(StaffEvent::RouteAssigned { staff_id: id, route_id }).await?;
        Ok(staff)
    }

    #[instrument(skip(self))]
    pub async fn unassign_bus(&self, id: Uuid) -> StaffResult<Staff> {
        let mut staff = self.load(id).await?;
        let previous = staff.assigned_bus_id.take().ok_or_else(|| {
            StaffError::BadRequest("Staff is not assigned to any bus".to_string())
        })?;
        self.save(&mut staff).await?;

        self.publish(StaffEvent::bus_unassigned(id, previous)).await?;
        Ok(staff)
    }

    #[instrument(skip(self))]
    pub async fn unassign_route(&self, id: Uuid) -> StaffResult<Staff> {
        let mut staff = self.load(id).await?;
        let previous = staff.assigned_route_id.take().ok_or_else(|| {
            StaffError::BadRequest("Staff is not assigned to any route".to_string())
        })?;
        self.save(&mut staff).await?;

        self.publish(StaffEvent::route_unassigned(id, previous)).await?;
        Ok(staff)
    }

    #[instrument(skip(self))]
    pub async fn update_status(&self, id: Uuid, status: StaffStatus) -> StaffResult<Staff> {
        let mut staff = self.load(id).await?;
        staff.status = status;
        self.save(&mut staff).await?;

        self.publish(StaffEvent::StatusUpdated { staff_id: id, status }).await?;
        Ok(staff)
    }

    async fn save(&self, staff: &mut Staff) -> StaffResult<()> {
        staff.touch();
        if self.store.update(staff.clone()).await {
            Ok(())
        } else {
            Err(StaffError::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{ConnectionManager, InMemoryBroker, RetryPolicy, Topology};
    use crate::staff::store::InMemoryStaffStore;
    use crate::types::StaffRole;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn service(broker: &InMemoryBroker) -> (StaffService, Arc<InMemoryStaffStore>) {
        let manager = ConnectionManager::new(
            Arc::new(broker.clone()),
            Topology::default(),
            RetryPolicy::default(),
        );
        let store = Arc::new(InMemoryStaffStore::new());
        (
            StaffService::new(store.clone(), EventPublisher::new(manager)),
            store,
        )
    }

    fn driver(email: &str) -> CreateStaffRequest {
        CreateStaffRequest {
            name: "Ravi Kumar".to_string(),
            email: email.to_string(),
            role: StaffRole::Driver,
            contact_number: "+91 98765 43210".to_string(),
            assigned_bus_id: None,
            assigned_route_id: None,
            status: None,
            shift_type: None,
            shift_duration: None,
        }
    }

    fn last_event(broker: &InMemoryBroker) -> (String, Value) {
        let envelope = broker.published().pop().unwrap();
        (
            envelope.routing_key,
            serde_json::from_slice(&envelope.payload).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_create_publishes_created_event() {
        let broker = InMemoryBroker::new();
        let (service, _) = service(&broker);

        let staff = service.create_staff(driver("ravi@example.com")).await.unwrap();

        let (key, body) = last_event(&broker);
        assert_eq!(key, "staff.created");
        assert_eq!(body, json!({"staffId": staff.id.to_string(), "role": "DRIVER"}));
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts_without_event() {
        let broker = InMemoryBroker::new();
        let (service, _) = service(&broker);
        service.create_staff(driver("ravi@example.com")).await.unwrap();

        let result = service.create_staff(driver("ravi@example.com")).await;

        assert!(matches!(result, Err(StaffError::Conflict(_))));
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_create_is_rejected() {
        let broker = InMemoryBroker::new();
        let (service, store) = service(&broker);
        let mut request = driver("bad-email");
        request.name = "R".to_string();

        let result = service.create_staff(request).await;

        assert!(matches!(result, Err(StaffError::Validation(_))));
        assert_eq!(store.len().await, 0);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_write() {
        let broker = InMemoryBroker::new();
        broker.set_fail_publishes(true);
        let (service, store) = service(&broker);

        let result = service.create_staff(driver("ravi@example.com")).await;

        assert!(matches!(result, Err(StaffError::EventPublish(_))));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_requires_fields() {
        let broker = InMemoryBroker::new();
        let (service, _) = service(&broker);
        let staff = service.create_staff(driver("ravi@example.com")).await.unwrap();

        let result = service.update_staff(staff.id, UpdateStaffRequest::default()).await;
        assert!(matches!(result, Err(StaffError::BadRequest(_))));

        let updated = service
            .update_staff(
                staff.id,
                UpdateStaffRequest {
                    name: Some("Ravi K".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Ravi K");

        let (key, body) = last_event(&broker);
        assert_eq!(key, "staff.updated");
        assert_eq!(body, json!({"staffId": staff.id.to_string(), "updates": {"name": "Ravi K"}}));
    }

    #[tokio::test]
    async fn test_update_email_conflict() {
        let broker = InMemoryBroker::new();
        let (service, _) = service(&broker);
        service.create_staff(driver("a@example.com")).await.unwrap();
        let other = service.create_staff(driver("b@example.com")).await.unwrap();

        let result = service
            .update_staff(
                other.id,
                UpdateStaffRequest {
                    email: Some("a@example.com".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert!(matches!(result, Err(StaffError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_assign_requires_active_staff() {
        let broker = InMemoryBroker::new();
        let (service, _) = service(&broker);
        let staff = service.create_staff(driver("ravi@example.com")).await.unwrap();
        service.update_status(staff.id, StaffStatus::Inactive).await.unwrap();

        let (key, body) = last_event(&broker);
        assert_eq!(key, "staff.status.updated");
        assert_eq!(body["status"], json!("INACTIVE"));

        let result = service.assign_to_bus(staff.id, "bus-1".to_string()).await;
        assert!(matches!(result, Err(StaffError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_assign_and_unassign_bus() {
        let broker = InMemoryBroker::new();
        let (service, _) = service(&broker);
        let staff = service.create_staff(driver("ravi@example.com")).await.unwrap();

        let assigned = service.assign_to_bus(staff.id, "bus-42".to_string()).await.unwrap();
        assert_eq!(assigned.assigned_bus_id.as_deref(), Some("bus-42"));
        let (key, body) = last_event(&broker);
        assert_eq!(key, "staff.assigned.bus");
        assert_eq!(body, json!({"staffId": staff.id.to_string(), "busId": "bus-42"}));

        let unassigned = service.unassign_bus(staff.id).await.unwrap();
        assert!(unassigned.assigned_bus_id.is_none());
        let (key, body) = last_event(&broker);
        assert_eq!(key, "staff.assigned.bus");
        assert_eq!(
            body,
            json!({"staffId": staff.id.to_string(), "previousBusId": "bus-42", "action": "unassigned"})
        );

        let again = service.unassign_bus(staff.id).await;
        assert!(matches!(again, Err(StaffError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_assign_and_unassign_route() {
        let broker = InMemoryBroker::new();
        let (service, _) = service(&broker);
        let staff = service.create_staff(driver("ravi@example.com")).await.unwrap();

        service.assign_to_route(staff.id, "route-9".to_string()).await.unwrap();
        let (key, _) = last_event(&broker);
        assert_eq!(key, "staff.assigned.route");

        service.unassign_route(staff.id).await.unwrap();
        let (key, body) = last_event(&broker);
        assert_eq!(key, "staff.assigned.route");
        assert_eq!(body["previousRouteId"], json!("route-9"));
    }

    #[tokio::test]
    async fn test_delete_and_missing() {
        let broker = InMemoryBroker::new();
        let (service, _) = service(&broker);
        let staff = service.create_staff(driver("ravi@example.com")).await.unwrap();

        service.delete_staff(staff.id).await.unwrap();
        let (key, body) = last_event(&broker);
        assert_eq!(key, "staff.deleted");
        assert_eq!(body, json!({"staffId": staff.id.to_string()}));

        assert!(matches!(service.get_staff(staff.id).await, Err(StaffError::NotFound)));
        assert!(matches!(service.delete_staff(staff.id).await, Err(StaffError::NotFound)));
    }

    #[tokio::test]
    async fn test_list_pages() {
        let broker = InMemoryBroker::new();
        let (service, _) = service(&broker);
        for i in 0..3 {
            service
                .create_staff(driver(&format!("d{}@example.com", i)))
                .await
                .unwrap();
        }

        let page = service.list_staff(2, 2, &StaffFilter::default()).await;
        assert_eq!(page.total, 3);
        assert_eq!(page.staff.len(), 1);

        let defaults = service.list_staff(0, 0, &StaffFilter::default()).await;
        assert_eq!(defaults.staff.len(), 3);
    }
}
