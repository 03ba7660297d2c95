//! Staff record and request/response definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job function of a staff member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StaffRole {
    Driver,
    Conductor,
    Admin,
}

impl std::fmt::Display for StaffRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaffRole::Driver => write!(f, "DRIVER"),
            StaffRole::Conductor => write!(f, "CONDUCTOR"),
            StaffRole::Admin => write!(f, "ADMIN"),
        }
    }
}

/// Whether a staff member can be assigned work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StaffStatus {
    #[default]
    Active,
    Inactive,
}

impl std::fmt::Display for StaffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaffStatus::Active => write!(f, "ACTIVE"),
            StaffStatus::Inactive => write!(f, "INACTIVE"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShiftType {
    #[default]
    Day,
    Night,
}

/// A staff member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Staff {
    pub id: Uuid,
    pub name: String,
    /// Unique across all staff
    pub email: String,
    pub role: StaffRole,
    pub contact_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_bus_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_route_id: Option<String>,
    pub status: StaffStatus,
    pub shift_type: ShiftType,
    /// Shift length in hours
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shift_duration: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Staff {
    /// Build a new active record from a validated create request.
    pub fn new(request: CreateStaffRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            email: request.email,
            role: request.role,
            contact_number: request.contact_number,
            assigned_bus_id: request.assigned_bus_id,
            assigned_route_id: request.assigned_route_id,
            status: request.status.unwrap_or_default(),
            shift_type: request.shift_type.unwrap_or_default(),
            shift_duration: request.shift_duration,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply the fields present in `update`.
    pub fn apply(&mut self, update: &UpdateStaffRequest) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(email) = &update.email {
            self.email = email.clone();
        }
        if let Some(role) = update.role {
            self.role = role;
        }
        if let Some(contact_number) = &update.contact_number {
            self.contact_number = contact_number.clone();
        }
        if let Some(bus_id) = &update.assigned_bus_id {
            self.assigned_bus_id = Some(bus_id.clone());
        }
        if let Some(route_id) = &update.assigned_route_id {
            self.assigned_route_id = Some(route_id.clone());
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(shift_type) = update.shift_type {
            self.shift_type = shift_type;
        }
        if let Some(shift_duration) = update.shift_duration {
            self.shift_duration = Some(shift_duration);
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_active(&self) -> bool {
        self.status == StaffStatus::Active
    }
}

/// Request body for creating a staff member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStaffRequest {
    pub name: String,
    pub email: String,
    pub role: StaffRole,
    pub contact_number: String,
    #[serde(default)]
    pub assigned_bus_id: Option<String>,
    #[serde(default)]
    pub assigned_route_id: Option<String>,
    #[serde(default)]
    pub status: Option<StaffStatus>,
    #[serde(default)]
    pub shift_type: Option<ShiftType>,
    #[serde(default)]
    pub shift_duration: Option<u32>,
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStaffRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<StaffRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_bus_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_route_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StaffStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift_type: Option<ShiftType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift_duration: Option<u32>,
}

impl UpdateStaffRequest {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Filters for listing staff. Empty strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffFilter {
    pub role: Option<StaffRole>,
    pub status: Option<StaffStatus>,
    pub assigned_bus_id: Option<String>,
    pub assigned_route_id: Option<String>,
}

impl StaffFilter {
    pub fn matches(&self, staff: &Staff) -> bool {
        self.role.map_or(true, |role| staff.role == role)
            && self.status.map_or(true, |status| staff.status == status)
            && matches_id(&self.assigned_bus_id, &staff.assigned_bus_id)
            && matches_id(&self.assigned_route_id, &staff.assigned_route_id)
    }
}

fn matches_id(wanted: &Option<String>, actual: &Option<String>) -> bool {
    match wanted.as_deref() {
        None | Some("") => true,
        Some(id) => actual.as_deref() == Some(id),
    }
}

/// Page of staff plus the total number of matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaffPage {
    pub staff: Vec<Staff>,
    pub total: usize,
}
