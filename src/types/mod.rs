//! Core types for the staff service.

mod config;
mod events;
mod staff;

pub use config::{LogFormat, ReconnectStrategy, ServiceConfig};
pub use events::{
    StaffEvent, STAFF_ASSIGNED_BUS, STAFF_ASSIGNED_ROUTE, STAFF_CREATED, STAFF_DELETED,
    STAFF_STATUS_UPDATED, STAFF_UPDATED, UNASSIGNED_ACTION,
};
pub use staff::{
    CreateStaffRequest, ShiftType, Staff, StaffFilter, StaffPage, StaffRole, StaffStatus,
    UpdateStaffRequest,
};
