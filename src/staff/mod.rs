//! # Staff Module
//!
//! Staff records, validation, storage and the service that turns every
//! mutation into a published domain event.

pub mod error;
pub mod service;
pub mod store;
pub mod validation;

pub use error::{StaffError, StaffResult};
pub use service::{StaffService, DEFAULT_PAGE_LIMIT};
pub use store::{InMemoryStaffStore, StaffStore};
