//! Field validation for staff requests.

use lazy_static::lazy_static;
use regex::Regex;

use crate::types::{CreateStaffRequest, UpdateStaffRequest};

lazy_static! {
    static ref EMAIL: Regex = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap();
    static ref CONTACT_NUMBER: Regex = Regex::new(r"^\+?[\d\s-]+$").unwrap();
}

const NAME_MIN: usize = 2;
const NAME_MAX: usize = 100;

fn check_name(name: &str, errors: &mut Vec<String>) {
    let len = name.chars().count();
    if len < NAME_MIN {
        errors.push(format!("\"name\" length must be at least {} characters long", NAME_MIN));
    } else if len > NAME_MAX {
        errors.push(format!(
            "\"name\" length must be less than or equal to {} characters long",
            NAME_MAX
        ));
    }
}

fn check_email(email: &str, errors: &mut Vec<String>) {
    if !EMAIL.is_match(email) {
        errors.push("\"email\" must be a valid email".to_string());
    }
}

fn check_contact_number(contact_number: &str, errors: &mut Vec<String>) {
    if !CONTACT_NUMBER.is_match(contact_number) {
        errors.push(format!(
            "\"contactNumber\" with value \"{}\" fails to match the required pattern",
            contact_number
        ));
    }
}

fn finish(errors: Vec<String>) -> Result<(), String> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("Validation error: {}", errors.join(", ")))
    }
}

/// Validate a create request, reporting every violation at once.
pub fn validate_create(request: &CreateStaffRequest) -> Result<(), String> {
    let mut errors = Vec::new();
    check_name(&request.name, &mut errors);
    check_email(&request.email, &mut errors);
    check_contact_number(&request.contact_number, &mut errors);
    finish(errors)
}

/// Validate the fields present in an update request.
pub fn validate_update(request: &UpdateStaffRequest) -> Result<(), String> {
    let mut errors = Vec::new();
    if let Some(name) = &request.name {
        check_name(name, &mut errors);
    }
    if let Some(email) = &request.email {
        check_email(email, &mut errors);
    }
    if let Some(contact_number) = &request.contact_number {
        check_contact_number(contact_number, &mut errors);
    }
    finish(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StaffRole;

    fn request(name: &str, email: &str, contact: &str) -> CreateStaffRequest {
        CreateStaffRequest {
            name: name.to_string(),
            email: email.to_string(),
            role: StaffRole::Conductor,
            contact_number: contact.to_string(),
            assigned_bus_id: None,
            assigned_route_id: None,
            status: None,
            shift_type: None,
            shift_duration: None,
        }
    }

    #[test]
    fn test_valid_request() {
        assert!(validate_create(&request("Meera", "meera@transit.in", "+91 80-1234 5678")).is_ok());
    }

    #[test]
    fn test_collects_all_violations() {
        let err = validate_create(&request("M", "not-an-email", "call me")).unwrap_err();
        assert!(err.starts_with("Validation error: "));
        assert!(err.contains("\"name\""));
        assert!(err.contains("\"email\""));
        assert!(err.contains("\"contactNumber\""));
    }

    #[test]
    fn test_name_too_long() {
        let long = "x".repeat(101);
        assert!(validate_create(&request(&long, "a@b.co", "123")).is_err());
    }

    #[test]
    fn test_update_checks_only_present_fields() {
        let update = UpdateStaffRequest {
            contact_number: Some("12ab".to_string()),
            ..Default::default()
        };
        let err = validate_update(&update).unwrap_err();
        assert!(err.contains("contactNumber"));
        assert!(!err.contains("email"));
        assert!(validate_update(&UpdateStaffRequest::default()).is_ok());
    }
}
