//! HTTP request handlers for the staff service.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{Method, StatusCode, Uri},
    Json,
};
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::error::{ApiError, ErrorBody};
use crate::messaging::ConnectionManager;
use crate::staff::{StaffError, StaffService, DEFAULT_PAGE_LIMIT};
use crate::types::{
    CreateStaffRequest, Staff, StaffFilter, StaffPage, StaffStatus, UpdateStaffRequest,
};

/// Application state shared across handlers.
pub struct AppState {
    pub service: StaffService,
    pub manager: Arc<ConnectionManager>,
}

type ApiResult<T> = Result<T, ApiError>;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    broker: String,
    timestamp: String,
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let broker = if state.manager.is_connected() {
        "connected"
    } else {
        "disconnected"
    };
    Json(HealthResponse {
        status: "OK".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        broker: broker.to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Fallback for unknown routes.
pub async fn not_found(method: Method, uri: Uri) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody::new(format!("Cannot {} {}", method, uri.path()))),
    )
}

/// Malformed ids can never name a stored record.
fn staff_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| StaffError::NotFound.into())
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload.map(|Json(value)| value).map_err(ApiError::from)
}

pub async fn create_staff(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateStaffRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Staff>)> {
    let staff = state.service.create_staff(body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(staff)))
}

pub async fn get_staff(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Staff>> {
    Ok(Json(state.service.get_staff(staff_id(&id)?).await?))
}

/// Query string for listing staff. Unparseable numbers fall back to defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    page: Option<String>,
    limit: Option<String>,
    role: Option<String>,
    status: Option<String>,
    bus_id: Option<String>,
    route_id: Option<String>,
}

/// Parse an upper-case enum value from a query parameter.
///
/// `Ok(None)` when absent or empty, `Err(())` when present but unknown.
fn parse_enum<T: DeserializeOwned>(raw: &Option<String>) -> Result<Option<T>, ()> {
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(value) => serde_json::from_value(serde_json::Value::String(value.to_string()))
            .map(Some)
            .map_err(|_| ()),
    }
}

pub async fn list_staff(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<StaffPage> {
    let page = query.page.as_deref().and_then(|p| p.parse().ok()).unwrap_or(1);
    let limit = query
        .limit
        .as_deref()
        .and_then(|l| l.parse().ok())
        .unwrap_or(DEFAULT_PAGE_LIMIT);

    let (role, status) = match (parse_enum(&query.role), parse_enum(&query.status)) {
        (Ok(role), Ok(status)) => (role, status),
        // An unknown enum value matches nothing.
        _ => {
            return Json(StaffPage {
                staff: Vec::new(),
                total: 0,
            })
        }
    };

    let filter = StaffFilter {
        role,
        status,
        assigned_bus_id: query.bus_id,
        assigned_route_id: query.route_id,
    };
    Json(state.service.list_staff(page, limit, &filter).await)
}

pub async fn update_staff(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateStaffRequest>, JsonRejection>,
) -> ApiResult<Json<Staff>> {
    let id = staff_id(&id)?;
    Ok(Json(state.service.update_staff(id, body(payload)?).await?))
}

pub async fn delete_staff(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete_staff(staff_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignBusRequest {
    #[serde(default)]
    bus_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRouteRequest {
    #[serde(default)]
    route_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    status: StaffStatus,
}

fn required(value: Option<String>, field: &str) -> ApiResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(StaffError::Validation(format!(
            "Validation error: \"{}\" is required",
            field
        ))
        .into()),
    }
}

pub async fn assign_bus(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<AssignBusRequest>, JsonRejection>,
) -> ApiResult<Json<Staff>> {
    let id = staff_id(&id)?;
    let bus_id = required(body(payload)?.bus_id, "busId")?;
    Ok(Json(state.service.assign_to_bus(id, bus_id).await?))
}

pub async fn assign_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<AssignRouteRequest>, JsonRejection>,
) -> ApiResult<Json<Staff>> {
    let id = staff_id(&id)?;
    let route_id = required(body(payload)?.route_id, "routeId")?;
    Ok(Json(state.service.assign_to_route(id, route_id).await?))
}

pub async fn unassign_bus(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Staff>> {
    Ok(Json(state.service.unassign_bus(staff_id(&id)?).await?))
}

pub async fn unassign_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Staff>> {
    Ok(Json(state.service.unassign_route(staff_id(&id)?).await?))
}

pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> ApiResult<Json<Staff>> {
    let id = staff_id(&id)?;
    let status = body(payload)?.status;
    Ok(Json(state.service.update_status(id, status).await?))
}
