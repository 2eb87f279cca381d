// src/handlers/driver_handler.rs
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use std::sync::Arc;

use crate::errors::KestrelError;
use crate::models::dispatch::{OkResponse, VehicleType};
use crate::models::driver::{
    Availability, DriverAvailabilityUpdate, DriverLocationUpdate, DriverSnapshot, GeoPoint,
};
use crate::state::AppState;

/// Position heartbeat from the driver app. A new driver enters the index
/// active; an existing one keeps whatever availability it had.
pub async fn update_location(
    State(state): State<Arc<AppState>>,
    Json(update): Json<DriverLocationUpdate>,
) -> Result<Json<OkResponse>, KestrelError> {
    if update.driver_id.trim().is_empty() {
        return Err(KestrelError::validation_error("driverId", "must not be empty"));
    }
    let vehicle_type = VehicleType::normalize(&update.vehicle_type).ok_or_else(|| {
        KestrelError::InvalidFieldValue {
            field: "vehicleType".to_string(),
            value: update.vehicle_type.clone(),
            reason: "expected car, motorcycle or auto".to_string(),
        }
    })?;

    state
        .drivers
        .upsert(DriverSnapshot {
            id: update.driver_id,
            position: GeoPoint::new(update.lat, update.lon),
            vehicle_type,
            availability: Availability::Active,
            push_address: update.push_address,
            updated_at: Utc::now(),
        })
        .await?;
    Ok(Json(OkResponse::yes()))
}

pub async fn set_availability(
    State(state): State<Arc<AppState>>,
    Json(update): Json<DriverAvailabilityUpdate>,
) -> Result<Json<OkResponse>, KestrelError> {
    state
        .drivers
        .set_availability(&update.driver_id, update.availability)
        .await?;
    Ok(Json(OkResponse::yes()))
}
