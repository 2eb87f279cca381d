// src/handlers/ride_handler.rs
use axum::extract::{Path, State};
use axum::Json;
use std::sync::Arc;

use crate::errors::KestrelError;
use crate::models::ride::{RideView, StartRideRequest};
use crate::state::AppState;

use super::Correlation;

pub async fn get_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<String>,
) -> Result<Json<RideView>, KestrelError> {
    let view = state.ride_service.get_ride(&ride_id).await?;
    Ok(Json(view))
}

pub async fn start_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<String>,
    Correlation(correlation_id): Correlation,
    Json(request): Json<StartRideRequest>,
) -> Result<Json<RideView>, KestrelError> {
    let view = state
        .ride_service
        .start_ride(&ride_id, &request.otp, &correlation_id)
        .await?;
    Ok(Json(view))
}

pub async fn complete_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<String>,
    Correlation(correlation_id): Correlation,
) -> Result<Json<RideView>, KestrelError> {
    let view = state.ride_service.complete_ride(&ride_id, &correlation_id).await?;
    Ok(Json(view))
}

pub async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<String>,
    Correlation(correlation_id): Correlation,
) -> Result<Json<RideView>, KestrelError> {
    let view = state.ride_service.cancel_ride(&ride_id, &correlation_id).await?;
    Ok(Json(view))
}
