// src/handlers/dispatch_handler.rs
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use crate::errors::KestrelError;
use crate::models::dispatch::{
    AckOfferRequest, DispatchView, OkResponse, StartDispatchRequest, StartDispatchResponse,
};
use crate::state::AppState;

use super::Correlation;

pub async fn start_dispatch(
    State(state): State<Arc<AppState>>,
    Correlation(correlation_id): Correlation,
    Json(request): Json<StartDispatchRequest>,
) -> Result<(StatusCode, Json<StartDispatchResponse>), KestrelError> {
    let response = state
        .dispatch_service
        .start_dispatch(request, &correlation_id)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn ack_offer(
    State(state): State<Arc<AppState>>,
    Path(dispatch_id): Path<String>,
    Json(request): Json<AckOfferRequest>,
) -> Result<Json<OkResponse>, KestrelError> {
    let response = state.dispatch_service.ack_offer(&dispatch_id, request).await?;
    Ok(Json(response))
}

pub async fn cancel_dispatch(
    State(state): State<Arc<AppState>>,
    Path(dispatch_id): Path<String>,
) -> Result<Json<OkResponse>, KestrelError> {
    let response = state.dispatch_service.cancel_dispatch(&dispatch_id).await?;
    Ok(Json(response))
}

pub async fn get_dispatch(
    State(state): State<Arc<AppState>>,
    Path(dispatch_id): Path<String>,
) -> Result<Json<DispatchView>, KestrelError> {
    let view = state.dispatch_service.get_dispatch(&dispatch_id).await?;
    Ok(Json(view))
}
