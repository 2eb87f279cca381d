// src/models/events.rs
use serde::Serialize;

// Event names on the wire. Consumers de-duplicate by dispatchId; delivery is
// at-least-once.
pub const RIDE_OFFER: &str = "ride-offer";
pub const RIDE_OFFER_ACCEPTED: &str = "ride-offer-accepted";
pub const RIDE_ASSIGNED: &str = "ride-assigned";
pub const DISPATCH_FAILED: &str = "dispatch-failed";
pub const RIDE_CONFIRMED: &str = "ride-confirmed";
pub const RIDE_STARTED: &str = "ride-started";
pub const RIDE_ENDED: &str = "ride-ended";

/// Address convention for rider-directed events.
pub fn rider_address(rider_id: &str) -> String {
    format!("rider:{}", rider_id)
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RideOfferEvent {
    pub dispatch_id: String,
    pub driver_id: String,
    pub pickup: String,
    pub destination: String,
    pub eta_seconds: Option<u32>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OfferAcceptedEvent {
    pub dispatch_id: String,
    pub ride_id: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RideAssignedEvent {
    pub ride_id: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFailedEvent {
    pub dispatch_id: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RideLifecycleEvent {
    pub ride_id: String,
    pub status: crate::models::ride::RideStatus,
}
