// src/models/dispatch.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::driver::GeoPoint;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Car,
    Motorcycle,
    Auto,
}

impl VehicleType {
    /// Parse a client-supplied vehicle type. Accepts the legacy "moto" alias.
    pub fn normalize(raw: &str) -> Option<VehicleType> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "car" => Some(VehicleType::Car),
            "motorcycle" | "moto" => Some(VehicleType::Motorcycle),
            "auto" => Some(VehicleType::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Car => "car",
            VehicleType::Motorcycle => "motorcycle",
            VehicleType::Auto => "auto",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CandidateStatus {
    Pending,  // Not yet offered
    Offered,  // Offer emitted, ack window open
    Acked,    // Driver accepted within the window
    Rejected, // Driver declined
    TimedOut, // Window elapsed without an answer
    Skipped,  // Bypassed by cursor seeding, never offered
    Assigned, // Won the dispatch
}

impl CandidateStatus {
    /// Terminal statuses never change again, except acked -> assigned.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CandidateStatus::Pending | CandidateStatus::Offered)
    }

    /// Serialized form, matching the serde rename on this enum.
    pub fn as_wire(&self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Offered => "offered",
            CandidateStatus::Acked => "acked",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::TimedOut => "timedOut",
            CandidateStatus::Skipped => "skipped",
            CandidateStatus::Assigned => "assigned",
        }
    }

    /// Forward-only transition table. This is the single source of truth the
    /// stores enforce their conditional writes against.
    pub fn can_transition(&self, next: CandidateStatus) -> bool {
        use CandidateStatus::*;
        matches!(
            (self, next),
            (Pending, Offered)
                | (Pending, Skipped)
                | (Offered, Acked)
                | (Offered, Rejected)
                | (Offered, TimedOut)
                | (Acked, Assigned)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DispatchOutcome {
    Pending,
    Assigned,
    Cancelled,
    Exhausted,
}

impl DispatchOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DispatchOutcome::Pending)
    }
}

/// A named place: the label the rider typed plus the resolved coordinates.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Place {
    pub label: String,
    pub point: GeoPoint,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Candidate {
    pub driver_id: String,
    pub push_address: Option<String>,
    pub eta_seconds: Option<u32>,
    pub status: CandidateStatus,
}

/// One open attempt to assign a ride. Candidate order is fixed at creation;
/// the cursor only moves forward; a non-pending outcome freezes the record.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Dispatch {
    pub id: String,
    pub rider_id: String,
    pub pickup: Place,
    pub destination: Place,
    pub vehicle_type: VehicleType,
    pub candidates: Vec<Candidate>,
    pub cursor: usize,
    pub outcome: DispatchOutcome,
    pub ride_id: Option<String>,
    pub quoted_fare: i64,
    pub ack_seconds: u64,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

// Request/Response models

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDispatchRequest {
    pub rider_id: String,
    pub pickup: String,
    pub destination: String,
    pub vehicle_type: Option<String>,
    pub radius_km: Option<f64>,
    pub limit: Option<usize>,
    pub bound_sec: Option<u32>,
    pub ack_sec: Option<u64>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StartDispatchResponse {
    pub dispatch_id: String,
    pub candidate_count: usize,
    pub cursor: usize,
    pub ack_sec: u64,
    pub quoted_fare: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckOfferRequest {
    pub driver_id: String,
    pub accepted: bool,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn yes() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateView {
    pub driver_id: String,
    pub eta_seconds: Option<u32>,
    pub status: CandidateStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchView {
    pub id: String,
    pub rider_id: String,
    pub pickup: String,
    pub destination: String,
    pub vehicle_type: VehicleType,
    pub candidates: Vec<CandidateView>,
    pub cursor: usize,
    pub outcome: DispatchOutcome,
    pub ride_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Dispatch> for DispatchView {
    fn from(d: Dispatch) -> Self {
        Self {
            id: d.id,
            rider_id: d.rider_id,
            pickup: d.pickup.label,
            destination: d.destination.label,
            vehicle_type: d.vehicle_type,
            candidates: d
                .candidates
                .into_iter()
                .map(|c| CandidateView {
                    driver_id: c.driver_id,
                    eta_seconds: c.eta_seconds,
                    status: c.status,
                })
                .collect(),
            cursor: d.cursor,
            outcome: d.outcome,
            ride_id: d.ride_id,
            created_at: d.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vehicle_type_normalization() {
        assert_eq!(VehicleType::normalize("car"), Some(VehicleType::Car));
        assert_eq!(VehicleType::normalize("moto"), Some(VehicleType::Motorcycle));
        assert_eq!(
            VehicleType::normalize(" Motorcycle "),
            Some(VehicleType::Motorcycle)
        );
        assert_eq!(VehicleType::normalize("auto"), Some(VehicleType::Auto));
        assert_eq!(VehicleType::normalize("rickshaw"), None);
    }

    #[test]
    fn candidate_transitions_are_forward_only() {
        use CandidateStatus::*;
        assert!(Pending.can_transition(Offered));
        assert!(Offered.can_transition(Acked));
        assert!(Offered.can_transition(Rejected));
        assert!(Offered.can_transition(TimedOut));
        assert!(Acked.can_transition(Assigned));

        // No going back or jumping ahead.
        assert!(!Offered.can_transition(Pending));
        assert!(!TimedOut.can_transition(Acked));
        assert!(!Rejected.can_transition(Offered));
        assert!(!Pending.can_transition(Acked));
        assert!(!Assigned.can_transition(Acked));
    }

    #[test]
    fn terminal_statuses() {
        use CandidateStatus::*;
        assert!(!Pending.is_terminal());
        assert!(!Offered.is_terminal());
        for s in [Acked, Rejected, TimedOut, Skipped, Assigned] {
            assert!(s.is_terminal());
        }
    }
}
