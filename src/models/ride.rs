// src/models/ride.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::dispatch::Place;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Accepted,  // Created at assignment
    Ongoing,   // Rider presence witnessed via OTP
    Completed,
    Cancelled,
}

impl RideStatus {
    /// accepted -> ongoing -> completed, with cancellation allowed before
    /// completion. Forward-only.
    pub fn can_transition(&self, next: RideStatus) -> bool {
        use RideStatus::*;
        matches!(
            (self, next),
            (Accepted, Ongoing) | (Accepted, Cancelled) | (Ongoing, Completed) | (Ongoing, Cancelled)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Ride {
    pub id: String,
    pub rider_id: String,
    pub driver_id: String,
    pub pickup: Place,
    pub destination: Place,
    /// Integer minor units, fixed at creation.
    pub fare: i64,
    pub status: RideStatus,
    /// 6-digit secret, readable only under an explicit include flag.
    pub otp: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ride {
    /// Copy with the OTP blanked, for default read paths.
    pub fn redacted(mut self) -> Ride {
        self.otp = String::new();
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct StartRideRequest {
    pub otp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideView {
    pub id: String,
    pub rider_id: String,
    pub driver_id: String,
    pub pickup: String,
    pub destination: String,
    pub fare: i64,
    pub status: RideStatus,
    pub created_at: DateTime<Utc>,
}

impl From<Ride> for RideView {
    fn from(r: Ride) -> Self {
        Self {
            id: r.id,
            rider_id: r.rider_id,
            driver_id: r.driver_id,
            pickup: r.pickup.label,
            destination: r.destination.label,
            fare: r.fare,
            status: r.status,
            created_at: r.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use RideStatus::*;
        assert!(Accepted.can_transition(Ongoing));
        assert!(Accepted.can_transition(Cancelled));
        assert!(Ongoing.can_transition(Completed));
        assert!(Ongoing.can_transition(Cancelled));

        assert!(!Completed.can_transition(Cancelled));
        assert!(!Cancelled.can_transition(Ongoing));
        assert!(!Accepted.can_transition(Completed));
        assert!(!Ongoing.can_transition(Accepted));
    }
}
