// src/services/ride_service.rs
use std::sync::Arc;

use crate::errors::{KestrelError, KestrelResult};
use crate::models::driver::Availability;
use crate::models::events;
use crate::models::ride::{RideStatus, RideView};
use crate::services::dispatch_store::CasOutcome;
use crate::services::geo_service::DriverIndex;
use crate::services::push_service::PushBus;
use crate::services::ride_store::RideStore;

/// Ride lifecycle after assignment: the driver witnesses the rider with the
/// OTP to start, then completes or cancels. Each transition fans out to the
/// rider.
pub struct RideService {
    rides: Arc<dyn RideStore>,
    drivers: Arc<dyn DriverIndex>,
    bus: Arc<dyn PushBus>,
}

impl RideService {
    pub fn new(
        rides: Arc<dyn RideStore>,
        drivers: Arc<dyn DriverIndex>,
        bus: Arc<dyn PushBus>,
    ) -> Self {
        Self { rides, drivers, bus }
    }

    pub async fn get_ride(&self, ride_id: &str) -> KestrelResult<RideView> {
        let ride = self
            .rides
            .read(ride_id, false)
            .await?
            .ok_or_else(|| KestrelError::RideNotFound(ride_id.to_string()))?;
        Ok(ride.into())
    }

    /// Driver submits the rider's OTP at pickup; a match moves the ride to
    /// ongoing.
    pub async fn start_ride(
        &self,
        ride_id: &str,
        otp: &str,
        correlation_id: &str,
    ) -> KestrelResult<RideView> {
        let ride = self
            .rides
            .read(ride_id, true)
            .await?
            .ok_or_else(|| KestrelError::RideNotFound(ride_id.to_string()))?;
        if ride.status != RideStatus::Accepted {
            return Err(KestrelError::conflict("ride is not awaiting pickup"));
        }
        if ride.otp != otp {
            tracing::warn!("otp mismatch on ride {} [{}]", ride_id, correlation_id);
            return Err(KestrelError::OtpMismatch);
        }

        match self
            .rides
            .transition(ride_id, RideStatus::Accepted, RideStatus::Ongoing)
            .await?
        {
            CasOutcome::Applied => {}
            CasOutcome::Conflict => {
                return Err(KestrelError::conflict("ride moved while starting"))
            }
        }
        tracing::info!("ride {} started [{}]", ride_id, correlation_id);
        self.emit_lifecycle(&ride.rider_id, ride_id, events::RIDE_STARTED, RideStatus::Ongoing, correlation_id)
            .await;
        self.get_ride(ride_id).await
    }

    pub async fn complete_ride(&self, ride_id: &str, correlation_id: &str) -> KestrelResult<RideView> {
        let ride = self
            .rides
            .read(ride_id, false)
            .await?
            .ok_or_else(|| KestrelError::RideNotFound(ride_id.to_string()))?;

        match self
            .rides
            .transition(ride_id, RideStatus::Ongoing, RideStatus::Completed)
            .await?
        {
            CasOutcome::Applied => {}
            CasOutcome::Conflict => return Err(KestrelError::conflict("ride is not ongoing")),
        }
        tracing::info!("ride {} completed [{}]", ride_id, correlation_id);
        self.emit_lifecycle(&ride.rider_id, ride_id, events::RIDE_ENDED, RideStatus::Completed, correlation_id)
            .await;
        self.release_driver(&ride.driver_id).await;
        self.get_ride(ride_id).await
    }

    pub async fn cancel_ride(&self, ride_id: &str, correlation_id: &str) -> KestrelResult<RideView> {
        let ride = self
            .rides
            .read(ride_id, false)
            .await?
            .ok_or_else(|| KestrelError::RideNotFound(ride_id.to_string()))?;
        if !matches!(ride.status, RideStatus::Accepted | RideStatus::Ongoing) {
            return Err(KestrelError::conflict("ride already settled"));
        }

        match self
            .rides
            .transition(ride_id, ride.status, RideStatus::Cancelled)
            .await?
        {
            CasOutcome::Applied => {}
            CasOutcome::Conflict => return Err(KestrelError::conflict("ride moved while cancelling")),
        }
        tracing::info!("ride {} cancelled [{}]", ride_id, correlation_id);
        self.release_driver(&ride.driver_id).await;
        self.get_ride(ride_id).await
    }

    async fn emit_lifecycle(
        &self,
        rider_id: &str,
        ride_id: &str,
        event: &str,
        status: RideStatus,
        correlation_id: &str,
    ) {
        let payload = serde_json::to_value(events::RideLifecycleEvent {
            ride_id: ride_id.to_string(),
            status,
        })
        .unwrap_or_default();
        if let Err(err) = self
            .bus
            .emit(&events::rider_address(rider_id), event, payload, correlation_id)
            .await
        {
            tracing::warn!("emit {} for ride {} failed: {}", event, ride_id, err);
        }
    }

    /// Best-effort, same as the assignment-side availability write.
    async fn release_driver(&self, driver_id: &str) {
        if let Err(err) = self.drivers.set_availability(driver_id, Availability::Active).await {
            tracing::warn!("availability release for {} failed: {}", driver_id, err);
        }
    }
}
