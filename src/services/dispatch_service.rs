// src/services/dispatch_service.rs
use chrono::Utc;
use std::sync::Arc;

use crate::errors::{KestrelError, KestrelResult};
use crate::models::dispatch::{
    AckOfferRequest, Candidate, CandidateStatus, Dispatch, DispatchOutcome, DispatchView,
    OkResponse, Place, StartDispatchRequest, StartDispatchResponse, VehicleType,
};
use crate::models::driver::GeoPoint;
use crate::services::dispatch_store::{CasOutcome, DispatchStore};
use crate::services::eta_service::{EtaOracle, Geocoder};
use crate::services::geo_service::DriverIndex;
use crate::services::idempotency::{idempotency_key, IdempotencyCache};
use crate::services::offer_queue::{OfferQueue, OfferTask};
use crate::utils::ids::{IdGenerator, IdType};
use crate::utils::retry::{with_backoff, RetryPolicy};

pub const MIN_ACK_SECONDS: u64 = 5;
pub const MAX_ACK_SECONDS: u64 = 120;
pub const MAX_RADIUS_KM: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub default_radius_km: f64,
    pub default_limit: usize,
    pub default_ack_seconds: u64,
    /// Flag fall in minor units.
    pub fare_base: i64,
    /// Per-kilometre rate in minor units.
    pub fare_per_km: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_radius_km: 5.0,
            default_limit: 10,
            default_ack_seconds: 30,
            fare_base: 1500,
            fare_per_km: 250,
        }
    }
}

/// Request entry points: build the candidate list, persist the dispatch, hand
/// it to the scheduler. The ack and cancel paths only ever touch the record
/// through conditional writes.
pub struct DispatchService {
    dispatches: Arc<dyn DispatchStore>,
    drivers: Arc<dyn DriverIndex>,
    eta: Arc<dyn EtaOracle>,
    geocoder: Arc<dyn Geocoder>,
    idempotency: Arc<dyn IdempotencyCache>,
    queue: Arc<dyn OfferQueue>,
    retry: RetryPolicy,
    config: DispatchConfig,
}

impl DispatchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatches: Arc<dyn DispatchStore>,
        drivers: Arc<dyn DriverIndex>,
        eta: Arc<dyn EtaOracle>,
        geocoder: Arc<dyn Geocoder>,
        idempotency: Arc<dyn IdempotencyCache>,
        queue: Arc<dyn OfferQueue>,
        retry: RetryPolicy,
        config: DispatchConfig,
    ) -> Self {
        Self {
            dispatches,
            drivers,
            eta,
            geocoder,
            idempotency,
            queue,
            retry,
            config,
        }
    }

    pub async fn start_dispatch(
        &self,
        request: StartDispatchRequest,
        correlation_id: &str,
    ) -> KestrelResult<StartDispatchResponse> {
        if request.rider_id.trim().is_empty() {
            return Err(KestrelError::validation_error("riderId", "must not be empty"));
        }
        let radius_km = request.radius_km.unwrap_or(self.config.default_radius_km);
        if !(radius_km > 0.0 && radius_km <= MAX_RADIUS_KM) {
            return Err(KestrelError::validation_error(
                "radiusKm",
                "must be between 0 and 50",
            ));
        }
        let limit = request.limit.unwrap_or(self.config.default_limit);
        if !(1..=50).contains(&limit) {
            return Err(KestrelError::validation_error("limit", "must be between 1 and 50"));
        }
        let ack_seconds = request.ack_sec.unwrap_or(self.config.default_ack_seconds);
        if !(MIN_ACK_SECONDS..=MAX_ACK_SECONDS).contains(&ack_seconds) {
            return Err(KestrelError::validation_error(
                "ackSec",
                "must be between 5 and 120",
            ));
        }
        let vehicle_type = match &request.vehicle_type {
            Some(raw) => Some(VehicleType::normalize(raw).ok_or_else(|| {
                KestrelError::InvalidFieldValue {
                    field: "vehicleType".to_string(),
                    value: raw.clone(),
                    reason: "expected car, motorcycle or auto".to_string(),
                }
            })?),
            None => None,
        };

        let key = idempotency_key(
            &request.rider_id,
            &request.pickup,
            &request.destination,
            vehicle_type,
            request.idempotency_key.as_deref(),
        );
        if let Some(existing) = self.idempotency.get(&key).await? {
            tracing::info!(
                "duplicate start within TTL, returning dispatch {} [{}]",
                existing.dispatch_id,
                correlation_id
            );
            return Ok(existing);
        }

        let pickup = self.resolve_place(&request.pickup).await?;
        let destination = self.resolve_place(&request.destination).await?;

        let snapshots = with_backoff("driver index nearby", self.retry, || {
            self.drivers
                .nearby(pickup.point, radius_km * 1000.0, vehicle_type, limit)
        })
        .await?;

        let id = IdGenerator::generate(IdType::Dispatch);

        if snapshots.is_empty() {
            // Persist the empty attempt so the record stays queryable.
            let dispatch = Dispatch {
                id: id.clone(),
                rider_id: request.rider_id.clone(),
                pickup,
                destination,
                vehicle_type: vehicle_type.unwrap_or(VehicleType::Car),
                candidates: Vec::new(),
                cursor: 0,
                outcome: DispatchOutcome::Exhausted,
                ride_id: None,
                quoted_fare: 0,
                ack_seconds,
                correlation_id: correlation_id.to_string(),
                created_at: Utc::now(),
            };
            self.dispatches.create(dispatch).await?;
            tracing::info!("dispatch {} found no drivers nearby [{}]", id, correlation_id);
            return Err(KestrelError::NoDriversNearby);
        }

        let origins: Vec<GeoPoint> = snapshots.iter().map(|s| s.position).collect();
        let mut matrix = self
            .eta
            .multi_eta(&origins, pickup.point, request.bound_sec)
            .await?;
        if matrix.best_index < 0 && request.bound_sec.is_some() {
            tracing::debug!(
                "bound of {}s filtered every candidate, retrying unbounded [{}]",
                request.bound_sec.unwrap_or_default(),
                correlation_id
            );
            matrix = self.eta.multi_eta(&origins, pickup.point, None).await?;
        }
        if matrix.durations.len() != snapshots.len() {
            return Err(KestrelError::internal(format!(
                "eta oracle returned {} durations for {} origins",
                matrix.durations.len(),
                snapshots.len()
            )));
        }

        let cursor = matrix.best_index.max(0) as usize;
        let candidates: Vec<Candidate> = snapshots
            .iter()
            .zip(matrix.durations.iter())
            .enumerate()
            .map(|(i, (snapshot, eta))| Candidate {
                driver_id: snapshot.id.clone(),
                push_address: snapshot.push_address.clone(),
                eta_seconds: *eta,
                status: if i < cursor {
                    CandidateStatus::Skipped
                } else {
                    CandidateStatus::Pending
                },
            })
            .collect();

        let quoted_fare = self.quote_fare(&pickup, &destination).await;

        let dispatch = Dispatch {
            id: id.clone(),
            rider_id: request.rider_id.clone(),
            pickup,
            destination,
            vehicle_type: vehicle_type.unwrap_or(VehicleType::Car),
            candidates,
            cursor,
            outcome: DispatchOutcome::Pending,
            ride_id: None,
            quoted_fare,
            ack_seconds,
            correlation_id: correlation_id.to_string(),
            created_at: Utc::now(),
        };
        let candidate_count = dispatch.candidates.len();
        self.dispatches.create(dispatch).await?;

        let envelope = StartDispatchResponse {
            dispatch_id: id.clone(),
            candidate_count,
            cursor,
            ack_sec: ack_seconds,
            quoted_fare,
        };

        if let Some(winner) = self.idempotency.put_if_absent(&key, &envelope).await? {
            // Lost a race with an identical request; fold into the winner and
            // retire the record we just wrote.
            tracing::info!(
                "dispatch {} lost idempotency race to {} [{}]",
                id,
                winner.dispatch_id,
                correlation_id
            );
            let _ = self.dispatches.cancel(&id).await;
            return Ok(winner);
        }

        self.queue.enqueue(OfferTask::new(&id)).await?;
        tracing::info!(
            "dispatch {} created with {} candidates, cursor {} [{}]",
            id,
            candidate_count,
            cursor,
            correlation_id
        );
        Ok(envelope)
    }

    /// Never blocks: one conditional write, then an immediate answer.
    pub async fn ack_offer(
        &self,
        dispatch_id: &str,
        request: AckOfferRequest,
    ) -> KestrelResult<OkResponse> {
        if !IdGenerator::validate_id(dispatch_id, Some(IdType::Dispatch)) {
            return Err(KestrelError::DispatchNotFound(dispatch_id.to_string()));
        }
        let dispatch = self
            .dispatches
            .read(dispatch_id)
            .await?
            .ok_or_else(|| KestrelError::DispatchNotFound(dispatch_id.to_string()))?;
        if dispatch.outcome.is_terminal() {
            return Err(KestrelError::gone("dispatch already settled"));
        }

        let index = dispatch
            .candidates
            .iter()
            .position(|c| c.driver_id == request.driver_id)
            .ok_or_else(|| {
                KestrelError::not_found(format!(
                    "driver {} is not a candidate of {}",
                    request.driver_id, dispatch_id
                ))
            })?;

        let desired = if request.accepted {
            CandidateStatus::Acked
        } else {
            CandidateStatus::Rejected
        };
        let current = dispatch.candidates[index].status;
        if current == desired || (current == CandidateStatus::Assigned && request.accepted) {
            return Ok(OkResponse::yes());
        }
        if current == CandidateStatus::Pending {
            return Err(KestrelError::conflict("offer not yet made to this driver"));
        }

        match self
            .dispatches
            .set_candidate_status(dispatch_id, index, CandidateStatus::Offered, desired)
            .await?
        {
            CasOutcome::Applied => {
                tracing::info!(
                    "driver {} {} offer on dispatch {}",
                    request.driver_id,
                    if request.accepted { "accepted" } else { "rejected" },
                    dispatch_id
                );
                Ok(OkResponse::yes())
            }
            CasOutcome::Conflict => {
                let now = self
                    .dispatches
                    .read(dispatch_id)
                    .await?
                    .ok_or_else(|| KestrelError::DispatchNotFound(dispatch_id.to_string()))?;
                let status = now.candidates[index].status;
                if status == desired || (status == CandidateStatus::Assigned && request.accepted) {
                    return Ok(OkResponse::yes());
                }
                match status {
                    CandidateStatus::TimedOut | CandidateStatus::Skipped => {
                        Err(KestrelError::gone("offer window already elapsed"))
                    }
                    _ if now.outcome.is_terminal() => {
                        Err(KestrelError::gone("dispatch already settled"))
                    }
                    _ => Err(KestrelError::conflict("offer already answered")),
                }
            }
        }
    }

    pub async fn cancel_dispatch(&self, dispatch_id: &str) -> KestrelResult<OkResponse> {
        if !IdGenerator::validate_id(dispatch_id, Some(IdType::Dispatch)) {
            return Err(KestrelError::DispatchNotFound(dispatch_id.to_string()));
        }
        match self.dispatches.cancel(dispatch_id).await? {
            CasOutcome::Applied => {
                tracing::info!("dispatch {} cancelled", dispatch_id);
                Ok(OkResponse::yes())
            }
            CasOutcome::Conflict => Err(KestrelError::conflict("dispatch already terminal")),
        }
    }

    pub async fn get_dispatch(&self, dispatch_id: &str) -> KestrelResult<DispatchView> {
        if !IdGenerator::validate_id(dispatch_id, Some(IdType::Dispatch)) {
            return Err(KestrelError::DispatchNotFound(dispatch_id.to_string()));
        }
        let dispatch = self
            .dispatches
            .read(dispatch_id)
            .await?
            .ok_or_else(|| KestrelError::DispatchNotFound(dispatch_id.to_string()))?;
        Ok(dispatch.into())
    }

    async fn resolve_place(&self, text: &str) -> KestrelResult<Place> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(KestrelError::validation_error("location", "must not be empty"));
        }
        if let Some(point) = GeoPoint::parse(trimmed) {
            return Ok(Place {
                label: trimmed.to_string(),
                point,
            });
        }
        match self.geocoder.geocode(trimmed).await? {
            Some(point) => Ok(Place {
                label: trimmed.to_string(),
                point,
            }),
            None => Err(KestrelError::GeocodeMiss(trimmed.to_string())),
        }
    }

    /// Quoted once here and frozen on the dispatch; the scheduler copies it
    /// onto the ride verbatim at assignment.
    async fn quote_fare(&self, pickup: &Place, destination: &Place) -> i64 {
        let surge = match self.geocoder.surge_factor(pickup.point).await {
            Ok(s) if s.is_finite() && s > 0.0 => s,
            Ok(_) => 1.0,
            Err(err) => {
                tracing::warn!("surge lookup failed, using 1.0: {}", err);
                1.0
            }
        };
        let distance_km = pickup.point.distance_m(&destination.point) / 1000.0;
        let metered = self.config.fare_base + (self.config.fare_per_km as f64 * distance_km) as i64;
        ((metered as f64 * surge) as i64).max(self.config.fare_base).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dispatch::VehicleType;
    use crate::models::driver::{Availability, DriverSnapshot};
    use crate::services::dispatch_store::MemoryDispatchStore;
    use crate::services::eta_service::{matrix_from, EtaMatrix};
    use crate::services::geo_service::MemoryDriverIndex;
    use crate::services::idempotency::MemoryIdempotencyCache;
    use crate::services::offer_queue::InMemoryOfferQueue;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Scripted oracle: raw durations fixed, bound semantics applied per
    /// call like the real client does.
    struct StubEta {
        raw: Vec<Option<u32>>,
        calls: Mutex<u32>,
    }

    impl StubEta {
        fn new(raw: Vec<Option<u32>>) -> Self {
            Self {
                raw,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl EtaOracle for StubEta {
        async fn multi_eta(
            &self,
            origins: &[GeoPoint],
            _destination: GeoPoint,
            bound_seconds: Option<u32>,
        ) -> KestrelResult<EtaMatrix> {
            *self.calls.lock().unwrap() += 1;
            assert_eq!(origins.len(), self.raw.len());
            Ok(matrix_from(self.raw.clone(), bound_seconds))
        }
    }

    struct StubGeocoder {
        places: HashMap<String, GeoPoint>,
        surge: f64,
    }

    #[async_trait]
    impl Geocoder for StubGeocoder {
        async fn geocode(&self, text: &str) -> KestrelResult<Option<GeoPoint>> {
            Ok(self.places.get(text).copied())
        }

        async fn surge_factor(&self, _at: GeoPoint) -> KestrelResult<f64> {
            Ok(self.surge)
        }
    }

    struct Fixture {
        service: DispatchService,
        dispatches: Arc<MemoryDispatchStore>,
        rx: mpsc::UnboundedReceiver<OfferTask>,
    }

    async fn fixture_with(raw_etas: Vec<Option<u32>>, driver_count: usize) -> (Fixture, Arc<StubEta>) {
        let dispatches = Arc::new(MemoryDispatchStore::new());
        let drivers = Arc::new(MemoryDriverIndex::new());
        for i in 0..driver_count {
            drivers
                .upsert(DriverSnapshot {
                    id: format!("drv-26010{}-aaaa{}", i, i),
                    // Ascending distance from the pickup below.
                    position: GeoPoint::new(5.5500 + 0.001 * (i as f64 + 1.0), -0.1800),
                    vehicle_type: VehicleType::Car,
                    availability: Availability::Active,
                    push_address: Some(format!("token-{}", i)),
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let eta = Arc::new(StubEta::new(raw_etas));
        let geocoder = Arc::new(StubGeocoder {
            places: HashMap::from([("Airport".to_string(), GeoPoint::new(5.60, -0.17))]),
            surge: 1.0,
        });
        let (queue, rx) = InMemoryOfferQueue::channel();
        let service = DispatchService::new(
            dispatches.clone(),
            drivers,
            eta.clone(),
            geocoder,
            Arc::new(MemoryIdempotencyCache::new()),
            Arc::new(queue),
            RetryPolicy::default(),
            DispatchConfig::default(),
        );
        (
            Fixture {
                service,
                dispatches,
                rx,
            },
            eta,
        )
    }

    fn start_request() -> StartDispatchRequest {
        StartDispatchRequest {
            rider_id: "usr-260101-aaaaa".to_string(),
            pickup: "5.5500,-0.1800".to_string(),
            destination: "Airport".to_string(),
            vehicle_type: Some("car".to_string()),
            radius_km: Some(10.0),
            limit: Some(10),
            bound_sec: None,
            ack_sec: Some(30),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn start_builds_candidates_and_enqueues_one_task() {
        let (mut fx, _eta) = fixture_with(vec![Some(300), Some(240), Some(360)], 3).await;

        let response = fx.service.start_dispatch(start_request(), "corr-1").await.unwrap();
        assert_eq!(response.candidate_count, 3);
        // Argmin of the ETAs, not of the distances.
        assert_eq!(response.cursor, 1);
        assert_eq!(response.ack_sec, 30);
        assert!(response.quoted_fare > 0);

        let d = fx.dispatches.read(&response.dispatch_id).await.unwrap().unwrap();
        assert_eq!(d.outcome, DispatchOutcome::Pending);
        assert_eq!(d.candidates[0].status, CandidateStatus::Skipped);
        assert_eq!(d.candidates[1].status, CandidateStatus::Pending);
        assert_eq!(d.candidates[1].eta_seconds, Some(240));
        assert_eq!(d.correlation_id, "corr-1");
        assert_eq!(d.quoted_fare, response.quoted_fare);

        let task = fx.rx.try_recv().unwrap();
        assert_eq!(task.dispatch_id, response.dispatch_id);
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bounded_selection_falls_back_to_unbounded() {
        let (mut fx, eta) = fixture_with(vec![Some(300), Some(240)], 2).await;

        let mut request = start_request();
        request.bound_sec = Some(60);
        let response = fx.service.start_dispatch(request, "corr-1").await.unwrap();

        // Bounded pass emptied out, unbounded pass supplied the order.
        assert_eq!(eta.calls(), 2);
        assert_eq!(response.cursor, 1);
        let d = fx.dispatches.read(&response.dispatch_id).await.unwrap().unwrap();
        assert_eq!(d.candidates[0].eta_seconds, Some(300));
        assert_eq!(d.candidates[1].eta_seconds, Some(240));
        assert!(fx.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn bound_that_keeps_someone_needs_no_fallback() {
        let (fx, eta) = fixture_with(vec![Some(300), Some(40)], 2).await;

        let mut request = start_request();
        request.bound_sec = Some(60);
        let response = fx.service.start_dispatch(request, "corr-1").await.unwrap();
        assert_eq!(response.cursor, 1);
        assert_eq!(eta.calls(), 1);

        // The over-bound entry stays blanked in the persisted record.
        let d = fx.dispatches.read(&response.dispatch_id).await.unwrap().unwrap();
        assert_eq!(d.candidates[0].eta_seconds, None);
        assert_eq!(d.candidates[1].eta_seconds, Some(40));
    }

    #[tokio::test]
    async fn no_drivers_nearby_persists_an_exhausted_record() {
        let (mut fx, _eta) = fixture_with(vec![], 0).await;

        let err = fx.service.start_dispatch(start_request(), "corr-1").await.unwrap_err();
        assert!(matches!(err, KestrelError::NoDriversNearby));

        let records = fx.dispatches.all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, DispatchOutcome::Exhausted);
        assert!(records[0].candidates.is_empty());
        // Nothing for the scheduler to do.
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_start_within_ttl_returns_the_same_dispatch() {
        let (mut fx, _eta) = fixture_with(vec![Some(120), Some(150)], 2).await;

        let first = fx.service.start_dispatch(start_request(), "corr-1").await.unwrap();
        let second = fx.service.start_dispatch(start_request(), "corr-2").await.unwrap();
        assert_eq!(first.dispatch_id, second.dispatch_id);

        // One dispatch, one task.
        assert_eq!(fx.dispatches.all().await.len(), 1);
        assert!(fx.rx.try_recv().is_ok());
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn client_idempotency_key_is_used_verbatim() {
        let (mut fx, _eta) = fixture_with(vec![Some(120), Some(150)], 2).await;

        let mut a = start_request();
        a.idempotency_key = Some("retry-1".to_string());
        let mut b = start_request();
        b.destination = "5.70,-0.20".to_string(); // different body, same key
        b.idempotency_key = Some("retry-1".to_string());

        let first = fx.service.start_dispatch(a, "corr-1").await.unwrap();
        let second = fx.service.start_dispatch(b, "corr-2").await.unwrap();
        assert_eq!(first.dispatch_id, second.dispatch_id);
    }

    #[tokio::test]
    async fn start_validates_inputs() {
        let (fx, _eta) = fixture_with(vec![Some(120)], 1).await;

        let mut bad_radius = start_request();
        bad_radius.radius_km = Some(80.0);
        assert!(matches!(
            fx.service.start_dispatch(bad_radius, "c").await.unwrap_err(),
            KestrelError::ValidationFailed(_)
        ));

        let mut bad_ack = start_request();
        bad_ack.ack_sec = Some(3);
        assert!(matches!(
            fx.service.start_dispatch(bad_ack, "c").await.unwrap_err(),
            KestrelError::ValidationFailed(_)
        ));

        let mut bad_vehicle = start_request();
        bad_vehicle.vehicle_type = Some("rickshaw".to_string());
        assert!(matches!(
            fx.service.start_dispatch(bad_vehicle, "c").await.unwrap_err(),
            KestrelError::InvalidFieldValue { .. }
        ));

        let mut unknown_place = start_request();
        unknown_place.destination = "Nowhere In Particular".to_string();
        assert!(matches!(
            fx.service.start_dispatch(unknown_place, "c").await.unwrap_err(),
            KestrelError::GeocodeMiss(_)
        ));
    }

    async fn started(fx: &mut Fixture) -> String {
        let response = fx.service.start_dispatch(start_request(), "corr-1").await.unwrap();
        response.dispatch_id
    }

    fn driver_at(index: usize) -> String {
        format!("drv-26010{}-aaaa{}", index, index)
    }

    fn ack(driver_id: &str, accepted: bool) -> AckOfferRequest {
        AckOfferRequest {
            driver_id: driver_id.to_string(),
            accepted,
        }
    }

    #[tokio::test]
    async fn ack_accepts_an_offered_candidate_once() {
        let (mut fx, _eta) = fixture_with(vec![Some(120), Some(150)], 2).await;
        let id = started(&mut fx).await;

        // Cursor sits at 0; the scheduler would have offered candidate 0.
        fx.dispatches
            .set_candidate_status(&id, 0, CandidateStatus::Pending, CandidateStatus::Offered)
            .await
            .unwrap();

        assert!(fx.service.ack_offer(&id, ack(&driver_at(0), true)).await.unwrap().ok);
        // Duplicate ack is the same successful answer.
        assert!(fx.service.ack_offer(&id, ack(&driver_at(0), true)).await.unwrap().ok);

        // The other direction now conflicts.
        let err = fx.service.ack_offer(&id, ack(&driver_at(0), false)).await.unwrap_err();
        assert!(matches!(err, KestrelError::Conflict(_)));
    }

    #[tokio::test]
    async fn ack_before_offer_is_a_conflict() {
        let (mut fx, _eta) = fixture_with(vec![Some(120), Some(150)], 2).await;
        let id = started(&mut fx).await;

        let err = fx.service.ack_offer(&id, ack(&driver_at(1), true)).await.unwrap_err();
        assert!(matches!(err, KestrelError::Conflict(_)));
    }

    #[tokio::test]
    async fn late_ack_after_timeout_is_gone() {
        let (mut fx, _eta) = fixture_with(vec![Some(120), Some(150)], 2).await;
        let id = started(&mut fx).await;

        fx.dispatches
            .set_candidate_status(&id, 0, CandidateStatus::Pending, CandidateStatus::Offered)
            .await
            .unwrap();
        fx.dispatches
            .set_candidate_status(&id, 0, CandidateStatus::Offered, CandidateStatus::TimedOut)
            .await
            .unwrap();

        let err = fx.service.ack_offer(&id, ack(&driver_at(0), true)).await.unwrap_err();
        assert!(matches!(err, KestrelError::Gone(_)));

        // State untouched by the rejected ack.
        let d = fx.dispatches.read(&id).await.unwrap().unwrap();
        assert_eq!(d.candidates[0].status, CandidateStatus::TimedOut);
    }

    #[tokio::test]
    async fn ack_after_cancel_is_gone() {
        let (mut fx, _eta) = fixture_with(vec![Some(120), Some(150)], 2).await;
        let id = started(&mut fx).await;

        fx.dispatches
            .set_candidate_status(&id, 0, CandidateStatus::Pending, CandidateStatus::Offered)
            .await
            .unwrap();
        fx.service.cancel_dispatch(&id).await.unwrap();

        let err = fx.service.ack_offer(&id, ack(&driver_at(0), true)).await.unwrap_err();
        assert!(matches!(err, KestrelError::Gone(_)));
    }

    #[tokio::test]
    async fn competing_acks_allow_at_most_one_winner() {
        let (mut fx, _eta) = fixture_with(vec![Some(120), Some(150)], 2).await;
        let id = started(&mut fx).await;

        fx.dispatches
            .set_candidate_status(&id, 0, CandidateStatus::Pending, CandidateStatus::Offered)
            .await
            .unwrap();

        assert!(fx.service.ack_offer(&id, ack(&driver_at(0), true)).await.unwrap().ok);
        // The second driver was never offered; its ack cannot succeed.
        let err = fx.service.ack_offer(&id, ack(&driver_at(1), true)).await.unwrap_err();
        assert!(matches!(err, KestrelError::Conflict(_) | KestrelError::Gone(_)));

        let d = fx.dispatches.read(&id).await.unwrap().unwrap();
        let acked = d
            .candidates
            .iter()
            .filter(|c| c.status == CandidateStatus::Acked)
            .count();
        assert_eq!(acked, 1);
    }

    #[tokio::test]
    async fn ack_unknown_dispatch_or_driver_is_not_found() {
        let (mut fx, _eta) = fixture_with(vec![Some(120), Some(150)], 2).await;
        let id = started(&mut fx).await;

        let err = fx
            .service
            .ack_offer("dsp-260101-zzzzzz", ack(&driver_at(0), true))
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::DispatchNotFound(_)));

        // Malformed ids are rejected without a store round-trip.
        let err = fx
            .service
            .ack_offer("not-a-dispatch-id", ack(&driver_at(0), true))
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::DispatchNotFound(_)));

        let err = fx
            .service
            .ack_offer(&id, ack("drv-260101-zzzzz", true))
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_is_terminal_once() {
        let (mut fx, _eta) = fixture_with(vec![Some(120), Some(150)], 2).await;
        let id = started(&mut fx).await;

        assert!(fx.service.cancel_dispatch(&id).await.unwrap().ok);
        let err = fx.service.cancel_dispatch(&id).await.unwrap_err();
        assert!(matches!(err, KestrelError::Conflict(_)));

        let view = fx.service.get_dispatch(&id).await.unwrap();
        assert_eq!(view.outcome, DispatchOutcome::Cancelled);
    }
}
