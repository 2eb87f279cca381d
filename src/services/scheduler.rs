// src/services/scheduler.rs
//
// The offer scheduler walks a dispatch's candidate list: emit the offer, wait
// out the ack window, commit the first acceptance or advance the cursor.
// Exactly one worker owns a dispatch at a time; everything it writes goes
// through the store's conditional operations, so a buggy double-lease still
// cannot corrupt a record.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::errors::KestrelResult;
use crate::models::dispatch::{Candidate, CandidateStatus, Dispatch};
use crate::models::driver::Availability;
use crate::models::events;
use crate::models::ride::{Ride, RideStatus};
use crate::services::dispatch_store::{CasOutcome, DispatchStore};
use crate::services::geo_service::DriverIndex;
use crate::services::offer_queue::{OfferQueue, OfferTask};
use crate::services::push_service::PushBus;
use crate::services::ride_store::RideStore;
use crate::utils::ids::{generate_otp, IdGenerator, IdType};

/// What the wait for one candidate resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitVerdict {
    /// The candidate left the offered state; here is where it landed.
    Status(CandidateStatus),
    /// The dispatch outcome went terminal while we were waiting.
    DispatchTerminal,
}

pub struct OfferScheduler {
    dispatches: Arc<dyn DispatchStore>,
    rides: Arc<dyn RideStore>,
    drivers: Arc<dyn DriverIndex>,
    bus: Arc<dyn PushBus>,
    poll_interval: Duration,
}

impl OfferScheduler {
    pub fn new(
        dispatches: Arc<dyn DispatchStore>,
        rides: Arc<dyn RideStore>,
        drivers: Arc<dyn DriverIndex>,
        bus: Arc<dyn PushBus>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            dispatches,
            rides,
            drivers,
            bus,
            poll_interval,
        }
    }

    /// Drive one dispatch to a terminal outcome. Safe to replay: a terminal
    /// record makes this a no-op, and a partially-walked record resumes from
    /// the current cursor.
    pub async fn run_task(&self, task: &OfferTask) -> KestrelResult<()> {
        let id = &task.dispatch_id;

        loop {
            let Some(dispatch) = self.dispatches.read(id).await? else {
                tracing::warn!("offer task for unknown dispatch {}, dropping", id);
                return Ok(());
            };
            if dispatch.outcome.is_terminal() {
                return Ok(());
            }

            let index = dispatch.cursor;
            if index >= dispatch.candidates.len() {
                if self.dispatches.mark_exhausted(id).await? == CasOutcome::Applied {
                    tracing::info!("dispatch {} exhausted its candidate list", id);
                    self.emit(
                        &events::rider_address(&dispatch.rider_id),
                        events::DISPATCH_FAILED,
                        serde_json::to_value(events::DispatchFailedEvent {
                            dispatch_id: id.clone(),
                            reason: "no driver accepted".to_string(),
                        })
                        .unwrap_or_default(),
                        &dispatch.correlation_id,
                    )
                    .await;
                }
                return Ok(());
            }

            let candidate = dispatch.candidates[index].clone();
            let window = Duration::from_secs(dispatch.ack_seconds);

            let verdict = match candidate.status {
                CandidateStatus::Pending => {
                    self.emit_offer(&dispatch, &candidate).await;
                    // A conflict here means a late ack already flipped the
                    // status; the wait below observes whatever it became.
                    let _ = self
                        .dispatches
                        .set_candidate_status(
                            id,
                            index,
                            CandidateStatus::Pending,
                            CandidateStatus::Offered,
                        )
                        .await?;
                    Some(self.await_ack(id, index, window).await?)
                }
                // Resumed mid-window after a crash: re-arm a full window
                // rather than guess how much of the old one was left.
                CandidateStatus::Offered => Some(self.await_ack(id, index, window).await?),
                CandidateStatus::Acked => Some(WaitVerdict::Status(CandidateStatus::Acked)),
                // Terminal candidate under the cursor (crash between the
                // status write and the cursor advance); just move on.
                _ => None,
            };

            match verdict {
                Some(WaitVerdict::DispatchTerminal) => return Ok(()),
                Some(WaitVerdict::Status(CandidateStatus::Acked)) => {
                    self.complete_assignment(&dispatch, index).await?;
                    return Ok(());
                }
                Some(WaitVerdict::Status(CandidateStatus::Assigned)) => return Ok(()),
                Some(WaitVerdict::Status(_)) | None => {
                    let _ = self.dispatches.advance_cursor(id, index, index + 1).await?;
                }
            }
        }
    }

    /// Wait for the candidate to leave `offered`, for the outcome to go
    /// terminal, or for the window to elapse — whichever comes first. The
    /// fixed-interval re-read keeps external cancellation observable within
    /// one poll period.
    async fn await_ack(
        &self,
        id: &str,
        index: usize,
        window: Duration,
    ) -> KestrelResult<WaitVerdict> {
        let deadline = Instant::now() + window;

        loop {
            let Some(dispatch) = self.dispatches.read(id).await? else {
                return Ok(WaitVerdict::DispatchTerminal);
            };
            if dispatch.outcome.is_terminal() {
                return Ok(WaitVerdict::DispatchTerminal);
            }

            let status = dispatch
                .candidates
                .get(index)
                .map(|c| c.status)
                .unwrap_or(CandidateStatus::Skipped);
            if !matches!(status, CandidateStatus::Pending | CandidateStatus::Offered) {
                return Ok(WaitVerdict::Status(status));
            }

            if Instant::now() >= deadline {
                if status == CandidateStatus::Offered {
                    match self
                        .dispatches
                        .set_candidate_status(
                            id,
                            index,
                            CandidateStatus::Offered,
                            CandidateStatus::TimedOut,
                        )
                        .await?
                    {
                        CasOutcome::Applied => {
                            return Ok(WaitVerdict::Status(CandidateStatus::TimedOut))
                        }
                        // An ack or a cancel beat the deadline write; loop
                        // once more to observe what actually happened.
                        CasOutcome::Conflict => continue,
                    }
                }
                // Never left pending: the offer write itself was lost. Skip
                // the candidate so the round can move on.
                let _ = self
                    .dispatches
                    .set_candidate_status(id, index, CandidateStatus::Pending, CandidateStatus::Skipped)
                    .await?;
                return Ok(WaitVerdict::Status(CandidateStatus::Skipped));
            }

            sleep(self.poll_interval).await;
        }
    }

    /// Materialize the ride, then commit. A commit conflict means the outcome
    /// raced to a terminal state; the just-created ride is compensated.
    /// Returns the committed ride id, or None when compensated.
    async fn complete_assignment(
        &self,
        dispatch: &Dispatch,
        index: usize,
    ) -> KestrelResult<Option<String>> {
        let candidate = &dispatch.candidates[index];
        let ride = Ride {
            id: IdGenerator::generate(IdType::Ride),
            rider_id: dispatch.rider_id.clone(),
            driver_id: candidate.driver_id.clone(),
            pickup: dispatch.pickup.clone(),
            destination: dispatch.destination.clone(),
            fare: dispatch.quoted_fare,
            status: RideStatus::Accepted,
            otp: generate_otp(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.rides.create(ride.clone()).await?;

        match self
            .dispatches
            .commit_assignment(&dispatch.id, index, &ride.id)
            .await?
        {
            CasOutcome::Applied => {
                tracing::info!(
                    "dispatch {} assigned to driver {} as ride {}",
                    dispatch.id,
                    candidate.driver_id,
                    ride.id
                );

                if let Some(address) = &candidate.push_address {
                    self.emit(
                        address,
                        events::RIDE_OFFER_ACCEPTED,
                        serde_json::to_value(events::OfferAcceptedEvent {
                            dispatch_id: dispatch.id.clone(),
                            ride_id: ride.id.clone(),
                        })
                        .unwrap_or_default(),
                        &dispatch.correlation_id,
                    )
                    .await;
                }
                let rider = events::rider_address(&dispatch.rider_id);
                self.emit(
                    &rider,
                    events::RIDE_ASSIGNED,
                    serde_json::to_value(events::RideAssignedEvent {
                        ride_id: ride.id.clone(),
                    })
                    .unwrap_or_default(),
                    &dispatch.correlation_id,
                )
                .await;
                self.emit(
                    &rider,
                    events::RIDE_CONFIRMED,
                    serde_json::to_value(events::RideLifecycleEvent {
                        ride_id: ride.id.clone(),
                        status: RideStatus::Accepted,
                    })
                    .unwrap_or_default(),
                    &dispatch.correlation_id,
                )
                .await;

                // Best-effort: the dispatch outcome is ground truth, a stale
                // availability flag is tolerated.
                if let Err(err) = self
                    .drivers
                    .set_availability(&candidate.driver_id, Availability::Assigned)
                    .await
                {
                    tracing::warn!(
                        "availability update for {} failed: {}",
                        candidate.driver_id,
                        err
                    );
                }
                Ok(Some(ride.id))
            }
            CasOutcome::Conflict => {
                tracing::info!(
                    "assignment commit for dispatch {} lost to a terminal outcome, compensating ride {}",
                    dispatch.id,
                    ride.id
                );
                match self
                    .rides
                    .transition(&ride.id, RideStatus::Accepted, RideStatus::Cancelled)
                    .await
                {
                    Ok(CasOutcome::Applied) => {}
                    Ok(CasOutcome::Conflict) => {
                        tracing::warn!("ride {} moved before compensation could land", ride.id)
                    }
                    Err(err) => {
                        tracing::error!("compensation failed for ride {}: {}", ride.id, err)
                    }
                }
                Ok(None)
            }
        }
    }

    async fn emit_offer(&self, dispatch: &Dispatch, candidate: &Candidate) {
        let Some(address) = &candidate.push_address else {
            tracing::warn!(
                "candidate {} has no push address, offer not emitted",
                candidate.driver_id
            );
            return;
        };
        self.emit(
            address,
            events::RIDE_OFFER,
            serde_json::to_value(events::RideOfferEvent {
                dispatch_id: dispatch.id.clone(),
                driver_id: candidate.driver_id.clone(),
                pickup: dispatch.pickup.label.clone(),
                destination: dispatch.destination.label.clone(),
                eta_seconds: candidate.eta_seconds,
            })
            .unwrap_or_default(),
            &dispatch.correlation_id,
        )
        .await;
    }

    /// Emission is best-effort: failures are logged, never propagated.
    async fn emit(&self, address: &str, event: &str, payload: serde_json::Value, correlation_id: &str) {
        if let Err(err) = self.bus.emit(address, event, payload, correlation_id).await {
            tracing::warn!("emit {} to {} failed: {}", event, address, err);
        }
    }
}

// ------------------------------
// Worker pool
// ------------------------------

const MAX_DELIVERIES: u32 = 3;

/// Workers draining the offer queue. The channel gives each task to exactly
/// one worker; a failed run is redelivered with a bounded attempt count.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        workers: usize,
        receiver: mpsc::UnboundedReceiver<OfferTask>,
        scheduler: Arc<OfferScheduler>,
        queue: Arc<dyn OfferQueue>,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..workers)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let scheduler = Arc::clone(&scheduler);
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    loop {
                        let task = { receiver.lock().await.recv().await };
                        let Some(task) = task else { break };
                        tracing::debug!("worker {} took dispatch {}", worker, task.dispatch_id);
                        if let Err(err) = scheduler.run_task(&task).await {
                            if task.attempt + 1 < MAX_DELIVERIES {
                                tracing::warn!(
                                    "offer task for {} failed on attempt {}, redelivering: {}",
                                    task.dispatch_id,
                                    task.attempt,
                                    err
                                );
                                let _ = queue.enqueue(task.redelivery()).await;
                            } else {
                                tracing::error!(
                                    "offer task for {} gave up after {} deliveries: {}",
                                    task.dispatch_id,
                                    MAX_DELIVERIES,
                                    err
                                );
                            }
                        }
                    }
                })
            })
            .collect();
        Self { handles }
    }

    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
