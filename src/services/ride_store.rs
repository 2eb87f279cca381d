// src/services/ride_store.rs
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::errors::{KestrelError, KestrelResult};
use crate::models::ride::{Ride, RideStatus};
use crate::services::dispatch_store::CasOutcome;

/// Durable ride records. The OTP is write-only on read paths unless the
/// caller explicitly asks for it.
#[async_trait]
pub trait RideStore: Send + Sync {
    async fn create(&self, ride: Ride) -> KestrelResult<()>;

    async fn read(&self, id: &str, include_otp: bool) -> KestrelResult<Option<Ride>>;

    /// Conditional lifecycle transition; conflicts when the stored status is
    /// not `from` or the edge is not an allowed one.
    async fn transition(&self, id: &str, from: RideStatus, to: RideStatus)
        -> KestrelResult<CasOutcome>;
}

// ------------------------------
// In-memory implementation
// ------------------------------

pub struct MemoryRideStore {
    records: RwLock<HashMap<String, Ride>>,
}

impl MemoryRideStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// All rides, unredacted. Handy for assertions and admin tooling.
    pub async fn all(&self) -> Vec<Ride> {
        self.records.read().await.values().cloned().collect()
    }
}

impl Default for MemoryRideStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RideStore for MemoryRideStore {
    async fn create(&self, ride: Ride) -> KestrelResult<()> {
        let mut records = self.records.write().await;
        records.insert(ride.id.clone(), ride);
        Ok(())
    }

    async fn read(&self, id: &str, include_otp: bool) -> KestrelResult<Option<Ride>> {
        let records = self.records.read().await;
        Ok(records.get(id).cloned().map(|ride| {
            if include_otp {
                ride
            } else {
                ride.redacted()
            }
        }))
    }

    async fn transition(
        &self,
        id: &str,
        from: RideStatus,
        to: RideStatus,
    ) -> KestrelResult<CasOutcome> {
        if !from.can_transition(to) {
            return Ok(CasOutcome::Conflict);
        }
        let mut records = self.records.write().await;
        let ride = records
            .get_mut(id)
            .ok_or_else(|| KestrelError::RideNotFound(id.to_string()))?;
        if ride.status != from {
            return Ok(CasOutcome::Conflict);
        }
        ride.status = to;
        ride.updated_at = chrono::Utc::now();
        Ok(CasOutcome::Applied)
    }
}

// ------------------------------
// Redis implementation
// ------------------------------

/// One JSON document per ride under `ride:{id}`; the transition runs as a Lua
/// script for the same atomicity as the dispatch store.
pub struct RedisRideStore {
    client: redis::Client,
    transition: redis::Script,
}

const TRANSITION_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local r = cjson.decode(raw)
if r.status ~= ARGV[1] then return 'conflict' end
r.status = ARGV[2]
redis.call('SET', KEYS[1], cjson.encode(r))
return 'ok'
"#;

impl RedisRideStore {
    pub fn new(redis_url: &str) -> KestrelResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            transition: redis::Script::new(TRANSITION_LUA),
        })
    }

    fn key(id: &str) -> String {
        format!("ride:{}", id)
    }

    fn status_wire(status: RideStatus) -> &'static str {
        match status {
            RideStatus::Accepted => "accepted",
            RideStatus::Ongoing => "ongoing",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

#[async_trait]
impl RideStore for RedisRideStore {
    async fn create(&self, ride: Ride) -> KestrelResult<()> {
        let mut conn = self.client.get_async_connection().await?;
        let json = serde_json::to_string(&ride)?;
        let _: () = redis::cmd("SET")
            .arg(Self::key(&ride.id))
            .arg(json)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read(&self, id: &str, include_otp: bool) -> KestrelResult<Option<Ride>> {
        let mut conn = self.client.get_async_connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => {
                let ride: Ride = serde_json::from_str(&json)?;
                Ok(Some(if include_otp { ride } else { ride.redacted() }))
            }
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        id: &str,
        from: RideStatus,
        to: RideStatus,
    ) -> KestrelResult<CasOutcome> {
        if !from.can_transition(to) {
            return Ok(CasOutcome::Conflict);
        }
        let mut conn = self.client.get_async_connection().await?;
        let verdict: String = self
            .transition
            .key(Self::key(id))
            .arg(Self::status_wire(from))
            .arg(Self::status_wire(to))
            .invoke_async(&mut conn)
            .await?;
        match verdict.as_str() {
            "ok" => Ok(CasOutcome::Applied),
            "conflict" => Ok(CasOutcome::Conflict),
            "missing" => Err(KestrelError::RideNotFound(id.to_string())),
            other => Err(KestrelError::internal(format!(
                "unexpected script verdict: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dispatch::Place;
    use crate::models::driver::GeoPoint;
    use chrono::Utc;

    fn sample_ride(id: &str) -> Ride {
        Ride {
            id: id.to_string(),
            rider_id: "usr-260101-aaaaa".to_string(),
            driver_id: "drv-260101-bbbbb".to_string(),
            pickup: Place {
                label: "Osu".to_string(),
                point: GeoPoint::new(5.55, -0.18),
            },
            destination: Place {
                label: "Airport".to_string(),
                point: GeoPoint::new(5.60, -0.17),
            },
            fare: 3200,
            status: RideStatus::Accepted,
            otp: "042137".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn otp_redacted_by_default() {
        let store = MemoryRideStore::new();
        store.create(sample_ride("rid-1")).await.unwrap();

        let plain = store.read("rid-1", false).await.unwrap().unwrap();
        assert!(plain.otp.is_empty());

        let with_otp = store.read("rid-1", true).await.unwrap().unwrap();
        assert_eq!(with_otp.otp, "042137");
    }

    #[tokio::test]
    async fn transitions_follow_lifecycle() {
        let store = MemoryRideStore::new();
        store.create(sample_ride("rid-1")).await.unwrap();

        assert_eq!(
            store
                .transition("rid-1", RideStatus::Accepted, RideStatus::Ongoing)
                .await
                .unwrap(),
            CasOutcome::Applied
        );
        // Stale expectation conflicts.
        assert_eq!(
            store
                .transition("rid-1", RideStatus::Accepted, RideStatus::Cancelled)
                .await
                .unwrap(),
            CasOutcome::Conflict
        );
        // Disallowed edge conflicts even with a fresh read.
        assert_eq!(
            store
                .transition("rid-1", RideStatus::Ongoing, RideStatus::Accepted)
                .await
                .unwrap(),
            CasOutcome::Conflict
        );
        assert_eq!(
            store
                .transition("rid-1", RideStatus::Ongoing, RideStatus::Completed)
                .await
                .unwrap(),
            CasOutcome::Applied
        );
    }

    #[tokio::test]
    async fn missing_ride_is_not_found() {
        let store = MemoryRideStore::new();
        let err = store
            .transition("rid-nope", RideStatus::Accepted, RideStatus::Ongoing)
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::RideNotFound(_)));
    }
}
