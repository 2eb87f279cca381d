// src/services/idempotency.rs
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use crate::errors::KestrelResult;
use crate::models::dispatch::{StartDispatchResponse, VehicleType};

pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(3600);

/// Key for a start-dispatch request: the client-supplied key verbatim when
/// present, otherwise rider + fingerprint of the request body.
pub fn idempotency_key(
    rider_id: &str,
    pickup: &str,
    destination: &str,
    vehicle_type: Option<VehicleType>,
    client_key: Option<&str>,
) -> String {
    if let Some(key) = client_key {
        return key.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(pickup.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(destination.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(vehicle_type.map(|vt| vt.as_str()).unwrap_or("any").as_bytes());
    format!("{}:{:x}", rider_id, hasher.finalize())
}

/// Typed cache from request key to the prior dispatch envelope, TTL one hour.
/// `put_if_absent` is compare-and-set: a losing writer gets the winner's
/// stored value back.
#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    async fn get(&self, key: &str) -> KestrelResult<Option<StartDispatchResponse>>;

    async fn put_if_absent(
        &self,
        key: &str,
        value: &StartDispatchResponse,
    ) -> KestrelResult<Option<StartDispatchResponse>>;
}

// ------------------------------
// In-memory implementation
// ------------------------------

pub struct MemoryIdempotencyCache {
    entries: RwLock<HashMap<String, (StartDispatchResponse, Instant)>>,
}

impl MemoryIdempotencyCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryIdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyCache for MemoryIdempotencyCache {
    async fn get(&self, key: &str) -> KestrelResult<Option<StartDispatchResponse>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &StartDispatchResponse,
    ) -> KestrelResult<Option<StartDispatchResponse>> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        if let Some((existing, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(Some(existing.clone()));
            }
        }
        entries.insert(key.to_string(), (value.clone(), now + IDEMPOTENCY_TTL));
        Ok(None)
    }
}

// ------------------------------
// Redis implementation
// ------------------------------

/// `SET NX EX` carries both the compare-and-set and the TTL.
pub struct RedisIdempotencyCache {
    client: redis::Client,
}

impl RedisIdempotencyCache {
    pub fn new(redis_url: &str) -> KestrelResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    fn key(key: &str) -> String {
        format!("idem:{}", key)
    }
}

#[async_trait]
impl IdempotencyCache for RedisIdempotencyCache {
    async fn get(&self, key: &str) -> KestrelResult<Option<StartDispatchResponse>> {
        let mut conn = self.client.get_async_connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(key))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &StartDispatchResponse,
    ) -> KestrelResult<Option<StartDispatchResponse>> {
        let mut conn = self.client.get_async_connection().await?;
        let json = serde_json::to_string(value)?;
        let set: Option<String> = redis::cmd("SET")
            .arg(Self::key(key))
            .arg(&json)
            .arg("NX")
            .arg("EX")
            .arg(IDEMPOTENCY_TTL.as_secs())
            .query_async(&mut conn)
            .await?;
        if set.is_some() {
            return Ok(None);
        }
        // Lost the race; read the winner's envelope.
        self.get(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(id: &str) -> StartDispatchResponse {
        StartDispatchResponse {
            dispatch_id: id.to_string(),
            candidate_count: 3,
            cursor: 0,
            ack_sec: 30,
            quoted_fare: 2000,
        }
    }

    #[test]
    fn client_key_wins_over_fingerprint() {
        let derived = idempotency_key("usr-1", "a", "b", Some(VehicleType::Car), None);
        let explicit = idempotency_key("usr-1", "a", "b", Some(VehicleType::Car), Some("my-key"));
        assert_eq!(explicit, "my-key");
        assert_ne!(derived, explicit);
        assert!(derived.starts_with("usr-1:"));
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = idempotency_key("usr-1", "Osu", "Airport", Some(VehicleType::Car), None);
        let b = idempotency_key("usr-1", "Osu", "Airport", Some(VehicleType::Car), None);
        let c = idempotency_key("usr-1", "Osu", "Airport", Some(VehicleType::Auto), None);
        let d = idempotency_key("usr-2", "Osu", "Airport", Some(VehicleType::Car), None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[tokio::test(start_paused = true)]
    async fn first_writer_wins_until_ttl() {
        let cache = MemoryIdempotencyCache::new();

        assert!(cache.put_if_absent("k", &envelope("dsp-1")).await.unwrap().is_none());

        // Losing writer reads the winner's envelope.
        let loser = cache.put_if_absent("k", &envelope("dsp-2")).await.unwrap();
        assert_eq!(loser.unwrap().dispatch_id, "dsp-1");
        assert_eq!(cache.get("k").await.unwrap().unwrap().dispatch_id, "dsp-1");

        // After the TTL the slot opens again.
        tokio::time::advance(IDEMPOTENCY_TTL + Duration::from_secs(1)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.put_if_absent("k", &envelope("dsp-2")).await.unwrap().is_none());
        assert_eq!(cache.get("k").await.unwrap().unwrap().dispatch_id, "dsp-2");
    }
}
