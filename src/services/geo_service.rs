// src/services/geo_service.rs
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::errors::{KestrelError, KestrelResult};
use crate::models::dispatch::VehicleType;
use crate::models::driver::{Availability, DriverSnapshot, GeoPoint};

pub const MAX_RADIUS_M: f64 = 50_000.0;
pub const MAX_LIMIT: usize = 50;

/// Queryable index of active drivers plus the write side that driver apps
/// feed. `set_availability` doubles as the driver-registry contract: callers
/// treat it as best-effort and idempotent.
#[async_trait]
pub trait DriverIndex: Send + Sync {
    /// Active drivers within `radius_m` of `origin`, ascending great-circle
    /// distance, capped at `limit`.
    async fn nearby(
        &self,
        origin: GeoPoint,
        radius_m: f64,
        vehicle_type: Option<VehicleType>,
        limit: usize,
    ) -> KestrelResult<Vec<DriverSnapshot>>;

    /// Position/vehicle/address feed. A known driver keeps its stored
    /// availability; the snapshot's availability only seeds new entries.
    async fn upsert(&self, snapshot: DriverSnapshot) -> KestrelResult<()>;

    async fn set_availability(
        &self,
        driver_id: &str,
        availability: Availability,
    ) -> KestrelResult<()>;
}

fn validate_query(origin: GeoPoint, radius_m: f64, limit: usize) -> KestrelResult<()> {
    if !origin.is_valid() {
        return Err(KestrelError::validation_error("origin", "invalid coordinates"));
    }
    if !(1.0..=MAX_RADIUS_M).contains(&radius_m) {
        return Err(KestrelError::validation_error(
            "radius",
            "must be between 1 m and 50 km",
        ));
    }
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(KestrelError::validation_error("limit", "must be between 1 and 50"));
    }
    Ok(())
}

// ------------------------------
// In-memory implementation
// ------------------------------

pub struct MemoryDriverIndex {
    drivers: RwLock<HashMap<String, DriverSnapshot>>,
}

impl MemoryDriverIndex {
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, driver_id: &str) -> Option<DriverSnapshot> {
        self.drivers.read().await.get(driver_id).cloned()
    }
}

impl Default for MemoryDriverIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverIndex for MemoryDriverIndex {
    async fn nearby(
        &self,
        origin: GeoPoint,
        radius_m: f64,
        vehicle_type: Option<VehicleType>,
        limit: usize,
    ) -> KestrelResult<Vec<DriverSnapshot>> {
        validate_query(origin, radius_m, limit)?;

        let drivers = self.drivers.read().await;
        let mut hits: Vec<(f64, DriverSnapshot)> = drivers
            .values()
            .filter(|d| d.availability == Availability::Active)
            .filter(|d| vehicle_type.map_or(true, |vt| d.vehicle_type == vt))
            .filter_map(|d| {
                let distance = origin.distance_m(&d.position);
                (distance <= radius_m).then(|| (distance, d.clone()))
            })
            .collect();

        hits.sort_by(|a, b| a.0.total_cmp(&b.0));
        hits.truncate(limit);
        Ok(hits.into_iter().map(|(_, d)| d).collect())
    }

    async fn upsert(&self, mut snapshot: DriverSnapshot) -> KestrelResult<()> {
        if !snapshot.position.is_valid() {
            return Err(KestrelError::validation_error("position", "invalid coordinates"));
        }
        let mut drivers = self.drivers.write().await;
        // A position ping must not clobber an assignment in flight.
        if let Some(existing) = drivers.get(&snapshot.id) {
            snapshot.availability = existing.availability;
        }
        drivers.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    async fn set_availability(
        &self,
        driver_id: &str,
        availability: Availability,
    ) -> KestrelResult<()> {
        let mut drivers = self.drivers.write().await;
        let driver = drivers
            .get_mut(driver_id)
            .ok_or_else(|| KestrelError::DriverNotFound(driver_id.to_string()))?;
        driver.availability = availability;
        driver.updated_at = chrono::Utc::now();
        Ok(())
    }
}

// ------------------------------
// Redis implementation
// ------------------------------

/// GEOADD/GEOSEARCH over `drivers:geo`, with the full snapshot as a JSON
/// document under `driver:{id}`.
pub struct RedisDriverIndex {
    client: redis::Client,
}

// GEOSEARCH returns by distance only; availability and vehicle filters are
// applied on the documents afterwards, so the search over-fetches.
const GEO_OVERFETCH: usize = 200;

impl RedisDriverIndex {
    pub fn new(redis_url: &str) -> KestrelResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    fn doc_key(id: &str) -> String {
        format!("driver:{}", id)
    }

    async fn read_snapshot(
        conn: &mut redis::aio::Connection,
        id: &str,
    ) -> KestrelResult<Option<DriverSnapshot>> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::doc_key(id))
            .query_async(conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DriverIndex for RedisDriverIndex {
    async fn nearby(
        &self,
        origin: GeoPoint,
        radius_m: f64,
        vehicle_type: Option<VehicleType>,
        limit: usize,
    ) -> KestrelResult<Vec<DriverSnapshot>> {
        validate_query(origin, radius_m, limit)?;

        let mut conn = self.client.get_async_connection().await?;
        let ids: Vec<String> = redis::cmd("GEOSEARCH")
            .arg("drivers:geo")
            .arg("FROMLONLAT")
            .arg(origin.lon)
            .arg(origin.lat)
            .arg("BYRADIUS")
            .arg(radius_m)
            .arg("m")
            .arg("ASC")
            .arg("COUNT")
            .arg(GEO_OVERFETCH)
            .query_async(&mut conn)
            .await?;

        let mut hits = Vec::new();
        for id in ids {
            let Some(snapshot) = Self::read_snapshot(&mut conn, &id).await? else {
                // Geo entry outlived its document; skip the stale member.
                continue;
            };
            if snapshot.availability != Availability::Active {
                continue;
            }
            if let Some(vt) = vehicle_type {
                if snapshot.vehicle_type != vt {
                    continue;
                }
            }
            hits.push(snapshot);
            if hits.len() == limit {
                break;
            }
        }
        Ok(hits)
    }

    async fn upsert(&self, mut snapshot: DriverSnapshot) -> KestrelResult<()> {
        if !snapshot.position.is_valid() {
            return Err(KestrelError::validation_error("position", "invalid coordinates"));
        }
        let mut conn = self.client.get_async_connection().await?;
        // A position ping must not clobber an assignment in flight.
        if let Some(existing) = Self::read_snapshot(&mut conn, &snapshot.id).await? {
            snapshot.availability = existing.availability;
        }
        let json = serde_json::to_string(&snapshot)?;
        let _: () = redis::cmd("SET")
            .arg(Self::doc_key(&snapshot.id))
            .arg(json)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("GEOADD")
            .arg("drivers:geo")
            .arg(snapshot.position.lon)
            .arg(snapshot.position.lat)
            .arg(&snapshot.id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_availability(
        &self,
        driver_id: &str,
        availability: Availability,
    ) -> KestrelResult<()> {
        let mut conn = self.client.get_async_connection().await?;
        let mut snapshot = Self::read_snapshot(&mut conn, driver_id)
            .await?
            .ok_or_else(|| KestrelError::DriverNotFound(driver_id.to_string()))?;
        snapshot.availability = availability;
        snapshot.updated_at = chrono::Utc::now();
        let json = serde_json::to_string(&snapshot)?;
        let _: () = redis::cmd("SET")
            .arg(Self::doc_key(driver_id))
            .arg(json)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
