// src/state.rs
use std::sync::Arc;
use std::time::Duration;

use crate::errors::KestrelResult;
use crate::services::dispatch_service::{DispatchConfig, DispatchService};
use crate::services::dispatch_store::{DispatchStore, MemoryDispatchStore, RedisDispatchStore};
use crate::services::eta_service::{EtaOracle, Geocoder, HttpGeocoder, OsrmEtaClient};
use crate::services::geo_service::{DriverIndex, MemoryDriverIndex, RedisDriverIndex};
use crate::services::idempotency::{IdempotencyCache, MemoryIdempotencyCache, RedisIdempotencyCache};
use crate::services::offer_queue::{InMemoryOfferQueue, OfferQueue};
use crate::services::push_service::{HttpPushBus, LogPushBus, PushBus, PushGatewayConfig};
use crate::services::ride_service::RideService;
use crate::services::ride_store::{MemoryRideStore, RedisRideStore, RideStore};
use crate::services::scheduler::{OfferScheduler, WorkerPool};
use crate::utils::retry::RetryPolicy;

pub struct AppState {
    pub dispatch_service: Arc<DispatchService>,
    pub ride_service: Arc<RideService>,
    pub drivers: Arc<dyn DriverIndex>,
    pub config: AppConfig,
}

#[derive(Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    /// Absent means in-memory stores (single-node / development).
    pub redis_url: Option<String>,
    pub osrm_url: String,
    pub eta_calibrate_url: Option<String>,
    pub geocode_url: String,
    pub push_gateway_url: Option<String>,
    pub push_api_key: Option<String>,
    pub default_radius_km: f64,
    pub default_limit: usize,
    pub ack_seconds_default: u64,
    pub poll_interval_ms: u64,
    pub workers: usize,
    pub fare_base: i64,
    pub fare_per_km: i64,
    pub surge_default: f64,
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            redis_url: std::env::var("REDIS_URL").ok(),
            osrm_url: std::env::var("OSRM_URL")
                .unwrap_or_else(|_| "http://localhost:5000".to_string()),
            eta_calibrate_url: std::env::var("ETA_CALIBRATE_URL").ok(),
            geocode_url: std::env::var("GEOCODE_URL")
                .unwrap_or_else(|_| "https://nominatim.openstreetmap.org".to_string()),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL").ok(),
            push_api_key: std::env::var("PUSH_API_KEY").ok(),
            default_radius_km: env_parsed("DEFAULT_RADIUS_KM", 5.0),
            default_limit: env_parsed("DEFAULT_LIMIT", 10),
            ack_seconds_default: env_parsed("ACK_SECONDS_DEFAULT", 30),
            poll_interval_ms: env_parsed("POLL_INTERVAL_MS", 1000),
            workers: env_parsed("DISPATCH_WORKERS", 4),
            fare_base: env_parsed("FARE_BASE_MINOR", 1500),
            fare_per_km: env_parsed("FARE_PER_KM_MINOR", 250),
            surge_default: env_parsed("SURGE_DEFAULT", 1.0),
        }
    }
}

impl AppState {
    /// Wire every collaborator explicitly and start the worker pool. The
    /// returned pool is the stop handle for the scheduler side.
    pub fn new(config: AppConfig) -> KestrelResult<(Self, WorkerPool)> {
        let retry = RetryPolicy::default();

        let (dispatches, rides, drivers, idempotency): (
            Arc<dyn DispatchStore>,
            Arc<dyn RideStore>,
            Arc<dyn DriverIndex>,
            Arc<dyn IdempotencyCache>,
        ) = match &config.redis_url {
            Some(url) => {
                tracing::info!("using redis-backed stores");
                (
                    Arc::new(RedisDispatchStore::new(url)?),
                    Arc::new(RedisRideStore::new(url)?),
                    Arc::new(RedisDriverIndex::new(url)?),
                    Arc::new(RedisIdempotencyCache::new(url)?),
                )
            }
            None => {
                tracing::warn!("REDIS_URL not set, using in-memory stores");
                (
                    Arc::new(MemoryDispatchStore::new()),
                    Arc::new(MemoryRideStore::new()),
                    Arc::new(MemoryDriverIndex::new()),
                    Arc::new(MemoryIdempotencyCache::new()),
                )
            }
        };

        let eta: Arc<dyn EtaOracle> = Arc::new(OsrmEtaClient::new(
            &config.osrm_url,
            config.eta_calibrate_url.clone(),
            retry,
        ));
        let geocoder: Arc<dyn Geocoder> = Arc::new(HttpGeocoder::new(
            &config.geocode_url,
            config.surge_default,
            retry,
        ));

        let bus: Arc<dyn PushBus> = match &config.push_gateway_url {
            Some(url) => {
                tracing::info!("using push gateway at {}", url);
                Arc::new(HttpPushBus::new(
                    PushGatewayConfig {
                        url: url.clone(),
                        api_key: config.push_api_key.clone(),
                    },
                    retry,
                ))
            }
            None => {
                tracing::warn!("PUSH_GATEWAY_URL not set, using log-only bus");
                Arc::new(LogPushBus::new())
            }
        };

        let (queue, receiver) = InMemoryOfferQueue::channel();
        let queue: Arc<dyn OfferQueue> = Arc::new(queue);

        let scheduler = Arc::new(OfferScheduler::new(
            dispatches.clone(),
            rides.clone(),
            drivers.clone(),
            bus.clone(),
            Duration::from_millis(config.poll_interval_ms),
        ));
        let workers = WorkerPool::spawn(config.workers, receiver, scheduler, queue.clone());

        let dispatch_service = Arc::new(DispatchService::new(
            dispatches,
            drivers.clone(),
            eta,
            geocoder,
            idempotency,
            queue,
            retry,
            DispatchConfig {
                default_radius_km: config.default_radius_km,
                default_limit: config.default_limit,
                default_ack_seconds: config.ack_seconds_default,
                fare_base: config.fare_base,
                fare_per_km: config.fare_per_km,
            },
        ));
        let ride_service = Arc::new(RideService::new(rides, drivers.clone(), bus));

        Ok((
            Self {
                dispatch_service,
                ride_service,
                drivers,
                config,
            },
            workers,
        ))
    }
}
