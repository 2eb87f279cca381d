// src/services/eta_service.rs
use async_trait::async_trait;
use chrono::{Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{KestrelError, KestrelResult};
use crate::models::driver::GeoPoint;
use crate::utils::retry::{with_backoff, RetryPolicy};

/// Travel times from each origin to one destination. An entry is None when
/// the origin is unreachable or filtered out by the bound.
#[derive(Debug, Clone)]
pub struct EtaMatrix {
    pub durations: Vec<Option<u32>>,
    /// Argmin over defined entries, lowest index on ties; -1 when every entry
    /// is None.
    pub best_index: isize,
}

#[async_trait]
pub trait EtaOracle: Send + Sync {
    async fn multi_eta(
        &self,
        origins: &[GeoPoint],
        destination: GeoPoint,
        bound_seconds: Option<u32>,
    ) -> KestrelResult<EtaMatrix>;
}

/// The rest of the mapping-provider contract: place resolution and the surge
/// factor consumed by the fare quote.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, text: &str) -> KestrelResult<Option<GeoPoint>>;
    async fn surge_factor(&self, at: GeoPoint) -> KestrelResult<f64>;
}

/// Blank out entries above the bound, in place.
pub fn apply_bound(durations: &mut [Option<u32>], bound_seconds: u32) {
    for entry in durations.iter_mut() {
        if matches!(entry, Some(d) if *d > bound_seconds) {
            *entry = None;
        }
    }
}

pub fn best_index(durations: &[Option<u32>]) -> isize {
    let mut best: Option<(usize, u32)> = None;
    for (i, entry) in durations.iter().enumerate() {
        if let Some(d) = entry {
            match best {
                Some((_, best_d)) if *d >= best_d => {}
                _ => best = Some((i, *d)),
            }
        }
    }
    best.map_or(-1, |(i, _)| i as isize)
}

pub fn matrix_from(mut durations: Vec<Option<u32>>, bound_seconds: Option<u32>) -> EtaMatrix {
    if let Some(bound) = bound_seconds {
        apply_bound(&mut durations, bound);
    }
    let best_index = best_index(&durations);
    EtaMatrix { durations, best_index }
}

// ------------------------------
// OSRM-backed oracle
// ------------------------------

#[derive(Debug, Deserialize)]
struct OsrmTableResponse {
    code: String,
    durations: Option<Vec<Vec<Option<f64>>>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CalibrateRequest {
    osrm_duration: f64,
    hour: u32,
    dow: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalibrateResponse {
    calibrated_duration: f64,
}

/// Table lookups against an OSRM-compatible endpoint, with an optional
/// calibration pass through the ML inference service.
pub struct OsrmEtaClient {
    http: reqwest::Client,
    endpoint: String,
    calibrate_endpoint: Option<String>,
    retry: RetryPolicy,
}

impl OsrmEtaClient {
    pub fn new(endpoint: &str, calibrate_endpoint: Option<String>, retry: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            calibrate_endpoint: calibrate_endpoint.map(|e| e.trim_end_matches('/').to_string()),
            retry,
        }
    }

    async fn table(
        &self,
        origins: &[GeoPoint],
        destination: GeoPoint,
    ) -> KestrelResult<Vec<Option<u32>>> {
        let coords = origins
            .iter()
            .chain(std::iter::once(&destination))
            .map(|p| format!("{},{}", p.lon, p.lat))
            .collect::<Vec<_>>()
            .join(";");
        let sources = (0..origins.len())
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(";");
        let url = format!(
            "{}/table/v1/driving/{}?sources={}&destinations={}&annotations=duration",
            self.endpoint,
            coords,
            sources,
            origins.len()
        );

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(KestrelError::unavailable(format!(
                "table request failed with status {}",
                response.status()
            )));
        }
        let parsed: OsrmTableResponse = response.json().await?;
        if parsed.code != "Ok" {
            return Err(KestrelError::unavailable(format!(
                "table request returned code {}",
                parsed.code
            )));
        }
        let rows = parsed
            .durations
            .ok_or_else(|| KestrelError::unavailable("table response missing durations"))?;

        // One row per source, each with the single destination column.
        Ok(rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .next()
                    .flatten()
                    .filter(|d| d.is_finite() && *d >= 0.0)
                    .map(|d| d.round() as u32)
            })
            .collect())
    }

    /// Pass each defined duration through the calibration endpoint. Any
    /// failure keeps the raw value; a defined entry never becomes None here.
    async fn calibrate(&self, durations: &mut [Option<u32>]) {
        let Some(endpoint) = &self.calibrate_endpoint else {
            return;
        };
        let now = Utc::now();
        let hour = now.hour();
        let dow = now.weekday().num_days_from_monday();

        for entry in durations.iter_mut() {
            let Some(raw) = *entry else { continue };
            let request = CalibrateRequest {
                osrm_duration: raw as f64,
                hour,
                dow,
            };
            match self
                .http
                .post(format!("{}/eta/calibrate", endpoint))
                .json(&request)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    match response.json::<CalibrateResponse>().await {
                        Ok(body) if body.calibrated_duration.is_finite() => {
                            *entry = Some(body.calibrated_duration.max(0.0).round() as u32);
                        }
                        Ok(_) | Err(_) => {
                            tracing::warn!("calibration returned unusable value, keeping raw eta");
                        }
                    }
                }
                Ok(response) => {
                    tracing::warn!(
                        "calibration failed with status {}, keeping raw eta",
                        response.status()
                    );
                }
                Err(err) => {
                    tracing::warn!("calibration call failed, keeping raw eta: {}", err);
                }
            }
        }
    }
}

#[async_trait]
impl EtaOracle for OsrmEtaClient {
    async fn multi_eta(
        &self,
        origins: &[GeoPoint],
        destination: GeoPoint,
        bound_seconds: Option<u32>,
    ) -> KestrelResult<EtaMatrix> {
        if origins.is_empty() {
            return Ok(EtaMatrix {
                durations: Vec::new(),
                best_index: -1,
            });
        }

        let mut durations =
            with_backoff("eta table", self.retry, || self.table(origins, destination)).await?;
        self.calibrate(&mut durations).await;
        Ok(matrix_from(durations, bound_seconds))
    }
}

// ------------------------------
// Geocoding
// ------------------------------

#[derive(Debug, Deserialize)]
struct GeocodeHit {
    lat: String,
    lon: String,
}

/// Nominatim-style forward geocoder. The surge factor currently comes from
/// configuration; the provider hook stays behind this trait.
pub struct HttpGeocoder {
    http: reqwest::Client,
    endpoint: String,
    default_surge: f64,
    retry: RetryPolicy,
}

impl HttpGeocoder {
    pub fn new(endpoint: &str, default_surge: f64, retry: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            default_surge,
            retry,
        }
    }

    async fn search(&self, text: &str) -> KestrelResult<Option<GeoPoint>> {
        let response = self
            .http
            .get(format!("{}/search", self.endpoint))
            .query(&[("q", text), ("format", "json"), ("limit", "1")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KestrelError::unavailable(format!(
                "geocode request failed with status {}",
                response.status()
            )));
        }
        let hits: Vec<GeocodeHit> = response.json().await?;
        Ok(hits.first().and_then(|hit| {
            let point = GeoPoint {
                lat: hit.lat.parse().ok()?,
                lon: hit.lon.parse().ok()?,
            };
            point.is_valid().then_some(point)
        }))
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, text: &str) -> KestrelResult<Option<GeoPoint>> {
        with_backoff("geocode", self.retry, || self.search(text)).await
    }

    async fn surge_factor(&self, _at: GeoPoint) -> KestrelResult<f64> {
        Ok(self.default_surge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_blanks_entries_above_it() {
        let mut durations = vec![Some(30), Some(60), Some(61), None, Some(300)];
        apply_bound(&mut durations, 60);
        assert_eq!(durations, vec![Some(30), Some(60), None, None, None]);
    }

    #[test]
    fn argmin_ties_break_low() {
        assert_eq!(best_index(&[Some(120), Some(90), Some(90)]), 1);
        assert_eq!(best_index(&[None, Some(10), None]), 1);
        assert_eq!(best_index(&[None, None]), -1);
        assert_eq!(best_index(&[]), -1);
    }

    #[test]
    fn matrix_with_bound_can_empty_out() {
        let m = matrix_from(vec![Some(100), Some(200)], Some(60));
        assert_eq!(m.best_index, -1);
        assert_eq!(m.durations, vec![None, None]);

        let unbounded = matrix_from(vec![Some(100), Some(200)], None);
        assert_eq!(unbounded.best_index, 0);
    }
}
