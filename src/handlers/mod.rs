// src/handlers/mod.rs
pub mod dispatch_handler;
pub mod driver_handler;
pub mod ride_handler;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::convert::Infallible;
use uuid::Uuid;

/// Correlation id for the request: taken from `x-correlation-id` when the
/// caller supplies one, minted otherwise. Attached to every downstream call
/// and every emitted event.
pub struct Correlation(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Correlation
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-correlation-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Correlation(id))
    }
}
