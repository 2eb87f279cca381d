// src/services/push_service.rs
use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;

use crate::errors::{KestrelError, KestrelResult};
use crate::utils::retry::{with_backoff, RetryPolicy};

/// Outbound event emission to the push transport. Delivery is at-least-once;
/// events to unknown addresses may be dropped. Callers treat failures as
/// best-effort: log, never abort the round.
#[async_trait]
pub trait PushBus: Send + Sync {
    async fn emit(
        &self,
        address: &str,
        event: &str,
        payload: serde_json::Value,
        correlation_id: &str,
    ) -> KestrelResult<()>;
}

#[derive(Debug, Clone)]
pub struct PushGatewayConfig {
    pub url: String,
    pub api_key: Option<String>,
}

/// HTTP gateway client. Transient failures are retried with the shared
/// backoff; an unknown-address response is a permitted drop, not an error.
pub struct HttpPushBus {
    config: PushGatewayConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpPushBus {
    pub fn new(config: PushGatewayConfig, retry: RetryPolicy) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            retry,
        }
    }

    async fn post_once(
        &self,
        address: &str,
        event: &str,
        payload: &serde_json::Value,
        correlation_id: &str,
    ) -> KestrelResult<()> {
        let body = json!({
            "to": address,
            "event": event,
            "payload": payload,
            "correlationId": correlation_id,
        });

        let mut request = self.client.post(format!("{}/emit", self.config.url)).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("key={}", key));
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            tracing::warn!("push gateway does not know address {}, dropping {}", address, event);
            return Ok(());
        }
        if status.is_server_error() {
            return Err(KestrelError::unavailable(format!(
                "push gateway returned {}",
                status
            )));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(KestrelError::internal(format!(
                "push gateway rejected {}: {}",
                event, error_text
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PushBus for HttpPushBus {
    async fn emit(
        &self,
        address: &str,
        event: &str,
        payload: serde_json::Value,
        correlation_id: &str,
    ) -> KestrelResult<()> {
        tracing::debug!("emitting {} to {} [{}]", event, address, correlation_id);
        with_backoff("push emit", self.retry, || {
            self.post_once(address, event, &payload, correlation_id)
        })
        .await
    }
}

/// An emission captured by the logging bus.
#[derive(Debug, Clone)]
pub struct EmittedEvent {
    pub address: String,
    pub event: String,
    pub payload: serde_json::Value,
    pub correlation_id: String,
}

/// Log-only bus for development and tests. Records every emission so tests
/// can assert on event order.
#[derive(Debug, Default)]
pub struct LogPushBus {
    emitted: Mutex<Vec<EmittedEvent>>,
}

impl LogPushBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> Vec<EmittedEvent> {
        self.emitted.lock().unwrap().clone()
    }

    /// Event names sent to one address, in emission order.
    pub fn events_for(&self, address: &str) -> Vec<String> {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.address == address)
            .map(|e| e.event.clone())
            .collect()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.emitted.lock().unwrap().iter().map(|e| e.event.clone()).collect()
    }
}

#[async_trait]
impl PushBus for LogPushBus {
    async fn emit(
        &self,
        address: &str,
        event: &str,
        payload: serde_json::Value,
        correlation_id: &str,
    ) -> KestrelResult<()> {
        tracing::info!("[LOG BUS] {} -> {} [{}]", event, address, correlation_id);
        self.emitted.lock().unwrap().push(EmittedEvent {
            address: address.to_string(),
            event: event.to_string(),
            payload,
            correlation_id: correlation_id.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_bus_records_in_order() {
        let bus = LogPushBus::new();
        bus.emit("rider:usr-1", "ride-offer", json!({"dispatchId": "dsp-1"}), "corr-1")
            .await
            .unwrap();
        bus.emit("rider:usr-1", "ride-assigned", json!({"rideId": "rid-1"}), "corr-1")
            .await
            .unwrap();
        bus.emit("token-a", "ride-offer", json!({}), "corr-1").await.unwrap();

        assert_eq!(
            bus.events_for("rider:usr-1"),
            vec!["ride-offer".to_string(), "ride-assigned".to_string()]
        );
        assert_eq!(bus.emitted().len(), 3);
        assert_eq!(bus.emitted()[0].correlation_id, "corr-1");
    }
}
