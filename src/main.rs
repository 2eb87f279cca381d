use std::sync::Arc;
use axum::{
    Router,
    routing::{get, post},
};
use kestrel_dispatch::{
    state::{AppState, AppConfig},
    handlers::{dispatch_handler, driver_handler, ride_handler},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    let listen_addr = config.listen_addr.clone();
    let (app_state, workers) = AppState::new(config).unwrap();

    let app = Router::new()
        .route("/dispatch", post(dispatch_handler::start_dispatch))
        .route("/dispatch/:id", get(dispatch_handler::get_dispatch))
        .route("/dispatch/:id/ack", post(dispatch_handler::ack_offer))
        .route("/dispatch/:id/cancel", post(dispatch_handler::cancel_dispatch))
        .route("/rides/:id", get(ride_handler::get_ride))
        .route("/rides/:id/start", post(ride_handler::start_ride))
        .route("/rides/:id/complete", post(ride_handler::complete_ride))
        .route("/rides/:id/cancel", post(ride_handler::cancel_ride))
        .route("/drivers/location", post(driver_handler::update_location))
        .route("/drivers/availability", post(driver_handler::set_availability))
        .with_state(Arc::new(app_state));

    let listener = tokio::net::TcpListener::bind(&listen_addr).await.unwrap();
    tracing::info!("kestrel-dispatch listening on {}", listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    tracing::info!("shutting down worker pool");
    workers.shutdown();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
    }
}
