use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use carebook::config::AppConfig;
use carebook::db;
use carebook::handlers;
use carebook::services::geocoding::http::HttpGeocoder;
use carebook::services::notify::email::HttpMailer;
use carebook::services::payment::http::HttpPaymentGateway;
use carebook::services::workflow;
use carebook::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();
    if config.payment_webhook_secret.is_empty() {
        tracing::warn!("PAYMENT_WEBHOOK_SECRET not set, payment webhook signatures will not be checked");
    }

    let conn = db::init_db(&config.database_url)?;

    let payments = HttpPaymentGateway::new(
        config.payment_gateway_url.clone(),
        config.payment_api_key.clone(),
    );
    let mailer = HttpMailer::new(
        config.mail_api_url.clone(),
        config.mail_api_key.clone(),
        config.mail_from.clone(),
    );
    let geocoder = HttpGeocoder::new(config.geocoder_url.clone());

    let state = Arc::new(AppState::new(
        conn,
        config.clone(),
        Box::new(payments),
        Box::new(mailer),
        Box::new(geocoder),
    ));

    if let Some(minutes) = config.pending_expiry_minutes {
        tracing::info!(minutes, "expiring stale PENDING bookings");
        let sweeper = Arc::clone(&state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                match workflow::expire_pending(&sweeper).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(expired = n, "stale PENDING bookings cancelled"),
                    Err(e) => tracing::error!(error = %e, "pending expiry sweep failed"),
                }
            }
        });
    }

    let app = handlers::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
