use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::LifecycleEvent;
use crate::services::geocoding::Geocoder;
use crate::services::notify::NotificationSink;
use crate::services::payment::PaymentGateway;

pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub config: AppConfig,
    pub payments: Box<dyn PaymentGateway>,
    pub notifier: Box<dyn NotificationSink>,
    pub geocoder: Box<dyn Geocoder>,
    pub events_tx: broadcast::Sender<LifecycleEvent>,
    /// Payment operations currently awaiting the gateway, keyed per booking and action.
    pub payments_in_flight: Mutex<HashSet<String>>,
}

impl AppState {
    pub fn new(
        conn: Connection,
        config: AppConfig,
        payments: Box<dyn PaymentGateway>,
        notifier: Box<dyn NotificationSink>,
        geocoder: Box<dyn Geocoder>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            db: Arc::new(Mutex::new(conn)),
            config,
            payments,
            notifier,
            geocoder,
            events_tx,
            payments_in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Locks the shared connection. Never hold the guard across an `.await`.
    pub fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("database mutex poisoned")))
    }
}
