pub mod http;

use async_trait::async_trait;

use crate::models::Coordinates;

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` when the address is unknown.
    async fn resolve(&self, address: &str) -> anyhow::Result<Option<Coordinates>>;
}

/// Explicit coordinates win; otherwise the address is geocoded. A geocoder
/// outage yields `None` rather than an error.
pub async fn resolve_origin(
    geocoder: &dyn Geocoder,
    origin: Option<Coordinates>,
    address: Option<&str>,
) -> Option<Coordinates> {
    if origin.is_some() {
        return origin;
    }
    let address = address.map(str::trim).filter(|a| !a.is_empty())?;

    match geocoder.resolve(address).await {
        Ok(Some(coords)) => Some(coords),
        Ok(None) => {
            tracing::info!(address, "address not found by geocoder");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, address, "geocoding unavailable");
            None
        }
    }
}
