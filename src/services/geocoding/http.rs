use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use super::Geocoder;
use crate::models::Coordinates;

/// Nominatim-compatible search endpoint.
pub struct HttpGeocoder {
    url: String,
    client: reqwest::Client,
}

impl HttpGeocoder {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::builder()
                .user_agent("carebook/0.1")
                .build()
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct Place {
    lat: String,
    lon: String,
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn resolve(&self, address: &str) -> anyhow::Result<Option<Coordinates>> {
        let places: Vec<Place> = self
            .client
            .get(&self.url)
            .query(&[("q", address), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .context("failed to call geocoder")?
            .error_for_status()
            .context("geocoder returned error")?
            .json()
            .await
            .context("failed to parse geocoder response")?;

        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        let lat: f64 = place.lat.parse().context("bad latitude from geocoder")?;
        let lng: f64 = place.lon.parse().context("bad longitude from geocoder")?;
        Ok(Some(Coordinates { lat, lng }))
    }
}
