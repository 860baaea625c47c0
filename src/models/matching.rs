use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use super::availability::TransportMode;
use super::booking::BookingMode;
use super::geo::Coordinates;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub duration_minutes: i32,
    pub mode: BookingMode,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub origin: Option<Coordinates>,
    /// Free-form address, geocoded when no `origin` is given.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub budget: Option<i64>,
    #[serde(default)]
    pub min_rating: Option<f64>,
}

impl MatchRequest {
    pub fn start(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }
}

/// A bookable option for one request. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchCandidate {
    pub therapist_id: String,
    pub site_id: Option<String>,
    pub distance_km: Option<f64>,
    pub transport_mode: Option<TransportMode>,
    pub rating: f64,
    pub price: i64,
    pub earliest_available_slot: NaiveDateTime,
}
