use serde::{Deserialize, Serialize};

use super::geo::Coordinates;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Therapist {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub rating: f64,
    /// Yen per 60 minutes.
    pub hourly_rate: i64,
    #[serde(default)]
    pub base_location: Option<Coordinates>,
    #[serde(default)]
    pub areas: Vec<String>,
    #[serde(default)]
    pub site_ids: Vec<String>,
    #[serde(default)]
    pub office_id: Option<String>,
    #[serde(default)]
    pub auto_approve: bool,
}

impl Therapist {
    /// Course price for a session, rounded down to the yen. `None` when the
    /// rate times the duration does not fit in an `i64`.
    pub fn quote(&self, duration_minutes: i32) -> Option<i64> {
        self.hourly_rate
            .checked_mul(duration_minutes as i64)
            .map(|yen_minutes| yen_minutes / 60)
    }

    pub fn serves_area(&self, area: &str) -> bool {
        self.areas.iter().any(|a| a.eq_ignore_ascii_case(area))
    }

    pub fn serves_site(&self, site_id: &str) -> bool {
        self.site_ids.iter().any(|s| s == site_id)
    }
}
