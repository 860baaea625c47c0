use serde::{Deserialize, Serialize};

use super::geo::Coordinates;

/// A facility where ONSITE sessions take place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub host_email: String,
    #[serde(default)]
    pub location: Option<Coordinates>,
}
