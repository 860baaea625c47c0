use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use super::booking::BookingMode;

/// An open window on one calendar day. `end` is exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenWindow {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoursRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl HoursRange {
    fn contains(&self, start: NaiveTime, end: NaiveTime) -> bool {
        start >= self.start && end <= self.end
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Walk,
    Bicycle,
    Car,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_distance_km: f64,
    /// Travel surcharge in yen added to the quote when this mode is used.
    #[serde(default)]
    pub fee: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportModes {
    #[serde(default)]
    pub walk: TransportConfig,
    #[serde(default)]
    pub bicycle: TransportConfig,
    #[serde(default)]
    pub car: TransportConfig,
}

impl TransportModes {
    pub fn iter(&self) -> impl Iterator<Item = (TransportMode, &TransportConfig)> {
        [
            (TransportMode::Walk, &self.walk),
            (TransportMode::Bicycle, &self.bicycle),
            (TransportMode::Car, &self.car),
        ]
        .into_iter()
    }

    /// The cheapest enabled mode whose range reaches `distance_km`.
    pub fn cheapest_viable(&self, distance_km: f64) -> Option<(TransportMode, &TransportConfig)> {
        self.iter()
            .filter(|(_, cfg)| cfg.enabled && distance_km <= cfg.max_distance_km)
            .min_by_key(|(_, cfg)| cfg.fee)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TherapistAvailability {
    #[serde(default)]
    pub windows: Vec<OpenWindow>,
    #[serde(default)]
    pub onsite_enabled: bool,
    #[serde(default)]
    pub outcall_enabled: bool,
    #[serde(default)]
    pub transport_modes: TransportModes,
    #[serde(default)]
    pub outcall_hours: Option<HoursRange>,
    #[serde(default)]
    pub incall_hours: Option<HoursRange>,
}

impl TherapistAvailability {
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let availability: TherapistAvailability = serde_json::from_str(s)?;
        availability.validate()?;
        Ok(availability)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for window in &self.windows {
            if window.start >= window.end {
                anyhow::bail!(
                    "window on {} must start before it ends ({}-{})",
                    window.date,
                    window.start,
                    window.end
                );
            }
        }
        for hours in [&self.outcall_hours, &self.incall_hours].into_iter().flatten() {
            if hours.start >= hours.end {
                anyhow::bail!("hours range {}-{} is empty", hours.start, hours.end);
            }
        }
        for (mode, cfg) in self.transport_modes.iter() {
            if cfg.max_distance_km < 0.0 || !cfg.max_distance_km.is_finite() {
                anyhow::bail!("invalid max distance for {mode:?}: {}", cfg.max_distance_km);
            }
            if cfg.fee < 0 {
                anyhow::bail!("negative travel fee for {mode:?}");
            }
        }
        Ok(())
    }

    /// Whether one open window contains the whole `[start, start + duration)` interval.
    pub fn covers(&self, start: &NaiveDateTime, duration_minutes: i32) -> bool {
        let end = *start + Duration::minutes(duration_minutes as i64);
        self.windows.iter().any(|w| {
            let window_start = w.date.and_time(w.start);
            let window_end = w.date.and_time(w.end);
            *start >= window_start && end <= window_end
        })
    }

    /// Whether the therapist takes this mode at all, and inside its configured hours.
    pub fn serves_mode(&self, mode: BookingMode, start: &NaiveDateTime, duration_minutes: i32) -> bool {
        let end = *start + Duration::minutes(duration_minutes as i64);
        if end.date() != start.date() {
            return false;
        }
        let (enabled, hours) = match mode {
            BookingMode::Onsite => (self.onsite_enabled, &self.incall_hours),
            BookingMode::Mobile => (self.outcall_enabled, &self.outcall_hours),
        };
        enabled
            && hours
                .as_ref()
                .map(|h| h.contains(start.time(), end.time()))
                .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn sample() -> TherapistAvailability {
        TherapistAvailability::from_json(
            r#"{
                "windows": [{"date": "2025-06-16", "start": "09:00:00", "end": "17:00:00"}],
                "onsite_enabled": true,
                "outcall_enabled": true,
                "transport_modes": {
                    "walk": {"enabled": true, "max_distance_km": 2.0, "fee": 0},
                    "car": {"enabled": true, "max_distance_km": 10.0, "fee": 1500}
                },
                "outcall_hours": {"start": "10:00:00", "end": "16:00:00"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(TherapistAvailability::from_json("not json").is_err());
    }

    #[test]
    fn test_parse_rejects_inverted_window() {
        let json = r#"{"windows":[{"date":"2025-06-16","start":"17:00:00","end":"09:00:00"}]}"#;
        assert!(TherapistAvailability::from_json(json).is_err());
    }

    #[test]
    fn test_parse_rejects_negative_distance() {
        let json = r#"{"transport_modes":{"car":{"enabled":true,"max_distance_km":-1.0}}}"#;
        assert!(TherapistAvailability::from_json(json).is_err());
    }

    #[test]
    fn test_covers_within_window() {
        let avail = sample();
        assert!(avail.covers(&dt("2025-06-16 09:00"), 60));
        assert!(avail.covers(&dt("2025-06-16 16:00"), 60));
        assert!(!avail.covers(&dt("2025-06-16 16:30"), 60));
        assert!(!avail.covers(&dt("2025-06-16 08:30"), 60));
    }

    #[test]
    fn test_covers_wrong_date() {
        let avail = sample();
        assert!(!avail.covers(&dt("2025-06-17 10:00"), 60));
    }

    #[test]
    fn test_serves_mode_respects_outcall_hours() {
        let avail = sample();
        assert!(avail.serves_mode(BookingMode::Mobile, &dt("2025-06-16 10:00"), 60));
        assert!(!avail.serves_mode(BookingMode::Mobile, &dt("2025-06-16 15:30"), 60));
        // no incall hours configured means any time inside the windows
        assert!(avail.serves_mode(BookingMode::Onsite, &dt("2025-06-16 15:30"), 60));
    }

    #[test]
    fn test_serves_mode_disabled() {
        let mut avail = sample();
        avail.outcall_enabled = false;
        assert!(!avail.serves_mode(BookingMode::Mobile, &dt("2025-06-16 10:00"), 60));
    }

    #[test]
    fn test_cheapest_viable_mode() {
        let avail = sample();
        let (mode, cfg) = avail.transport_modes.cheapest_viable(1.0).unwrap();
        assert_eq!(mode, TransportMode::Walk);
        assert_eq!(cfg.fee, 0);

        let (mode, _) = avail.transport_modes.cheapest_viable(6.0).unwrap();
        assert_eq!(mode, TransportMode::Car);

        assert!(avail.transport_modes.cheapest_viable(12.0).is_none());
    }
}
