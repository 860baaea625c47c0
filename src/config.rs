use std::env;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub admin_token: String,
    pub payment_gateway_url: String,
    pub payment_api_key: String,
    pub payment_webhook_secret: String,
    pub mail_api_url: String,
    pub mail_api_key: String,
    pub mail_from: String,
    pub geocoder_url: String,
    pub start_grace_minutes: i64,
    pub refund_cutoff_hours: i64,
    pub late_cancel_fee_percent: i64,
    pub match_limit: usize,
    pub office_commission_percent: i64,
    pub pending_expiry_minutes: Option<i64>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: parse_var("PORT").unwrap_or(3000),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "carebook.db".to_string()),
            admin_token: env::var("ADMIN_TOKEN").unwrap_or_else(|_| "changeme".to_string()),
            payment_gateway_url: env::var("PAYMENT_GATEWAY_URL")
                .unwrap_or_else(|_| "http://localhost:4242".to_string()),
            payment_api_key: env::var("PAYMENT_API_KEY").unwrap_or_default(),
            payment_webhook_secret: env::var("PAYMENT_WEBHOOK_SECRET").unwrap_or_default(),
            mail_api_url: env::var("MAIL_API_URL")
                .unwrap_or_else(|_| "http://localhost:8025/api/send".to_string()),
            mail_api_key: env::var("MAIL_API_KEY").unwrap_or_default(),
            mail_from: env::var("MAIL_FROM").unwrap_or_else(|_| "no-reply@carebook.local".to_string()),
            geocoder_url: env::var("GEOCODER_URL")
                .unwrap_or_else(|_| "https://nominatim.openstreetmap.org/search".to_string()),
            start_grace_minutes: parse_var("START_GRACE_MINUTES").unwrap_or(15),
            refund_cutoff_hours: parse_var("REFUND_CUTOFF_HOURS").unwrap_or(0),
            late_cancel_fee_percent: parse_var("LATE_CANCEL_FEE_PERCENT")
                .unwrap_or(0)
                .clamp(0, 100),
            match_limit: parse_var("MATCH_LIMIT").unwrap_or(20),
            office_commission_percent: parse_var("OFFICE_COMMISSION_PERCENT")
                .unwrap_or(10)
                .clamp(0, 100),
            pending_expiry_minutes: parse_var("PENDING_EXPIRY_MINUTES").filter(|m: &i64| *m > 0),
        }
    }

    pub fn start_grace(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.start_grace_minutes)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
