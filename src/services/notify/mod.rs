pub mod dispatcher;
pub mod email;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    BookingConfirmed,
    BookingCancelled,
    BookingCompleted,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::BookingConfirmed => "booking_confirmed",
            TemplateKind::BookingCancelled => "booking_cancelled",
            TemplateKind::BookingCompleted => "booking_completed",
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, template: TemplateKind, recipient: &str, context: &serde_json::Value) -> anyhow::Result<()>;
}
