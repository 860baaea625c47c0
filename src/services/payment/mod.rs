pub mod coordinator;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CaptureOutcome {
    Captured { transaction_id: String },
    Declined { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RefundOutcome {
    Refunded,
    Declined { reason: String },
}

/// Card capture/refund provider. Transport errors are `Err`; a gateway that
/// answered but said no is `Ok(Declined)`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// `booking_id` and `attempt` form the idempotency key: a resent request
    /// never charges twice, while a retry after a decline gets a fresh answer.
    async fn capture(
        &self,
        booking_id: &str,
        attempt: u32,
        amount: i64,
        authorization_id: Option<&str>,
    ) -> anyhow::Result<CaptureOutcome>;

    async fn refund(&self, transaction_id: &str, amount: i64) -> anyhow::Result<RefundOutcome>;

    /// Drops an authorization hold that was never captured.
    async fn release(&self, authorization_id: &str) -> anyhow::Result<()>;
}
