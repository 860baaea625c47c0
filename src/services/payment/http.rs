use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;

use super::{CaptureOutcome, PaymentGateway, RefundOutcome};

pub struct HttpPaymentGateway {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpPaymentGateway {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, idempotency_key: &str, body: serde_json::Value) -> anyhow::Result<(reqwest::StatusCode, serde_json::Value)> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to call payment gateway {path}"))?;

        let status = resp.status();
        let data: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse payment gateway response")?;

        if status.is_server_error() {
            anyhow::bail!("payment gateway error ({}): {}", status, data);
        }
        Ok((status, data))
    }
}

fn capture_key(booking_id: &str, attempt: u32) -> String {
    format!("capture-{booking_id}-{attempt}")
}

fn decline_reason(data: &serde_json::Value) -> String {
    data["error"]["message"]
        .as_str()
        .or_else(|| data["reason"].as_str())
        .unwrap_or("declined")
        .to_string()
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn capture(
        &self,
        booking_id: &str,
        attempt: u32,
        amount: i64,
        authorization_id: Option<&str>,
    ) -> anyhow::Result<CaptureOutcome> {
        let body = json!({
            "amount": amount,
            "currency": "jpy",
            "reference": booking_id,
            "authorization": authorization_id,
        });
        let (status, data) = self
            .post("/v1/captures", &capture_key(booking_id, attempt), body)
            .await?;

        if !status.is_success() {
            return Ok(CaptureOutcome::Declined {
                reason: decline_reason(&data),
            });
        }

        let transaction_id = data["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("missing transaction id in capture response"))?;
        Ok(CaptureOutcome::Captured { transaction_id })
    }

    async fn refund(&self, transaction_id: &str, amount: i64) -> anyhow::Result<RefundOutcome> {
        let body = json!({
            "transaction": transaction_id,
            "amount": amount,
        });
        let (status, data) = self
            .post("/v1/refunds", &format!("refund-{transaction_id}"), body)
            .await?;

        if status.is_success() {
            Ok(RefundOutcome::Refunded)
        } else {
            Ok(RefundOutcome::Declined {
                reason: decline_reason(&data),
            })
        }
    }

    async fn release(&self, authorization_id: &str) -> anyhow::Result<()> {
        let (status, data) = self
            .post(
                &format!("/v1/authorizations/{authorization_id}/release"),
                &format!("release-{authorization_id}"),
                json!({}),
            )
            .await?;

        if !status.is_success() {
            anyhow::bail!("authorization release refused: {}", decline_reason(&data));
        }
        Ok(())
    }
}
