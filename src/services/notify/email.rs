use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;

use super::{NotificationSink, TemplateKind};

/// Sends templated mail through an HTTP mail API; templates live on the provider side.
pub struct HttpMailer {
    api_url: String,
    api_key: String,
    from: String,
    client: reqwest::Client,
}

impl HttpMailer {
    pub fn new(api_url: String, api_key: String, from: String) -> Self {
        Self {
            api_url,
            api_key,
            from,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for HttpMailer {
    async fn send(&self, template: TemplateKind, recipient: &str, context: &serde_json::Value) -> anyhow::Result<()> {
        let body = json!({
            "from": self.from,
            "to": recipient,
            "template": template.as_str(),
            "context": context,
        });

        self.client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to call mail API")?
            .error_for_status()
            .context("mail API returned error")?;

        Ok(())
    }
}
