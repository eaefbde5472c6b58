use crate::plugin::{SenderContext, SenderPlugin};
use crate::template;
use crate::utils::{truncate_string, MAX_BODY_LENGTH};
use crate::Sender;
use anyhow::Result;
use async_trait::async_trait;
use moira_common::types::NotificationPackage;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Posts packages as JSON. The target URL is the configured `url` or, when
/// none is set, the contact value itself.
pub struct WebhookSender {
    client: reqwest::Client,
    url: Option<String>,
    body_template: Option<String>,
    user: Option<String>,
    password: Option<String>,
    attempts: u32,
    front_uri: String,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig, front_uri: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url,
            body_template: config.body_template,
            user: config.user,
            password: config.password,
            attempts: config.attempts.max(1),
            front_uri: front_uri.to_string(),
        })
    }

    fn render_body(&self, package: &NotificationPackage) -> String {
        if let Some(template) = &self.body_template {
            return template::render(template, package, &self.front_uri);
        }
        serde_json::json!({
            "trigger": {
                "id": package.trigger.id,
                "name": package.trigger.name,
                "desc": package.trigger.desc,
                "tags": package.trigger.tags,
                "uri": template::trigger_uri(&self.front_uri, &package.trigger.id),
            },
            "contact": {
                "type": package.contact.contact_type,
                "value": package.contact.value,
                "id": package.contact.id,
            },
            "events": package.events.iter().map(|e| serde_json::json!({
                "metric": e.metric,
                "value": e.value,
                "timestamp": e.timestamp,
                "state": e.state,
                "old_state": e.old_state,
                "message": e.message,
            })).collect::<Vec<_>>(),
            "state": package.worst_state(),
            "throttled": package.throttled,
        })
        .to_string()
    }
}

#[async_trait]
impl Sender for WebhookSender {
    async fn send(&self, package: &NotificationPackage) -> Result<()> {
        let url = self
            .url
            .as_deref()
            .unwrap_or(package.contact.value.as_str());
        let body = self.render_body(package);

        let mut last_err = None;
        for attempt in 0..self.attempts {
            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .body(body.clone());
            if let Some(user) = &self.user {
                request = request.basic_auth(user, self.password.as_deref());
            }
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    let resp_body = match resp.text().await {
                        Ok(text) => truncate_string(&text, MAX_BODY_LENGTH),
                        Err(e) => format!("[Failed to read response body: {e}]"),
                    };
                    tracing::warn!(
                        attempt = attempt + 1,
                        status = %status,
                        "Webhook returned non-success status"
                    );
                    last_err = Some(anyhow::anyhow!("HTTP {status}: {resp_body}"));
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Webhook send failed");
                    last_err = Some(e.into());
                }
            }
            if attempt + 1 < self.attempts {
                tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("webhook {url} was not called")))
    }

    fn sender_type(&self) -> &str {
        "webhook"
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

pub struct WebhookPlugin;

impl SenderPlugin for WebhookPlugin {
    fn name(&self) -> &str {
        "webhook"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: WebhookConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid webhook config: {e}"))?;
        if let Some(url) = &cfg.url {
            reqwest::Url::parse(url).map_err(|e| anyhow::anyhow!("Invalid webhook url {url}: {e}"))?;
        }
        Ok(())
    }

    fn create_sender(&self, config: &Value, ctx: &SenderContext) -> Result<Arc<dyn Sender>> {
        let cfg: WebhookConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid webhook config: {e}"))?;
        Ok(Arc::new(WebhookSender::new(cfg, &ctx.front_uri)?))
    }
}
