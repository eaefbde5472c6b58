use crate::plugin::{SenderContext, SenderPlugin};
use crate::template;
use crate::Sender;
use anyhow::Result;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use moira_common::types::NotificationPackage;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Sends plain-text mail to the contact value.
pub struct MailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    front_uri: String,
}

impl MailSender {
    pub fn new(config: &MailConfig, front_uri: &str) -> Result<Self> {
        let builder = if config.insecure_tls {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)?
        };
        let mut builder = builder.port(config.smtp_port);

        if let (Some(user), Some(pass)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from: config.from.clone(),
            front_uri: front_uri.to_string(),
        })
    }
}

#[async_trait]
impl Sender for MailSender {
    async fn send(&self, package: &NotificationPackage) -> Result<()> {
        let email = Message::builder()
            .from(self.from.parse()?)
            .to(package.contact.value.parse()?)
            .subject(template::subject(package))
            .header(ContentType::TEXT_PLAIN)
            .body(template::plain_body(package, &self.front_uri))?;
        self.transport.send(email).await?;
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "mail"
    }
}

fn default_smtp_port() -> u16 {
    25
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    pub from: String,
    /// Plain SMTP without TLS, for local relays.
    #[serde(default)]
    pub insecure_tls: bool,
}

pub struct MailPlugin;

impl SenderPlugin for MailPlugin {
    fn name(&self) -> &str {
        "mail"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: MailConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid mail config: {e}"))?;
        cfg.from
            .parse::<lettre::message::Mailbox>()
            .map_err(|e| anyhow::anyhow!("Invalid mail sender address {}: {e}", cfg.from))?;
        Ok(())
    }

    fn create_sender(&self, config: &Value, ctx: &SenderContext) -> Result<Arc<dyn Sender>> {
        let cfg: MailConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid mail config: {e}"))?;
        Ok(Arc::new(MailSender::new(&cfg, &ctx.front_uri)?))
    }
}
