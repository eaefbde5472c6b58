use crate::plugin::{SenderContext, SenderPlugin};
use crate::template;
use crate::utils::{truncate_string, MAX_BODY_LENGTH};
use crate::Sender;
use anyhow::{Context, Result};
use async_trait::async_trait;
use moira_common::types::NotificationPackage;
use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs an executable per package. The package JSON is written to its
/// stdin; arguments may use the same `{{placeholders}}` as webhook body
/// templates. A non-zero exit status is a failed delivery.
pub struct ScriptSender {
    exec: String,
    args: Vec<String>,
    front_uri: String,
}

impl ScriptSender {
    pub fn new(config: ScriptConfig, front_uri: &str) -> Self {
        Self {
            exec: config.exec,
            args: config.args,
            front_uri: front_uri.to_string(),
        }
    }
}

#[async_trait]
impl Sender for ScriptSender {
    async fn send(&self, package: &NotificationPackage) -> Result<()> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| template::render(a, package, &self.front_uri))
            .collect();
        let input = serde_json::to_vec(package)?;

        let mut child = Command::new(&self.exec)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.exec))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!(exec = %self.exec, error = %e, "Script closed stdin early");
            }
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} exited with {}: {}",
                self.exec,
                output.status,
                truncate_string(stderr.trim(), MAX_BODY_LENGTH)
            );
        }
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "script"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    pub exec: String,
    #[serde(default)]
    pub args: Vec<String>,
}

pub struct ScriptPlugin;

impl SenderPlugin for ScriptPlugin {
    fn name(&self) -> &str {
        "script"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: ScriptConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid script config: {e}"))?;
        if cfg.exec.trim().is_empty() {
            anyhow::bail!("Invalid script config: exec is empty");
        }
        Ok(())
    }

    fn create_sender(&self, config: &Value, ctx: &SenderContext) -> Result<Arc<dyn Sender>> {
        let cfg: ScriptConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid script config: {e}"))?;
        Ok(Arc::new(ScriptSender::new(cfg, &ctx.front_uri)))
    }
}
