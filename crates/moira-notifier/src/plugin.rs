use crate::error::{NotifyError, Result};
use crate::utils::redact_sensitive_json;
use crate::Sender;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Values every sender may use while rendering messages.
#[derive(Debug, Clone, Default)]
pub struct SenderContext {
    pub front_uri: String,
}

/// One `[[notifier.senders]]` entry.
///
/// `type` selects the plugin; `contact_type` is the contact type the sender
/// serves and defaults to `type`. Every other key is handed to the plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(rename = "type")]
    pub sender_type: String,
    #[serde(default)]
    pub contact_type: Option<String>,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl SenderConfig {
    pub fn contact_type(&self) -> &str {
        self.contact_type.as_deref().unwrap_or(&self.sender_type)
    }
}

/// Factory for creating [`Sender`] instances from JSON configuration.
pub trait SenderPlugin: Send + Sync {
    /// Returns the plugin type name (e.g., `"mail"`, `"webhook"`).
    fn name(&self) -> &str;

    /// Validates a JSON config blob against this plugin's expected schema.
    fn validate_config(&self, config: &Value) -> anyhow::Result<()>;

    fn create_sender(&self, config: &Value, ctx: &SenderContext)
        -> anyhow::Result<Arc<dyn Sender>>;

    /// Returns a copy of `config` safe to log.
    fn redact_config(&self, config: &Value) -> Value {
        redact_sensitive_json(config)
    }
}

/// Registry of available [`SenderPlugin`]s.
///
/// # Examples
///
/// ```
/// use moira_notifier::plugin::SenderRegistry;
///
/// let registry = SenderRegistry::default();
/// assert!(registry.has_plugin("mail"));
/// assert!(registry.has_plugin("webhook"));
/// assert!(registry.has_plugin("script"));
/// assert!(!registry.has_plugin("pager"));
/// ```
pub struct SenderRegistry {
    plugins: HashMap<String, Box<dyn SenderPlugin>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin: Box<dyn SenderPlugin>) {
        let name = plugin.name().to_string();
        self.plugins.insert(name, plugin);
    }

    pub fn has_plugin(&self, type_name: &str) -> bool {
        self.plugins.contains_key(type_name)
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.keys().map(|s| s.as_str()).collect()
    }

    pub fn create_sender(
        &self,
        type_name: &str,
        config: &Value,
        ctx: &SenderContext,
    ) -> Result<Arc<dyn Sender>> {
        let plugin = self
            .plugins
            .get(type_name)
            .ok_or_else(|| NotifyError::UnknownSenderType(type_name.to_string()))?;
        plugin
            .validate_config(config)
            .and_then(|_| plugin.create_sender(config, ctx))
            .map_err(|e| NotifyError::InvalidConfig(format!("{type_name}: {e}")))
    }

    /// Builds one sender per entry. Two entries serving the same contact
    /// type are rejected.
    pub fn build(&self, configs: &[SenderConfig], ctx: &SenderContext) -> Result<Senders> {
        let mut senders = Senders::new();
        for config in configs {
            let contact_type = config.contact_type();
            if senders.get(contact_type).is_some() {
                return Err(NotifyError::InvalidConfig(format!(
                    "contact type '{contact_type}' has more than one sender"
                )));
            }
            let settings = Value::Object(config.settings.clone());
            let sender = self.create_sender(&config.sender_type, &settings, ctx)?;
            if let Some(plugin) = self.plugins.get(&config.sender_type) {
                tracing::info!(
                    sender_type = %config.sender_type,
                    contact_type,
                    config = %plugin.redact_config(&settings),
                    "Sender registered"
                );
            }
            senders.insert(contact_type, sender);
        }
        Ok(senders)
    }
}

impl Default for SenderRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(crate::senders::mail::MailPlugin));
        registry.register(Box::new(crate::senders::webhook::WebhookPlugin));
        registry.register(Box::new(crate::senders::script::ScriptPlugin));
        registry
    }
}

/// Senders keyed by the contact type they serve.
#[derive(Clone, Default)]
pub struct Senders {
    by_contact_type: HashMap<String, Arc<dyn Sender>>,
}

impl Senders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, contact_type: impl Into<String>, sender: Arc<dyn Sender>) {
        self.by_contact_type.insert(contact_type.into(), sender);
    }

    pub fn get(&self, contact_type: &str) -> Option<&Arc<dyn Sender>> {
        self.by_contact_type.get(contact_type)
    }

    pub fn contact_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_contact_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.by_contact_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_contact_type.is_empty()
    }
}
