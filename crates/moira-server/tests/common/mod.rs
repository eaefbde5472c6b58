#![allow(dead_code)]

use async_trait::async_trait;
use moira_common::state::{State, TtlState};
use moira_common::types::{Contact, NotificationPackage, Subscription, Trigger, TriggerType};
use moira_notifier::{Sender, Senders};
use moira_server::config::{DatabaseBackend, ServerConfig};
use moira_storage::memory::MemoryDatabase;
use moira_storage::DynDatabase;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Aligned to the default 60s retention.
pub const BASE: i64 = 1_699_999_980;
pub const KIND: &str = "recording";

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<NotificationPackage>>,
}

impl RecordingSender {
    pub fn sent(&self) -> Vec<NotificationPackage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, package: &NotificationPackage) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(package.clone());
        Ok(())
    }

    fn sender_type(&self) -> &str {
        KIND
    }
}

pub fn memory_db() -> DynDatabase {
    Arc::new(MemoryDatabase::new())
}

pub fn senders_with(sender: Arc<RecordingSender>) -> Senders {
    let mut senders = Senders::new();
    senders.insert(KIND, sender);
    senders
}

/// Config with every stage off, on the memory backend, listening on an
/// ephemeral port.
pub fn quiet_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.database.backend = DatabaseBackend::Memory;
    config.filter.enabled = false;
    config.filter.listen_tcp = "127.0.0.1:0".to_string();
    config.filter.flush_interval_ms = 20;
    config.checker.enabled = false;
    config.notifier.enabled = false;
    config.selfstate.enabled = false;
    config
}

pub fn rising_trigger(id: &str, target: &str, tags: &[&str]) -> Trigger {
    Trigger {
        id: id.to_string(),
        name: format!("{id} name"),
        desc: None,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        targets: vec![target.to_string()],
        warn_value: Some(60.0),
        error_value: Some(90.0),
        trigger_type: TriggerType::Rising,
        expression: None,
        ttl: 0,
        ttl_state: TtlState::Nodata,
        schedule: None,
        patterns: moira_checker::target::patterns_of(&[target.to_string()]).unwrap(),
        alone_metrics: Default::default(),
        mute_new_metrics: false,
        is_remote: false,
    }
}

pub fn any_tags_subscription(id: &str, contacts: &[&str]) -> Subscription {
    Subscription {
        id: id.to_string(),
        user: Some("ops".to_string()),
        team_id: None,
        contacts: contacts.iter().map(|c| c.to_string()).collect(),
        tags: Vec::new(),
        any_tags: true,
        enabled: true,
        throttling: false,
        ignore_warnings: false,
        ignore_recoverings: false,
        schedule: None,
        plotting: false,
    }
}

pub fn contact(id: &str, value: &str) -> Contact {
    Contact {
        id: id.to_string(),
        contact_type: KIND.to_string(),
        value: value.to_string(),
        user: Some("ops".to_string()),
        team_id: None,
    }
}

pub fn states(package: &NotificationPackage) -> Vec<(State, State)> {
    package
        .events
        .iter()
        .map(|e| (e.old_state, e.state))
        .collect()
}

/// Polls `check` every 20ms until it holds, failing after five seconds.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
