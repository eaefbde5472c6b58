//! `init-seed`: bulk import of triggers, subscriptions and contacts.

use crate::config::SeedFile;
use moira_checker::target::patterns_of;
use moira_storage::DynDatabase;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub triggers: u32,
    pub subscriptions: u32,
    pub contacts: u32,
    pub skipped: u32,
}

pub fn read_seed_file(path: &str) -> anyhow::Result<SeedFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read seed file '{}': {}", path, e))?;
    let seed: SeedFile = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse seed file '{}': {}", path, e))?;
    Ok(seed)
}

/// Saves every valid record. Invalid ones are logged and skipped; store
/// errors abort the import.
pub async fn apply(db: &DynDatabase, seed: SeedFile) -> anyhow::Result<SeedReport> {
    let mut report = SeedReport::default();

    for mut trigger in seed.triggers {
        trigger.patterns = match patterns_of(&trigger.targets) {
            Ok(patterns) => patterns,
            Err(e) => {
                tracing::warn!(id = %trigger.id, error = %e, "Trigger has an invalid target, skipping");
                report.skipped += 1;
                continue;
            }
        };
        if let Err(e) = trigger.validate() {
            tracing::warn!(id = %trigger.id, error = %e, "Invalid trigger, skipping");
            report.skipped += 1;
            continue;
        }
        db.save_trigger(&trigger).await?;
        tracing::info!(id = %trigger.id, name = %trigger.name, patterns = trigger.patterns.len(), "Trigger saved");
        report.triggers += 1;
    }

    for contact in seed.contacts {
        if contact.id.is_empty() || contact.contact_type.is_empty() {
            tracing::warn!(id = %contact.id, "Contact needs an id and a type, skipping");
            report.skipped += 1;
            continue;
        }
        db.save_contact(&contact).await?;
        tracing::info!(id = %contact.id, contact_type = %contact.contact_type, "Contact saved");
        report.contacts += 1;
    }

    for subscription in seed.subscriptions {
        if let Err(e) = subscription.validate() {
            tracing::warn!(id = %subscription.id, error = %e, "Invalid subscription, skipping");
            report.skipped += 1;
            continue;
        }
        db.save_subscription(&subscription).await?;
        tracing::info!(id = %subscription.id, tags = ?subscription.tags, "Subscription saved");
        report.subscriptions += 1;
    }

    Ok(report)
}
