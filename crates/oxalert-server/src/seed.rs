use crate::config::SeedFile;
use anyhow::Context;
use oxalert_storage::Database;

/// What [`apply_seed`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub created: u32,
    pub skipped: u32,
    pub invalid: u32,
}

pub fn load_seed_file(path: &str) -> anyhow::Result<SeedFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file '{path}'"))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse seed file '{path}'"))
}

/// Writes the seed's contacts, triggers and subscriptions. Existing ids are
/// left untouched; triggers that fail validation are skipped.
pub fn apply_seed(db: &Database, seed: &SeedFile) -> anyhow::Result<SeedReport> {
    let mut report = SeedReport::default();

    for contact in &seed.contacts {
        if db.get_contact(&contact.id)?.is_some() {
            tracing::warn!(id = %contact.id, "Contact already exists, skipping");
            report.skipped += 1;
            continue;
        }
        db.save_contact(contact)?;
        tracing::info!(id = %contact.id, contact_type = %contact.contact_type, "Contact created");
        report.created += 1;
    }

    for trigger in &seed.triggers {
        if db.get_trigger(&trigger.id)?.is_some() {
            tracing::warn!(id = %trigger.id, "Trigger already exists, skipping");
            report.skipped += 1;
            continue;
        }
        if let Err(e) = trigger.validate() {
            tracing::error!(id = %trigger.id, error = %e, "Invalid trigger, skipping");
            report.invalid += 1;
            continue;
        }
        db.save_trigger(trigger)?;
        tracing::info!(id = %trigger.id, name = %trigger.name, "Trigger created");
        report.created += 1;
    }

    for sub in &seed.subscriptions {
        if db.get_subscription(&sub.id)?.is_some() {
            tracing::warn!(id = %sub.id, "Subscription already exists, skipping");
            report.skipped += 1;
            continue;
        }
        for contact_id in &sub.contacts {
            if db.get_contact(contact_id)?.is_none() {
                tracing::warn!(id = %sub.id, contact_id = %contact_id, "Subscription references unknown contact");
            }
        }
        db.save_subscription(sub)?;
        tracing::info!(id = %sub.id, tags = ?sub.tags, "Subscription created");
        report.created += 1;
    }

    Ok(report)
}
