use super::Database;
use crate::error::Result;
use crate::keys;
use oxalert_common::types::Contact;

impl Database {
    pub fn get_contact(&self, id: &str) -> Result<Option<Contact>> {
        self.get_json(&keys::contact(id))
    }

    /// Contacts that still exist, in the order of `ids`.
    pub fn get_contacts(&self, ids: &[String]) -> Result<Vec<Contact>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_contact(id)? {
                Some(c) => out.push(c),
                None => tracing::warn!(contact_id = %id, "Contact referenced but missing"),
            }
        }
        Ok(out)
    }

    pub fn save_contact(&self, contact: &Contact) -> Result<()> {
        self.set_json(&keys::contact(&contact.id), contact)
    }

    pub fn remove_contact(&self, id: &str) -> Result<bool> {
        self.kv.del(&keys::contact(id))
    }
}
