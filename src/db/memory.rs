use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Contact, Database};
use crate::core::{ContactId, DbError, TransportId};
use crate::transport::{KeySetId, TransportKeys, TransportProperties};

/// In-memory database for tests and simulation.
///
/// All state lives behind `Arc<Mutex<_>>`, so clones share the same data.
/// [`fail_writes`](Self::fail_writes) makes every write fail, which lets
/// tests drive the error paths of the key manager and connections.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<MemoryDatabaseInner>>,
    fail_writes: Arc<AtomicBool>,
}

#[derive(Default)]
struct MemoryDatabaseInner {
    contacts: HashMap<ContactId, Contact>,
    keys: HashMap<KeySetId, TransportKeys>,
    properties: HashMap<(ContactId, TransportId), TransportProperties>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a contact.
    pub fn add_contact(&self, contact: Contact) {
        self.inner.lock().contacts.insert(contact.id, contact);
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored key sets.
    pub fn key_set_count(&self) -> usize {
        self.inner.lock().keys.len()
    }

    fn check_writable(&self) -> Result<(), DbError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DbError::Storage("writes disabled".into()));
        }
        Ok(())
    }
}

impl Database for MemoryDatabase {
    fn get_contact(&self, id: ContactId) -> Result<Contact, DbError> {
        self.inner
            .lock()
            .contacts
            .get(&id)
            .cloned()
            .ok_or(DbError::UnknownContact(id))
    }

    fn store_transport_keys(&self, keys: &TransportKeys) -> Result<(), DbError> {
        self.check_writable()?;
        self.inner.lock().keys.insert(keys.id(), keys.clone());
        Ok(())
    }

    fn store_transport_keys_batch(&self, keys: &[TransportKeys]) -> Result<(), DbError> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        for set in keys {
            inner.keys.insert(set.id(), set.clone());
        }
        Ok(())
    }

    fn load_transport_keys(&self) -> Result<Vec<TransportKeys>, DbError> {
        Ok(self.inner.lock().keys.values().cloned().collect())
    }

    fn merge_remote_properties(
        &self,
        contact: ContactId,
        transport: &TransportId,
        properties: &TransportProperties,
    ) -> Result<(), DbError> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        if !inner.contacts.contains_key(&contact) {
            return Err(DbError::UnknownContact(contact));
        }
        inner
            .properties
            .entry((contact, transport.clone()))
            .or_default()
            .merge(properties);
        Ok(())
    }

    fn get_remote_properties(
        &self,
        contact: ContactId,
        transport: &TransportId,
    ) -> Result<TransportProperties, DbError> {
        let inner = self.inner.lock();
        if !inner.contacts.contains_key(&contact) {
            return Err(DbError::UnknownContact(contact));
        }
        Ok(inner
            .properties
            .get(&(contact, transport.clone()))
            .cloned()
            .unwrap_or_default())
    }
}
