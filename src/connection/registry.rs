//! Live connections per contact and transport.
//!
//! Two peers may dial each other at the same moment, leaving two
//! connections for one (contact, transport) pair. Each connection carries the
//! priority its dialler generated; once both are known the connection with
//! the lower priority is redundant. Both peers see the same two priorities,
//! so they drop the same physical connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::{ContactId, TransportId};
use crate::sync::{Interrupter, Priority};

/// A registered connection whose outgoing session can be stopped.
pub trait InterruptibleConnection: Send + Sync {
    /// Stop the outgoing session, now or as soon as it starts.
    fn interrupt_outgoing_session(&self);
}

impl InterruptibleConnection for Interrupter {
    fn interrupt_outgoing_session(&self) {
        self.interrupt();
    }
}

/// Registry-assigned connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

/// Something that happened in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection was registered.
    Opened {
        /// Contact.
        contact: ContactId,
        /// Transport.
        transport: TransportId,
        /// Whether the peer dialled.
        incoming: bool,
    },
    /// A connection was removed.
    Closed {
        /// Contact.
        contact: ContactId,
        /// Transport.
        transport: TransportId,
        /// Whether the peer dialled.
        incoming: bool,
        /// Removed because it failed.
        errored: bool,
        /// Removed because another connection won on priority.
        replaced: bool,
    },
    /// The contact's first connection on any transport was registered.
    ContactConnected(ContactId),
    /// The contact's last connection was removed.
    ContactDisconnected(ContactId),
}

struct Entry {
    id: ConnectionId,
    incoming: bool,
    priority: Option<Priority>,
    connection: Arc<dyn InterruptibleConnection>,
}

type Key = (ContactId, TransportId);

/// Table of live connections.
///
/// All mutation goes through one lock. Events are sent while it is held, so
/// subscribers observe them in mutation order.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<Key, Vec<Entry>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionRegistry {
    /// Create an empty registry whose event channel buffers `capacity`
    /// events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Receive future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn contact_has_connections(map: &HashMap<Key, Vec<Entry>>, contact: ContactId) -> bool {
        map.iter().any(|((c, _), entries)| *c == contact && !entries.is_empty())
    }

    fn register(
        &self,
        contact: ContactId,
        transport: &TransportId,
        incoming: bool,
        priority: Option<Priority>,
        connection: Arc<dyn InterruptibleConnection>,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut map = self.connections.lock();
        let first_for_contact = !Self::contact_has_connections(&map, contact);
        map.entry((contact, transport.clone())).or_default().push(Entry {
            id,
            incoming,
            priority,
            connection,
        });

        info!(contact = %contact, transport = %transport, incoming, "connection registered");
        self.emit(ConnectionEvent::Opened {
            contact,
            transport: transport.clone(),
            incoming,
        });
        if first_for_contact {
            self.emit(ConnectionEvent::ContactConnected(contact));
        }
        if priority.is_some() {
            self.resolve(&mut map, contact, transport);
        }
        id
    }

    /// Register a connection we dialled, carrying our priority.
    pub fn register_outgoing(
        &self,
        contact: ContactId,
        transport: &TransportId,
        priority: Priority,
        connection: Arc<dyn InterruptibleConnection>,
    ) -> ConnectionId {
        self.register(contact, transport, false, Some(priority), connection)
    }

    /// Register a connection the peer dialled. Its priority arrives later
    /// through [`set_priority`](Self::set_priority).
    pub fn register_incoming(
        &self,
        contact: ContactId,
        transport: &TransportId,
        connection: Arc<dyn InterruptibleConnection>,
    ) -> ConnectionId {
        self.register(contact, transport, true, None, connection)
    }

    /// Record the priority the peer sent on an incoming connection.
    pub fn set_priority(&self, contact: ContactId, transport: &TransportId, id: ConnectionId, priority: Priority) {
        let mut map = self.connections.lock();
        let Some(entry) = map
            .get_mut(&(contact, transport.clone()))
            .and_then(|entries| entries.iter_mut().find(|e| e.id == id))
        else {
            return;
        };
        entry.priority = Some(priority);
        self.resolve(&mut map, contact, transport);
    }

    /// Drop connections made redundant by a higher priority one.
    fn resolve(&self, map: &mut HashMap<Key, Vec<Entry>>, contact: ContactId, transport: &TransportId) {
        let key = (contact, transport.clone());
        let Some(entries) = map.get_mut(&key) else {
            return;
        };
        let Some(best) = entries.iter().filter_map(|e| e.priority).max() else {
            return;
        };
        let (keep, redundant): (Vec<Entry>, Vec<Entry>) = entries
            .drain(..)
            .partition(|e| e.priority.is_none_or(|p| p == best));
        *entries = keep;

        for entry in redundant {
            debug!(contact = %contact, transport = %transport, incoming = entry.incoming, "interrupting redundant connection");
            entry.connection.interrupt_outgoing_session();
            self.emit(ConnectionEvent::Closed {
                contact,
                transport: transport.clone(),
                incoming: entry.incoming,
                errored: false,
                replaced: true,
            });
        }
        if entries.is_empty() {
            map.remove(&key);
        }
    }

    /// Remove a connection. Returns false if it was already removed, for
    /// instance because it was replaced.
    pub fn unregister(&self, contact: ContactId, transport: &TransportId, id: ConnectionId, errored: bool) -> bool {
        let mut map = self.connections.lock();
        let key = (contact, transport.clone());
        let Some(entries) = map.get_mut(&key) else {
            return false;
        };
        let Some(pos) = entries.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = entries.remove(pos);
        if entries.is_empty() {
            map.remove(&key);
        }

        info!(contact = %contact, transport = %transport, errored, "connection unregistered");
        self.emit(ConnectionEvent::Closed {
            contact,
            transport: transport.clone(),
            incoming: entry.incoming,
            errored,
            replaced: false,
        });
        if !Self::contact_has_connections(&map, contact) {
            self.emit(ConnectionEvent::ContactDisconnected(contact));
        }
        true
    }

    /// Whether the contact has a connection on any transport.
    pub fn is_connected(&self, contact: ContactId) -> bool {
        Self::contact_has_connections(&self.connections.lock(), contact)
    }

    /// Whether the contact has a connection on `transport`.
    pub fn is_connected_on(&self, contact: ContactId, transport: &TransportId) -> bool {
        self.connections
            .lock()
            .get(&(contact, transport.clone()))
            .is_some_and(|entries| !entries.is_empty())
    }

    /// Contacts with at least one connection, in id order.
    pub fn connected_contacts(&self) -> Vec<ContactId> {
        let map = self.connections.lock();
        let mut contacts: Vec<ContactId> = map
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|((c, _), _)| *c)
            .collect();
        contacts.sort();
        contacts.dedup();
        contacts
    }

    /// Number of connections for a pair.
    pub fn connection_count(&self, contact: ContactId, transport: &TransportId) -> usize {
        self.connections
            .lock()
            .get(&(contact, transport.clone()))
            .map_or(0, Vec::len)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}
